use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::LlmError;
use crate::provider::{EmbeddingProvider, InputType};
use crate::retry::send_with_retry;

pub const DEFAULT_BASE_URL: &str = "https://api.voyageai.com/v1";
const PROVIDER: &str = "voyage";

/// Voyage AI embeddings client.
#[derive(Clone)]
pub struct VoyageProvider {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
    max_retries: u32,
}

impl fmt::Debug for VoyageProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VoyageProvider")
            .field("base_url", &self.base_url)
            .field("api_key", &"<redacted>")
            .field("model", &self.model)
            .field("max_retries", &self.max_retries)
            .finish_non_exhaustive()
    }
}

impl VoyageProvider {
    /// # Errors
    ///
    /// Returns an error if the API key is empty or the HTTP client cannot be built.
    pub fn new(
        base_url: &str,
        api_key: String,
        model: String,
        timeout: Duration,
    ) -> Result<Self, LlmError> {
        if api_key.trim().is_empty() {
            return Err(LlmError::MissingApiKey { provider: PROVIDER });
        }
        Ok(Self {
            client: crate::http::default_client(timeout)?,
            base_url: base_url.trim_end_matches('/').to_owned(),
            api_key,
            model,
            max_retries: 3,
        })
    }

    #[must_use]
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }
}

impl EmbeddingProvider for VoyageProvider {
    async fn embed_batch(
        &self,
        texts: &[String],
        input_type: InputType,
    ) -> Result<Vec<Vec<f32>>, LlmError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let body = EmbeddingRequest {
            input: texts,
            model: &self.model,
            input_type,
        };
        let url = format!("{}/embeddings", self.base_url);

        let response = send_with_retry(PROVIDER, self.max_retries, || {
            self.client
                .post(&url)
                .bearer_auth(&self.api_key)
                .json(&body)
                .send()
        })
        .await?;

        let status = response.status();
        let text = response.text().await.map_err(LlmError::Http)?;

        if !status.is_success() {
            tracing::error!("Voyage embedding API error {status}: {text}");
            return Err(LlmError::Api {
                provider: PROVIDER,
                status: status.as_u16(),
            });
        }

        let resp: EmbeddingResponse = serde_json::from_str(&text)?;
        if let Some(usage) = resp.usage {
            tracing::debug!(tokens = usage.total_tokens, "voyage embedding usage");
        }

        let mut data = resp.data;
        if data.len() != texts.len() {
            return Err(LlmError::CountMismatch {
                provider: PROVIDER,
                expected: texts.len(),
                got: data.len(),
            });
        }
        data.sort_by_key(|d| d.index);
        Ok(data.into_iter().map(|d| d.embedding).collect())
    }

    fn name(&self) -> &'static str {
        PROVIDER
    }
}

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    input: &'a [String],
    model: &'a str,
    input_type: InputType,
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
    #[serde(default)]
    index: usize,
}

#[derive(Deserialize)]
struct Usage {
    total_tokens: u64,
}
