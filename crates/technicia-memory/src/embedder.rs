//! Batched embedding on top of an [`EmbeddingProvider`].

use std::sync::Arc;
use std::time::Duration;

use technicia_llm::{EmbeddingProvider, ErrorKind, InputType, LlmError};

#[derive(Debug, thiserror::Error)]
pub enum EmbedError {
    #[error("embedding provider error: {0}")]
    Provider(#[from] LlmError),

    #[error("embedding batch {batch} timed out")]
    Timeout { batch: usize },

    #[error("embedding has {got} dimensions, expected {expected}")]
    DimensionMismatch { expected: usize, got: usize },

    #[error("nothing to embed")]
    EmptyInput,
}

impl EmbedError {
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Provider(e) => e.kind(),
            Self::Timeout { .. } => ErrorKind::TransientIo,
            Self::DimensionMismatch { .. } => ErrorKind::Consistency,
            Self::EmptyInput => ErrorKind::Input,
        }
    }

    #[must_use]
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::TransientIo
    }
}

#[derive(Debug, Clone)]
pub struct EmbedConfig {
    pub batch_size: usize,
    /// Pause between consecutive batches.
    pub batch_delay: Duration,
    pub dimensions: usize,
    /// Upper bound for one provider call.
    pub timeout: Duration,
    pub max_retries: u32,
    pub retry_backoff: Duration,
}

impl Default for EmbedConfig {
    fn default() -> Self {
        Self {
            batch_size: 20,
            batch_delay: Duration::from_millis(200),
            dimensions: 1024,
            timeout: Duration::from_secs(60),
            max_retries: 3,
            retry_backoff: Duration::from_millis(500),
        }
    }
}

/// Vectors produced so far plus the error that stopped the run, if any.
#[derive(Debug)]
pub struct EmbedOutcome {
    /// `(input index, vector)` pairs in input order.
    pub vectors: Vec<(usize, Vec<f32>)>,
    pub failure: Option<EmbedError>,
}

impl EmbedOutcome {
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.failure.is_none()
    }
}

pub struct EmbeddingGateway<P> {
    provider: Arc<P>,
    config: EmbedConfig,
}

impl<P> Clone for EmbeddingGateway<P> {
    fn clone(&self) -> Self {
        Self {
            provider: Arc::clone(&self.provider),
            config: self.config.clone(),
        }
    }
}

impl<P> std::fmt::Debug for EmbeddingGateway<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmbeddingGateway")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl<P: EmbeddingProvider> EmbeddingGateway<P> {
    #[must_use]
    pub fn new(provider: Arc<P>, config: EmbedConfig) -> Self {
        Self { provider, config }
    }

    #[must_use]
    pub fn config(&self) -> &EmbedConfig {
        &self.config
    }

    /// Embed `texts` in batches of `batch_size`.
    ///
    /// Whitespace-only inputs get no vector. The first batch that fails after retries
    /// stops the run; vectors from earlier batches are still returned.
    pub async fn embed(&self, texts: &[String], input_type: InputType) -> EmbedOutcome {
        let pending: Vec<(usize, &String)> = texts
            .iter()
            .enumerate()
            .filter(|(_, t)| !t.trim().is_empty())
            .collect();
        let mut vectors = Vec::with_capacity(pending.len());

        for (batch_no, batch) in pending.chunks(self.config.batch_size.max(1)).enumerate() {
            if batch_no > 0 && !self.config.batch_delay.is_zero() {
                tokio::time::sleep(self.config.batch_delay).await;
            }
            let inputs: Vec<String> = batch.iter().map(|(_, t)| (*t).clone()).collect();
            match self.embed_batch(batch_no, &inputs, input_type).await {
                Ok(batch_vectors) => {
                    vectors.extend(batch.iter().map(|(i, _)| *i).zip(batch_vectors));
                }
                Err(e) => {
                    tracing::warn!(
                        provider = self.provider.name(),
                        batch = batch_no,
                        embedded = vectors.len(),
                        error = %e,
                        "embedding batch failed"
                    );
                    return EmbedOutcome {
                        vectors,
                        failure: Some(e),
                    };
                }
            }
        }

        EmbedOutcome {
            vectors,
            failure: None,
        }
    }

    /// Embed a single search query.
    ///
    /// # Errors
    ///
    /// Returns [`EmbedError::EmptyInput`] for a blank query, otherwise the provider,
    /// timeout or dimension error of the call.
    pub async fn embed_query(&self, query: &str) -> Result<Vec<f32>, EmbedError> {
        if query.trim().is_empty() {
            return Err(EmbedError::EmptyInput);
        }
        self.embed_batch(0, &[query.to_owned()], InputType::Query)
            .await?
            .into_iter()
            .next()
            .ok_or(EmbedError::Provider(LlmError::EmptyResponse {
                provider: self.provider.name(),
            }))
    }

    async fn embed_batch(
        &self,
        batch: usize,
        inputs: &[String],
        input_type: InputType,
    ) -> Result<Vec<Vec<f32>>, EmbedError> {
        let mut attempt = 0u32;
        loop {
            let result =
                match tokio::time::timeout(self.config.timeout, self.provider.embed_batch(inputs, input_type))
                    .await
                {
                    Ok(Ok(v)) => self.validate(inputs.len(), v),
                    Ok(Err(e)) => Err(EmbedError::Provider(e)),
                    Err(_) => Err(EmbedError::Timeout { batch }),
                };
            match result {
                Ok(v) => return Ok(v),
                Err(e) if e.is_retryable() && attempt < self.config.max_retries => {
                    let delay = self.config.retry_backoff.saturating_mul(1 << attempt.min(10));
                    tracing::debug!(batch, attempt = attempt + 1, error = %e, "retrying embedding batch");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn validate(&self, expected: usize, vectors: Vec<Vec<f32>>) -> Result<Vec<Vec<f32>>, EmbedError> {
        if vectors.len() != expected {
            return Err(EmbedError::Provider(LlmError::CountMismatch {
                provider: self.provider.name(),
                expected,
                got: vectors.len(),
            }));
        }
        if let Some(bad) = vectors.iter().find(|v| v.len() != self.config.dimensions) {
            return Err(EmbedError::DimensionMismatch {
                expected: self.config.dimensions,
                got: bad.len(),
            });
        }
        Ok(vectors)
    }
}
