use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::LlmError;
use crate::provider::{LlmProvider, Message, Role};
use crate::retry::send_with_retry;

const API_URL: &str = "https://api.anthropic.com/v1";
const ANTHROPIC_VERSION: &str = "2023-06-01";
const MAX_RETRIES: u32 = 3;
const PROVIDER: &str = "claude";

#[derive(Clone)]
pub struct ClaudeProvider {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
    max_tokens: u32,
}

impl fmt::Debug for ClaudeProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClaudeProvider")
            .field("client", &"<reqwest::Client>")
            .field("api_key", &"<redacted>")
            .field("model", &self.model)
            .field("max_tokens", &self.max_tokens)
            .finish()
    }
}

impl ClaudeProvider {
    /// # Errors
    ///
    /// Returns an error if the API key is empty or the HTTP client cannot be built.
    pub fn new(
        api_key: String,
        model: String,
        max_tokens: u32,
        timeout: Duration,
    ) -> Result<Self, LlmError> {
        if api_key.trim().is_empty() {
            return Err(LlmError::MissingApiKey { provider: PROVIDER });
        }
        Ok(Self {
            client: crate::http::default_client(timeout)?,
            base_url: API_URL.to_owned(),
            api_key,
            model,
            max_tokens,
        })
    }

    #[must_use]
    pub fn with_base_url(mut self, url: &str) -> Self {
        url.trim_end_matches('/').clone_into(&mut self.base_url);
        self
    }

    async fn send_request(&self, messages: &[Message]) -> Result<String, LlmError> {
        let (system, chat_messages) = split_messages(messages);
        let body = RequestBody {
            model: &self.model,
            max_tokens: self.max_tokens,
            temperature: 0.0,
            system: system.as_deref(),
            messages: &chat_messages,
        };
        let url = format!("{}/messages", self.base_url);

        let response = send_with_retry(PROVIDER, MAX_RETRIES, || {
            self.client
                .post(&url)
                .header("x-api-key", &self.api_key)
                .header("anthropic-version", ANTHROPIC_VERSION)
                .json(&body)
                .send()
        })
        .await?;

        let status = response.status();
        let text = response.text().await.map_err(LlmError::Http)?;

        if !status.is_success() {
            tracing::error!("Claude API error {status}: {text}");
            return Err(LlmError::Api {
                provider: PROVIDER,
                status: status.as_u16(),
            });
        }

        let resp: ApiResponse = serde_json::from_str(&text)?;
        resp.content
            .into_iter()
            .find_map(|c| (c.kind == "text").then_some(c.text))
            .filter(|t| !t.is_empty())
            .ok_or(LlmError::EmptyResponse { provider: PROVIDER })
    }
}

impl LlmProvider for ClaudeProvider {
    async fn chat(&self, messages: &[Message]) -> Result<String, LlmError> {
        self.send_request(messages).await
    }

    fn name(&self) -> &'static str {
        PROVIDER
    }
}

/// Claude takes the system prompt as a top-level field, not as a message.
fn split_messages(messages: &[Message]) -> (Option<String>, Vec<ApiMessage<'_>>) {
    let mut system: Option<String> = None;
    let mut chat = Vec::with_capacity(messages.len());
    for msg in messages {
        match msg.role {
            Role::System => match system.as_mut() {
                Some(s) => {
                    s.push_str("\n\n");
                    s.push_str(&msg.content);
                }
                None => system = Some(msg.content.clone()),
            },
            Role::User | Role::Assistant => chat.push(ApiMessage {
                role: msg.role,
                content: &msg.content,
            }),
        }
    }
    (system, chat)
}

#[derive(Serialize)]
struct RequestBody<'a> {
    model: &'a str,
    max_tokens: u32,
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<&'a str>,
    messages: &'a [ApiMessage<'a>],
}

#[derive(Serialize)]
struct ApiMessage<'a> {
    role: Role,
    content: &'a str,
}

#[derive(Deserialize)]
struct ApiResponse {
    content: Vec<ContentBlock>,
}

#[derive(Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: String,
}

#[cfg(test)]
mod tests {
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;

    fn provider(url: &str) -> ClaudeProvider {
        ClaudeProvider::new(
            "key".into(),
            "claude-test".into(),
            256,
            Duration::from_secs(5),
        )
        .unwrap()
        .with_base_url(url)
    }

    #[test]
    fn split_messages_extracts_system() {
        let messages = vec![
            Message::system("be brief"),
            Message::user("hello"),
            Message::system("cite sources"),
        ];
        let (system, chat) = split_messages(&messages);
        assert_eq!(system.as_deref(), Some("be brief\n\ncite sources"));
        assert_eq!(chat.len(), 1);
        assert_eq!(chat[0].content, "hello");
    }

    #[test]
    fn missing_key_rejected() {
        let result = ClaudeProvider::new(String::new(), "m".into(), 1, Duration::from_secs(1));
        assert!(matches!(result, Err(LlmError::MissingApiKey { .. })));
    }

    #[tokio::test]
    async fn chat_returns_first_text_block() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/messages"))
            .and(header("x-api-key", "key"))
            .and(body_partial_json(serde_json::json!({"system": "sys"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "content": [{"type": "text", "text": "the torque is 12 Nm"}]
            })))
            .mount(&server)
            .await;

        let answer = provider(&server.uri())
            .chat(&[Message::system("sys"), Message::user("torque?")])
            .await
            .unwrap();
        assert_eq!(answer, "the torque is 12 Nm");
    }

    #[tokio::test]
    async fn empty_content_is_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({"content": []})),
            )
            .mount(&server)
            .await;

        let result = provider(&server.uri()).chat(&[Message::user("q")]).await;
        assert!(matches!(result, Err(LlmError::EmptyResponse { .. })));
    }

    #[tokio::test]
    async fn server_error_mapped_to_api_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let result = provider(&server.uri()).chat(&[Message::user("q")]).await;
        assert!(matches!(result, Err(LlmError::Api { status: 500, .. })));
    }
}
