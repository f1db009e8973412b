//! Test-only mock provider implementing both embedding and chat.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::error::LlmError;
use crate::provider::{EmbeddingProvider, InputType, LlmProvider, Message};

#[derive(Debug, Clone)]
pub struct MockProvider {
    responses: Arc<Mutex<Vec<String>>>,
    pub default_response: String,
    pub embedding: Vec<f32>,
    pub fail_chat: bool,
    /// 1-based `embed_batch` call number that fails with a provider error.
    pub fail_embed_on_call: Option<usize>,
    /// Milliseconds to sleep before returning.
    pub delay_ms: u64,
    embed_calls: Arc<AtomicUsize>,
    embedded_texts: Arc<AtomicUsize>,
    chat_calls: Arc<AtomicUsize>,
    last_prompt: Arc<Mutex<Option<String>>>,
}

impl Default for MockProvider {
    fn default() -> Self {
        Self {
            responses: Arc::new(Mutex::new(Vec::new())),
            default_response: "mock response".into(),
            embedding: vec![1.0, 0.0, 0.0, 0.0],
            fail_chat: false,
            fail_embed_on_call: None,
            delay_ms: 0,
            embed_calls: Arc::new(AtomicUsize::new(0)),
            embedded_texts: Arc::new(AtomicUsize::new(0)),
            chat_calls: Arc::new(AtomicUsize::new(0)),
            last_prompt: Arc::new(Mutex::new(None)),
        }
    }
}

impl MockProvider {
    #[must_use]
    pub fn with_responses(responses: Vec<String>) -> Self {
        Self {
            responses: Arc::new(Mutex::new(responses)),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_embedding(mut self, embedding: Vec<f32>) -> Self {
        self.embedding = embedding;
        self
    }

    #[must_use]
    pub fn failing() -> Self {
        Self {
            fail_chat: true,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn fail_embed_on_call(mut self, call: usize) -> Self {
        self.fail_embed_on_call = Some(call);
        self
    }

    #[must_use]
    pub fn with_delay(mut self, ms: u64) -> Self {
        self.delay_ms = ms;
        self
    }

    #[must_use]
    pub fn embed_calls(&self) -> usize {
        self.embed_calls.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn embedded_texts(&self) -> usize {
        self.embedded_texts.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn chat_calls(&self) -> usize {
        self.chat_calls.load(Ordering::SeqCst)
    }

    /// The last user message seen by `chat`.
    #[must_use]
    pub fn last_prompt(&self) -> Option<String> {
        self.last_prompt.lock().unwrap().clone()
    }

    async fn maybe_delay(&self) {
        if self.delay_ms > 0 {
            tokio::time::sleep(std::time::Duration::from_millis(self.delay_ms)).await;
        }
    }
}

impl LlmProvider for MockProvider {
    fn name(&self) -> &'static str {
        "mock"
    }

    async fn chat(&self, messages: &[Message]) -> Result<String, LlmError> {
        self.chat_calls.fetch_add(1, Ordering::SeqCst);
        self.maybe_delay().await;
        if let Some(last) = messages.last() {
            *self.last_prompt.lock().unwrap() = Some(last.content.clone());
        }
        if self.fail_chat {
            return Err(LlmError::Other("mock LLM error".into()));
        }
        let mut responses = self.responses.lock().unwrap();
        if responses.is_empty() {
            Ok(self.default_response.clone())
        } else {
            Ok(responses.remove(0))
        }
    }
}

impl EmbeddingProvider for MockProvider {
    fn name(&self) -> &'static str {
        "mock"
    }

    async fn embed_batch(
        &self,
        texts: &[String],
        _input_type: InputType,
    ) -> Result<Vec<Vec<f32>>, LlmError> {
        let call = self.embed_calls.fetch_add(1, Ordering::SeqCst) + 1;
        self.maybe_delay().await;
        if self.fail_embed_on_call == Some(call) {
            return Err(LlmError::Other("mock embed error".into()));
        }
        self.embedded_texts.fetch_add(texts.len(), Ordering::SeqCst);
        Ok(texts.iter().map(|_| self.embedding.clone()).collect())
    }
}
