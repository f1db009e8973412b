//! Query-time retrieval: embed the question, search, assemble context, ask the answerer.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use technicia_llm::provider::Message;
use technicia_llm::{EmbeddingProvider, ErrorKind, LlmError, LlmProvider};
use technicia_memory::{ChunkPayload, DocumentStore, EmbedError, EmbeddingGateway, SearchHit, VectorStoreError};

pub const SYSTEM_PROMPT: &str = "You are a technical documentation assistant. Answer the \
question using only the provided context extracted from technical documents. If the context \
does not contain the answer, say so plainly. Quote values, units and part numbers exactly as \
they appear, and mention the source document when it helps.";

pub const CONTEXT_DELIMITER: &str = "\n---\n";

pub const NOTHING_INDEXED: &str = "No documents have been indexed yet.";
pub const NO_RESULTS: &str = "No relevant information found in the indexed documents.";
pub const UNAVAILABLE: &str = "Search is temporarily unavailable. Please try again later.";
pub const EMPTY_QUERY: &str = "Please provide a question.";

#[derive(Debug, thiserror::Error)]
pub enum RetrievalError {
    #[error("query is empty")]
    EmptyQuery,

    #[error("query embedding failed: {0}")]
    Embed(#[from] EmbedError),

    #[error("vector search failed: {0}")]
    Store(#[from] VectorStoreError),

    /// Search returned hits but none carried usable text.
    #[error("{hits} search hits produced an empty context")]
    EmptyContext { hits: usize },

    #[error("answer generation failed: {0}")]
    Answer(#[from] LlmError),

    #[error("answer generation timed out")]
    AnswerTimeout,
}

impl RetrievalError {
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::EmptyQuery => ErrorKind::Input,
            Self::Embed(e) => e.kind(),
            Self::Store(e) => e.kind(),
            Self::EmptyContext { .. } => ErrorKind::Consistency,
            Self::Answer(e) => e.kind(),
            Self::AnswerTimeout => ErrorKind::TransientIo,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RetrievalConfig {
    pub limit: u64,
    /// Used when a search does not pass its own threshold.
    pub score_threshold: f32,
    /// Upper bound on the context handed to the answerer, in characters.
    pub max_context_chars: usize,
    pub answer_timeout: Duration,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            limit: 5,
            score_threshold: 0.7,
            max_context_chars: 12_000,
            answer_timeout: Duration::from_secs(120),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchOutcome {
    Answered,
    NoResults,
    NothingIndexed,
    /// A failure was turned into a fallback message.
    Degraded,
}

#[derive(Debug, Clone, Serialize)]
pub struct Source {
    pub score: f32,
    pub payload: ChunkPayload,
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchResponse {
    pub answer: String,
    pub sources: Vec<Source>,
    /// Number of chunks that made it into the context.
    pub context_used: usize,
    pub outcome: SearchOutcome,
}

impl SearchResponse {
    fn empty(answer: &str, outcome: SearchOutcome) -> Self {
        Self {
            answer: answer.to_owned(),
            sources: Vec::new(),
            context_used: 0,
            outcome,
        }
    }
}

pub struct Retriever<E, A> {
    gateway: EmbeddingGateway<E>,
    store: DocumentStore,
    answerer: Arc<A>,
    config: RetrievalConfig,
}

impl<E: EmbeddingProvider, A: LlmProvider> Retriever<E, A> {
    #[must_use]
    pub fn new(
        gateway: EmbeddingGateway<E>,
        store: DocumentStore,
        answerer: Arc<A>,
        config: RetrievalConfig,
    ) -> Self {
        Self {
            gateway,
            store,
            answerer,
            config,
        }
    }

    #[must_use]
    pub fn config(&self) -> &RetrievalConfig {
        &self.config
    }

    /// Answer `query` from the indexed chunks.
    ///
    /// `score_threshold: None` uses the configured default; pass `Some(-1.0)` to disable
    /// filtering.
    ///
    /// # Errors
    ///
    /// Returns [`RetrievalError`] on an empty query, a provider or store failure, or hits
    /// that yield no context.
    pub async fn search(
        &self,
        query: &str,
        limit: u64,
        score_threshold: Option<f32>,
    ) -> Result<SearchResponse, RetrievalError> {
        if query.trim().is_empty() {
            return Err(RetrievalError::EmptyQuery);
        }
        if self.store.point_count().await? == 0 {
            tracing::debug!("search on empty collection");
            return Ok(SearchResponse::empty(NOTHING_INDEXED, SearchOutcome::NothingIndexed));
        }

        let vector = self.gateway.embed_query(query).await?;
        let threshold = score_threshold.unwrap_or(self.config.score_threshold);
        let hits = self.store.search(vector, limit, threshold).await?;
        if hits.is_empty() {
            tracing::debug!(threshold, "no hits above threshold");
            return Ok(SearchResponse::empty(NO_RESULTS, SearchOutcome::NoResults));
        }

        let hits = dedup_by_hash(hits);
        let (context, used) = build_context(&hits, self.config.max_context_chars);
        if context.trim().is_empty() {
            return Err(RetrievalError::EmptyContext { hits: hits.len() });
        }

        let messages = [
            Message::system(SYSTEM_PROMPT),
            Message::user(format!("Context:\n{context}\n\nQuestion: {query}")),
        ];
        let answer = tokio::time::timeout(self.config.answer_timeout, self.answerer.chat(&messages))
            .await
            .map_err(|_| RetrievalError::AnswerTimeout)??;

        tracing::info!(hits = hits.len(), context_used = used, "answered query");
        Ok(SearchResponse {
            answer,
            sources: hits
                .into_iter()
                .map(|h| Source {
                    score: h.score,
                    payload: h.payload,
                })
                .collect(),
            context_used: used,
            outcome: SearchOutcome::Answered,
        })
    }

    /// Like [`Retriever::search`], but failures become a human-readable answer.
    pub async fn search_or_fallback(
        &self,
        query: &str,
        limit: u64,
        score_threshold: Option<f32>,
    ) -> SearchResponse {
        match self.search(query, limit, score_threshold).await {
            Ok(response) => response,
            Err(e) => {
                tracing::error!(error = %e, kind = ?e.kind(), "search failed");
                SearchResponse::empty(fallback_message(&e), SearchOutcome::Degraded)
            }
        }
    }
}

/// Only an empty query or an empty context has a message of its own; every other
/// failure, including a misconfigured embedding dimension, means the service is degraded.
#[must_use]
pub fn fallback_message(err: &RetrievalError) -> &'static str {
    match err {
        RetrievalError::EmptyQuery => EMPTY_QUERY,
        RetrievalError::EmptyContext { .. } => NO_RESULTS,
        RetrievalError::Embed(_)
        | RetrievalError::Store(_)
        | RetrievalError::Answer(_)
        | RetrievalError::AnswerTimeout => UNAVAILABLE,
    }
}

/// Keep the best-scoring hit per content hash, preserving order.
fn dedup_by_hash(hits: Vec<SearchHit>) -> Vec<SearchHit> {
    let mut seen = HashSet::new();
    hits.into_iter()
        .filter(|h| seen.insert(h.payload.content_hash.clone()))
        .collect()
}

/// Join hit texts with [`CONTEXT_DELIMITER`], cutting the last one to stay within
/// `max_chars`. Returns the context and how many hits contributed.
fn build_context(hits: &[SearchHit], max_chars: usize) -> (String, usize) {
    let mut context = String::new();
    let mut len = 0usize;
    let mut used = 0usize;
    let delimiter_len = CONTEXT_DELIMITER.chars().count();

    for hit in hits {
        let text = hit.payload.text.trim();
        if text.is_empty() {
            continue;
        }
        let sep = if used == 0 { 0 } else { delimiter_len };
        let room = max_chars.saturating_sub(len + sep);
        if room == 0 {
            break;
        }
        if used > 0 {
            context.push_str(CONTEXT_DELIMITER);
        }
        let text_len = text.chars().count();
        if text_len <= room {
            context.push_str(text);
            len += sep + text_len;
            used += 1;
        } else {
            context.extend(text.chars().take(room));
            used += 1;
            break;
        }
    }
    (context, used)
}
