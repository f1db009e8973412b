//! Embedding and answer-generation provider abstraction with Voyage and Claude backends.

pub mod claude;
pub mod error;
pub mod http;
#[cfg(feature = "mock")]
pub mod mock;
pub mod provider;
pub(crate) mod retry;
pub mod voyage;

pub use error::{ErrorKind, LlmError};
pub use provider::{EmbeddingProvider, InputType, LlmProvider};
