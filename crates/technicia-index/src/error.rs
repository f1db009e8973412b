//! Error types for technicia-index.

use std::path::Path;

use technicia_llm::ErrorKind;
use technicia_memory::document::DocumentError;
use technicia_memory::document::splitter::SplitterConfigError;
use technicia_memory::{EmbedError, VectorStoreError};

/// Errors that can occur while indexing documents.
#[derive(Debug, thiserror::Error)]
pub enum IndexError {
    /// Loading or parsing a document failed.
    #[error(transparent)]
    Document(#[from] DocumentError),

    #[error(transparent)]
    Embed(#[from] EmbedError),

    #[error(transparent)]
    Store(#[from] VectorStoreError),

    #[error(transparent)]
    Splitter(#[from] SplitterConfigError),

    /// File watcher error.
    #[error("watcher error: {0}")]
    Watcher(#[from] notify::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl IndexError {
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Document(e) => e.kind(),
            Self::Embed(e) => e.kind(),
            Self::Store(e) => e.kind(),
            Self::Splitter(_) | Self::Watcher(_) => ErrorKind::Input,
            Self::Io(_) => ErrorKind::TransientIo,
        }
    }

    /// Stat errors for `path`, with a missing file reported as an input error.
    pub(crate) fn from_stat(path: &Path, err: std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::NotFound {
            Self::Document(DocumentError::NotFound(path.to_path_buf()))
        } else {
            Self::Io(err)
        }
    }
}

/// Result type alias using `IndexError`.
pub type Result<T> = std::result::Result<T, IndexError>;
