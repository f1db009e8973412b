use std::path::PathBuf;

use technicia_llm::ErrorKind;

#[derive(Debug, thiserror::Error)]
pub enum DocumentError {
    #[error("file not found: {}", .0.display())]
    NotFound(PathBuf),

    #[error("unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("not a PDF document: {}", .0.display())]
    NotPdf(PathBuf),

    #[error("file too large: {0} bytes")]
    FileTooLarge(u64),

    /// The file looks truncated, most likely still being written.
    #[error("partially written file: {}", .0.display())]
    Partial(PathBuf),

    #[error("file is locked or busy: {}", .path.display())]
    Locked {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("PDF error: {0}")]
    Pdf(String),

    #[error("extraction task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl DocumentError {
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound(_)
            | Self::UnsupportedFormat(_)
            | Self::NotPdf(_)
            | Self::FileTooLarge(_)
            | Self::Pdf(_) => ErrorKind::Input,
            Self::Partial(_) | Self::Locked { .. } | Self::Io(_) | Self::Join(_) => {
                ErrorKind::TransientIo
            }
        }
    }

    /// Whether a later read of the same file may succeed.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        self.kind() == ErrorKind::TransientIo
    }
}
