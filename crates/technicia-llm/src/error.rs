/// Failure classes shared by every pipeline layer.
///
/// Callers branch on the class rather than on concrete error variants: input errors are
/// never retried, transient errors are retried with backoff, provider errors surface as a
/// degraded service and consistency errors fail the current request only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Input,
    TransientIo,
    Provider,
    Consistency,
}

#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON parse failed: {0}")]
    Json(#[from] serde_json::Error),

    #[error("rate limited")]
    RateLimited,

    #[error("request to {provider} timed out")]
    Timeout { provider: &'static str },

    #[error("{provider} API request failed (status {status})")]
    Api { provider: &'static str, status: u16 },

    #[error("empty response from {provider}")]
    EmptyResponse { provider: &'static str },

    #[error("{provider} returned {got} embeddings for {expected} inputs")]
    CountMismatch {
        provider: &'static str,
        expected: usize,
        got: usize,
    },

    #[error("missing API key for {provider}")]
    MissingApiKey { provider: &'static str },

    #[error("{0}")]
    Other(String),
}

impl LlmError {
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Http(e) if e.is_timeout() || e.is_connect() => ErrorKind::TransientIo,
            Self::RateLimited | Self::Timeout { .. } => ErrorKind::TransientIo,
            Self::Api { status, .. } if *status >= 500 => ErrorKind::TransientIo,
            Self::Api { status, .. } if *status == 400 || *status == 413 => ErrorKind::Input,
            Self::CountMismatch { .. } => ErrorKind::Consistency,
            Self::Http(_)
            | Self::Json(_)
            | Self::Api { .. }
            | Self::EmptyResponse { .. }
            | Self::MissingApiKey { .. }
            | Self::Other(_) => ErrorKind::Provider,
        }
    }

    /// Whether retrying the same request can succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::TransientIo
    }
}

pub type Result<T> = std::result::Result<T, LlmError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_errors_are_transient() {
        let err = LlmError::Api {
            provider: "voyage",
            status: 503,
        };
        assert_eq!(err.kind(), ErrorKind::TransientIo);
        assert!(err.is_retryable());
    }

    #[test]
    fn oversized_batch_is_input_error() {
        let err = LlmError::Api {
            provider: "voyage",
            status: 413,
        };
        assert_eq!(err.kind(), ErrorKind::Input);
        assert!(!err.is_retryable());
    }

    #[test]
    fn auth_failure_is_provider_error() {
        let err = LlmError::Api {
            provider: "claude",
            status: 401,
        };
        assert_eq!(err.kind(), ErrorKind::Provider);
    }

    #[test]
    fn count_mismatch_is_consistency_error() {
        let err = LlmError::CountMismatch {
            provider: "voyage",
            expected: 3,
            got: 2,
        };
        assert_eq!(err.kind(), ErrorKind::Consistency);
    }

    #[test]
    fn timeout_and_rate_limit_retryable() {
        assert!(LlmError::RateLimited.is_retryable());
        assert!(LlmError::Timeout { provider: "claude" }.is_retryable());
        assert!(!LlmError::Other("boom".into()).is_retryable());
    }
}
