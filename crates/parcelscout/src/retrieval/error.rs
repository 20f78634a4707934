use std::time::Duration;

use thiserror::Error;

/// Errors from either retrieval strategy.
///
/// `is_retryable` and `is_auth_expired` are the only places the rest of the
/// crate inspects a retrieval failure.
#[derive(Debug, Error)]
pub enum RetrievalError {
    #[error("{strategy} path timed out after {after:?}")]
    Timeout {
        strategy: &'static str,
        after: Duration,
    },

    #[error("Network error: {0}")]
    Network(String),

    #[error("Source server error (status {status}): {body}")]
    Server { status: u16, body: String },

    #[error("Rate limited by source (retry after {retry_after_secs:?}s)")]
    RateLimited { retry_after_secs: Option<u64> },

    #[error("Suspicious response from source: {0}")]
    Suspicious(String),

    #[error("Browser automation failed: {0}")]
    Browser(String),

    #[error("Bearer token rejected (status {status})")]
    AuthExpired { status: u16 },

    #[error("Request rejected by source (status {status}): {body}")]
    Rejected { status: u16, body: String },

    #[error("Invalid search input: {0}")]
    InvalidInput(String),
}

impl RetrievalError {
    /// Whether another attempt of the same job may succeed.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::Rejected { .. } | Self::InvalidInput(_))
    }

    pub fn is_auth_expired(&self) -> bool {
        matches!(self, Self::AuthExpired { .. })
    }

    /// Short machine-readable kind, used as a structured log field.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Timeout { .. } => "timeout",
            Self::Network(_) => "network",
            Self::Server { .. } => "server",
            Self::RateLimited { .. } => "rate_limited",
            Self::Suspicious(_) => "suspicious",
            Self::Browser(_) => "browser",
            Self::AuthExpired { .. } => "auth_expired",
            Self::Rejected { .. } => "rejected",
            Self::InvalidInput(_) => "invalid_input",
        }
    }
}

impl From<reqwest::Error> for RetrievalError {
    fn from(err: reqwest::Error) -> Self {
        RetrievalError::Network(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        assert!(RetrievalError::Server {
            status: 502,
            body: String::new()
        }
        .is_retryable());
        assert!(RetrievalError::Suspicious("html".into()).is_retryable());
        assert!(RetrievalError::RateLimited {
            retry_after_secs: Some(30)
        }
        .is_retryable());
        assert!(!RetrievalError::InvalidInput("empty".into()).is_retryable());
        assert!(!RetrievalError::Rejected {
            status: 400,
            body: String::new()
        }
        .is_retryable());

        let auth = RetrievalError::AuthExpired { status: 401 };
        assert!(auth.is_auth_expired());
        assert!(auth.is_retryable());
        assert_eq!(auth.kind(), "auth_expired");
    }

    #[test]
    fn test_timeout_message() {
        let err = RetrievalError::Timeout {
            strategy: "slow",
            after: Duration::from_secs(90),
        };
        assert_eq!(err.to_string(), "slow path timed out after 90s");
    }
}
