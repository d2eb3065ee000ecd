//! Error taxonomy for the ingestion pipeline.
//!
//! Every failure that reaches a worker is a [`HarvestError`]. The variant
//! decides three things: the [`ErrorCategory`] it is recorded under, whether
//! the retry policy may try again, and whether it ends the whole cycle.
//!
//! | Variant | Category | Transient | Cycle-fatal |
//! |---------|----------|-----------|-------------|
//! | `Network` | network | yes | no |
//! | `Http` 429 / 5xx | network | yes | no |
//! | `Http` other 4xx | network | no | no |
//! | `Timeout` | network | yes | no |
//! | `Content` | parse | no | no |
//! | `Integrity` | validation | yes | no |
//! | `Storage` | storage | no | **yes** |
//! | `Configuration` | validation | no | **yes** |
//! | `LockBusy` | storage | no | no |
//! | `Cancelled` | processing | no | no |
//! | `Processing` | processing | no | no |

use std::time::Duration;

use paper_harvest_core::models::{ErrorCategory, ErrorRecord};
use paper_harvest_core::retry::RetryClass;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum HarvestError {
    #[error("network error: {0}")]
    Network(String),

    #[error("HTTP {status}: {message}")]
    Http {
        status: u16,
        message: String,
        retry_after: Option<Duration>,
    },

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("content error: {0}")]
    Content(String),

    #[error("integrity check failed: {0}")]
    Integrity(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("instance '{0}' is locked by another cycle")]
    LockBusy(String),

    #[error("cancelled")]
    Cancelled,

    #[error("processing error: {0}")]
    Processing(String),
}

pub type HarvestResult<T> = std::result::Result<T, HarvestError>;

impl HarvestError {
    pub fn http(status: u16, message: impl Into<String>) -> Self {
        HarvestError::Http {
            status,
            message: message.into(),
            retry_after: None,
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            HarvestError::Network(_) | HarvestError::Http { .. } | HarvestError::Timeout(_) => {
                ErrorCategory::Network
            }
            HarvestError::Content(_) => ErrorCategory::Parse,
            HarvestError::Integrity(_) | HarvestError::Configuration(_) => {
                ErrorCategory::Validation
            }
            HarvestError::Storage(_) | HarvestError::LockBusy(_) => ErrorCategory::Storage,
            HarvestError::Cancelled | HarvestError::Processing(_) => ErrorCategory::Processing,
        }
    }

    /// Whether this error ends the instance cycle rather than one document.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            HarvestError::Storage(_) | HarvestError::Configuration(_)
        )
    }

    /// Build the ledger entry for this error.
    pub fn to_record(&self, document_id: Option<&str>, retries: u32) -> ErrorRecord {
        let mut record = ErrorRecord::new(self.category(), self.to_string()).with_retries(retries);
        if let Some(id) = document_id {
            record = record.for_document(id);
        }
        if self.is_fatal() {
            record = record.fatal();
        }
        record
    }
}

impl RetryClass for HarvestError {
    fn is_transient(&self) -> bool {
        match self {
            HarvestError::Network(_) | HarvestError::Timeout(_) | HarvestError::Integrity(_) => {
                true
            }
            HarvestError::Http { status, .. } => *status == 429 || (500..600).contains(status),
            _ => false,
        }
    }

    fn retry_after_hint(&self) -> Option<Duration> {
        match self {
            HarvestError::Http { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

impl From<std::io::Error> for HarvestError {
    fn from(e: std::io::Error) -> Self {
        HarvestError::Storage(e.to_string())
    }
}

impl From<serde_json::Error> for HarvestError {
    fn from(e: serde_json::Error) -> Self {
        HarvestError::Storage(format!("state serialization: {}", e))
    }
}

impl From<reqwest::Error> for HarvestError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            return HarvestError::Timeout(Duration::ZERO);
        }
        match e.status() {
            Some(status) => HarvestError::http(status.as_u16(), e.to_string()),
            None => HarvestError::Network(e.to_string()),
        }
    }
}

impl From<sqlx::Error> for HarvestError {
    fn from(e: sqlx::Error) -> Self {
        HarvestError::Storage(format!("vector store: {}", e))
    }
}

impl From<tokio::time::error::Elapsed> for HarvestError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        HarvestError::Timeout(Duration::ZERO)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_status_decides_transience() {
        assert!(HarvestError::http(429, "slow down").is_transient());
        assert!(HarvestError::http(503, "unavailable").is_transient());
        assert!(!HarvestError::http(404, "missing").is_transient());
        assert_eq!(HarvestError::http(404, "missing").category(), ErrorCategory::Network);
    }

    #[test]
    fn corrupt_download_is_retryable_validation() {
        let err = HarvestError::Integrity("not a PDF".into());
        assert!(err.is_transient());
        assert_eq!(err.category(), ErrorCategory::Validation);
        assert!(!err.is_fatal());
    }

    #[test]
    fn storage_is_fatal_and_never_retried() {
        let err: HarvestError = std::io::Error::new(std::io::ErrorKind::Other, "disk full").into();
        assert!(err.is_fatal());
        assert!(!err.is_transient());
        let record = err.to_record(Some("arxiv:1"), 0);
        assert!(record.fatal);
        assert_eq!(record.category, ErrorCategory::Storage);
        assert_eq!(record.document_id.as_deref(), Some("arxiv:1"));
    }

    #[test]
    fn retry_after_is_exposed() {
        let err = HarvestError::Http {
            status: 429,
            message: "throttled".into(),
            retry_after: Some(Duration::from_secs(7)),
        };
        assert_eq!(err.retry_after_hint(), Some(Duration::from_secs(7)));
    }
}
