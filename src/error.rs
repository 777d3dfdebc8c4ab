//! Error types for mediador-crawler
//!
//! This module provides the crate-wide [`Error`] plus the attachment failure
//! classification used by the fetcher and the retry policy:
//! - [`Error`] - navigation, form, extraction, storage and configuration failures
//! - [`FetchFailure`] - why an attachment could not be captured

use std::path::PathBuf;
use thiserror::Error;

use crate::signature::PayloadKind;

/// Result type alias for mediador-crawler operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for mediador-crawler
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error with context about which setting is invalid
    #[error("configuration error: {message}")]
    Config {
        /// Human-readable error message describing the configuration issue
        message: String,
        /// The configuration key that caused the error (e.g., "max_workers")
        key: Option<String>,
    },

    /// Page navigation or load wait failed
    #[error("navigation to {url} failed: {reason}")]
    Navigation {
        /// Target URL (or a description of the action for clicks)
        url: String,
        /// Underlying cause
        reason: String,
        /// Whether the failure was a timeout
        timed_out: bool,
    },

    /// A form control the search depends on is not on the page
    #[error("form field not found: {0}")]
    FormFieldNotFound(String),

    /// The current page could not be read or parsed
    #[error("extraction failed on page {page}: {reason}")]
    Extraction {
        /// 1-based page number
        page: u32,
        /// Underlying cause
        reason: String,
    },

    /// Attachment could not be captured
    #[error("attachment fetch failed: {0}")]
    AttachmentFetch(#[from] FetchFailure),

    /// Writing to the artifact store failed
    #[error("failed to write {path}: {reason}")]
    StorageWrite {
        /// Path being written
        path: PathBuf,
        /// Underlying cause
        reason: String,
    },

    /// The data root could not be created or is not a directory
    #[error("storage root {path} unavailable: {reason}")]
    StorageRootUnavailable {
        /// Configured root
        path: PathBuf,
        /// Underlying cause
        reason: String,
    },

    /// The session backend cannot perform the requested operation
    #[error("not supported: {0}")]
    NotSupported(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Network error
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Other error
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Shorthand for a configuration error tied to a key
    pub fn config(key: &str, message: impl Into<String>) -> Self {
        Error::Config {
            message: message.into(),
            key: Some(key.to_string()),
        }
    }
}

/// Why an attachment could not be captured for a record
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum FetchFailure {
    /// The listing row carried no download token
    #[error("record has no download token")]
    TokenMissing,

    /// The per-record summary page could not be retrieved
    #[error("detail page unreachable: {0}")]
    DetailPageUnreachable(String),

    /// The summary page has no attachment link
    #[error("no attachment link on detail page")]
    LinkNotFound,

    /// The transfer did not complete within the hard timeout
    #[error("transfer timed out after {0} seconds")]
    TransferTimedOut(u64),

    /// The server answered the attachment request with an error status
    #[error("transfer rejected with HTTP status {0}")]
    TransferRejected(u16),

    /// The connection broke while requesting or reading the attachment
    #[error("transfer interrupted: {0}")]
    TransferInterrupted(String),

    /// The bytes received are not the expected file type
    #[error("signature mismatch: received {0}")]
    SignatureMismatch(PayloadKind),
}

impl FetchFailure {
    /// Short machine-readable label used in events and logs
    pub fn label(&self) -> &'static str {
        match self {
            FetchFailure::TokenMissing => "token_missing",
            FetchFailure::DetailPageUnreachable(_) => "detail_page_unreachable",
            FetchFailure::LinkNotFound => "link_not_found",
            FetchFailure::TransferTimedOut(_) => "transfer_timed_out",
            FetchFailure::TransferRejected(_) => "transfer_rejected",
            FetchFailure::TransferInterrupted(_) => "transfer_interrupted",
            FetchFailure::SignatureMismatch(_) => "signature_mismatch",
        }
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fetch_failure_converts_into_error() {
        let err: Error = FetchFailure::TransferRejected(503).into();
        assert_eq!(
            err.to_string(),
            "attachment fetch failed: transfer rejected with HTTP status 503"
        );
    }

    #[test]
    fn signature_mismatch_names_detected_payload() {
        let failure = FetchFailure::SignatureMismatch(PayloadKind::Html);
        assert_eq!(failure.to_string(), "signature mismatch: received HTML");
        assert_eq!(failure.label(), "signature_mismatch");
    }

    #[test]
    fn config_helper_records_key() {
        match Error::config("max_workers", "must be at least 1") {
            Error::Config { key, message } => {
                assert_eq!(key.as_deref(), Some("max_workers"));
                assert_eq!(message, "must be at least 1");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
