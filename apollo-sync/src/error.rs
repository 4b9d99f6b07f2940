//! Error types for configuration sync operations

use crate::identity::NamespaceIdentity;
use apollo_keypath::{AssemblyError, KeyPathError};
use thiserror::Error;

/// Errors from sync operations
///
/// `Clone` so one refresh result can be handed to every caller coalesced
/// onto it.
#[derive(Debug, Clone, Error)]
pub enum SyncError {
    /// The namespace contains a key that cannot be assembled
    #[error("Malformed configuration: {0}")]
    MalformedKey(#[from] AssemblyError),

    /// Network error communicating with the configuration service
    #[error("Remote communication error: {0}")]
    Remote(String),

    /// The configuration service answered with an unexpected status
    #[error("Unexpected status {status} from {url}")]
    Http { status: u16, url: String },

    /// Response body could not be decoded
    #[error("JSON error: {0}")]
    Json(String),

    /// The first fetch of a namespace failed and there is nothing cached
    #[error("Initial fetch failed for {identity}: {source}")]
    InitialFetch {
        identity: NamespaceIdentity,
        #[source]
        source: Box<SyncError>,
    },

    #[error("Sync engine is already running")]
    AlreadyStarted,

    #[error("Sync engine is not running")]
    NotStarted,

    /// Settings were read before their first successful load
    #[error("Settings '{0}' have not been loaded yet")]
    NotReady(String),

    /// Binding rejected at registration time
    #[error("Registration error: {0}")]
    Registration(String),

    /// The schema rejected a snapshot; the previous instance is kept
    #[error("Validation failed for '{binding}': {message}")]
    Validation { binding: String, message: String },

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Abandoned because the engine was stopped
    #[error("Operation cancelled")]
    Cancelled,
}

impl SyncError {
    /// Whether another attempt may succeed: transport failures, server errors
    /// and throttling. Client errors and undecodable bodies are final.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Remote(_) => true,
            SyncError::Http { status, .. } => *status >= 500 || *status == 429,
            _ => false,
        }
    }
}

impl From<reqwest::Error> for SyncError {
    fn from(e: reqwest::Error) -> Self {
        SyncError::Remote(e.to_string())
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(e: serde_json::Error) -> Self {
        SyncError::Json(e.to_string())
    }
}

impl From<KeyPathError> for SyncError {
    fn from(e: KeyPathError) -> Self {
        SyncError::MalformedKey(AssemblyError::MalformedKey(e))
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        let http = |status| SyncError::Http {
            status,
            url: "http://config/configs".to_string(),
        };

        assert!(SyncError::Remote("connection reset".to_string()).is_retryable());
        assert!(http(500).is_retryable());
        assert!(http(503).is_retryable());
        assert!(http(429).is_retryable());

        assert!(!http(404).is_retryable());
        assert!(!http(401).is_retryable());
        assert!(!SyncError::Json("eof".to_string()).is_retryable());
        assert!(!SyncError::Cancelled.is_retryable());
    }

    #[test]
    fn test_malformed_key_from_parse_error() {
        let err: SyncError = apollo_keypath::parse("a..b").unwrap_err().into();
        assert!(matches!(
            err,
            SyncError::MalformedKey(AssemblyError::MalformedKey(_))
        ));
    }
}
