//! Error types for the adaptive cache engine

use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the cache engine
#[derive(Error, Debug)]
pub enum Error {
    /// Codec round-trip or value serialization failed; nothing was stored
    #[error("Encoding failed: {reason}")]
    Encode { reason: String },

    /// A stored payload could not be decoded back to its original bytes
    #[error("Decoding failed for {namespace}/{key}: {reason}")]
    Decode {
        namespace: String,
        key: String,
        reason: String,
    },

    /// A caller-supplied backend fetch failed
    #[error("Fetch failed for {namespace}/{key}: {reason}")]
    Fetch {
        namespace: String,
        key: String,
        reason: String,
    },

    /// Primary store configuration was rejected at construction
    #[error("Storage initialization failed: {0}")]
    StorageInit(String),

    /// Irreconcilable cross-process divergence for a key
    #[error("Conflict detected for {namespace}/{key}: equal versions, differing content")]
    Conflict { namespace: String, key: String },

    /// Broadcast channel send failed
    #[error("Broadcast send failed: {0}")]
    Broadcast(String),

    /// Fallback store operation failed
    #[error("Fallback store error: {0}")]
    Fallback(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Shorthand for an encode error with a formatted reason.
    pub fn encode(reason: impl Into<String>) -> Self {
        Error::Encode {
            reason: reason.into(),
        }
    }

    /// Shorthand for a decode error.
    pub fn decode(
        namespace: impl Into<String>,
        key: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Error::Decode {
            namespace: namespace.into(),
            key: key.into(),
            reason: reason.into(),
        }
    }

    /// Shorthand for a fetch error.
    pub fn fetch(
        namespace: impl Into<String>,
        key: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Error::Fetch {
            namespace: namespace.into(),
            key: key.into(),
            reason: reason.into(),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
