//! Error types for the relay core.
//!
//! None of these cross the control surface. They are returned internally so
//! callers can log them and tests can match on them; the public operations
//! swallow them and report through the running flag and the diagnostic log.

use std::path::PathBuf;

use thiserror::Error;

use crate::common::types::CaptureSource;

/// A field of the durable store could not be read or written
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error while {operation} at {path}: {source}")]
    Io {
        operation: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("field '{field}' at {path} holds malformed JSON: {source}")]
    Decode {
        field: &'static str,
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to encode field '{field}': {source}")]
    Encode {
        field: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

impl StoreError {
    #[must_use]
    pub fn io(operation: &'static str, path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            operation,
            path: path.into(),
            source,
        }
    }
}

/// Delivery of an event or signal to one endpoint failed
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EndpointError {
    #[error("endpoint is closed")]
    Closed,

    #[error("endpoint rejected delivery: {0}")]
    Rejected(String),
}

/// The host refused to promote the process to a persistent state
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StartupFailure {
    #[error("another instance already holds the service (pid {pid})")]
    AlreadyClaimed { pid: u32 },

    #[error("host rejected promotion: {0}")]
    Rejected(String),

    #[error("promotion could not be verified")]
    Unverified,
}

/// The host refused an OS-level capture subscription
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("subscription to {capture} refused: {reason}")]
pub struct SubscribeError {
    pub capture: CaptureSource,
    pub reason: String,
}

/// A background job finished without handing back a result
#[derive(Debug, Error)]
pub enum OffloadError {
    #[error("background job '{name}' panicked or was cancelled")]
    Aborted { name: &'static str },
}
