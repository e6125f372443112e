//! Error types for the replication subsystem.

use groupsync_core::CoreError;
use thiserror::Error;

use crate::kvstore::StoreError;
use crate::ratelimit::RateLimitError;

/// Errors that can abort a replication cycle.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Snapshot lookup or parse failure.
    #[error(transparent)]
    Core(#[from] CoreError),

    /// Rate limiter misuse.
    #[error(transparent)]
    RateLimit(#[from] RateLimitError),

    /// Replication state store failure.
    #[error("state store error: {0}")]
    Store(#[from] StoreError),

    /// A remote system answered with an error.
    #[error("remote error{}: {msg}", status_suffix(.status))]
    Remote {
        /// HTTP status, when the failure came from an HTTP response.
        status: Option<u16>,
        /// Error message or response body.
        msg: String,
    },

    /// HTTP transport error.
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// Invalid or missing configuration.
    #[error("configuration error: {msg}")]
    Config {
        /// Error message describing the issue.
        msg: String,
    },

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON encoding error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

/// How a cycle-aborting error should be escalated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Known intermittent upstream condition; log only.
    Transient,
    /// Anything else; log and report to monitoring.
    Fatal,
}

fn status_suffix(status: &Option<u16>) -> String {
    status.map(|s| format!(" (HTTP {s})")).unwrap_or_default()
}

const TRANSIENT_STATUSES: &[u16] = &[502, 503, 504];
const TRANSIENT_SIGNATURES: &[&str] = &["backendError", "Bad Gateway"];

impl SyncError {
    /// Shorthand for a remote error.
    pub fn remote(status: Option<u16>, msg: impl Into<String>) -> Self {
        SyncError::Remote {
            status,
            msg: msg.into(),
        }
    }

    /// Classify this error for escalation at the cycle boundary.
    pub fn class(&self) -> ErrorClass {
        let status = match self {
            SyncError::Remote { status, .. } => *status,
            SyncError::Http(e) => e.status().map(|s| s.as_u16()),
            _ => None,
        };
        if status.is_some_and(|s| TRANSIENT_STATUSES.contains(&s)) {
            return ErrorClass::Transient;
        }

        let rendered = self.to_string();
        if TRANSIENT_SIGNATURES.iter().any(|sig| rendered.contains(sig)) {
            ErrorClass::Transient
        } else {
            ErrorClass::Fatal
        }
    }
}
