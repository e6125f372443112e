//! Error types for the snapshot model and differ.

use thiserror::Error;

/// Errors raised by snapshot lookups and parsing.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CoreError {
    /// A group name was expected in a snapshot but is absent.
    #[error("group not found: {group}")]
    NotFound {
        /// The missing group name.
        group: String,
    },

    /// A role string did not name any known role.
    #[error("unknown role: {role}")]
    UnknownRole {
        /// The unrecognized role string.
        role: String,
    },
}
