//! Error types for policy sources.

use thiserror::Error;

/// Result type for source operations.
pub type Result<T> = std::result::Result<T, SourceError>;

/// Message fragments that mark a source error as a dead transport rather
/// than a transient hiccup. Matched case-insensitively as substrings.
const UNRECOVERABLE_PATTERNS: &[&str] = &["connection refused", "eof"];

/// Errors surfaced by a policy source.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SourceError {
    /// The ID monitor failed.
    #[error("policy monitor failed: {message}")]
    Monitor {
        /// Transport- or source-reported failure.
        message: String,
    },

    /// Fetching one policy document failed.
    #[error("failed to fetch policy {policy_id}: {message}")]
    Fetch {
        /// The policy that could not be fetched.
        policy_id: String,
        /// Underlying failure.
        message: String,
    },

    /// The source has no policy under the given ID.
    #[error("policy {policy_id} not found")]
    NotFound {
        /// The unknown ID.
        policy_id: String,
    },

    /// A policy document exists but is unusable.
    #[error("policy {policy_id} is invalid: {message}")]
    InvalidPolicy {
        /// The offending policy.
        policy_id: String,
        /// Validation or parse failure.
        message: String,
    },
}

impl SourceError {
    /// True when the transport behind the source is gone and the monitor
    /// cannot make progress; the manager reacts by tearing down and
    /// restarting after a back-off.
    #[must_use]
    pub fn is_unrecoverable(&self) -> bool {
        let message = match self {
            Self::Monitor { message } | Self::Fetch { message, .. } => message,
            Self::NotFound { .. } | Self::InvalidPolicy { .. } => return false,
        };
        let lowered = message.to_lowercase();
        UNRECOVERABLE_PATTERNS.iter().any(|p| lowered.contains(p))
    }
}
