//! Error types for the policy model.

use thiserror::Error;

/// Result type for policy operations.
pub type Result<T> = std::result::Result<T, PolicyError>;

/// Errors that can occur while handling policy documents.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PolicyError {
    /// The policy document failed validation. Every violation found is
    /// collected so a user can fix the document in one pass.
    #[error("invalid scaling policy: {}", violations.join("; "))]
    Invalid {
        /// One entry per violated rule.
        violations: Vec<String>,
    },

    /// The policy document could not be parsed.
    #[error("malformed policy document: {reason}")]
    Malformed {
        /// Description of the parse failure.
        reason: String,
    },
}

impl PolicyError {
    /// Builds an `Invalid` error from collected violations.
    ///
    /// Returns `Ok(())` when the list is empty so validation call sites can
    /// end with `PolicyError::from_violations(violations)`.
    pub fn from_violations(violations: Vec<String>) -> Result<()> {
        if violations.is_empty() {
            Ok(())
        } else {
            Err(Self::Invalid { violations })
        }
    }
}
