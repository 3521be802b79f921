//! Error taxonomy of the control loop.

use davit_policy::PolicyId;
use thiserror::Error;

/// Result type for control loop operations.
pub type Result<T> = std::result::Result<T, CoreError>;

/// Errors produced inside the control loop.
///
/// Check-level failures (`NoMetrics`, `Query`, `Strategy`) are subject to
/// the check's error-resolution rules and may never leave the check runner;
/// everything else is surfaced on the manager's error channel.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CoreError {
    /// The target adapter reported that the target does not exist.
    #[error("target for policy {policy_id} not found")]
    TargetNotFound {
        /// The policy whose target is missing.
        policy_id: PolicyId,
    },

    /// Querying the target's status failed.
    #[error("status of target for policy {policy_id} failed: {message}")]
    TargetStatus {
        /// The policy whose status call failed.
        policy_id: PolicyId,
        /// Adapter-reported failure.
        message: String,
    },

    /// A check's query returned no samples.
    #[error("check {check} returned no metrics")]
    NoMetrics {
        /// The check whose query came back empty.
        check: String,
    },

    /// A check's metric query failed.
    #[error("query for check {check} failed: {message}")]
    Query {
        /// The failing check.
        check: String,
        /// Backend-reported failure.
        message: String,
    },

    /// A check's strategy failed.
    #[error("strategy for check {check} failed: {message}")]
    Strategy {
        /// The failing check.
        check: String,
        /// Strategy-reported failure.
        message: String,
    },

    /// The scaling adapter rejected an action. The handler returns to Idle
    /// and the next tick may retry.
    #[error("scaling policy {policy_id} failed: {message}")]
    Scale {
        /// The policy whose scaling failed.
        policy_id: PolicyId,
        /// Adapter-reported failure.
        message: String,
    },

    /// No scaling slot became free within the limiter's timeout.
    #[error("timed out waiting for a scaling slot")]
    SlotTimeout,

    /// A policy referenced an unregistered plugin.
    #[error(transparent)]
    Plugin(#[from] davit_plugin::PluginError),

    /// The surrounding scope was cancelled.
    #[error("operation cancelled")]
    Cancelled,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_carries_context() {
        let err = CoreError::TargetNotFound {
            policy_id: PolicyId::new("web"),
        };
        assert_eq!(err.to_string(), "target for policy web not found");

        let err = CoreError::NoMetrics {
            check: "avg-cpu".into(),
        };
        assert_eq!(err.to_string(), "check avg-cpu returned no metrics");
    }

    #[test]
    fn plugin_errors_convert() {
        let err: CoreError = davit_plugin::PluginError::Unknown {
            kind: "strategy",
            name: "x".into(),
        }
        .into();
        assert!(matches!(err, CoreError::Plugin(_)));
    }
}
