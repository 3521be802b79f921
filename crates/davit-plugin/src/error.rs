//! Error types for the plugin seams.

use thiserror::Error;

/// Result type for plugin operations.
pub type Result<T> = std::result::Result<T, PluginError>;

/// Errors crossing a plugin boundary.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PluginError {
    /// No plugin of the given kind is registered under the name.
    #[error("unknown {kind} plugin: {name}")]
    Unknown {
        /// Plugin kind ("target", "metric source", "strategy").
        kind: &'static str,
        /// The name the policy referred to.
        name: String,
    },

    /// A metric query failed.
    #[error("metric query failed: {message}")]
    Query {
        /// Backend-reported failure.
        message: String,
    },

    /// A strategy could not compute an action.
    #[error("strategy failed: {message}")]
    Strategy {
        /// Strategy-reported failure.
        message: String,
    },

    /// A target adapter call failed.
    #[error("target adapter failed: {message}")]
    Target {
        /// Adapter-reported failure.
        message: String,
    },

    /// A plugin rejected its configuration.
    #[error("invalid plugin config: {message}")]
    InvalidConfig {
        /// What was wrong with the configuration.
        message: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_display() {
        let err = PluginError::Unknown {
            kind: "strategy",
            name: "does-not-exist".into(),
        };
        assert_eq!(err.to_string(), "unknown strategy plugin: does-not-exist");
    }

    #[test]
    fn errors_clone_and_compare() {
        let err = PluginError::Query {
            message: "boom".into(),
        };
        assert_eq!(err.clone(), err);
    }
}
