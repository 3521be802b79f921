//! Per-check configuration within a scaling policy.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// How a failing check resolves: loudly or silently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CheckErrorMode {
    /// The error propagates and fails the evaluation.
    Fail,
    /// The check contributes a no-op action instead.
    #[default]
    Ignore,
}

/// The strategy a check invokes on its metric series: a plugin name plus
/// opaque configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct StrategySpec {
    /// Name of the strategy plugin.
    pub name: String,
    /// Strategy-specific configuration.
    #[serde(default)]
    pub config: HashMap<String, String>,
}

impl StrategySpec {
    /// Creates a strategy spec for the named plugin.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            config: HashMap::new(),
        }
    }

    /// Adds a config entry, builder style.
    #[must_use]
    pub fn with_config(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.config.insert(key.into(), value.into());
        self
    }
}

/// One metric-driven sub-evaluation of a policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyCheck {
    /// Name, unique within the policy.
    pub name: String,
    /// Label clustering co-dependent checks for winner reconciliation.
    /// Empty means the check forms its own group.
    #[serde(default)]
    pub group: String,
    /// Logical metric backend to query.
    pub source: String,
    /// Backend-specific query text.
    pub query: String,
    /// Width of the time range handed to the backend.
    #[serde(with = "humantime_serde", default)]
    pub query_window: Duration,
    /// Shifts the query window backwards in time.
    #[serde(with = "humantime_serde", default)]
    pub query_window_offset: Duration,
    /// Per-check error mode; `None` defers to the policy's `on_check_error`.
    #[serde(default)]
    pub on_error: Option<CheckErrorMode>,
    /// The strategy that turns the metric series into an action.
    pub strategy: StrategySpec,
}

impl PolicyCheck {
    /// The group key used for winner reconciliation. A check without an
    /// explicit group reconciles alone, keyed by its own name.
    #[must_use]
    pub fn group_key(&self) -> &str {
        if self.group.is_empty() {
            &self.name
        } else {
            &self.group
        }
    }

    /// Appends this check's validation violations to `violations`.
    pub(crate) fn collect_violations(&self, violations: &mut Vec<String>) {
        if self.name.is_empty() {
            violations.push("check name is required".to_string());
        }
        if self.query.is_empty() {
            violations.push(format!("check {:?} requires a query", self.name));
        }
        if self.source.is_empty() {
            violations.push(format!("check {:?} requires a source", self.name));
        }
        if self.strategy.name.is_empty() {
            violations.push(format!("check {:?} requires a strategy", self.name));
        }
    }
}
