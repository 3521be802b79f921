//! In-memory plugin implementations.
//!
//! Used by the test suites across the workspace and handy for wiring up a
//! local agent without real infrastructure.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use davit_policy::{ScalingAction, TargetStatus};

use crate::error::{PluginError, Result};
use crate::metrics::{MetricSource, Sample, TimeRange};
use crate::strategy::{CheckEvaluation, Strategy};
use crate::target::TargetPlugin;

/// A metric source answering from a preloaded map of query text to series.
#[derive(Debug, Default)]
pub struct InMemoryMetricSource {
    series: RwLock<HashMap<String, Vec<Sample>>>,
    failure: RwLock<Option<String>>,
}

impl InMemoryMetricSource {
    /// Creates an empty source.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the series returned for `query`.
    pub fn set_series(&self, query: impl Into<String>, samples: Vec<Sample>) {
        self.series.write().insert(query.into(), samples);
    }

    /// Makes every query fail with `message` until cleared with `None`.
    pub fn set_failure(&self, message: Option<String>) {
        *self.failure.write() = message;
    }
}

#[async_trait::async_trait]
impl MetricSource for InMemoryMetricSource {
    async fn query(&self, query: &str, range: TimeRange) -> Result<Vec<Sample>> {
        if let Some(message) = self.failure.read().clone() {
            return Err(PluginError::Query { message });
        }
        let samples = self
            .series
            .read()
            .get(query)
            .map(|series| {
                series
                    .iter()
                    .filter(|s| s.timestamp >= range.from && s.timestamp <= range.to)
                    .copied()
                    .collect()
            })
            .unwrap_or_default();
        Ok(samples)
    }
}

/// A target adapter that tracks its count in memory and records every
/// scale call it receives.
#[derive(Debug, Default)]
pub struct InMemoryTarget {
    status: RwLock<Option<TargetStatus>>,
    scaled: RwLock<Vec<ScalingAction>>,
    fail_scale: RwLock<Option<String>>,
}

impl InMemoryTarget {
    /// Creates a ready target at the given count.
    #[must_use]
    pub fn with_count(count: i64) -> Self {
        Self {
            status: RwLock::new(Some(TargetStatus::ready(count))),
            scaled: RwLock::new(Vec::new()),
            fail_scale: RwLock::new(None),
        }
    }

    /// Creates a target whose status call reports "not found".
    #[must_use]
    pub fn missing() -> Self {
        Self::default()
    }

    /// Replaces the reported status.
    pub fn set_status(&self, status: Option<TargetStatus>) {
        *self.status.write() = status;
    }

    /// Makes every scale call fail with `message` until cleared with `None`.
    pub fn set_scale_failure(&self, message: Option<String>) {
        *self.fail_scale.write() = message;
    }

    /// Every action this target has been asked to apply, oldest first.
    #[must_use]
    pub fn scaled_actions(&self) -> Vec<ScalingAction> {
        self.scaled.read().clone()
    }
}

#[async_trait::async_trait]
impl TargetPlugin for InMemoryTarget {
    async fn status(&self, _config: &HashMap<String, String>) -> Result<Option<TargetStatus>> {
        Ok(self.status.read().clone())
    }

    async fn scale(&self, action: ScalingAction, _config: &HashMap<String, String>) -> Result<()> {
        if let Some(message) = self.fail_scale.read().clone() {
            return Err(PluginError::Target { message });
        }
        if !action.is_dry_run() {
            if let Some(status) = self.status.write().as_mut() {
                status.count = action.count;
            }
        }
        self.scaled.write().push(action);
        Ok(())
    }
}

/// A strategy that always proposes the same action. Error injection via
/// [`StaticStrategy::failing`].
#[derive(Debug)]
pub struct StaticStrategy {
    action: Option<ScalingAction>,
    failure: Option<String>,
}

impl StaticStrategy {
    /// Always proposes `action`.
    #[must_use]
    pub fn proposing(action: ScalingAction) -> Arc<Self> {
        Arc::new(Self {
            action: Some(action),
            failure: None,
        })
    }

    /// Always fails with `message`.
    #[must_use]
    pub fn failing(message: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            action: None,
            failure: Some(message.into()),
        })
    }
}

#[async_trait::async_trait]
impl Strategy for StaticStrategy {
    async fn run(&self, mut eval: CheckEvaluation, _current_count: i64) -> Result<CheckEvaluation> {
        if let Some(message) = &self.failure {
            return Err(PluginError::Strategy {
                message: message.clone(),
            });
        }
        eval.action = self.action.clone();
        Ok(eval)
    }
}
