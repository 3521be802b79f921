//! The per-check runner: one metric query plus one strategy invocation.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::watch;
use tracing::{debug, warn};

use davit_plugin::{CheckEvaluation, MetricSource, PluginRegistry, Strategy, TimeRange};
use davit_policy::{CheckErrorMode, PolicyCheck, ScalingAction, ScalingPolicy};
use davit_telemetry::{Registry, names};

use crate::error::{CoreError, Result};

/// Runs one check of one policy: windowed metric query, strategy
/// invocation, error resolution, and capping to the policy's bounds.
///
/// Plugins are resolved when the runner is built, so a policy referencing
/// an unknown plugin fails before its handler ever ticks.
#[derive(Clone)]
pub struct CheckRunner {
    policy: Arc<ScalingPolicy>,
    check: PolicyCheck,
    metric_source: Arc<dyn MetricSource>,
    strategy: Arc<dyn Strategy>,
    telemetry: Registry,
}

impl CheckRunner {
    /// Builds a runner for `check`, resolving its plugins from `registry`.
    pub fn new(
        policy: Arc<ScalingPolicy>,
        check: PolicyCheck,
        registry: &PluginRegistry,
        telemetry: Registry,
    ) -> Result<Self> {
        let metric_source = registry.metric_source(&check.source)?;
        let strategy = registry.strategy(&check.strategy.name)?;
        Ok(Self {
            policy,
            check,
            metric_source,
            strategy,
            telemetry,
        })
    }

    /// The check this runner evaluates.
    #[must_use]
    pub fn check(&self) -> &PolicyCheck {
        &self.check
    }

    /// Produces this check's candidate action for the current tick.
    ///
    /// A query or strategy failure resolves through the check's `on_error`
    /// (falling back to the policy's `on_check_error`): `ignore` yields a
    /// directionless action, `fail` propagates the error. The returned
    /// action always satisfies `min <= count <= max`.
    pub async fn run(
        &self,
        shutdown: watch::Receiver<bool>,
        current_count: i64,
    ) -> Result<ScalingAction> {
        match self.evaluate(shutdown, current_count).await {
            Ok(action) => Ok(action),
            // Cancellation is never subject to on_error resolution.
            Err(CoreError::Cancelled) => Err(CoreError::Cancelled),
            Err(error) => self.resolve_error(error),
        }
    }

    /// The fallible part of the run, before error resolution.
    async fn evaluate(
        &self,
        mut shutdown: watch::Receiver<bool>,
        current_count: i64,
    ) -> Result<ScalingAction> {
        let range = TimeRange::window_ending_at(
            Utc::now(),
            self.check.query_window,
            self.check.query_window_offset,
        );
        let labels = [
            ("plugin_name", self.check.source.as_str()),
            ("policy_id", self.policy.id.as_str()),
        ];

        let mut samples = {
            let _timer = self.telemetry.start_timer(names::CHECK_QUERY_MS, &labels);
            tokio::select! {
                result = self.metric_source.query(&self.check.query, range) => {
                    result.map_err(|e| CoreError::Query {
                        check: self.check.name.clone(),
                        message: e.to_string(),
                    })?
                }
                _ = shutdown.changed() => return Err(CoreError::Cancelled),
            }
        };
        samples.sort_by_key(|s| s.timestamp);

        if samples.is_empty() {
            return Err(CoreError::NoMetrics {
                check: self.check.name.clone(),
            });
        }

        let labels = [
            ("plugin_name", self.check.strategy.name.as_str()),
            ("policy_id", self.policy.id.as_str()),
        ];
        let eval = CheckEvaluation::new(self.check.clone(), samples);
        let eval = {
            let _timer = self.telemetry.start_timer(names::CHECK_STRATEGY_MS, &labels);
            tokio::select! {
                result = self.strategy.run(eval, current_count) => {
                    result.map_err(|e| CoreError::Strategy {
                        check: self.check.name.clone(),
                        message: e.to_string(),
                    })?
                }
                _ = shutdown.changed() => return Err(CoreError::Cancelled),
            }
        };

        // A strategy returning no action means no scaling is called for.
        let mut action = eval.action.unwrap_or_else(ScalingAction::no_op);

        if let Some(original) = action.cap_count(self.policy.min, self.policy.max, current_count) {
            debug!(
                policy = %self.policy.id,
                check = %self.check.name,
                from = original,
                to = action.count,
                "capped action count to policy bounds"
            );
        }
        action.canonicalize(current_count);
        Ok(action)
    }

    /// Applies the first matching error rule: check-level `on_error`, then
    /// the policy's `on_check_error`. This is the only place a check
    /// decides how loud its failure is.
    fn resolve_error(&self, error: CoreError) -> Result<ScalingAction> {
        let mode = self.check.on_error.unwrap_or(self.policy.on_check_error);
        match mode {
            CheckErrorMode::Fail => Err(error),
            CheckErrorMode::Ignore => {
                warn!(
                    policy = %self.policy.id,
                    check = %self.check.name,
                    error = %error,
                    "check failed, ignoring per error policy"
                );
                Ok(ScalingAction::no_op())
            }
        }
    }
}
