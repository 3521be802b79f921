//! The strategy seam and the built-in strategies.

use davit_policy::{PolicyCheck, ScaleDirection, ScalingAction};

use crate::error::{PluginError, Result};
use crate::metrics::Sample;

/// The per-check bundle a strategy works on: the check definition, the
/// fetched metric series, and the action slot the strategy fills in.
#[derive(Debug, Clone, PartialEq)]
pub struct CheckEvaluation {
    /// The check being evaluated.
    pub check: PolicyCheck,
    /// Samples returned by the metric source, sorted by timestamp.
    pub metrics: Vec<Sample>,
    /// The proposed action, filled in by the strategy.
    pub action: Option<ScalingAction>,
}

impl CheckEvaluation {
    /// Creates an evaluation awaiting a strategy run.
    #[must_use]
    pub fn new(check: PolicyCheck, metrics: Vec<Sample>) -> Self {
        Self {
            check,
            metrics,
            action: None,
        }
    }
}

/// Computes a candidate scaling action from a metric series.
#[async_trait::async_trait]
pub trait Strategy: Send + Sync {
    /// Fills `eval.action` with the proposed action for `current_count`.
    async fn run(&self, eval: CheckEvaluation, current_count: i64) -> Result<CheckEvaluation>;
}

fn direction_toward(desired: i64, current: i64) -> ScaleDirection {
    match desired.cmp(&current) {
        std::cmp::Ordering::Greater => ScaleDirection::Up,
        std::cmp::Ordering::Less => ScaleDirection::Down,
        std::cmp::Ordering::Equal => ScaleDirection::None,
    }
}

/// Forwards the latest metric value as the desired count.
///
/// Useful when the query itself computes the desired count, e.g. a
/// PromQL expression dividing queue depth by per-task throughput.
#[derive(Debug, Default, Clone, Copy)]
pub struct PassThrough;

#[async_trait::async_trait]
impl Strategy for PassThrough {
    async fn run(&self, mut eval: CheckEvaluation, current_count: i64) -> Result<CheckEvaluation> {
        let latest = eval.metrics.last().ok_or_else(|| PluginError::Strategy {
            message: "pass-through requires at least one sample".to_string(),
        })?;
        let desired = latest.value.round() as i64;
        let direction = direction_toward(desired, current_count);
        eval.action = Some(ScalingAction::new(
            desired,
            direction,
            format!("pass-through of metric value {:.2}", latest.value),
        ));
        Ok(eval)
    }
}

/// Always proposes the configured count, regardless of the metric series.
///
/// Pairs with check groups: a fixed-value check acts as a floor or ceiling
/// that other checks in the group preempt against.
#[derive(Debug, Default, Clone, Copy)]
pub struct FixedValue;

#[async_trait::async_trait]
impl Strategy for FixedValue {
    async fn run(&self, mut eval: CheckEvaluation, current_count: i64) -> Result<CheckEvaluation> {
        let raw = eval
            .check
            .strategy
            .config
            .get("count")
            .ok_or_else(|| PluginError::InvalidConfig {
                message: "fixed-value requires a \"count\" config entry".to_string(),
            })?;
        let desired: i64 = raw.parse().map_err(|_| PluginError::InvalidConfig {
            message: format!("fixed-value count {raw:?} is not an integer"),
        })?;
        let direction = direction_toward(desired, current_count);
        eval.action = Some(ScalingAction::new(
            desired,
            direction,
            format!("fixed count {desired}"),
        ));
        Ok(eval)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use davit_policy::StrategySpec;
    use std::time::Duration;

    fn check_with(strategy: StrategySpec) -> PolicyCheck {
        PolicyCheck {
            name: "c".into(),
            group: String::new(),
            source: "mem".into(),
            query: "q".into(),
            query_window: Duration::from_secs(60),
            query_window_offset: Duration::ZERO,
            on_error: None,
            strategy,
        }
    }

    fn samples(values: &[f64]) -> Vec<Sample> {
        let base = Utc::now();
        values
            .iter()
            .enumerate()
            .map(|(i, v)| Sample::new(base + chrono::Duration::seconds(i as i64), *v))
            .collect()
    }

    #[tokio::test]
    async fn pass_through_uses_latest_sample() {
        let eval = CheckEvaluation::new(
            check_with(StrategySpec::new("pass-through")),
            samples(&[2.0, 4.0, 7.4]),
        );
        let out = PassThrough.run(eval, 5).await.unwrap();
        let action = out.action.unwrap();
        assert_eq!(action.count, 7);
        assert_eq!(action.direction, ScaleDirection::Up);
    }

    #[tokio::test]
    async fn pass_through_scale_down() {
        let eval = CheckEvaluation::new(
            check_with(StrategySpec::new("pass-through")),
            samples(&[3.0]),
        );
        let out = PassThrough.run(eval, 5).await.unwrap();
        let action = out.action.unwrap();
        assert_eq!(action.count, 3);
        assert_eq!(action.direction, ScaleDirection::Down);
    }

    #[tokio::test]
    async fn pass_through_no_samples_is_an_error() {
        let eval = CheckEvaluation::new(check_with(StrategySpec::new("pass-through")), Vec::new());
        assert!(PassThrough.run(eval, 5).await.is_err());
    }

    #[tokio::test]
    async fn fixed_value_reads_config() {
        let eval = CheckEvaluation::new(
            check_with(StrategySpec::new("fixed-value").with_config("count", "9")),
            Vec::new(),
        );
        let out = FixedValue.run(eval, 5).await.unwrap();
        let action = out.action.unwrap();
        assert_eq!(action.count, 9);
        assert_eq!(action.direction, ScaleDirection::Up);
    }

    #[tokio::test]
    async fn fixed_value_at_current_is_directionless() {
        let eval = CheckEvaluation::new(
            check_with(StrategySpec::new("fixed-value").with_config("count", "5")),
            Vec::new(),
        );
        let out = FixedValue.run(eval, 5).await.unwrap();
        assert_eq!(out.action.unwrap().direction, ScaleDirection::None);
    }

    #[tokio::test]
    async fn fixed_value_rejects_bad_config() {
        let eval = CheckEvaluation::new(
            check_with(StrategySpec::new("fixed-value").with_config("count", "lots")),
            Vec::new(),
        );
        assert!(FixedValue.run(eval, 5).await.is_err());

        let eval = CheckEvaluation::new(check_with(StrategySpec::new("fixed-value")), Vec::new());
        assert!(FixedValue.run(eval, 5).await.is_err());
    }
}
