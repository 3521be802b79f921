//! Scaling actions and the preemption rules that reconcile them.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Sentinel count marking an action as a dry-run no-op. The action still
/// flows through the scaling path so cooldown and state transitions behave
/// exactly as a live scale would.
pub const DRY_RUN_COUNT: i64 = -1;

/// Direction of a scaling action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ScaleDirection {
    /// Increase the target count.
    Up,
    /// Decrease the target count.
    Down,
    /// Leave the target count alone.
    #[default]
    None,
}

impl std::fmt::Display for ScaleDirection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Up => "up",
            Self::Down => "down",
            Self::None => "none",
        };
        write!(f, "{s}")
    }
}

/// The outcome of a check: a desired count, a direction, and the reasoning
/// that produced it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ScalingAction {
    /// Desired count; [`DRY_RUN_COUNT`] marks a dry-run no-op.
    pub count: i64,
    /// Which way the count moves relative to the current count.
    pub direction: ScaleDirection,
    /// Human-readable explanation of the decision.
    pub reason: String,
    /// Whether the producing check failed.
    pub error: bool,
    /// Free-form annotations carried to the target adapter.
    #[serde(default)]
    pub meta: HashMap<String, serde_json::Value>,
}

impl ScalingAction {
    /// An action that changes nothing; used when a check's error resolves
    /// to `ignore`.
    #[must_use]
    pub fn no_op() -> Self {
        Self::default()
    }

    /// Builds a directional action toward `count`.
    #[must_use]
    pub fn new(count: i64, direction: ScaleDirection, reason: impl Into<String>) -> Self {
        Self {
            count,
            direction,
            reason: reason.into(),
            error: false,
            meta: HashMap::new(),
        }
    }

    /// True when carrying out this action would not move the target.
    #[must_use]
    pub fn is_no_op(&self) -> bool {
        self.direction == ScaleDirection::None
    }

    /// Clamps the count to `[min, max]`, keeping the direction except when
    /// the capped count lands exactly on the current count.
    ///
    /// Returns the pre-cap count when capping changed it, for logging.
    pub fn cap_count(&mut self, min: i64, max: i64, current: i64) -> Option<i64> {
        if self.direction == ScaleDirection::None {
            return None;
        }
        let original = self.count;
        self.count = self.count.clamp(min, max);
        if self.count == current {
            self.direction = ScaleDirection::None;
        }
        (self.count != original).then_some(original)
    }

    /// Normalizes an action for comparison: a directional action whose count
    /// equals the current count collapses to `None`.
    pub fn canonicalize(&mut self, current: i64) {
        if self.direction != ScaleDirection::None && self.count == current {
            self.direction = ScaleDirection::None;
        }
    }

    /// Rewrites this action into the dry-run no-op sentinel, annotating the
    /// meta so downstream observers can tell the difference.
    pub fn set_dry_run(&mut self) {
        self.count = DRY_RUN_COUNT;
        self.meta
            .insert("davit.dry_run".to_string(), serde_json::Value::Bool(true));
    }

    /// Whether this action carries the dry-run sentinel.
    #[must_use]
    pub fn is_dry_run(&self) -> bool {
        self.count == DRY_RUN_COUNT
    }

    /// Picks the action with the safer outcome out of two candidates.
    ///
    /// In order: scale-up beats scale-down; a larger scale-up beats a
    /// smaller one; a smaller scale-down beats a larger one; a directionless
    /// action loses to any directional one; remaining ties break toward the
    /// lexicographically smaller reason so reduction order cannot change
    /// the winner.
    #[must_use]
    pub fn preempt<'a>(a: &'a Self, b: &'a Self) -> &'a Self {
        use ScaleDirection::{Down, None, Up};

        match (a.direction, b.direction) {
            (None, None) => Self::tie_break(a, b),
            (None, _) => b,
            (_, None) => a,
            (Up, Down) => a,
            (Down, Up) => b,
            // Same direction: a higher count is the safer outcome both
            // ways, a bigger scale-up and a smaller scale-down.
            (Up, Up) | (Down, Down) => match a.count.cmp(&b.count) {
                std::cmp::Ordering::Greater => a,
                std::cmp::Ordering::Less => b,
                std::cmp::Ordering::Equal => Self::tie_break(a, b),
            },
        }
    }

    fn tie_break<'a>(a: &'a Self, b: &'a Self) -> &'a Self {
        if a.reason <= b.reason { a } else { b }
    }
}
