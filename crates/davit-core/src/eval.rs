//! The per-tick evaluation bundle.

use std::sync::Arc;

use davit_policy::{ScalingAction, ScalingPolicy};
use uuid::Uuid;

/// The result of one check runner within a tick.
#[derive(Debug, Clone, PartialEq)]
pub struct CheckOutcome {
    /// Name of the check that produced the action.
    pub check: String,
    /// The check's winner-reconciliation group key.
    pub group: String,
    /// The capped, canonicalized candidate action.
    pub action: ScalingAction,
}

/// Everything one tick works with: the policy snapshot it was evaluated
/// against and the per-check outcomes. Created per tick and discarded with
/// it; the evaluation ID ties the tick's log lines together.
#[derive(Debug, Clone)]
pub struct ScalingEvaluation {
    /// Unique ID of this evaluation, for log correlation.
    pub id: Uuid,
    /// The policy snapshot this tick ran against.
    pub policy: Arc<ScalingPolicy>,
    /// The count the target reported at the start of the tick.
    pub current_count: i64,
    /// One outcome per check, in check order.
    pub outcomes: Vec<CheckOutcome>,
}

impl ScalingEvaluation {
    /// Starts an empty evaluation for one tick.
    #[must_use]
    pub fn new(policy: Arc<ScalingPolicy>, current_count: i64) -> Self {
        Self {
            id: Uuid::new_v4(),
            policy,
            current_count,
            outcomes: Vec::new(),
        }
    }
}
