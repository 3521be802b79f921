//! The scaling target seam.

use std::collections::HashMap;

use davit_policy::{ScalingAction, TargetStatus};

use crate::error::Result;

/// A scaling adapter for one kind of target workload.
///
/// `config` is the opaque map from the policy's target block; adapters pull
/// their coordinates (job, group, node class, ...) out of it.
#[async_trait::async_trait]
pub trait TargetPlugin: Send + Sync {
    /// Reports the target's current state, or `None` when the target does
    /// not exist.
    async fn status(&self, config: &HashMap<String, String>) -> Result<Option<TargetStatus>>;

    /// Drives the target toward `action.count`.
    async fn scale(&self, action: ScalingAction, config: &HashMap<String, String>) -> Result<()>;
}
