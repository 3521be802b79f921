//! Target status as reported by a scaling adapter.

use std::collections::HashMap;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// Well-known target configuration and status meta keys.
///
/// These are wire-level names shared with orchestrator tooling; they are
/// matched verbatim and must not be renamed.
pub mod keys {
    /// Node class a cluster policy selects on.
    pub const NODE_CLASS: &str = "node_class";
    /// Deadline for draining a node before termination.
    pub const NODE_DRAIN_DEADLINE: &str = "node_drain_deadline";
    /// Whether system jobs are ignored while draining.
    pub const NODE_DRAIN_IGNORE_SYSTEM_JOBS: &str = "node_drain_ignore_system_jobs";
    /// Whether drained nodes are purged from the orchestrator.
    pub const NODE_PURGE: &str = "node_purge";
    /// Strategy used to pick which nodes to remove.
    pub const NODE_SELECTOR_STRATEGY: &str = "node_selector_strategy";
    /// Marks the policy's actions as dry-run no-ops.
    pub const DRY_RUN: &str = "dry-run";
    /// Job the target tracks.
    pub const JOB: &str = "Job";
    /// Task group the target tracks.
    pub const GROUP: &str = "Group";
    /// Namespace the target lives in.
    pub const NAMESPACE: &str = "Namespace";
    /// Status meta key carrying the unix-nanosecond timestamp of the last
    /// externally-observed scaling event.
    pub const LAST_EVENT: &str = "nomad_autoscaler.last_event";
}

/// A snapshot of the target workload's authoritative state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct TargetStatus {
    /// When false the handler skips evaluation for this tick.
    pub ready: bool,
    /// The authoritative current count.
    pub count: i64,
    /// Adapter-specific annotations.
    #[serde(default)]
    pub meta: HashMap<String, String>,
}

impl TargetStatus {
    /// Creates a ready status at the given count.
    #[must_use]
    pub fn ready(count: i64) -> Self {
        Self {
            ready: true,
            count,
            meta: HashMap::new(),
        }
    }

    /// Adds a meta entry, builder style.
    #[must_use]
    pub fn with_meta(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.meta.insert(key.into(), value.into());
        self
    }

    /// The timestamp of the last scaling event something other than this
    /// autoscaler performed on the target, if the adapter recorded one.
    ///
    /// Unparseable values are treated as absent.
    #[must_use]
    pub fn last_event(&self) -> Option<DateTime<Utc>> {
        let nanos: i64 = self.meta.get(keys::LAST_EVENT)?.parse().ok()?;
        Some(Utc.timestamp_nanos(nanos))
    }
}
