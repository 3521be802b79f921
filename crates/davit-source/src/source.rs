//! The policy source contract consumed by the manager.

use std::collections::HashMap;

use tokio::sync::{mpsc, watch};

use davit_policy::{PolicyId, ScalingPolicy};

use crate::error::{Result, SourceError};

/// Identifies which source a message or handler belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SourceName {
    /// Directory of policy documents on disk.
    File,
    /// The orchestrator's scaling policy API.
    OrchestratorApi,
}

impl std::fmt::Display for SourceName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::File => "file",
            Self::OrchestratorApi => "orchestrator-api",
        };
        write!(f, "{s}")
    }
}

/// One publication of a source's current policy ID set.
///
/// The `bool` per ID is the updated flag: `true` when the source detected a
/// change relative to its last publication, `false` when the ID persists
/// unchanged. The manager re-fetches a document only for updated or
/// previously-unseen IDs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdMessage {
    /// The complete current ID set with per-ID updated flags.
    pub ids: HashMap<PolicyId, bool>,
    /// Which source published this set.
    pub source: SourceName,
}

impl IdMessage {
    /// Creates a message for `source` from `(id, updated)` pairs.
    #[must_use]
    pub fn new(source: SourceName, ids: impl IntoIterator<Item = (PolicyId, bool)>) -> Self {
        Self {
            ids: ids.into_iter().collect(),
            source,
        }
    }
}

/// An external supplier of policy identities and documents.
///
/// Disabled policies never appear in a source's ID set.
#[async_trait::async_trait]
pub trait PolicySource: Send + Sync {
    /// Which source this is.
    fn name(&self) -> SourceName;

    /// Continuously publishes the source's current ID set on `ids_tx`.
    ///
    /// Transient failures go to `err_tx` and the monitor keeps running;
    /// unrecoverable transport failures go to `err_tx` and the monitor
    /// returns, signalling the manager to tear down and restart. Returns
    /// promptly when `shutdown` flips to true.
    async fn monitor_ids(
        &self,
        shutdown: watch::Receiver<bool>,
        ids_tx: mpsc::Sender<IdMessage>,
        err_tx: mpsc::Sender<SourceError>,
    );

    /// Returns the latest canonicalized, validated document for `id`.
    async fn get_latest(&self, id: &PolicyId) -> Result<ScalingPolicy>;

    /// Unblocks any internal waits so the monitor re-queries immediately.
    /// Idempotent; calling it with no monitor running is a no-op.
    fn reload(&self);
}

/// Validates and canonicalizes a freshly fetched document, mapping
/// violations into a source error tagged with the policy ID.
pub(crate) fn finalize_policy(
    id: &PolicyId,
    mut policy: ScalingPolicy,
) -> Result<ScalingPolicy> {
    policy.id = id.clone();
    policy.canonicalize();
    policy
        .validate()
        .map_err(|e| SourceError::InvalidPolicy {
            policy_id: id.to_string(),
            message: e.to_string(),
        })?;
    Ok(policy)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_message_collects_pairs() {
        let msg = IdMessage::new(
            SourceName::File,
            [(PolicyId::new("a"), true), (PolicyId::new("b"), false)],
        );
        assert_eq!(msg.ids.len(), 2);
        assert_eq!(msg.ids.get(&PolicyId::new("a")), Some(&true));
        assert_eq!(msg.source, SourceName::File);
    }

    #[test]
    fn source_names_display() {
        assert_eq!(SourceName::File.to_string(), "file");
        assert_eq!(SourceName::OrchestratorApi.to_string(), "orchestrator-api");
    }
}
