//! Bounded concurrency for in-flight scaling actions.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Semaphore, watch};
use tracing::debug;

use davit_policy::PolicyType;

use crate::error::{CoreError, Result};

/// Default wait before giving a slot request up for this tick.
pub const DEFAULT_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(60);

/// Bounds how many scaling actions run at once, with one FIFO queue per
/// policy type so a burst of cluster scale-outs cannot starve horizontal
/// policies.
///
/// A granted [`SlotPermit`] returns its slot when dropped, which covers
/// every exit path of the scaling activity.
#[derive(Debug, Clone)]
pub struct SlotLimiter {
    queues: HashMap<PolicyType, Arc<Semaphore>>,
    acquire_timeout: Duration,
}

/// One unit of the scaling-concurrency budget. Dropping it releases the
/// slot.
#[derive(Debug)]
pub struct SlotPermit {
    _permit: tokio::sync::OwnedSemaphorePermit,
}

impl SlotLimiter {
    /// Creates a limiter with the given queue sizes and the default
    /// acquisition timeout.
    #[must_use]
    pub fn new(horizontal_slots: usize, cluster_slots: usize) -> Self {
        Self::with_timeout(horizontal_slots, cluster_slots, DEFAULT_ACQUIRE_TIMEOUT)
    }

    /// Creates a limiter with a custom acquisition timeout.
    #[must_use]
    pub fn with_timeout(
        horizontal_slots: usize,
        cluster_slots: usize,
        acquire_timeout: Duration,
    ) -> Self {
        let queues = HashMap::from([
            (
                PolicyType::Horizontal,
                Arc::new(Semaphore::new(horizontal_slots)),
            ),
            (PolicyType::Cluster, Arc::new(Semaphore::new(cluster_slots))),
        ]);
        Self {
            queues,
            acquire_timeout,
        }
    }

    /// Waits for a slot in the queue for `policy_type`.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::SlotTimeout`] when no slot frees up within the
    /// limiter's timeout, so the handler can retry on its next tick, and
    /// [`CoreError::Cancelled`] when `shutdown` flips first.
    pub async fn acquire(
        &self,
        policy_type: PolicyType,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<SlotPermit> {
        let semaphore = self
            .queues
            .get(&policy_type)
            .ok_or_else(|| CoreError::Plugin(davit_plugin::PluginError::InvalidConfig {
                message: format!("no scaling queue for policy type {policy_type}"),
            }))?
            .clone();

        tokio::select! {
            result = tokio::time::timeout(self.acquire_timeout, semaphore.acquire_owned()) => {
                match result {
                    Ok(Ok(permit)) => Ok(SlotPermit { _permit: permit }),
                    // The semaphore is never closed while the limiter lives.
                    Ok(Err(_)) => Err(CoreError::Cancelled),
                    Err(_) => {
                        debug!(policy_type = %policy_type, "slot acquisition timed out");
                        Err(CoreError::SlotTimeout)
                    }
                }
            }
            _ = shutdown.changed() => Err(CoreError::Cancelled),
        }
    }

    /// Free slots in the queue for `policy_type`; used by tests and the
    /// status surface.
    #[must_use]
    pub fn available(&self, policy_type: PolicyType) -> usize {
        self.queues
            .get(&policy_type)
            .map_or(0, |s| s.available_permits())
    }
}
