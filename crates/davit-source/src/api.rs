//! Orchestrator API policy source: long-polling with a wait index.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

use davit_policy::{PolicyId, ScalingPolicy};

use crate::error::{Result, SourceError};
use crate::source::{IdMessage, PolicySource, SourceName, finalize_policy};

/// Default blocking-query duration handed to the orchestrator.
pub const DEFAULT_WAIT: Duration = Duration::from_secs(60);

/// Pause between retries after a transient listing failure.
const RETRY_PAUSE: Duration = Duration::from_secs(1);

/// A summary row from the orchestrator's policy listing.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PolicyStub {
    /// Policy identifier.
    pub id: PolicyId,
    /// Disabled policies are filtered out of the ID set.
    pub enabled: bool,
    /// Bumped by the orchestrator every time the policy document changes.
    pub modify_index: u64,
}

/// One response to a blocking policy listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyListing {
    /// The current policy set.
    pub stubs: Vec<PolicyStub>,
    /// The wait index to pass into the next listing call.
    pub index: u64,
}

/// The slice of the orchestrator API the source consumes.
///
/// `list_policies` is a blocking query: it returns early when anything in
/// the policy set changes past `index`, or after roughly `wait` with an
/// unchanged index.
#[async_trait::async_trait]
pub trait OrchestratorApi: Send + Sync {
    /// Lists policy stubs, blocking server-side until a change past `index`
    /// or the `wait` horizon.
    async fn list_policies(&self, index: u64, wait: Duration) -> Result<PolicyListing>;

    /// Fetches one full policy document.
    async fn get_policy(&self, id: &PolicyId) -> Result<ScalingPolicy>;
}

/// Policy source backed by an [`OrchestratorApi`].
pub struct ApiPolicySource {
    api: Arc<dyn OrchestratorApi>,
    wait: Duration,
    reload_tx: watch::Sender<u64>,
}

impl ApiPolicySource {
    /// Creates a source over `api` with the default blocking-query wait.
    #[must_use]
    pub fn new(api: Arc<dyn OrchestratorApi>) -> Self {
        Self::with_wait(api, DEFAULT_WAIT)
    }

    /// Creates a source with a custom blocking-query wait.
    #[must_use]
    pub fn with_wait(api: Arc<dyn OrchestratorApi>, wait: Duration) -> Self {
        let (reload_tx, _) = watch::channel(0);
        Self {
            api,
            wait,
            reload_tx,
        }
    }

    /// Turns a listing into an `IdMessage`, updating `known` modify indices.
    fn diff_listing(
        listing: &PolicyListing,
        known: &mut HashMap<PolicyId, u64>,
    ) -> HashMap<PolicyId, bool> {
        let mut ids = HashMap::new();
        let mut next_known = HashMap::new();
        for stub in &listing.stubs {
            if !stub.enabled {
                continue;
            }
            let updated = known.get(&stub.id) != Some(&stub.modify_index);
            ids.insert(stub.id.clone(), updated);
            next_known.insert(stub.id.clone(), stub.modify_index);
        }
        *known = next_known;
        ids
    }
}

#[async_trait::async_trait]
impl PolicySource for ApiPolicySource {
    fn name(&self) -> SourceName {
        SourceName::OrchestratorApi
    }

    async fn monitor_ids(
        &self,
        mut shutdown: watch::Receiver<bool>,
        ids_tx: mpsc::Sender<IdMessage>,
        err_tx: mpsc::Sender<SourceError>,
    ) {
        let mut reload_rx = self.reload_tx.subscribe();
        let mut index = 0u64;
        let mut known: HashMap<PolicyId, u64> = HashMap::new();
        let mut first = true;

        loop {
            tokio::select! {
                result = shutdown.changed() => {
                    if result.is_err() || *shutdown.borrow() {
                        debug!("api policy monitor shutting down");
                        return;
                    }
                }
                _ = reload_rx.changed() => {
                    debug!("reload requested, resetting wait index");
                    index = 0;
                    known.clear();
                    first = true;
                }
                result = self.api.list_policies(index, self.wait) => {
                    match result {
                        Ok(listing) => {
                            // An unchanged index with nothing new is the
                            // blocking query timing out; just re-issue.
                            if !first && listing.index == index {
                                continue;
                            }
                            first = false;
                            index = listing.index;
                            let ids = Self::diff_listing(&listing, &mut known);
                            if ids_tx
                                .send(IdMessage { ids, source: SourceName::OrchestratorApi })
                                .await
                                .is_err()
                            {
                                return;
                            }
                        }
                        Err(error) => {
                            let fatal = error.is_unrecoverable();
                            warn!(error = %error, fatal, "policy listing failed");
                            let _ = err_tx.send(error).await;
                            if fatal {
                                return;
                            }
                            tokio::time::sleep(RETRY_PAUSE).await;
                        }
                    }
                }
            }
        }
    }

    async fn get_latest(&self, id: &PolicyId) -> Result<ScalingPolicy> {
        let policy = self.api.get_policy(id).await?;
        finalize_policy(id, policy)
    }

    fn reload(&self) {
        self.reload_tx.send_modify(|generation| *generation += 1);
    }
}

/// HTTP implementation of [`OrchestratorApi`] against the orchestrator's
/// scaling endpoints.
#[derive(Debug, Clone)]
pub struct HttpOrchestratorApi {
    base_url: String,
    client: reqwest::Client,
}

/// Response header carrying the listing's wait index.
const INDEX_HEADER: &str = "X-Davit-Index";

impl HttpOrchestratorApi {
    /// Creates a client for the orchestrator at `base_url`
    /// (e.g. `http://127.0.0.1:4646`).
    #[must_use]
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
        }
    }

    fn listing_error(e: &reqwest::Error) -> SourceError {
        SourceError::Monitor {
            message: e.to_string(),
        }
    }
}

#[async_trait::async_trait]
impl OrchestratorApi for HttpOrchestratorApi {
    async fn list_policies(&self, index: u64, wait: Duration) -> Result<PolicyListing> {
        let url = format!(
            "{}/v1/scaling/policies?index={index}&wait={}s",
            self.base_url,
            wait.as_secs()
        );
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|e| Self::listing_error(&e))?;

        let header_index = response
            .headers()
            .get(INDEX_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok());

        let stubs: Vec<PolicyStub> = response
            .json()
            .await
            .map_err(|e| Self::listing_error(&e))?;

        // Fall back to the highest modify index when the header is absent.
        let index = header_index.unwrap_or_else(|| {
            stubs
                .iter()
                .map(|s| s.modify_index)
                .max()
                .unwrap_or(index)
        });

        Ok(PolicyListing { stubs, index })
    }

    async fn get_policy(&self, id: &PolicyId) -> Result<ScalingPolicy> {
        let url = format!("{}/v1/scaling/policy/{id}", self.base_url);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| SourceError::Fetch {
                policy_id: id.to_string(),
                message: e.to_string(),
            })?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(SourceError::NotFound {
                policy_id: id.to_string(),
            });
        }

        let response = response
            .error_for_status()
            .map_err(|e| SourceError::Fetch {
                policy_id: id.to_string(),
                message: e.to_string(),
            })?;

        response.json().await.map_err(|e| SourceError::Fetch {
            policy_id: id.to_string(),
            message: e.to_string(),
        })
    }
}
