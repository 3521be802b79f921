//! Filesystem policy source: a directory of TOML policy documents.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use parking_lot::RwLock;
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

use davit_policy::{PolicyId, ScalingPolicy};

use crate::error::{Result, SourceError};
use crate::source::{IdMessage, PolicySource, SourceName, finalize_policy};

/// Reads scaling policies from `*.toml` files in one directory.
///
/// A file's policy gets a stable ID derived from hashing its path together
/// with the document's own label, so renaming a file produces a new policy
/// while editing one in place updates the existing policy. The directory is
/// scanned when the monitor starts and again on every [`PolicySource::reload`].
#[derive(Debug)]
pub struct FilePolicySource {
    dir: PathBuf,
    /// Maps stable IDs to the backing file and its last seen content hash.
    entries: RwLock<HashMap<PolicyId, FileEntry>>,
    reload_tx: watch::Sender<u64>,
}

#[derive(Debug, Clone)]
struct FileEntry {
    path: PathBuf,
    content_hash: blake3::Hash,
}

impl FilePolicySource {
    /// Creates a source over `dir`. The directory is not touched until the
    /// monitor starts.
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        let (reload_tx, _) = watch::channel(0);
        Self {
            dir: dir.into(),
            entries: RwLock::new(HashMap::new()),
            reload_tx,
        }
    }

    /// Stable ID for the policy in `path` labelled `label`.
    fn stable_id(path: &Path, label: &str) -> PolicyId {
        let mut hasher = blake3::Hasher::new();
        hasher.update(path.to_string_lossy().as_bytes());
        hasher.update(label.as_bytes());
        let hex = hasher.finalize().to_hex();
        PolicyId::new(format!("file_{}", &hex.as_str()[..16]))
    }

    fn label_for(path: &Path, policy: &ScalingPolicy) -> String {
        if policy.id.as_str().is_empty() {
            path.file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_default()
        } else {
            policy.id.to_string()
        }
    }

    /// Scans the directory, refreshes the entry map, and builds the ID set
    /// with per-ID updated flags. Unreadable or unparseable files are
    /// reported and skipped.
    fn scan(&self) -> (HashMap<PolicyId, bool>, Vec<SourceError>) {
        let mut ids = HashMap::new();
        let mut errors = Vec::new();
        let mut next_entries = HashMap::new();

        let dir_entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) => {
                errors.push(SourceError::Monitor {
                    message: format!("failed to read policy dir {}: {e}", self.dir.display()),
                });
                return (ids, errors);
            }
        };

        let previous = self.entries.read().clone();

        for dir_entry in dir_entries.flatten() {
            let path = dir_entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("toml") {
                continue;
            }

            let content = match std::fs::read_to_string(&path) {
                Ok(content) => content,
                Err(e) => {
                    errors.push(SourceError::Monitor {
                        message: format!("failed to read {}: {e}", path.display()),
                    });
                    continue;
                }
            };

            let policy: ScalingPolicy = match toml::from_str(&content) {
                Ok(policy) => policy,
                Err(e) => {
                    errors.push(SourceError::InvalidPolicy {
                        policy_id: path.display().to_string(),
                        message: e.to_string(),
                    });
                    continue;
                }
            };

            if !policy.enabled {
                debug!(path = %path.display(), "skipping disabled policy");
                continue;
            }

            let label = Self::label_for(&path, &policy);
            let id = Self::stable_id(&path, &label);
            let content_hash = blake3::hash(content.as_bytes());
            let updated = previous
                .get(&id)
                .is_none_or(|entry| entry.content_hash != content_hash);

            ids.insert(id.clone(), updated);
            next_entries.insert(id, FileEntry { path, content_hash });
        }

        *self.entries.write() = next_entries;
        (ids, errors)
    }

    async fn publish_scan(
        &self,
        ids_tx: &mpsc::Sender<IdMessage>,
        err_tx: &mpsc::Sender<SourceError>,
    ) {
        let (ids, errors) = self.scan();
        for error in errors {
            warn!(error = %error, "policy file scan error");
            let _ = err_tx.send(error).await;
        }
        let _ = ids_tx.send(IdMessage { ids, source: SourceName::File }).await;
    }
}

#[async_trait::async_trait]
impl PolicySource for FilePolicySource {
    fn name(&self) -> SourceName {
        SourceName::File
    }

    async fn monitor_ids(
        &self,
        mut shutdown: watch::Receiver<bool>,
        ids_tx: mpsc::Sender<IdMessage>,
        err_tx: mpsc::Sender<SourceError>,
    ) {
        let mut reload_rx = self.reload_tx.subscribe();

        self.publish_scan(&ids_tx, &err_tx).await;

        loop {
            tokio::select! {
                result = shutdown.changed() => {
                    if result.is_err() || *shutdown.borrow() {
                        debug!("file policy monitor shutting down");
                        return;
                    }
                }
                result = reload_rx.changed() => {
                    if result.is_err() {
                        return;
                    }
                    debug!(dir = %self.dir.display(), "reload requested, rescanning policy dir");
                    self.publish_scan(&ids_tx, &err_tx).await;
                }
            }
        }
    }

    async fn get_latest(&self, id: &PolicyId) -> Result<ScalingPolicy> {
        let path = {
            let entries = self.entries.read();
            entries
                .get(id)
                .map(|entry| entry.path.clone())
                .ok_or_else(|| SourceError::NotFound {
                    policy_id: id.to_string(),
                })?
        };

        let content = std::fs::read_to_string(&path).map_err(|e| SourceError::Fetch {
            policy_id: id.to_string(),
            message: format!("failed to read {}: {e}", path.display()),
        })?;
        let policy: ScalingPolicy =
            toml::from_str(&content).map_err(|e| SourceError::InvalidPolicy {
                policy_id: id.to_string(),
                message: e.to_string(),
            })?;

        finalize_policy(id, policy)
    }

    fn reload(&self) {
        self.reload_tx.send_modify(|generation| *generation += 1);
    }
}
