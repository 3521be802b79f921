//! Configuration for the davitd agent.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Top-level agent configuration, loaded from a TOML file and overridable
/// from the command line.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AgentConfig {
    /// Log filter directive (e.g. "info", "davit_core=debug").
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Scaling concurrency limits.
    #[serde(default)]
    pub limiter: LimiterConfig,

    /// Policy source configuration.
    #[serde(default)]
    pub sources: SourcesConfig,
}

/// Sizing of the scaling slot queues.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimiterConfig {
    /// Concurrent scaling actions for horizontal (task group) policies.
    #[serde(default = "default_horizontal_slots")]
    pub horizontal_slots: usize,

    /// Concurrent scaling actions for cluster policies.
    #[serde(default = "default_cluster_slots")]
    pub cluster_slots: usize,

    /// How long a handler waits for a slot before retrying next tick.
    #[serde(with = "humantime_serde", default = "default_acquire_timeout")]
    pub acquire_timeout: Duration,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            horizontal_slots: default_horizontal_slots(),
            cluster_slots: default_cluster_slots(),
            acquire_timeout: default_acquire_timeout(),
        }
    }
}

/// Which policy sources the agent runs.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SourcesConfig {
    /// Directory of TOML policy documents; absent disables the file source.
    #[serde(default)]
    pub policy_dir: Option<PathBuf>,

    /// Orchestrator API base URL; absent disables the API source.
    #[serde(default)]
    pub orchestrator_address: Option<String>,

    /// Blocking-query wait handed to the orchestrator.
    #[serde(with = "humantime_serde", default = "default_wait")]
    pub orchestrator_wait: Duration,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_horizontal_slots() -> usize {
    10
}

fn default_cluster_slots() -> usize {
    2
}

fn default_acquire_timeout() -> Duration {
    Duration::from_secs(60)
}

fn default_wait() -> Duration {
    Duration::from_secs(60)
}

impl AgentConfig {
    /// Loads configuration from a TOML file.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }

    /// Ensures at least one source is configured.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.sources.policy_dir.is_none() && self.sources.orchestrator_address.is_none() {
            anyhow::bail!(
                "no policy source configured: set sources.policy_dir or sources.orchestrator_address"
            );
        }
        Ok(())
    }
}
