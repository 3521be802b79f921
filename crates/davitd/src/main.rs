//! Davitd binary entrypoint.
//!
//! The autoscaler agent: wires policy sources and plugins into the policy
//! manager and runs until interrupted.

mod config;

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use davit_core::{ManagerConfig, PolicyManager, SlotLimiter};
use davit_plugin::PluginRegistry;
use davit_plugin::mem::{InMemoryMetricSource, InMemoryTarget};
use davit_source::{ApiPolicySource, FilePolicySource, HttpOrchestratorApi, PolicySource};
use davit_telemetry::Registry;

use crate::config::AgentConfig;

/// Davitd - autoscaling agent for workload orchestrators.
///
/// Watches policy sources and drives scaling targets toward the desired
/// count.
#[derive(Parser, Debug, Clone)]
#[command(name = "davitd")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to configuration file (TOML format).
    #[arg(short, long, env = "DAVITD_CONFIG")]
    config: Option<PathBuf>,

    /// Directory of policy documents (overrides the config file).
    #[arg(long, env = "DAVITD_POLICY_DIR")]
    policy_dir: Option<PathBuf>,

    /// Orchestrator API address (overrides the config file).
    #[arg(long, env = "DAVITD_ORCHESTRATOR_ADDR")]
    orchestrator_addr: Option<String>,

    /// Log filter directive (overrides the config file).
    #[arg(long, env = "DAVITD_LOG_LEVEL")]
    log_level: Option<String>,
}

impl Cli {
    /// Builds the agent config: CLI args > config file > defaults.
    fn build_config(&self) -> anyhow::Result<AgentConfig> {
        let mut config = match &self.config {
            Some(path) => AgentConfig::from_file(path)?,
            None => AgentConfig::default(),
        };

        if let Some(dir) = &self.policy_dir {
            config.sources.policy_dir = Some(dir.clone());
        }
        if let Some(addr) = &self.orchestrator_addr {
            config.sources.orchestrator_address = Some(addr.clone());
        }
        if let Some(level) = &self.log_level {
            config.log_level.clone_from(level);
        }

        config.validate()?;
        Ok(config)
    }
}

fn build_sources(config: &AgentConfig) -> Vec<Arc<dyn PolicySource>> {
    let mut sources: Vec<Arc<dyn PolicySource>> = Vec::new();
    if let Some(dir) = &config.sources.policy_dir {
        info!(dir = %dir.display(), "file policy source enabled");
        sources.push(Arc::new(FilePolicySource::new(dir.clone())));
    }
    if let Some(address) = &config.sources.orchestrator_address {
        info!(address = %address, "orchestrator policy source enabled");
        let api = Arc::new(HttpOrchestratorApi::new(address.clone()));
        sources.push(Arc::new(ApiPolicySource::with_wait(
            api,
            config.sources.orchestrator_wait,
        )));
    }
    sources
}

/// Built-in plugins available without any external plugin process: the two
/// bundled strategies plus in-memory target/metrics for dry runs.
fn build_registry() -> PluginRegistry {
    let mut registry = PluginRegistry::with_builtins();
    registry.register_target("mem", Arc::new(InMemoryTarget::with_count(0)));
    registry.register_metric_source("mem", Arc::new(InMemoryMetricSource::new()));
    registry
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = cli.build_config()?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config.log_level.clone())),
        )
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "davitd starting");

    let telemetry = Registry::new();
    let limiter = Arc::new(SlotLimiter::with_timeout(
        config.limiter.horizontal_slots,
        config.limiter.cluster_slots,
        config.limiter.acquire_timeout,
    ));
    let manager = Arc::new(PolicyManager::with_config(
        build_sources(&config),
        build_registry(),
        limiter,
        telemetry,
        ManagerConfig::default(),
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // SIGINT stops the agent.
    tokio::spawn(async move {
        if let Ok(()) = tokio::signal::ctrl_c().await {
            info!("received SIGINT, shutting down");
            let _ = shutdown_tx.send(true);
        }
    });

    // SIGHUP re-reads every policy source.
    #[cfg(unix)]
    {
        let manager = manager.clone();
        tokio::spawn(async move {
            let Ok(mut hangup) =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup())
            else {
                warn!("failed to install SIGHUP handler");
                return;
            };
            while hangup.recv().await.is_some() {
                info!("received SIGHUP, reloading policy sources");
                manager.reload_sources();
            }
        });
    }

    manager.run(shutdown_rx).await;
    info!("davitd stopped");
    Ok(())
}
