//! The policy manager: reconciles running handlers against policy sources.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use davit_plugin::PluginRegistry;
use davit_policy::{PolicyId, PolicyMutator, ScalingPolicy, ZeroCountGuard, apply_mutators};
use davit_source::{IdMessage, PolicySource, SourceError, SourceName};
use davit_telemetry::{Registry, names};

use crate::error::CoreError;
use crate::handler::PolicyHandler;
use crate::limiter::SlotLimiter;

/// Tunables of the manager's outer loop.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Pause before re-entering the outer loop after an unrecoverable
    /// source error.
    pub restart_backoff: Duration,
    /// Cadence of the active-handler gauge.
    pub gauge_interval: Duration,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            restart_backoff: Duration::from_secs(10),
            gauge_interval: Duration::from_secs(10),
        }
    }
}

/// The manager's bookkeeping for one running handler.
struct HandlerTracker {
    source: SourceName,
    shutdown_tx: watch::Sender<bool>,
    update_tx: mpsc::Sender<Arc<ScalingPolicy>>,
    cooldown_tx: mpsc::Sender<Duration>,
}

enum LoopOutcome {
    Shutdown,
    Restart,
}

/// Owns the map of policy handlers and reconciles it against the ID
/// streams of every configured source.
pub struct PolicyManager {
    sources: Vec<Arc<dyn PolicySource>>,
    registry: PluginRegistry,
    mutators: Vec<Box<dyn PolicyMutator>>,
    limiter: Arc<SlotLimiter>,
    telemetry: Registry,
    config: ManagerConfig,
    handlers: Arc<RwLock<HashMap<PolicyId, HandlerTracker>>>,
}

impl PolicyManager {
    /// Creates a manager with the default configuration and the standard
    /// mutators.
    #[must_use]
    pub fn new(
        sources: Vec<Arc<dyn PolicySource>>,
        registry: PluginRegistry,
        limiter: Arc<SlotLimiter>,
        telemetry: Registry,
    ) -> Self {
        Self::with_config(sources, registry, limiter, telemetry, ManagerConfig::default())
    }

    /// Creates a manager with a custom configuration.
    #[must_use]
    pub fn with_config(
        sources: Vec<Arc<dyn PolicySource>>,
        registry: PluginRegistry,
        limiter: Arc<SlotLimiter>,
        telemetry: Registry,
        config: ManagerConfig,
    ) -> Self {
        Self {
            sources,
            registry,
            mutators: vec![Box::new(ZeroCountGuard)],
            limiter,
            telemetry,
            config,
            handlers: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Replaces the mutator chain applied to every incoming policy.
    #[must_use]
    pub fn with_mutators(mut self, mutators: Vec<Box<dyn PolicyMutator>>) -> Self {
        self.mutators = mutators;
        self
    }

    /// The IDs of every currently tracked handler.
    #[must_use]
    pub fn active_handlers(&self) -> Vec<PolicyId> {
        self.handlers.read().keys().cloned().collect()
    }

    /// Injects a cooldown into a running handler from outside the control
    /// loop. Returns false when no handler is tracked for the policy.
    pub fn enforce_cooldown(&self, policy_id: &PolicyId, duration: Duration) -> bool {
        let cooldown_tx = self
            .handlers
            .read()
            .get(policy_id)
            .map(|t| t.cooldown_tx.clone());
        match cooldown_tx {
            Some(tx) => tx.try_send(duration).is_ok(),
            None => false,
        }
    }

    /// Asks every source to re-query immediately.
    pub fn reload_sources(&self) {
        for source in &self.sources {
            source.reload();
        }
    }

    /// Runs the manager until `shutdown` flips.
    ///
    /// Each pass of the outer loop starts every source's ID monitor and
    /// reconciles until an unrecoverable source error, then tears all
    /// handlers down, backs off, and starts over.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        loop {
            let (ids_tx, mut ids_rx) = mpsc::channel::<IdMessage>(16);
            let (src_err_tx, mut src_err_rx) = mpsc::channel::<SourceError>(16);
            let (handler_err_tx, mut handler_err_rx) = mpsc::channel::<CoreError>(64);
            let (monitor_shutdown_tx, _) = watch::channel(false);

            for source in &self.sources {
                let source = source.clone();
                let ids_tx = ids_tx.clone();
                let err_tx = src_err_tx.clone();
                let monitor_shutdown = monitor_shutdown_tx.subscribe();
                info!(source = %source.name(), "starting policy source monitor");
                tokio::spawn(async move {
                    source.monitor_ids(monitor_shutdown, ids_tx, err_tx).await;
                });
            }
            drop(ids_tx);
            drop(src_err_tx);

            let outcome = self
                .reconcile_loop(
                    &mut shutdown,
                    &mut ids_rx,
                    &mut src_err_rx,
                    &mut handler_err_rx,
                    &handler_err_tx,
                )
                .await;

            let _ = monitor_shutdown_tx.send(true);
            self.stop_all_handlers();

            match outcome {
                LoopOutcome::Shutdown => {
                    info!("policy manager stopped");
                    return;
                }
                LoopOutcome::Restart => {
                    warn!(
                        backoff = ?self.config.restart_backoff,
                        "unrecoverable source error, restarting policy manager"
                    );
                    tokio::select! {
                        () = tokio::time::sleep(self.config.restart_backoff) => {}
                        _ = shutdown.changed() => {
                            if *shutdown.borrow() {
                                return;
                            }
                        }
                    }
                }
            }
        }
    }

    async fn reconcile_loop(
        &self,
        shutdown: &mut watch::Receiver<bool>,
        ids_rx: &mut mpsc::Receiver<IdMessage>,
        src_err_rx: &mut mpsc::Receiver<SourceError>,
        handler_err_rx: &mut mpsc::Receiver<CoreError>,
        handler_err_tx: &mpsc::Sender<CoreError>,
    ) -> LoopOutcome {
        let mut gauge_ticker = tokio::time::interval(self.config.gauge_interval);

        loop {
            tokio::select! {
                result = shutdown.changed() => {
                    if result.is_err() || *shutdown.borrow() {
                        return LoopOutcome::Shutdown;
                    }
                }

                Some(message) = ids_rx.recv() => {
                    if self.handle_id_message(message, handler_err_tx).await.is_err() {
                        return LoopOutcome::Restart;
                    }
                    self.emit_handler_gauge();
                }

                Some(error) = src_err_rx.recv() => {
                    if error.is_unrecoverable() {
                        error!(error = %error, "source failed unrecoverably");
                        return LoopOutcome::Restart;
                    }
                    self.telemetry.incr_counter(names::SOURCE_ERRORS, &[], 1);
                    warn!(error = %error, "recoverable source error");
                }

                Some(error) = handler_err_rx.recv() => {
                    warn!(error = %error, "handler error");
                }

                _ = gauge_ticker.tick() => {
                    self.emit_handler_gauge();
                }
            }
        }
    }

    /// Applies one ID message: fetch-and-update changed policies, spawn
    /// handlers for new ones, stop handlers for IDs absent from their
    /// source's set.
    ///
    /// # Errors
    ///
    /// Returns the error when a policy fetch fails unrecoverably, which
    /// restarts the whole manager.
    async fn handle_id_message(
        &self,
        message: IdMessage,
        handler_err_tx: &mpsc::Sender<CoreError>,
    ) -> Result<(), SourceError> {
        let Some(source) = self
            .sources
            .iter()
            .find(|s| s.name() == message.source)
            .cloned()
        else {
            warn!(source = %message.source, "id message from unconfigured source");
            return Ok(());
        };

        for (policy_id, updated) in &message.ids {
            let tracked = self
                .handlers
                .read()
                .get(policy_id)
                .map(|t| (t.source, t.update_tx.clone()));

            match tracked {
                // Another source owns this policy; first one wins.
                Some((owner, _)) if owner != message.source => {
                    debug!(policy = %policy_id, owner = %owner, "id already tracked by another source");
                }
                Some(_) if !*updated => {}
                Some((_, update_tx)) => {
                    let policy = match self.fetch_policy(source.as_ref(), policy_id).await? {
                        Some(policy) => policy,
                        None => continue,
                    };
                    debug!(policy = %policy_id, "delivering updated policy");
                    if update_tx.send(Arc::new(policy)).await.is_err() {
                        warn!(policy = %policy_id, "handler gone, dropping tracker");
                        self.stop_handler(policy_id);
                    }
                }
                None => {
                    let policy = match self.fetch_policy(source.as_ref(), policy_id).await? {
                        Some(policy) => policy,
                        None => continue,
                    };
                    self.spawn_handler(message.source, policy_id, policy, handler_err_tx);
                }
            }
        }

        let stale: Vec<PolicyId> = self
            .handlers
            .read()
            .iter()
            .filter(|(id, tracker)| {
                tracker.source == message.source && !message.ids.contains_key(*id)
            })
            .map(|(id, _)| id.clone())
            .collect();
        for policy_id in stale {
            info!(policy = %policy_id, "policy removed from source, stopping handler");
            self.stop_handler(&policy_id);
        }

        Ok(())
    }

    /// Fetches and mutates one policy. Recoverable fetch errors are
    /// logged and collapsed to `None`; unrecoverable ones propagate.
    async fn fetch_policy(
        &self,
        source: &dyn PolicySource,
        policy_id: &PolicyId,
    ) -> Result<Option<ScalingPolicy>, SourceError> {
        match source.get_latest(policy_id).await {
            Ok(mut policy) => {
                apply_mutators(&self.mutators, &mut policy);
                Ok(Some(policy))
            }
            Err(error) if error.is_unrecoverable() => Err(error),
            Err(error) => {
                self.telemetry.incr_counter(names::SOURCE_ERRORS, &[], 1);
                warn!(policy = %policy_id, error = %error, "failed to fetch policy");
                Ok(None)
            }
        }
    }

    fn spawn_handler(
        &self,
        source: SourceName,
        policy_id: &PolicyId,
        policy: ScalingPolicy,
        handler_err_tx: &mpsc::Sender<CoreError>,
    ) {
        let handler = match PolicyHandler::new(
            policy,
            self.registry.clone(),
            self.limiter.clone(),
            self.telemetry.clone(),
            handler_err_tx.clone(),
        ) {
            Ok(handler) => handler,
            Err(error) => {
                warn!(policy = %policy_id, error = %error, "failed to build handler");
                return;
            }
        };

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (update_tx, update_rx) = mpsc::channel(1);
        let (cooldown_tx, cooldown_rx) = mpsc::channel(1);

        info!(policy = %policy_id, source = %source, "starting policy handler");
        tokio::spawn(handler.run(shutdown_rx, update_rx, cooldown_rx));

        self.handlers.write().insert(
            policy_id.clone(),
            HandlerTracker {
                source,
                shutdown_tx,
                update_tx,
                cooldown_tx,
            },
        );
    }

    fn stop_handler(&self, policy_id: &PolicyId) {
        if let Some(tracker) = self.handlers.write().remove(policy_id) {
            let _ = tracker.shutdown_tx.send(true);
        }
    }

    fn stop_all_handlers(&self) {
        let trackers: Vec<HandlerTracker> =
            self.handlers.write().drain().map(|(_, t)| t).collect();
        let count = trackers.len();
        for tracker in trackers {
            let _ = tracker.shutdown_tx.send(true);
        }
        if count > 0 {
            info!(count, "stopped all policy handlers");
        }
        self.emit_handler_gauge();
    }

    fn emit_handler_gauge(&self) {
        let count = self.handlers.read().len();
        self.telemetry
            .set_gauge(names::ACTIVE_HANDLERS, &[], count as f64);
    }
}
