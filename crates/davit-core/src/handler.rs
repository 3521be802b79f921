//! The per-policy handler: a four-state machine driven by a periodic tick.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use rand::Rng;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use davit_plugin::{PluginRegistry, TargetPlugin};
use davit_policy::{ScaleDirection, ScalingAction, ScalingPolicy, keys};
use davit_telemetry::{Registry, names};

use crate::check::CheckRunner;
use crate::error::CoreError;
use crate::eval::{CheckOutcome, ScalingEvaluation};
use crate::limiter::SlotLimiter;
use crate::winner::select_winner;

/// Upper bound of the uniform random splay slept before restarting the
/// ticker after an interval change, so hundreds of policies reloaded
/// together do not tick in lockstep.
pub const TICKER_SPLAY: Duration = Duration::from_millis(300);

/// Where a handler is in its scaling lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerState {
    /// Evaluating ticks, free to start a scaling action.
    Idle,
    /// Holding a pending action, waiting for a scaling slot.
    WaitingTurn,
    /// A scaling call is in flight.
    Scaling,
    /// Recently scaled; new actions are suppressed until the deadline.
    Cooldown,
}

impl std::fmt::Display for HandlerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::WaitingTurn => "waiting-turn",
            Self::Scaling => "scaling",
            Self::Cooldown => "cooldown",
        };
        write!(f, "{s}")
    }
}

/// Remaining cooldown given the last scaling event, the configured
/// cooldown, and the current clock. Negative when the cooldown has lapsed.
#[must_use]
pub fn cooldown_remaining(
    last_event: DateTime<Utc>,
    cooldown: Duration,
    now: DateTime<Utc>,
) -> chrono::Duration {
    let cooldown =
        chrono::Duration::from_std(cooldown).unwrap_or_else(|_| chrono::Duration::MAX);
    last_event + cooldown - now
}

/// The cooldown deadline on both clocks: wall time for logging and
/// arithmetic, the monotonic runtime clock for the wake-up timer.
#[derive(Debug, Clone, Copy)]
struct CooldownClock {
    until_wall: DateTime<Utc>,
    until_mono: tokio::time::Instant,
}

/// State shared between the handler task and its wait-and-scale activity.
/// Locks guard single reads and writes only, never I/O.
#[derive(Debug)]
struct Shared {
    state: RwLock<HandlerState>,
    next_action: RwLock<Option<ScalingAction>>,
    cooldown: RwLock<Option<CooldownClock>>,
}

impl Shared {
    fn new() -> Self {
        Self {
            state: RwLock::new(HandlerState::Idle),
            next_action: RwLock::new(None),
            cooldown: RwLock::new(None),
        }
    }

    fn state(&self) -> HandlerState {
        *self.state.read()
    }

    fn set_state(&self, state: HandlerState) {
        *self.state.write() = state;
    }

    fn store_action(&self, action: ScalingAction) {
        *self.next_action.write() = Some(action);
    }

    fn take_action(&self) -> Option<ScalingAction> {
        self.next_action.write().take()
    }

    /// Enters Cooldown until `duration` from now.
    fn enter_cooldown(&self, duration: Duration) {
        let until_wall = Utc::now()
            + chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::MAX);
        *self.cooldown.write() = Some(CooldownClock {
            until_wall,
            until_mono: tokio::time::Instant::now() + duration,
        });
        self.set_state(HandlerState::Cooldown);
    }

    fn cooldown_deadline(&self) -> Option<tokio::time::Instant> {
        self.cooldown.read().map(|c| c.until_mono)
    }

    fn out_of_cooldown_on(&self) -> Option<DateTime<Utc>> {
        self.cooldown.read().map(|c| c.until_wall)
    }

    /// Moves Cooldown back to Idle when the deadline has passed.
    fn finish_cooldown_if_due(&self) {
        let due = self
            .cooldown
            .read()
            .is_some_and(|c| tokio::time::Instant::now() >= c.until_mono);
        if due && self.state() == HandlerState::Cooldown {
            self.finish_cooldown();
        }
    }

    /// Ends the cooldown: clears the clock and, when the handler is still
    /// in Cooldown, returns it to Idle. A handler pushed into another state
    /// meanwhile keeps that state.
    fn finish_cooldown(&self) {
        *self.cooldown.write() = None;
        let mut state = self.state.write();
        if *state == HandlerState::Cooldown {
            *state = HandlerState::Idle;
        }
    }
}

/// Read-only view of a handler's state, usable from any task.
#[derive(Debug, Clone)]
pub struct HandlerStateHandle {
    shared: Arc<Shared>,
}

impl HandlerStateHandle {
    /// The handler's current lifecycle state.
    #[must_use]
    pub fn state(&self) -> HandlerState {
        self.shared.state()
    }

    /// When the current cooldown ends, if one is active.
    #[must_use]
    pub fn out_of_cooldown_on(&self) -> Option<DateTime<Utc>> {
        self.shared.out_of_cooldown_on()
    }
}

/// Owns one policy end-to-end: ticks on its evaluation interval, fans out
/// its check runners, picks the winning action, and drives the target
/// through the slot limiter.
pub struct PolicyHandler {
    policy: Arc<ScalingPolicy>,
    registry: PluginRegistry,
    target: Arc<dyn TargetPlugin>,
    runners: Vec<CheckRunner>,
    shared: Arc<Shared>,
    limiter: Arc<SlotLimiter>,
    telemetry: Registry,
    error_tx: mpsc::Sender<CoreError>,
}

impl PolicyHandler {
    /// Builds a handler for `policy`, resolving its target and check
    /// plugins up front.
    pub fn new(
        policy: ScalingPolicy,
        registry: PluginRegistry,
        limiter: Arc<SlotLimiter>,
        telemetry: Registry,
        error_tx: mpsc::Sender<CoreError>,
    ) -> crate::Result<Self> {
        let policy = Arc::new(policy);
        let target = registry.target(&policy.target.name)?;
        let runners = Self::build_runners(&policy, &registry, &telemetry)?;
        Ok(Self {
            policy,
            registry,
            target,
            runners,
            shared: Arc::new(Shared::new()),
            limiter,
            telemetry,
            error_tx,
        })
    }

    /// A view of this handler's state that outlives `run`.
    #[must_use]
    pub fn state_handle(&self) -> HandlerStateHandle {
        HandlerStateHandle {
            shared: self.shared.clone(),
        }
    }

    fn build_runners(
        policy: &Arc<ScalingPolicy>,
        registry: &PluginRegistry,
        telemetry: &Registry,
    ) -> crate::Result<Vec<CheckRunner>> {
        policy
            .checks
            .iter()
            .map(|check| {
                CheckRunner::new(
                    policy.clone(),
                    check.clone(),
                    registry,
                    telemetry.clone(),
                )
            })
            .collect()
    }

    /// Runs the handler until `shutdown` flips or both control channels
    /// close. Consumes the handler; observe it afterwards through
    /// [`PolicyHandler::state_handle`].
    pub async fn run(
        mut self,
        mut shutdown: watch::Receiver<bool>,
        mut update_rx: mpsc::Receiver<Arc<ScalingPolicy>>,
        mut cooldown_rx: mpsc::Receiver<Duration>,
    ) {
        self.bootstrap_cooldown().await;

        let interval = self.policy.evaluation_interval;
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);

        info!(policy = %self.policy.id, interval = ?interval, "policy handler started");

        loop {
            let cooldown_deadline = self.shared.cooldown_deadline();

            tokio::select! {
                biased;

                result = shutdown.changed() => {
                    if result.is_err() || *shutdown.borrow() {
                        break;
                    }
                }

                Some(duration) = cooldown_rx.recv() => {
                    info!(policy = %self.policy.id, cooldown = ?duration, "cooldown enforced externally");
                    self.shared.enter_cooldown(duration);
                }

                Some(new_policy) = update_rx.recv() => {
                    match self.apply_update(new_policy) {
                        Ok(Some(new_interval)) => {
                            let splay = rand::thread_rng().gen_range(Duration::ZERO..TICKER_SPLAY);
                            debug!(
                                policy = %self.policy.id,
                                splay = ?splay,
                                interval = ?new_interval,
                                "evaluation interval changed, restarting ticker"
                            );
                            tokio::time::sleep(splay).await;
                            ticker = tokio::time::interval_at(
                                tokio::time::Instant::now() + new_interval,
                                new_interval,
                            );
                        }
                        Ok(None) => {}
                        Err(error) => {
                            warn!(policy = %self.policy.id, error = %error, "policy update rejected");
                            let _ = self.error_tx.send(error).await;
                        }
                    }
                }

                () = sleep_until_opt(cooldown_deadline), if cooldown_deadline.is_some() => {
                    debug!(policy = %self.policy.id, "cooldown ended");
                    self.shared.finish_cooldown();
                }

                _ = ticker.tick() => {
                    self.handle_tick(&shutdown).await;
                }
            }
        }

        debug!(policy = %self.policy.id, "policy handler stopped");
    }

    /// Starts in Cooldown when the target reports an out-of-band scaling
    /// event whose timestamp implies one is still active. The direction of
    /// such an event is unknowable, so the shorter scale-up cooldown
    /// applies.
    async fn bootstrap_cooldown(&self) {
        let status = match self.target.status(&self.policy.target.config).await {
            Ok(Some(status)) => status,
            Ok(None) => return,
            Err(error) => {
                debug!(policy = %self.policy.id, error = %error, "status unavailable at startup");
                return;
            }
        };
        let Some(last_event) = status.last_event() else {
            return;
        };

        let remaining =
            cooldown_remaining(last_event, self.policy.scale_up_cooldown(), Utc::now());
        if remaining > chrono::Duration::zero() {
            let remaining = remaining.to_std().unwrap_or(Duration::ZERO);
            info!(
                policy = %self.policy.id,
                remaining = ?remaining,
                "out-of-band scaling event observed, starting in cooldown"
            );
            self.shared.enter_cooldown(remaining);
        }
    }

    /// One tick: status, check fan-out, winner selection, state dispatch.
    async fn handle_tick(&self, shutdown: &watch::Receiver<bool>) {
        let policy = self.policy.clone();

        let status = match self.target.status(&policy.target.config).await {
            Ok(Some(status)) => status,
            Ok(None) => {
                let _ = self
                    .error_tx
                    .send(CoreError::TargetNotFound {
                        policy_id: policy.id.clone(),
                    })
                    .await;
                return;
            }
            Err(error) => {
                let _ = self
                    .error_tx
                    .send(CoreError::TargetStatus {
                        policy_id: policy.id.clone(),
                        message: error.to_string(),
                    })
                    .await;
                return;
            }
        };
        if !status.ready {
            debug!(policy = %policy.id, "target not ready, skipping tick");
            return;
        }

        let current_count = status.count;
        let mut evaluation = ScalingEvaluation::new(policy.clone(), current_count);

        let results = futures::future::join_all(self.runners.iter().map(|runner| {
            let shutdown = shutdown.clone();
            async move {
                let outcome = runner.run(shutdown, current_count).await;
                (runner.check().name.clone(), runner.check().group_key().to_string(), outcome)
            }
        }))
        .await;

        for (check, group, result) in results {
            match result {
                Ok(action) => evaluation.outcomes.push(CheckOutcome { check, group, action }),
                Err(CoreError::Cancelled) => return,
                Err(error) => {
                    let _ = self.error_tx.send(error).await;
                    return;
                }
            }
        }

        let Some(mut winner) = select_winner(&evaluation.outcomes) else {
            return;
        };
        winner.canonicalize(current_count);
        if winner.is_no_op() {
            debug!(policy = %policy.id, eval = %evaluation.id, "no scaling required");
            return;
        }

        self.shared.finish_cooldown_if_due();

        match self.shared.state() {
            HandlerState::Cooldown => {
                if let Some(until) = self.shared.out_of_cooldown_on() {
                    info!(
                        policy = %policy.id,
                        remaining = %(until - Utc::now()),
                        "in cooldown, suppressing action"
                    );
                }
            }
            HandlerState::WaitingTurn => {
                debug!(policy = %policy.id, count = winner.count, "replacing pending action");
                self.shared.store_action(winner);
            }
            HandlerState::Scaling => {
                debug!(policy = %policy.id, "scaling in flight, dropping action");
            }
            HandlerState::Idle => {
                self.shared.store_action(winner);
                self.shared.set_state(HandlerState::WaitingTurn);
                tokio::spawn(wait_and_scale(
                    self.shared.clone(),
                    policy,
                    self.target.clone(),
                    self.limiter.clone(),
                    self.telemetry.clone(),
                    shutdown.clone(),
                    self.error_tx.clone(),
                ));
            }
        }
    }

    /// Swaps in a new policy snapshot. The check runners and target are
    /// rebuilt before anything is replaced, so a rejected update leaves the
    /// handler on its previous configuration. In-flight scaling keeps its
    /// own snapshot.
    ///
    /// Returns the new evaluation interval when it changed.
    fn apply_update(&mut self, new_policy: Arc<ScalingPolicy>) -> crate::Result<Option<Duration>> {
        let interval_change = (new_policy.evaluation_interval != self.policy.evaluation_interval)
            .then_some(new_policy.evaluation_interval);

        let target = self.registry.target(&new_policy.target.name)?;
        let runners = Self::build_runners(&new_policy, &self.registry, &self.telemetry)?;

        self.target = target;
        self.runners = runners;
        self.policy = new_policy;
        info!(policy = %self.policy.id, "policy updated");

        Ok(interval_change)
    }
}

/// Sleep arm helper; only polled when the deadline is present.
async fn sleep_until_opt(deadline: Option<tokio::time::Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// The wait-and-scale activity: waits for a scaling slot, re-reads the
/// latest pending action, applies it, and starts the cooldown.
async fn wait_and_scale(
    shared: Arc<Shared>,
    policy: Arc<ScalingPolicy>,
    target: Arc<dyn TargetPlugin>,
    limiter: Arc<SlotLimiter>,
    telemetry: Registry,
    mut shutdown: watch::Receiver<bool>,
    error_tx: mpsc::Sender<CoreError>,
) {
    let permit = match limiter.acquire(policy.policy_type, shutdown.clone()).await {
        Ok(permit) => permit,
        Err(error) => {
            shared.set_state(HandlerState::Idle);
            if error != CoreError::Cancelled {
                warn!(policy = %policy.id, error = %error, "gave up waiting for a scaling slot");
                let _ = error_tx.send(error).await;
            }
            return;
        }
    };

    // The pending action may have been superseded while we waited.
    let Some(mut action) = shared.take_action() else {
        shared.set_state(HandlerState::Idle);
        return;
    };
    shared.set_state(HandlerState::Scaling);

    if policy.target.config.get(keys::DRY_RUN).map(String::as_str) == Some("true") {
        debug!(policy = %policy.id, "dry-run target, rewriting action");
        action.set_dry_run();
    }

    let labels = [("policy_id", policy.id.as_str())];
    telemetry.incr_counter(names::SCALE_ATTEMPTS, &labels, 1);
    info!(
        policy = %policy.id,
        count = action.count,
        direction = %action.direction,
        reason = %action.reason,
        "scaling target"
    );

    let result = tokio::select! {
        result = target.scale(action.clone(), &policy.target.config) => result,
        _ = shutdown.changed() => {
            shared.set_state(HandlerState::Idle);
            return;
        }
    };

    match result {
        Err(error) => {
            telemetry.incr_counter(names::SCALE_FAILURES, &labels, 1);
            shared.set_state(HandlerState::Idle);
            let _ = error_tx
                .send(CoreError::Scale {
                    policy_id: policy.id.clone(),
                    message: error.to_string(),
                })
                .await;
        }
        Ok(()) => {
            let cooldown = if action.direction == ScaleDirection::Up {
                policy.scale_up_cooldown()
            } else {
                policy.cooldown
            };
            shared.enter_cooldown(cooldown);
            info!(policy = %policy.id, cooldown = ?cooldown, "scaling complete, cooling down");
        }
    }

    drop(permit);
}

#[cfg(test)]
mod tests {
    use super::*;
    use davit_plugin::mem::{InMemoryMetricSource, InMemoryTarget, StaticStrategy};
    use davit_plugin::{CheckEvaluation, Sample, Strategy};
    use davit_policy::{
        CheckErrorMode, PolicyCheck, PolicyId, PolicyType, StrategySpec, TargetSpec, TargetStatus,
    };
    use parking_lot::Mutex;
    use std::collections::VecDeque;

    /// Proposes the scripted counts in order, repeating the last one.
    struct SequenceStrategy {
        counts: Mutex<VecDeque<i64>>,
        last: Mutex<i64>,
    }

    impl SequenceStrategy {
        fn new(counts: &[i64]) -> Arc<Self> {
            Arc::new(Self {
                counts: Mutex::new(counts.iter().copied().collect()),
                last: Mutex::new(*counts.last().unwrap_or(&0)),
            })
        }
    }

    #[async_trait::async_trait]
    impl Strategy for SequenceStrategy {
        async fn run(
            &self,
            mut eval: CheckEvaluation,
            current_count: i64,
        ) -> davit_plugin::Result<CheckEvaluation> {
            let count = self.counts.lock().pop_front().unwrap_or(*self.last.lock());
            let direction = match count.cmp(&current_count) {
                std::cmp::Ordering::Greater => ScaleDirection::Up,
                std::cmp::Ordering::Less => ScaleDirection::Down,
                std::cmp::Ordering::Equal => ScaleDirection::None,
            };
            eval.action = Some(ScalingAction::new(count, direction, format!("seq {count}")));
            Ok(eval)
        }
    }

    /// Always proposes current + 1.
    struct IncrementStrategy;

    #[async_trait::async_trait]
    impl Strategy for IncrementStrategy {
        async fn run(
            &self,
            mut eval: CheckEvaluation,
            current_count: i64,
        ) -> davit_plugin::Result<CheckEvaluation> {
            eval.action = Some(ScalingAction::new(
                current_count + 1,
                ScaleDirection::Up,
                "one more",
            ));
            Ok(eval)
        }
    }

    struct Fixture {
        registry: PluginRegistry,
        limiter: Arc<SlotLimiter>,
        telemetry: Registry,
        error_tx: mpsc::Sender<CoreError>,
        error_rx: mpsc::Receiver<CoreError>,
    }

    fn fixture(target: Arc<InMemoryTarget>, strategy: Arc<dyn Strategy>) -> Fixture {
        let metrics = Arc::new(InMemoryMetricSource::new());
        metrics.set_series("q", vec![Sample::new(Utc::now(), 1.0)]);

        let mut registry = PluginRegistry::new();
        registry.register_target("mem", target);
        registry.register_metric_source("mem", metrics);
        registry.register_strategy("test", strategy);

        let (error_tx, error_rx) = mpsc::channel(16);
        Fixture {
            registry,
            limiter: Arc::new(SlotLimiter::new(2, 2)),
            telemetry: Registry::new(),
            error_tx,
            error_rx,
        }
    }

    fn policy(evaluation_interval: Duration) -> ScalingPolicy {
        ScalingPolicy {
            id: PolicyId::new("p1"),
            policy_type: PolicyType::Horizontal,
            min: 0,
            max: 100,
            enabled: true,
            cooldown: Duration::from_secs(600),
            cooldown_on_scale_up: Some(Duration::from_secs(300)),
            evaluation_interval,
            on_check_error: CheckErrorMode::Ignore,
            priority: 0,
            target: TargetSpec::new("mem"),
            checks: vec![PolicyCheck {
                name: "c".into(),
                group: String::new(),
                source: "mem".into(),
                query: "q".into(),
                query_window: Duration::from_secs(3600),
                query_window_offset: Duration::ZERO,
                on_error: None,
                strategy: StrategySpec::new("test"),
            }],
        }
    }

    struct Running {
        state: HandlerStateHandle,
        shutdown_tx: watch::Sender<bool>,
        update_tx: mpsc::Sender<Arc<ScalingPolicy>>,
        cooldown_tx: mpsc::Sender<Duration>,
        join: tokio::task::JoinHandle<()>,
    }

    fn start(f: &Fixture, policy: ScalingPolicy) -> Running {
        let handler = PolicyHandler::new(
            policy,
            f.registry.clone(),
            f.limiter.clone(),
            f.telemetry.clone(),
            f.error_tx.clone(),
        )
        .unwrap();
        let state = handler.state_handle();

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (update_tx, update_rx) = mpsc::channel(1);
        let (cooldown_tx, cooldown_rx) = mpsc::channel(1);
        let join = tokio::spawn(handler.run(shutdown_rx, update_rx, cooldown_rx));

        Running {
            state,
            shutdown_tx,
            update_tx,
            cooldown_tx,
            join,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn tick_scales_and_enters_cooldown() {
        let target = Arc::new(InMemoryTarget::with_count(5));
        let f = fixture(
            target.clone(),
            StaticStrategy::proposing(ScalingAction::new(8, ScaleDirection::Up, "load")),
        );
        let running = start(&f, policy(Duration::from_millis(50)));

        tokio::time::sleep(Duration::from_millis(120)).await;

        let scaled = target.scaled_actions();
        assert_eq!(scaled.len(), 1, "exactly one scale during cooldown");
        assert_eq!(scaled[0].count, 8);
        assert_eq!(running.state.state(), HandlerState::Cooldown);

        // Scale-up used the scale-up cooldown.
        let until = running.state.out_of_cooldown_on().unwrap();
        let remaining = until - Utc::now();
        assert!(remaining <= chrono::Duration::seconds(300));
        assert!(remaining > chrono::Duration::seconds(290));

        running.shutdown_tx.send(true).unwrap();
        running.join.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn cooldown_suppresses_further_scaling() {
        let target = Arc::new(InMemoryTarget::with_count(5));
        let f = fixture(target.clone(), Arc::new(IncrementStrategy));
        let running = start(&f, policy(Duration::from_millis(50)));

        // Many ticks inside the cooldown window; only the first may scale.
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(target.scaled_actions().len(), 1);

        running.shutdown_tx.send(true).unwrap();
        running.join.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn scaling_resumes_after_cooldown_expires() {
        let target = Arc::new(InMemoryTarget::with_count(5));
        let f = fixture(target.clone(), Arc::new(IncrementStrategy));
        let mut p = policy(Duration::from_millis(50));
        p.cooldown = Duration::from_millis(200);
        p.cooldown_on_scale_up = Some(Duration::from_millis(200));
        let running = start(&f, p);

        tokio::time::sleep(Duration::from_secs(2)).await;
        let scales = target.scaled_actions().len();
        assert!(scales >= 3, "expected repeated scaling, got {scales}");

        running.shutdown_tx.send(true).unwrap();
        running.join.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn not_ready_target_skips_ticks() {
        let target = Arc::new(InMemoryTarget::with_count(5));
        target.set_status(Some(TargetStatus {
            ready: false,
            count: 5,
            meta: Default::default(),
        }));
        let f = fixture(target.clone(), Arc::new(IncrementStrategy));
        let running = start(&f, policy(Duration::from_millis(50)));

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(target.scaled_actions().is_empty());
        assert_eq!(running.state.state(), HandlerState::Idle);

        running.shutdown_tx.send(true).unwrap();
        running.join.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn missing_target_surfaces_not_found() {
        let target = Arc::new(InMemoryTarget::missing());
        let mut f = fixture(target, Arc::new(IncrementStrategy));
        let running = start(&f, policy(Duration::from_millis(50)));

        tokio::time::sleep(Duration::from_millis(120)).await;
        let error = f.error_rx.try_recv().unwrap();
        assert!(matches!(error, CoreError::TargetNotFound { .. }));

        running.shutdown_tx.send(true).unwrap();
        running.join.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn scale_failure_returns_to_idle() {
        let target = Arc::new(InMemoryTarget::with_count(5));
        target.set_scale_failure(Some("provider exploded".into()));
        let mut f = fixture(target.clone(), Arc::new(IncrementStrategy));
        let running = start(&f, policy(Duration::from_millis(50)));

        tokio::time::sleep(Duration::from_millis(80)).await;
        let error = loop {
            match f.error_rx.try_recv() {
                Ok(CoreError::Scale { .. }) => break true,
                Ok(_) => continue,
                Err(_) => break false,
            }
        };
        assert!(error, "expected a Scale error");
        assert_eq!(running.state.state(), HandlerState::Idle);

        running.shutdown_tx.send(true).unwrap();
        running.join.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn dry_run_rewrites_the_action() {
        let target = Arc::new(InMemoryTarget::with_count(5));
        let f = fixture(target.clone(), Arc::new(IncrementStrategy));
        let mut p = policy(Duration::from_millis(50));
        p.target = TargetSpec::new("mem").with_config(keys::DRY_RUN, "true");
        let running = start(&f, p);

        tokio::time::sleep(Duration::from_millis(120)).await;
        let scaled = target.scaled_actions();
        assert_eq!(scaled.len(), 1);
        assert!(scaled[0].is_dry_run());
        // Dry runs still cool down like live scales.
        assert_eq!(running.state.state(), HandlerState::Cooldown);

        running.shutdown_tx.send(true).unwrap();
        running.join.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn out_of_band_event_bootstraps_cooldown() {
        let now = Utc::now();
        let target = Arc::new(InMemoryTarget::with_count(5));
        target.set_status(Some(TargetStatus::ready(5).with_meta(
            keys::LAST_EVENT,
            (now - chrono::Duration::seconds(5))
                .timestamp_nanos_opt()
                .unwrap_or_default()
                .to_string(),
        )));
        let f = fixture(target, Arc::new(IncrementStrategy));
        let mut p = policy(Duration::from_secs(3600));
        p.cooldown_on_scale_up = Some(Duration::from_secs(30));
        let running = start(&f, p);

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(running.state.state(), HandlerState::Cooldown);

        // 25 seconds of cooldown remained at startup.
        tokio::time::sleep(Duration::from_secs(26)).await;
        assert_eq!(running.state.state(), HandlerState::Idle);

        running.shutdown_tx.send(true).unwrap();
        running.join.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn stale_out_of_band_event_starts_idle() {
        let now = Utc::now();
        let target = Arc::new(InMemoryTarget::with_count(5));
        target.set_status(Some(TargetStatus::ready(5).with_meta(
            keys::LAST_EVENT,
            (now - chrono::Duration::minutes(25))
                .timestamp_nanos_opt()
                .unwrap_or_default()
                .to_string(),
        )));
        let f = fixture(target, Arc::new(IncrementStrategy));
        let mut p = policy(Duration::from_secs(3600));
        p.cooldown_on_scale_up = Some(Duration::from_secs(60 * 20));
        let running = start(&f, p);

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(running.state.state(), HandlerState::Idle);

        running.shutdown_tx.send(true).unwrap();
        running.join.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn waiting_turn_takes_the_latest_action() {
        let target = Arc::new(InMemoryTarget::with_count(5));
        let f = fixture(target.clone(), SequenceStrategy::new(&[7, 9]));
        // Occupy the only horizontal slot so the handler queues.
        let limiter = Arc::new(SlotLimiter::new(1, 1));
        let (_slot_tx, slot_rx) = watch::channel(false);
        let held = limiter
            .acquire(PolicyType::Horizontal, slot_rx)
            .await
            .unwrap();

        let handler = PolicyHandler::new(
            policy(Duration::from_millis(50)),
            f.registry.clone(),
            limiter.clone(),
            f.telemetry.clone(),
            f.error_tx.clone(),
        )
        .unwrap();
        let state = handler.state_handle();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (_update_tx, update_rx) = mpsc::channel(1);
        let (_cooldown_tx, cooldown_rx) = mpsc::channel(1);
        let join = tokio::spawn(handler.run(shutdown_rx, update_rx, cooldown_rx));

        // Two ticks while the slot is held: the second replaces the
        // pending action.
        tokio::time::sleep(Duration::from_millis(130)).await;
        assert_eq!(state.state(), HandlerState::WaitingTurn);
        assert!(target.scaled_actions().is_empty());

        drop(held);
        tokio::time::sleep(Duration::from_millis(50)).await;

        let scaled = target.scaled_actions();
        assert_eq!(scaled.len(), 1);
        assert_eq!(scaled[0].count, 9, "latest pending action must win");

        shutdown_tx.send(true).unwrap();
        join.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn external_cooldown_injection_pauses_scaling() {
        let target = Arc::new(InMemoryTarget::with_count(5));
        let f = fixture(target.clone(), Arc::new(IncrementStrategy));
        let running = start(&f, policy(Duration::from_secs(60)));

        running
            .cooldown_tx
            .send(Duration::from_secs(3600))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(running.state.state(), HandlerState::Cooldown);

        // The next tick lands inside the injected cooldown.
        tokio::time::sleep(Duration::from_secs(61)).await;
        assert!(target.scaled_actions().is_empty());

        running.shutdown_tx.send(true).unwrap();
        running.join.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn interval_update_restarts_the_ticker() {
        let target = Arc::new(InMemoryTarget::with_count(5));
        let f = fixture(target.clone(), Arc::new(IncrementStrategy));
        let mut p = policy(Duration::from_secs(3600));
        p.cooldown = Duration::from_millis(10);
        p.cooldown_on_scale_up = Some(Duration::from_millis(10));
        let running = start(&f, p.clone());

        // Nothing ticks at the old hour-long cadence.
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(target.scaled_actions().is_empty());

        p.evaluation_interval = Duration::from_millis(100);
        running.update_tx.send(Arc::new(p)).await.unwrap();

        // No tick can fire before the splay plus the new interval.
        tokio::time::sleep(Duration::from_millis(90)).await;
        assert!(target.scaled_actions().is_empty());

        tokio::time::sleep(Duration::from_secs(2)).await;
        let scales = target.scaled_actions().len();
        assert!(scales >= 3, "ticker did not restart at new cadence: {scales}");

        running.shutdown_tx.send(true).unwrap();
        running.join.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn update_with_unknown_plugin_is_rejected() {
        let target = Arc::new(InMemoryTarget::with_count(5));
        let mut f = fixture(target.clone(), Arc::new(IncrementStrategy));
        let running = start(&f, policy(Duration::from_secs(3600)));

        let mut bad = policy(Duration::from_secs(3600));
        bad.target = TargetSpec::new("unregistered");
        running.update_tx.send(Arc::new(bad)).await.unwrap();

        tokio::time::sleep(Duration::from_millis(10)).await;
        let error = f.error_rx.try_recv().unwrap();
        assert!(matches!(error, CoreError::Plugin(_)));

        running.shutdown_tx.send(true).unwrap();
        running.join.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_stops_the_handler() {
        let target = Arc::new(InMemoryTarget::with_count(5));
        let f = fixture(target, Arc::new(IncrementStrategy));
        let running = start(&f, policy(Duration::from_millis(50)));

        running.shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), running.join)
            .await
            .expect("handler did not stop")
            .unwrap();
    }

    mod cooldown_math {
        use super::*;

        #[test]
        fn active_cooldown_has_positive_remainder() {
            let now = Utc::now();
            let last_event = now - chrono::Duration::minutes(10);
            let remaining =
                cooldown_remaining(last_event, Duration::from_secs(20 * 60), now);
            assert_eq!(remaining, chrono::Duration::minutes(10));
        }

        #[test]
        fn lapsed_cooldown_is_negative() {
            let now = Utc::now();
            let last_event = now - chrono::Duration::minutes(25);
            let remaining =
                cooldown_remaining(last_event, Duration::from_secs(20 * 60), now);
            assert_eq!(remaining, chrono::Duration::minutes(-5));
        }
    }

    #[test]
    fn states_display() {
        assert_eq!(HandlerState::Idle.to_string(), "idle");
        assert_eq!(HandlerState::WaitingTurn.to_string(), "waiting-turn");
        assert_eq!(HandlerState::Scaling.to_string(), "scaling");
        assert_eq!(HandlerState::Cooldown.to_string(), "cooldown");
    }
}
