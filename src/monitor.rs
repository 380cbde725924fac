//! The polling loop for a single target.

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::config::PollingConfig;
use crate::fetcher::Fetcher;
use crate::models::{AvailabilityState, FetchOutcome, Observation, StateChangeEvent, Target};
use crate::proxy_pool::ProxyPool;
use crate::store::{PersistedState, StateStore};
use crate::supervisor::UpstreamHealth;

#[derive(Debug, Clone)]
pub struct MonitorSettings {
    pub interval: Duration,
    /// Fraction of the delay randomly added or removed, in `[0, 1)`.
    pub jitter: f64,
    pub failure_threshold: u32,
    pub max_backoff_multiplier: u32,
    pub max_delay: Duration,
}

impl From<&PollingConfig> for MonitorSettings {
    fn from(config: &PollingConfig) -> Self {
        Self {
            interval: config.interval(),
            jitter: config.jitter,
            failure_threshold: config.failure_threshold.max(1),
            max_backoff_multiplier: config.max_backoff_multiplier.max(1),
            max_delay: config.max_delay(),
        }
    }
}

/// Process-wide policy every monitor reads before it polls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct GlobalPolicy {
    pub paused: bool,
    pub backoff_multiplier: u32,
    /// Replaces the configured polling interval for targets without their own.
    pub interval: Option<Duration>,
}

impl Default for GlobalPolicy {
    fn default() -> Self {
        Self {
            paused: false,
            backoff_multiplier: 1,
            interval: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MonitorPhase {
    Stopped,
    Polling,
    Backoff,
}

/// Read-only view of a monitor, published after every cycle.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MonitorStatus {
    pub phase: MonitorPhase,
    pub state: AvailabilityState,
    pub last_checked: Option<DateTime<Utc>>,
    pub last_changed: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
    pub backoff_multiplier: u32,
    pub last_error: Option<String>,
    pub checks: u64,
}

impl MonitorStatus {
    pub fn stopped(persisted: Option<PersistedState>) -> Self {
        Self {
            phase: MonitorPhase::Stopped,
            state: persisted.map(|p| p.state).unwrap_or_default(),
            last_checked: None,
            last_changed: persisted.map(|p| p.changed_at),
            consecutive_failures: 0,
            backoff_multiplier: 1,
            last_error: None,
            checks: 0,
        }
    }
}

/// Detects genuine transitions against the last-known state.
#[derive(Debug, Clone, Copy, Default)]
pub struct StateTracker {
    state: AvailabilityState,
}

impl StateTracker {
    pub fn new(initial: AvailabilityState) -> Self {
        Self { state: initial }
    }

    pub fn state(&self) -> AvailabilityState {
        self.state
    }

    /// The event `observation` would produce, without applying it.
    pub fn detect(&self, target: &Target, observation: &Observation) -> Option<StateChangeEvent> {
        if observation.state == AvailabilityState::Unknown || observation.state == self.state {
            return None;
        }
        Some(StateChangeEvent::new(target, self.state, observation))
    }

    pub fn apply(&mut self, event: &StateChangeEvent) {
        self.state = event.current;
    }
}

/// Shared collaborators handed to every monitor.
#[derive(Clone)]
pub struct MonitorContext {
    pub fetcher: Arc<dyn Fetcher>,
    pub pool: Arc<ProxyPool>,
    pub store: Arc<dyn StateStore>,
    pub events: mpsc::Sender<StateChangeEvent>,
    pub health: Arc<UpstreamHealth>,
    pub global: watch::Receiver<GlobalPolicy>,
    pub settings: MonitorSettings,
}

pub struct MonitorHandle {
    cancel: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl MonitorHandle {
    /// Cancels the loop and waits for it to exit. After this returns the
    /// monitor makes no further fetches and emits no further events.
    pub async fn stop(self) {
        let _ = self.cancel.send(true);
        if let Err(e) = self.task.await {
            if e.is_panic() {
                error!("Monitor task panicked: {}", e);
            }
        }
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

pub struct TargetMonitor {
    target: Target,
    ctx: MonitorContext,
    tracker: StateTracker,
    status: Arc<watch::Sender<MonitorStatus>>,
    cancel: watch::Receiver<bool>,
    interval: watch::Receiver<Option<Duration>>,
    failures: u32,
    multiplier: u32,
}

impl TargetMonitor {
    /// Starts polling `target` on its own task, seeded with its persisted state.
    /// `interval` carries a per-target override of the polling interval.
    pub fn spawn(
        target: Target,
        persisted: Option<PersistedState>,
        ctx: MonitorContext,
        status: Arc<watch::Sender<MonitorStatus>>,
        interval: watch::Receiver<Option<Duration>>,
    ) -> MonitorHandle {
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let initial = persisted.map(|p| p.state).unwrap_or_default();

        status.send_modify(|s| {
            s.phase = MonitorPhase::Polling;
            s.state = initial;
            s.consecutive_failures = 0;
            s.backoff_multiplier = 1;
        });

        let monitor = TargetMonitor {
            target,
            ctx,
            tracker: StateTracker::new(initial),
            status,
            cancel: cancel_rx,
            interval,
            failures: 0,
            multiplier: 1,
        };

        MonitorHandle {
            cancel: cancel_tx,
            task: tokio::spawn(monitor.run()),
        }
    }

    async fn run(mut self) {
        let id = self.target.id();
        info!(target_id = %id, "Monitor started for {}", self.target.display_name);
        self.stagger().await;

        loop {
            if self.is_cancelled() {
                break;
            }
            if !self.wait_while_paused().await {
                break;
            }

            match self.ctx.pool.select().await {
                None => {
                    metrics::counter!("scout_fetch_total", "outcome" => "no_route").increment(1);
                    self.on_no_route();
                }
                Some(route) => {
                    let result = self.ctx.fetcher.fetch(&self.target, &route).await;
                    let outcome = FetchOutcome::from(&result);
                    self.ctx.pool.report_result(&route, &result).await;
                    self.ctx.health.record(result.is_ok()).await;
                    metrics::counter!("scout_fetch_total", "outcome" => outcome.as_str()).increment(1);

                    if self.is_cancelled() {
                        break;
                    }

                    match result {
                        Ok(observation) => self.on_success(observation).await,
                        Err(e) => {
                            debug!(target_id = %id, route = %route.id, outcome = outcome.as_str(), "Fetch failed: {}", e);
                            self.on_failure(e.to_string());
                        }
                    }
                }
            }

            if self.wait_for_next_check().await {
                break;
            }
        }

        self.status.send_modify(|s| s.phase = MonitorPhase::Stopped);
        info!(target_id = %id, "Monitor stopped");
    }

    fn is_cancelled(&self) -> bool {
        *self.cancel.borrow()
    }

    /// Blocks while the global pause is raised. Returns false if cancelled.
    async fn wait_while_paused(&mut self) -> bool {
        let mut held = false;
        loop {
            if !self.ctx.global.borrow_and_update().paused {
                if !held {
                    return true;
                }
                // monitors released together would otherwise poll in lockstep
                held = false;
                if self.stagger().await {
                    return false;
                }
                continue;
            }
            held = true;
            tokio::select! {
                changed = self.ctx.global.changed() => {
                    if changed.is_err() {
                        return false;
                    }
                }
                changed = self.cancel.changed() => {
                    if changed.is_err() || *self.cancel.borrow() {
                        return false;
                    }
                }
            }
        }
    }

    /// Returns true if cancelled before `delay` elapsed.
    async fn sleep_or_cancel(&mut self, delay: Duration) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(delay) => self.is_cancelled(),
            changed = self.cancel.changed() => changed.is_err() || *self.cancel.borrow(),
        }
    }

    /// Waits a random share of the interval, up to `jitter`, before polling.
    /// Returns true if cancelled meanwhile.
    async fn stagger(&mut self) -> bool {
        let jitter = self.ctx.settings.jitter;
        if jitter <= 0.0 {
            return false;
        }
        let offset = self.interval().mul_f64(rand::thread_rng().gen_range(0.0..=jitter));
        debug!(target_id = %self.target.id(), ?offset, "Staggering first check");
        self.sleep_or_cancel(offset).await
    }

    /// Sleeps until the next check is due. Interval or global policy changes
    /// made meanwhile move the deadline. Returns true if cancelled.
    async fn wait_for_next_check(&mut self) -> bool {
        let started = Instant::now();
        let sample = self.jitter_sample();
        let mut interval_open = true;
        let mut global_open = true;

        loop {
            let deadline = started + self.next_delay(sample);
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => return self.is_cancelled(),
                changed = self.cancel.changed() => {
                    if changed.is_err() || *self.cancel.borrow() {
                        return true;
                    }
                }
                changed = self.interval.changed(), if interval_open => {
                    interval_open = changed.is_ok();
                }
                changed = self.ctx.global.changed(), if global_open => {
                    global_open = changed.is_ok();
                }
            }
        }
    }

    async fn on_success(&mut self, observation: Observation) {
        let id = self.target.id();
        let mut changed_at = None;

        if let Some(event) = self.tracker.detect(&self.target, &observation) {
            match self.ctx.store.record_transition(&event).await {
                Ok(()) => {
                    self.tracker.apply(&event);
                    changed_at = Some(event.observed_at);
                    metrics::counter!("scout_state_changes_total").increment(1);
                    info!(
                        target_id = %id,
                        event_id = %event.id,
                        "Availability changed {} -> {}",
                        event.previous,
                        event.current
                    );
                    if self.ctx.events.send(event).await.is_err() {
                        warn!(target_id = %id, "Event stream closed, event left in outbox");
                    }
                }
                Err(e) => {
                    // tracker keeps the old state so the next check retries the transition
                    error!(target_id = %id, "Failed to persist transition: {}", e);
                }
            }
        }

        self.failures = 0;
        self.multiplier = 1;
        let state = self.tracker.state();
        self.status.send_modify(|s| {
            s.phase = MonitorPhase::Polling;
            s.state = state;
            s.last_checked = Some(observation.observed_at);
            if changed_at.is_some() {
                s.last_changed = changed_at;
            }
            s.consecutive_failures = 0;
            s.backoff_multiplier = 1;
            s.last_error = None;
            s.checks += 1;
        });
    }

    fn on_failure(&mut self, message: String) {
        self.failures += 1;
        if self.failures >= self.ctx.settings.failure_threshold {
            self.multiplier = (self.multiplier.saturating_mul(2)).min(self.ctx.settings.max_backoff_multiplier);
        }
        let phase = if self.failures >= self.ctx.settings.failure_threshold {
            MonitorPhase::Backoff
        } else {
            MonitorPhase::Polling
        };
        if phase == MonitorPhase::Backoff && self.failures == self.ctx.settings.failure_threshold {
            warn!(target_id = %self.target.id(), failures = self.failures, "Entering backoff: {}", message);
        }
        self.publish_failure(phase, message);
    }

    /// Every route is cooling down. Back off without touching the network.
    fn on_no_route(&mut self) {
        self.failures += 1;
        self.multiplier = (self.multiplier.saturating_mul(2)).min(self.ctx.settings.max_backoff_multiplier);
        debug!(target_id = %self.target.id(), "No egress route available, backing off");
        self.publish_failure(MonitorPhase::Backoff, "no egress route available".to_string());
    }

    fn publish_failure(&self, phase: MonitorPhase, message: String) {
        let failures = self.failures;
        let multiplier = self.multiplier;
        self.status.send_modify(|s| {
            s.phase = phase;
            s.last_checked = Some(Utc::now());
            s.consecutive_failures = failures;
            s.backoff_multiplier = multiplier;
            s.last_error = Some(message);
            s.checks += 1;
        });
    }

    /// Target override, then the global override, then the configured interval.
    fn interval(&self) -> Duration {
        (*self.interval.borrow())
            .or(self.ctx.global.borrow().interval)
            .unwrap_or(self.ctx.settings.interval)
    }

    fn jitter_sample(&self) -> f64 {
        let jitter = self.ctx.settings.jitter;
        if jitter > 0.0 {
            rand::thread_rng().gen_range(-jitter..=jitter)
        } else {
            0.0
        }
    }

    fn next_delay(&self, jitter_sample: f64) -> Duration {
        let global = self.ctx.global.borrow().backoff_multiplier;
        compute_delay(
            self.interval(),
            self.ctx.settings.max_delay,
            self.multiplier,
            global,
            jitter_sample,
        )
    }
}

/// `interval * local * global`, scaled by `1 + jitter_sample` and capped at `max_delay`.
pub fn compute_delay(interval: Duration, max_delay: Duration, local: u32, global: u32, jitter_sample: f64) -> Duration {
    let secs = interval.as_secs_f64()
        * f64::from(local.max(1))
        * f64::from(global.max(1))
        * (1.0 + jitter_sample);
    let capped = secs.min(max_delay.as_secs_f64()).max(0.0);
    if capped.is_finite() {
        Duration::from_secs_f64(capped)
    } else {
        max_delay
    }
}
