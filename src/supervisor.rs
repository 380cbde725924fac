use futures::future::join_all;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::config::SupervisorConfig;
use crate::fetcher::Fetcher;
use crate::models::{Scope, StateChangeEvent, Target, TargetId};
use crate::monitor::{
    GlobalPolicy, MonitorContext, MonitorHandle, MonitorSettings, MonitorStatus, TargetMonitor,
};
use crate::notifications::AlertSink;
use crate::proxy_pool::ProxyPool;
use crate::store::{PersistedState, StateStore};
use crate::utils::error::{AppError, Result};

/// Tracks whether any fetch, for any target, has succeeded lately.
#[derive(Default)]
pub struct UpstreamHealth {
    inner: Mutex<HealthInner>,
}

#[derive(Default)]
struct HealthInner {
    failing_since: Option<Instant>,
    last_success: Option<Instant>,
}

impl UpstreamHealth {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn record(&self, success: bool) {
        let now = Instant::now();
        let mut inner = self.inner.lock().await;
        if success {
            inner.failing_since = None;
            inner.last_success = Some(now);
        } else if inner.failing_since.is_none() {
            inner.failing_since = Some(now);
        }
    }

    /// Forgets the current failure streak. Used while nothing is being fetched.
    pub async fn clear_failures(&self) {
        self.inner.lock().await.failing_since = None;
    }

    /// Time since the first failure that has not been followed by a success.
    pub async fn failing_for(&self) -> Option<Duration> {
        let inner = self.inner.lock().await;
        inner
            .failing_since
            .map(|since| Instant::now().saturating_duration_since(since))
    }

    pub async fn last_success(&self) -> Option<Instant> {
        self.inner.lock().await.last_success
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TargetSnapshot {
    pub id: TargetId,
    pub display_name: String,
    pub enabled: bool,
    pub running: bool,
    /// Polling interval currently in effect, before backoff.
    pub interval_secs: f64,
    pub status: MonitorStatus,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RestoreSummary {
    pub started: usize,
    pub replayed: usize,
}

struct MonitorEntry {
    target: Target,
    status: Arc<watch::Sender<MonitorStatus>>,
    interval: watch::Sender<Option<Duration>>,
    handle: Option<MonitorHandle>,
}

impl MonitorEntry {
    fn new(target: Target, persisted: Option<PersistedState>) -> Self {
        let (status, _) = watch::channel(MonitorStatus::stopped(persisted));
        let (interval, _) = watch::channel(None);
        Self {
            target,
            status: Arc::new(status),
            interval,
            handle: None,
        }
    }

    /// State and change time as the monitor last persisted them.
    fn last_known(&self) -> Option<PersistedState> {
        let status = self.status.borrow();
        status.last_changed.map(|changed_at| PersistedState {
            state: status.state,
            changed_at,
        })
    }

    async fn stop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.stop().await;
        }
    }
}

/// Owns every monitor, keyed by target id.
pub struct MonitorSupervisor {
    entries: Mutex<HashMap<TargetId, MonitorEntry>>,
    fetcher: Arc<dyn Fetcher>,
    pool: Arc<ProxyPool>,
    store: Arc<dyn StateStore>,
    events: mpsc::Sender<StateChangeEvent>,
    health: Arc<UpstreamHealth>,
    global: watch::Sender<GlobalPolicy>,
    settings: MonitorSettings,
}

impl MonitorSupervisor {
    /// Returns the supervisor and the single stream all monitors emit into.
    pub fn new(
        fetcher: Arc<dyn Fetcher>,
        pool: Arc<ProxyPool>,
        store: Arc<dyn StateStore>,
        settings: MonitorSettings,
        event_buffer: usize,
    ) -> (Self, mpsc::Receiver<StateChangeEvent>) {
        let (events, rx) = mpsc::channel(event_buffer.max(1));
        let (global, _) = watch::channel(GlobalPolicy::default());

        let supervisor = Self {
            entries: Mutex::new(HashMap::new()),
            fetcher,
            pool,
            store,
            events,
            health: Arc::new(UpstreamHealth::new()),
            global,
            settings,
        };
        (supervisor, rx)
    }

    fn context(&self) -> MonitorContext {
        MonitorContext {
            fetcher: self.fetcher.clone(),
            pool: self.pool.clone(),
            store: self.store.clone(),
            events: self.events.clone(),
            health: self.health.clone(),
            global: self.global.subscribe(),
            settings: self.settings.clone(),
        }
    }

    fn start(&self, entry: &mut MonitorEntry) {
        if entry.handle.is_some() {
            return;
        }
        entry.handle = Some(TargetMonitor::spawn(
            entry.target.clone(),
            entry.last_known(),
            self.context(),
            entry.status.clone(),
            entry.interval.subscribe(),
        ));
    }

    /// Adds a target, or updates the display name and enablement of an
    /// existing one. Returns true when the target is new.
    pub async fn add(&self, target: Target) -> Result<bool> {
        target.validate()?;
        let id = target.id();
        let mut entries = self.entries.lock().await;

        self.store.save_target(&target).await?;

        match entries.get_mut(&id) {
            Some(entry) => {
                entry.target.display_name = target.display_name.clone();
                entry.target.enabled = target.enabled;
                if target.enabled {
                    self.start(entry);
                } else {
                    entry.stop().await;
                }
                info!(target_id = %id, "Target updated");
                Ok(false)
            }
            None => {
                let mut entry = MonitorEntry::new(target, None);
                if entry.target.enabled {
                    self.start(&mut entry);
                }
                entries.insert(id.clone(), entry);
                info!(target_id = %id, "Target added");
                Ok(true)
            }
        }
    }

    pub async fn remove(&self, id: &TargetId) -> Result<()> {
        let mut entries = self.entries.lock().await;
        let mut entry = entries
            .remove(id)
            .ok_or_else(|| AppError::not_found(format!("target {}", id)))?;

        entry.stop().await;
        self.store.remove_target(id).await?;
        info!(target_id = %id, "Target removed");
        Ok(())
    }

    pub async fn pause(&self, scope: &Scope) -> Result<()> {
        match scope {
            Scope::All => {
                self.global.send_modify(|p| p.paused = true);
                info!("Monitoring paused globally");
                Ok(())
            }
            Scope::Target(id) => self.set_enabled(id, false).await,
        }
    }

    pub async fn resume(&self, scope: &Scope) -> Result<()> {
        match scope {
            Scope::All => {
                self.health.clear_failures().await;
                self.global.send_modify(|p| p.paused = false);
                info!("Monitoring resumed globally");
                Ok(())
            }
            Scope::Target(id) => self.set_enabled(id, true).await,
        }
    }

    async fn set_enabled(&self, id: &TargetId, enabled: bool) -> Result<()> {
        let mut entries = self.entries.lock().await;
        let entry = entries
            .get_mut(id)
            .ok_or_else(|| AppError::not_found(format!("target {}", id)))?;

        if !enabled {
            entry.stop().await;
        }
        entry.target.enabled = enabled;
        self.store.save_target(&entry.target).await?;
        if enabled {
            self.start(entry);
        }

        info!(target_id = %id, enabled, "Target enablement changed");
        Ok(())
    }

    /// Changes the polling interval of one target, or of every target.
    /// Running monitors pick the new interval up for the wait in progress.
    pub async fn set_interval(&self, scope: &Scope, interval: Duration) -> Result<()> {
        let max = self.settings.max_delay;
        if interval < Duration::from_secs(1) || interval > max {
            return Err(AppError::Validation(format!(
                "interval must be between 1 and {} seconds",
                max.as_secs()
            )));
        }

        let entries = self.entries.lock().await;
        match scope {
            Scope::All => {
                for entry in entries.values() {
                    entry.interval.send_replace(None);
                }
                self.global.send_modify(|p| p.interval = Some(interval));
                info!(?interval, "Polling interval changed for every target");
            }
            Scope::Target(id) => {
                let entry = entries
                    .get(id)
                    .ok_or_else(|| AppError::not_found(format!("target {}", id)))?;
                entry.interval.send_replace(Some(interval));
                info!(target_id = %id, ?interval, "Polling interval changed");
            }
        }
        Ok(())
    }

    pub async fn list(&self) -> Vec<TargetSnapshot> {
        let entries = self.entries.lock().await;
        let default_interval = self.global.borrow().interval.unwrap_or(self.settings.interval);
        let mut snapshots: Vec<TargetSnapshot> = entries
            .iter()
            .map(|(id, entry)| TargetSnapshot {
                id: id.clone(),
                display_name: entry.target.display_name.clone(),
                enabled: entry.target.enabled,
                running: entry.handle.as_ref().is_some_and(|h| !h.is_finished()),
                interval_secs: entry.interval.borrow().unwrap_or(default_interval).as_secs_f64(),
                status: entry.status.borrow().clone(),
            })
            .collect();
        snapshots.sort_by(|a, b| a.id.cmp(&b.id));
        snapshots
    }

    /// Live status updates for one target.
    pub async fn watch_status(&self, id: &TargetId) -> Option<watch::Receiver<MonitorStatus>> {
        self.entries.lock().await.get(id).map(|e| e.status.subscribe())
    }

    /// Loads persisted targets and states, merges in `configured` targets,
    /// replays undelivered outbox events and starts every enabled monitor.
    ///
    /// The event receiver must already be drained by a running dispatcher.
    pub async fn restore(&self, configured: Vec<Target>) -> Result<RestoreSummary> {
        let mut targets: HashMap<TargetId, Target> = self
            .store
            .load_targets()
            .await?
            .into_iter()
            .map(|t| (t.id(), t))
            .collect();

        for target in configured {
            if !targets.contains_key(&target.id()) {
                self.store.save_target(&target).await?;
                targets.insert(target.id(), target);
            }
        }

        let states = self.store.load_states().await?;
        let mut summary = RestoreSummary::default();

        for event in self.store.pending_events().await? {
            if self.events.send(event).await.is_err() {
                warn!("Event stream closed while replaying outbox");
                break;
            }
            summary.replayed += 1;
        }

        let mut entries = self.entries.lock().await;
        for (id, target) in targets {
            if entries.contains_key(&id) {
                continue;
            }
            let mut entry = MonitorEntry::new(target, states.get(&id).copied());
            if entry.target.enabled {
                self.start(&mut entry);
                summary.started += 1;
            }
            entries.insert(id, entry);
        }

        info!(
            "Restored {} target(s), started {}, replayed {} pending event(s)",
            entries.len(),
            summary.started,
            summary.replayed
        );
        Ok(summary)
    }

    pub async fn shutdown(&self) {
        let mut entries = self.entries.lock().await;
        let stops = entries.values_mut().map(|entry| entry.stop());
        join_all(stops).await;
        info!("All monitors stopped");
    }

    pub fn global_policy(&self) -> GlobalPolicy {
        *self.global.borrow()
    }

    pub fn set_global_multiplier(&self, multiplier: u32) {
        self.global.send_modify(|p| p.backoff_multiplier = multiplier.max(1));
    }

    pub fn health(&self) -> Arc<UpstreamHealth> {
        self.health.clone()
    }

    pub fn pool(&self) -> Arc<ProxyPool> {
        self.pool.clone()
    }
}

#[derive(Debug, Clone)]
pub struct WatchdogSettings {
    pub interval: Duration,
    pub failure_window: Duration,
    pub max_global_multiplier: u32,
    pub exhaustion_alert_after: Duration,
}

impl From<&SupervisorConfig> for WatchdogSettings {
    fn from(config: &SupervisorConfig) -> Self {
        Self {
            interval: config.watchdog_interval(),
            failure_window: config.global_failure_window(),
            max_global_multiplier: config.max_global_multiplier.max(1),
            exhaustion_alert_after: config.exhaustion_alert_after(),
        }
    }
}

/// Applies the global backoff and raises operator alerts for sustained
/// upstream failure or route exhaustion, once per episode.
pub struct Watchdog {
    supervisor: Arc<MonitorSupervisor>,
    alerts: Arc<dyn AlertSink>,
    settings: WatchdogSettings,
    failure_alerted: bool,
    exhaustion_alerted: bool,
    last_escalation: Option<Instant>,
}

impl Watchdog {
    pub fn new(supervisor: Arc<MonitorSupervisor>, alerts: Arc<dyn AlertSink>, settings: WatchdogSettings) -> Self {
        Self {
            supervisor,
            alerts,
            settings,
            failure_alerted: false,
            exhaustion_alerted: false,
            last_escalation: None,
        }
    }

    pub async fn check(&mut self) {
        let window = self.settings.failure_window;

        // no fetches run while paused, so silence is not an upstream failure
        if self.supervisor.global_policy().paused {
            self.supervisor.health.clear_failures().await;
            self.last_escalation = None;
        }

        match self.supervisor.health.failing_for().await {
            Some(failing) if failing >= window => {
                let due = self.last_escalation.is_none_or(|at| at.elapsed() >= window);
                let current = self.supervisor.global_policy().backoff_multiplier;
                if due && current < self.settings.max_global_multiplier {
                    let next = current.saturating_mul(2).min(self.settings.max_global_multiplier);
                    self.supervisor.set_global_multiplier(next);
                    warn!("No successful fetch for {:?}, global backoff now x{}", failing, next);
                }
                if due {
                    self.last_escalation = Some(Instant::now());
                }
                if !self.failure_alerted {
                    self.failure_alerted = true;
                    self.alerts
                        .alert(&format!(
                            "⚠️ No successful availability check for {} minutes. Slowing down all monitors.",
                            failing.as_secs() / 60
                        ))
                        .await;
                }
            }
            Some(_) => {}
            None => {
                if self.supervisor.global_policy().backoff_multiplier > 1 {
                    self.supervisor.set_global_multiplier(1);
                    info!("Upstream recovered, global backoff reset");
                }
                self.last_escalation = None;
                if self.failure_alerted {
                    self.failure_alerted = false;
                    self.alerts.alert("✅ Availability checks are succeeding again.").await;
                }
            }
        }

        match self.supervisor.pool.exhausted_for().await {
            Some(exhausted) if exhausted >= self.settings.exhaustion_alert_after => {
                if !self.exhaustion_alerted {
                    self.exhaustion_alerted = true;
                    let routes = self.supervisor.pool.len().await;
                    self.alerts
                        .alert(&format!(
                            "⚠️ All {} proxy route(s) have been cooling down for {} seconds.",
                            routes,
                            exhausted.as_secs()
                        ))
                        .await;
                }
            }
            Some(_) => {}
            None => self.exhaustion_alerted = false,
        }
    }

    pub fn spawn(mut self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.settings.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => self.check().await,
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            info!("Watchdog stopped");
        })
    }
}
