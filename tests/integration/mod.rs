// Integration tests for shelf-scout
// Monitors, the proxy pool, the store and the dispatcher wired together
// against a scripted upstream and an in-memory chat transport.

pub mod control_tests;
pub mod dispatcher_tests;
pub mod monitor_tests;
pub mod persistence_tests;
pub mod web_tests;

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use shelf_scout::control::ControlChannel;
use shelf_scout::fetcher::Fetcher;
use shelf_scout::models::{
    AvailabilityState, FetchError, FetchResult, Observation, Subscriber, Target, TargetId,
};
use shelf_scout::monitor::MonitorSettings;
use shelf_scout::notifications::{
    AlertSink, DispatchSettings, MessageTransport, NotificationDispatcher, OutboundMessage, SentMessage,
    SubscriberRegistry, TransportError,
};
use shelf_scout::proxy_pool::{PoolSettings, ProxyPool, ProxyRoute};
use shelf_scout::store::StateStore;
use shelf_scout::supervisor::MonitorSupervisor;

pub const INTERVAL: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy)]
pub enum Step {
    State(AvailabilityState),
    RateLimited,
    Transport,
}

pub use shelf_scout::models::AvailabilityState::{Available as A, Unavailable as U};

/// Plays back a fixed sequence of upstream answers, repeating the last one.
pub struct ScriptedFetcher {
    script: Mutex<VecDeque<Step>>,
    last: Mutex<Option<Step>>,
    calls: AtomicUsize,
    log: Mutex<Vec<(TargetId, Instant)>>,
}

impl ScriptedFetcher {
    pub fn new(steps: impl IntoIterator<Item = Step>) -> Self {
        Self {
            script: Mutex::new(steps.into_iter().collect()),
            last: Mutex::new(None),
            calls: AtomicUsize::new(0),
            log: Mutex::new(Vec::new()),
        }
    }

    pub fn states(states: &[AvailabilityState]) -> Self {
        Self::new(states.iter().copied().map(Step::State))
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// When each target was fetched, in call order.
    pub fn fetch_log(&self) -> Vec<(TargetId, Instant)> {
        self.log.lock().unwrap().clone()
    }
}

#[async_trait]
impl Fetcher for ScriptedFetcher {
    async fn fetch(&self, target: &Target, _route: &ProxyRoute) -> FetchResult {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.log.lock().unwrap().push((target.id(), Instant::now()));
        let step = {
            let mut script = self.script.lock().unwrap();
            let mut last = self.last.lock().unwrap();
            match script.pop_front() {
                Some(step) => {
                    *last = Some(step);
                    step
                }
                None => last.unwrap_or(Step::State(AvailabilityState::Unavailable)),
            }
        };
        match step {
            Step::State(state) => Ok(Observation::now(state)),
            Step::RateLimited => Err(FetchError::rate_limited(None)),
            Step::Transport => Err(FetchError::transport("connection reset")),
        }
    }
}

/// Records every message; fails the first `failures` sends with a network error.
#[derive(Default)]
pub struct RecordingTransport {
    sent: Mutex<Vec<OutboundMessage>>,
    failures: AtomicUsize,
}

impl RecordingTransport {
    pub fn failing(failures: usize) -> Self {
        Self {
            sent: Mutex::new(Vec::new()),
            failures: AtomicUsize::new(failures),
        }
    }

    pub fn sent(&self) -> Vec<OutboundMessage> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl MessageTransport for RecordingTransport {
    async fn send(&self, message: &OutboundMessage) -> Result<SentMessage, TransportError> {
        let remaining = self.failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures.store(remaining - 1, Ordering::SeqCst);
            return Err(TransportError::Network("connection reset".into()));
        }
        let mut sent = self.sent.lock().unwrap();
        sent.push(message.clone());
        Ok(SentMessage {
            message_id: Some(sent.len().to_string()),
        })
    }
}

#[derive(Default)]
pub struct CollectingAlerts {
    pub messages: Mutex<Vec<String>>,
}

#[async_trait]
impl AlertSink for CollectingAlerts {
    async fn alert(&self, message: &str) {
        self.messages.lock().unwrap().push(message.to_string());
    }
}

pub fn monitor_settings() -> MonitorSettings {
    MonitorSettings {
        interval: INTERVAL,
        jitter: 0.0,
        failure_threshold: 3,
        max_backoff_multiplier: 8,
        max_delay: Duration::from_secs(600),
    }
}

pub fn dispatch_settings() -> DispatchSettings {
    DispatchSettings {
        max_attempts: 3,
        base_delay: Duration::from_millis(100),
        max_delay: Duration::from_secs(1),
        retention: chrono::Duration::hours(24),
    }
}

/// One running instance: supervisor, dispatcher and control channel.
pub struct Harness {
    pub store: Arc<dyn StateStore>,
    pub fetcher: Arc<ScriptedFetcher>,
    pub transport: Arc<RecordingTransport>,
    pub alerts: Arc<CollectingAlerts>,
    pub supervisor: Arc<MonitorSupervisor>,
    pub subscribers: Arc<SubscriberRegistry>,
    pub dispatcher: Arc<NotificationDispatcher>,
    pub control: Arc<ControlChannel>,
    dispatch_task: JoinHandle<()>,
}

pub struct HarnessBuilder {
    store: Arc<dyn StateStore>,
    fetcher: ScriptedFetcher,
    transport: RecordingTransport,
    pool: ProxyPool,
    settings: MonitorSettings,
    subscribers: Vec<Subscriber>,
}

impl HarnessBuilder {
    pub fn new(store: Arc<dyn StateStore>, fetcher: ScriptedFetcher) -> Self {
        Self {
            store,
            fetcher,
            transport: RecordingTransport::default(),
            pool: ProxyPool::new(vec![], PoolSettings::default()),
            settings: monitor_settings(),
            subscribers: Vec::new(),
        }
    }

    pub fn transport(mut self, transport: RecordingTransport) -> Self {
        self.transport = transport;
        self
    }

    pub fn pool(mut self, pool: ProxyPool) -> Self {
        self.pool = pool;
        self
    }

    pub fn monitor_settings(mut self, settings: MonitorSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn subscriber(mut self, subscriber: Subscriber) -> Self {
        self.subscribers.push(subscriber);
        self
    }

    pub async fn build(self) -> anyhow::Result<Harness> {
        let fetcher = Arc::new(self.fetcher);
        let transport = Arc::new(self.transport);
        let alerts = Arc::new(CollectingAlerts::default());
        let pool = Arc::new(self.pool);

        let subscribers = Arc::new(SubscriberRegistry::load(self.store.clone(), self.subscribers).await?);
        let (supervisor, events) = MonitorSupervisor::new(
            fetcher.clone(),
            pool,
            self.store.clone(),
            self.settings,
            64,
        );
        let supervisor = Arc::new(supervisor);

        let dispatcher = Arc::new(NotificationDispatcher::new(
            transport.clone(),
            subscribers.clone(),
            self.store.clone(),
            alerts.clone(),
            dispatch_settings(),
        ));
        let dispatch_task = dispatcher.clone().spawn(events);
        let control = Arc::new(ControlChannel::new(supervisor.clone(), subscribers.clone()));

        Ok(Harness {
            store: self.store,
            fetcher,
            transport,
            alerts,
            supervisor,
            subscribers,
            dispatcher,
            control,
            dispatch_task,
        })
    }
}

impl Harness {
    /// Stops every monitor and the dispatcher, like a process exit.
    pub async fn stop(self) {
        self.supervisor.shutdown().await;
        self.dispatch_task.abort();
    }
}

pub fn target() -> Target {
    Target::new("MU793LL/A", "R409", Some("iPhone 15 Pro".to_string()))
}

/// Polls `condition` once per virtual second until it holds or `limit` passes.
pub async fn wait_until<F>(limit: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
    }
    condition()
}
