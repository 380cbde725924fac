//! Egress route selection with per-route health and exponential cooldown.
//!
//! Every fetch attempt asks the pool for a route and reports the outcome
//! back. Rate-limited and transport failures put a route into cooldown for
//! `base * factor^consecutive_failures` (capped) and halve its health.
//! Successes earn health back until `restore_after_successes` in a row
//! restore it fully.

use rand::distributions::{Distribution, WeightedIndex};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::Serialize;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use url::Url;

use crate::config::ProxyConfig;
use crate::models::{FetchErrorKind, FetchOutcome, FetchResult};

/// Lowest health a route can be demoted to, so it keeps a small weight.
pub const HEALTH_FLOOR: f64 = 0.05;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ProxyRoute {
    /// Stable label without credentials, safe to log.
    pub id: String,
    /// `None` means connect directly.
    pub proxy_url: Option<String>,
}

impl ProxyRoute {
    pub fn direct() -> Self {
        Self {
            id: "direct".to_string(),
            proxy_url: None,
        }
    }

    pub fn proxied(proxy_url: &str) -> Self {
        let id = match Url::parse(proxy_url) {
            Ok(url) => match url.host_str() {
                Some(host) => match url.port_or_known_default() {
                    Some(port) => format!("{}://{}:{}", url.scheme(), host, port),
                    None => format!("{}://{}", url.scheme(), host),
                },
                None => proxy_url.to_string(),
            },
            Err(_) => proxy_url.to_string(),
        };
        Self {
            id,
            proxy_url: Some(proxy_url.to_string()),
        }
    }

    pub fn is_direct(&self) -> bool {
        self.proxy_url.is_none()
    }
}

#[derive(Debug, Clone)]
pub struct PoolSettings {
    pub cooldown_base: Duration,
    pub cooldown_factor: f64,
    pub max_cooldown: Duration,
    pub restore_after_successes: u32,
    pub randomize: bool,
    pub seed: Option<u64>,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self::from(&ProxyConfig::default())
    }
}

impl From<&ProxyConfig> for PoolSettings {
    fn from(config: &ProxyConfig) -> Self {
        Self {
            cooldown_base: Duration::from_millis(config.cooldown_base_ms),
            cooldown_factor: config.cooldown_factor,
            max_cooldown: Duration::from_secs(config.max_cooldown_secs),
            restore_after_successes: config.restore_after_successes.max(1),
            randomize: config.randomize,
            seed: config.selection_seed,
        }
    }
}

#[derive(Debug)]
struct RouteState {
    route: ProxyRoute,
    health: f64,
    consecutive_failures: u32,
    consecutive_successes: u32,
    cooldown_until: Option<Instant>,
    total_requests: u64,
    total_failures: u64,
}

impl RouteState {
    fn new(route: ProxyRoute) -> Self {
        Self {
            route,
            health: 1.0,
            consecutive_failures: 0,
            consecutive_successes: 0,
            cooldown_until: None,
            total_requests: 0,
            total_failures: 0,
        }
    }

    fn is_eligible(&self, now: Instant) -> bool {
        self.cooldown_until.is_none_or(|until| until <= now)
    }
}

/// Per-route view for status commands and the web API.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct RouteStatus {
    pub id: String,
    pub health: f64,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    pub cooldown_remaining_secs: Option<f64>,
    pub total_requests: u64,
    pub total_failures: u64,
}

struct PoolInner {
    routes: Vec<RouteState>,
    rng: StdRng,
    cursor: usize,
    exhausted_since: Option<Instant>,
}

pub struct ProxyPool {
    inner: Mutex<PoolInner>,
    settings: PoolSettings,
}

impl ProxyPool {
    /// An empty route list becomes a single direct route.
    pub fn new(routes: Vec<ProxyRoute>, settings: PoolSettings) -> Self {
        let routes = if routes.is_empty() {
            vec![ProxyRoute::direct()]
        } else {
            routes
        };
        let rng = match settings.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        Self {
            inner: Mutex::new(PoolInner {
                routes: routes.into_iter().map(RouteState::new).collect(),
                rng,
                cursor: 0,
                exhausted_since: None,
            }),
            settings,
        }
    }

    pub fn from_config(config: &ProxyConfig) -> Self {
        let mut routes: Vec<ProxyRoute> = Vec::new();
        for raw in &config.routes {
            let mut route = ProxyRoute::proxied(raw);
            if routes.iter().any(|r| r.id == route.id) {
                route.id = format!("{}#{}", route.id, routes.len());
            }
            routes.push(route);
        }
        if config.include_direct && !routes.is_empty() {
            routes.push(ProxyRoute::direct());
        }

        info!("Proxy pool initialized with {} route(s)", routes.len().max(1));
        Self::new(routes, PoolSettings::from(config))
    }

    /// Picks a route for the next fetch, or `None` when every route is cooling down.
    pub async fn select(&self) -> Option<ProxyRoute> {
        let now = Instant::now();
        let mut inner = self.inner.lock().await;

        let eligible: Vec<usize> = inner
            .routes
            .iter()
            .enumerate()
            .filter(|(_, r)| r.is_eligible(now))
            .map(|(i, _)| i)
            .collect();

        if eligible.is_empty() {
            if inner.exhausted_since.is_none() {
                warn!("All {} proxy routes are in cooldown", inner.routes.len());
                inner.exhausted_since = Some(now);
            }
            return None;
        }
        if inner.exhausted_since.take().is_some() {
            info!("Proxy routes available again");
        }

        let index = if self.settings.randomize {
            Self::pick_weighted(&mut inner, &eligible)
        } else {
            Self::pick_healthiest(&mut inner, &eligible)
        };

        let state = &mut inner.routes[index];
        state.total_requests += 1;
        debug!(route = %state.route.id, health = state.health, "Selected route");
        Some(state.route.clone())
    }

    fn pick_weighted(inner: &mut PoolInner, eligible: &[usize]) -> usize {
        let weights: Vec<f64> = eligible.iter().map(|&i| inner.routes[i].health).collect();
        match WeightedIndex::new(&weights) {
            Ok(dist) => eligible[dist.sample(&mut inner.rng)],
            Err(_) => eligible[0],
        }
    }

    fn pick_healthiest(inner: &mut PoolInner, eligible: &[usize]) -> usize {
        let best = eligible
            .iter()
            .map(|&i| inner.routes[i].health)
            .fold(f64::MIN, f64::max);
        let tied: Vec<usize> = eligible
            .iter()
            .copied()
            .filter(|&i| (inner.routes[i].health - best).abs() < f64::EPSILON)
            .collect();

        let index = tied
            .iter()
            .copied()
            .find(|&i| i >= inner.cursor)
            .unwrap_or(tied[0]);
        inner.cursor = index + 1;
        index
    }

    /// Records how a fetch through `route` went.
    pub async fn report(&self, route: &ProxyRoute, outcome: FetchOutcome) {
        let now = Instant::now();
        let mut inner = self.inner.lock().await;
        let Some(state) = inner.routes.iter_mut().find(|r| r.route.id == route.id) else {
            return;
        };

        match outcome {
            FetchOutcome::Success => {
                state.consecutive_failures = 0;
                state.consecutive_successes += 1;
                let restore_after = self.settings.restore_after_successes;
                if state.consecutive_successes >= restore_after {
                    if state.health < 1.0 {
                        info!(route = %state.route.id, "Route restored to full health");
                    }
                    state.health = 1.0;
                } else {
                    let step = (1.0 - HEALTH_FLOOR) / restore_after as f64;
                    state.health = (state.health + step).min(1.0);
                }
            }
            FetchOutcome::Failed(FetchErrorKind::RateLimited | FetchErrorKind::Transport) => {
                state.consecutive_failures += 1;
                state.consecutive_successes = 0;
                state.total_failures += 1;
                state.health = (state.health / 2.0).max(HEALTH_FLOOR);

                let cooldown = self.cooldown_for(state.consecutive_failures);
                state.cooldown_until = Some(now + cooldown);
                warn!(
                    route = %state.route.id,
                    outcome = outcome.as_str(),
                    failures = state.consecutive_failures,
                    "Route demoted, cooling down for {:?}",
                    cooldown
                );
            }
            FetchOutcome::Failed(FetchErrorKind::Parse | FetchErrorKind::UpstreamError) => {}
        }
    }

    /// Like [`report`](Self::report), and also honors an upstream `Retry-After`.
    pub async fn report_result(&self, route: &ProxyRoute, result: &FetchResult) {
        self.report(route, FetchOutcome::from(result)).await;

        if let Err(error) = result {
            if let Some(retry_after) = error.retry_after {
                let until = Instant::now() + retry_after.min(self.settings.max_cooldown);
                let mut inner = self.inner.lock().await;
                if let Some(state) = inner.routes.iter_mut().find(|r| r.route.id == route.id) {
                    if state.cooldown_until.is_none_or(|current| current < until) {
                        state.cooldown_until = Some(until);
                    }
                }
            }
        }
    }

    fn cooldown_for(&self, failures: u32) -> Duration {
        let max = self.settings.max_cooldown;
        let exponent = i32::try_from(failures).unwrap_or(i32::MAX);
        let secs = self.settings.cooldown_base.as_secs_f64() * self.settings.cooldown_factor.powi(exponent);
        if !secs.is_finite() || secs >= max.as_secs_f64() {
            max
        } else {
            Duration::from_secs_f64(secs)
        }
    }

    /// How long every route has been cooling down, or `None` if one is usable.
    pub async fn exhausted_for(&self) -> Option<Duration> {
        let now = Instant::now();
        let mut inner = self.inner.lock().await;
        if inner.routes.iter().any(|r| r.is_eligible(now)) {
            inner.exhausted_since = None;
            return None;
        }
        let since = *inner.exhausted_since.get_or_insert(now);
        Some(now.saturating_duration_since(since))
    }

    pub async fn snapshot(&self) -> Vec<RouteStatus> {
        let now = Instant::now();
        let inner = self.inner.lock().await;
        inner
            .routes
            .iter()
            .map(|r| RouteStatus {
                id: r.route.id.clone(),
                health: r.health,
                consecutive_failures: r.consecutive_failures,
                consecutive_successes: r.consecutive_successes,
                cooldown_remaining_secs: r
                    .cooldown_until
                    .filter(|until| *until > now)
                    .map(|until| (until - now).as_secs_f64()),
                total_requests: r.total_requests,
                total_failures: r.total_failures,
            })
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.routes.len()
    }
}
