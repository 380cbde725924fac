use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

use super::target::{Target, TargetId};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum AvailabilityState {
    #[default]
    Unknown,
    Available,
    Unavailable,
}

impl AvailabilityState {
    pub fn as_str(&self) -> &'static str {
        match self {
            AvailabilityState::Unknown => "unknown",
            AvailabilityState::Available => "available",
            AvailabilityState::Unavailable => "unavailable",
        }
    }
}

impl FromStr for AvailabilityState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "unknown" => Ok(AvailabilityState::Unknown),
            "available" => Ok(AvailabilityState::Available),
            "unavailable" => Ok(AvailabilityState::Unavailable),
            other => Err(format!("unknown availability state '{}'", other)),
        }
    }
}

impl fmt::Display for AvailabilityState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.as_str().to_uppercase())
    }
}

/// A successfully resolved availability reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Observation {
    pub state: AvailabilityState,
    pub observed_at: DateTime<Utc>,
}

impl Observation {
    pub fn now(state: AvailabilityState) -> Self {
        Self {
            state,
            observed_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum FetchErrorKind {
    /// Connection-level failure or timeout. Retryable.
    Transport,
    /// Upstream throttled us. Retryable with backoff and demotes the route.
    RateLimited,
    /// Response did not match the known schema. Not retryable for that response.
    Parse,
    /// Vendor reported a failure of its own. Retryable.
    UpstreamError,
}

impl fmt::Display for FetchErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            FetchErrorKind::Transport => "transport",
            FetchErrorKind::RateLimited => "rate limited",
            FetchErrorKind::Parse => "parse",
            FetchErrorKind::UpstreamError => "upstream error",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{kind}: {message}")]
pub struct FetchError {
    pub kind: FetchErrorKind,
    pub message: String,
    pub retry_after: Option<Duration>,
}

impl FetchError {
    pub fn new(kind: FetchErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            retry_after: None,
        }
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self::new(FetchErrorKind::Transport, message)
    }

    pub fn rate_limited(retry_after: Option<Duration>) -> Self {
        Self {
            kind: FetchErrorKind::RateLimited,
            message: "upstream throttled the request".to_string(),
            retry_after,
        }
    }

    pub fn parse(message: impl Into<String>) -> Self {
        Self::new(FetchErrorKind::Parse, message)
    }

    pub fn upstream(message: impl Into<String>) -> Self {
        Self::new(FetchErrorKind::UpstreamError, message)
    }
}

pub type FetchResult = Result<Observation, FetchError>;

/// Outcome of one fetch attempt as reported to the proxy pool and metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FetchOutcome {
    Success,
    Failed(FetchErrorKind),
}

impl FetchOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            FetchOutcome::Success => "success",
            FetchOutcome::Failed(FetchErrorKind::Transport) => "transport",
            FetchOutcome::Failed(FetchErrorKind::RateLimited) => "rate_limited",
            FetchOutcome::Failed(FetchErrorKind::Parse) => "parse",
            FetchOutcome::Failed(FetchErrorKind::UpstreamError) => "upstream_error",
        }
    }
}

impl From<&FetchResult> for FetchOutcome {
    fn from(result: &FetchResult) -> Self {
        match result {
            Ok(_) => FetchOutcome::Success,
            Err(error) => FetchOutcome::Failed(error.kind),
        }
    }
}

/// A genuine availability transition for one target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateChangeEvent {
    pub id: Uuid,
    pub target: TargetId,
    pub display_name: String,
    pub previous: AvailabilityState,
    pub current: AvailabilityState,
    pub observed_at: DateTime<Utc>,
}

impl StateChangeEvent {
    pub fn new(target: &Target, previous: AvailabilityState, observation: &Observation) -> Self {
        Self {
            id: Uuid::new_v4(),
            target: target.id(),
            display_name: target.display_name.clone(),
            previous,
            current: observation.state,
            observed_at: observation.observed_at,
        }
    }

    /// True for the UNKNOWN -> first state transition after monitoring starts.
    pub fn is_first_observation(&self) -> bool {
        self.previous == AvailabilityState::Unknown
    }
}
