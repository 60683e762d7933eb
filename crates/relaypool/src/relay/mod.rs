use std::time::Duration;

use serde::Serialize;

use crate::relay::health::Metrics;
use crate::RelayUrl;

mod connection;
pub mod dedup;
pub mod health;
pub mod identity;
pub mod message;
#[cfg(any(test, feature = "mock"))]
pub mod mock;
pub mod pool;
pub mod queue;
pub mod transport;
pub mod websocket;

pub use connection::{RelaySubscription, ReqEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RelayStatus {
    Connecting,
    Connected,
    Failed,
}

/// Offsets from the start of a connection attempt at which we check whether
/// the relay answered. The attempt fails at the last one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LivenessSchedule {
    pub checks: Vec<Duration>,
}

impl Default for LivenessSchedule {
    fn default() -> Self {
        Self {
            checks: vec![
                Duration::from_secs(1),
                Duration::from_secs(3),
                Duration::from_secs(5),
            ],
        }
    }
}

impl LivenessSchedule {
    pub fn new(checks: impl IntoIterator<Item = Duration>) -> Self {
        let mut checks: Vec<Duration> = checks.into_iter().collect();
        checks.sort();
        if checks.is_empty() {
            return Self::default();
        }
        Self { checks }
    }

    pub fn give_up_after(&self) -> Duration {
        self.checks.last().copied().unwrap_or_default()
    }
}

/// Snapshot of one endpoint as the pool sees it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Endpoint {
    pub url: RelayUrl,
    pub state: RelayStatus,
    pub metrics: Option<Metrics>,
}

/// Lifecycle notifications broadcast by the pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PoolEvent {
    Connecting(RelayUrl),
    Connected { url: RelayUrl, latency: Duration },
    Failed { url: RelayUrl, reason: String },
    Disconnected { url: RelayUrl, reason: String },
    Notice { url: RelayUrl, message: String },
}

impl PoolEvent {
    pub fn url(&self) -> &RelayUrl {
        match self {
            PoolEvent::Connecting(url)
            | PoolEvent::Connected { url, .. }
            | PoolEvent::Failed { url, .. }
            | PoolEvent::Disconnected { url, .. }
            | PoolEvent::Notice { url, .. } => url,
        }
    }
}
