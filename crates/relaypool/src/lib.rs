mod client;
mod error;
mod event;
mod filter;
mod pubkey;
mod relay;

pub use client::ClientMessage;
pub use error::Error;
pub use event::{Event, EventId};
pub use ewebsock;
pub use filter::Filter;
pub use pubkey::Pubkey;
pub use relay::dedup::QueryDeduplicator;
pub use relay::health::{HealthConfig, HealthMonitor, HealthSample, HealthStatus, Metrics};
pub use relay::identity::{RelayReqId, RelayUrl};
pub use relay::message::{CommandResult, RelayMessage};
pub use relay::pool::{PoolConfig, PoolStats, RelayLease, RelayPool};
pub use relay::queue::{Priority, QueryQueue, QueueConfig, QueueStats, QueuedQuery};
pub use relay::transport::{Channel, ChannelPeer, Transport, WireCommand, WireEvent};
pub use relay::websocket::WebsocketTransport;
pub use relay::{
    Endpoint, LivenessSchedule, PoolEvent, RelayStatus, RelaySubscription, ReqEvent,
};

#[cfg(any(test, feature = "mock"))]
pub use relay::mock;

pub type Result<T> = std::result::Result<T, error::Error>;
