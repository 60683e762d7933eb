use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Relay(#[from] relaypool::Error),

    #[error("no such subscription: {0}")]
    UnknownSubscription(String),

    #[error("subscription {0} was cancelled")]
    Cancelled(String),

    #[error("no endpoints to query")]
    NoEndpoints,

    #[error("invalid config: {0}")]
    Config(String),

    #[error("cache error: {0}")]
    Cache(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}
