use std::array::TryFromSliceError;
use std::time::Duration;

use thiserror::Error;

/// Errors are `Clone` so that a single query outcome can be handed to every
/// caller that was deduplicated onto it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("message is empty")]
    Empty,

    #[error("decoding failed: {0}")]
    DecodeFailed(String),

    #[error("hex decoding failed")]
    HexDecodeFailed,

    #[error("invalid bech32")]
    InvalidBech32,

    #[error("invalid byte size")]
    InvalidByteSize,

    #[error("invalid relay url: {0}")]
    InvalidRelayUrl(String),

    #[error("json error: {0}")]
    Json(String),

    #[error("connection to {url} failed: {reason}")]
    Connection { url: String, reason: String },

    #[error("query to {url} timed out after {after:?}")]
    Timeout { url: String, after: Duration },

    #[error("subscription closed by {url}: {reason}")]
    Closed { url: String, reason: String },

    #[error("query was abandoned before it produced a result")]
    Abandoned,

    #[error("relay pool is shut down")]
    PoolShutdown,

    #[error("{0}")]
    Generic(String),
}

impl Error {
    pub fn connection(url: impl ToString, reason: impl Into<String>) -> Self {
        Error::Connection {
            url: url.to_string(),
            reason: reason.into(),
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout { .. })
    }
}

impl From<String> for Error {
    fn from(s: String) -> Self {
        Error::Generic(s)
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Json(e.to_string())
    }
}

impl From<TryFromSliceError> for Error {
    fn from(_e: TryFromSliceError) -> Self {
        Error::InvalidByteSize
    }
}

impl From<hex::FromHexError> for Error {
    fn from(_e: hex::FromHexError) -> Self {
        Error::HexDecodeFailed
    }
}

impl From<url::ParseError> for Error {
    fn from(e: url::ParseError) -> Self {
        Error::InvalidRelayUrl(e.to_string())
    }
}
