use std::{
    borrow::Borrow,
    fmt::{self, Display},
};

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use url::Url;
use uuid::Uuid;

use crate::Error;

/// A canonicalized relay websocket url. Two spellings of the same relay
/// (eg. with and without a trailing slash) compare equal.
#[derive(Eq, PartialEq, Hash, Clone, Debug, PartialOrd, Ord)]
pub struct RelayUrl(String);

impl RelayUrl {
    pub fn new(url: &str) -> Result<Self, Error> {
        let parsed = Url::parse(url.trim())?;

        match parsed.scheme() {
            "ws" | "wss" => {}
            other => {
                return Err(Error::InvalidRelayUrl(format!(
                    "unsupported scheme '{other}' in {url}"
                )))
            }
        }

        if parsed.host_str().is_none() {
            return Err(Error::InvalidRelayUrl(format!("missing host in {url}")));
        }

        Ok(Self(parsed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for RelayUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Borrow<str> for RelayUrl {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl TryFrom<&str> for RelayUrl {
    type Error = Error;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        RelayUrl::new(value)
    }
}

impl Serialize for RelayUrl {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for RelayUrl {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        RelayUrl::new(&s).map_err(serde::de::Error::custom)
    }
}

impl From<RelayUrl> for String {
    fn from(value: RelayUrl) -> Self {
        value.0
    }
}

/// The subscription id we put on the wire. Ids are random so relays can't
/// correlate our subscriptions across connections.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RelayReqId(pub String);

impl Default for RelayReqId {
    fn default() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl From<&str> for RelayReqId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

impl Display for RelayReqId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl Borrow<str> for RelayReqId {
    fn borrow(&self) -> &str {
        &self.0
    }
}
