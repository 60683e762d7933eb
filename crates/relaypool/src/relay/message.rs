use crate::{Error, Event, Result};
use serde_json::Value;

/// Messages sent by relays, received by clients
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayMessage {
    Event { sub_id: String, event: Box<Event> },
    Eose(String),
    Closed { sub_id: String, message: String },
    Notice(String),
    Ok(CommandResult),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandResult {
    pub event_id: String,
    pub status: bool,
    pub message: String,
}

impl RelayMessage {
    pub fn eose(sub_id: impl Into<String>) -> Self {
        RelayMessage::Eose(sub_id.into())
    }

    pub fn notice(msg: impl Into<String>) -> Self {
        RelayMessage::Notice(msg.into())
    }

    pub fn closed(sub_id: impl Into<String>, message: impl Into<String>) -> Self {
        RelayMessage::Closed {
            sub_id: sub_id.into(),
            message: message.into(),
        }
    }

    pub fn event(sub_id: impl Into<String>, event: Event) -> Self {
        RelayMessage::Event {
            sub_id: sub_id.into(),
            event: Box::new(event),
        }
    }

    /// The subscription this message belongs to, if any.
    pub fn sub_id(&self) -> Option<&str> {
        match self {
            RelayMessage::Event { sub_id, .. }
            | RelayMessage::Eose(sub_id)
            | RelayMessage::Closed { sub_id, .. } => Some(sub_id),
            RelayMessage::Notice(_) | RelayMessage::Ok(_) => None,
        }
    }

    /// Serialize the message the way a relay would put it on the wire.
    pub fn to_json(&self) -> Result<String> {
        let value = match self {
            RelayMessage::Event { sub_id, event } => {
                serde_json::json!(["EVENT", sub_id, serde_json::to_value(event.as_ref())?])
            }
            RelayMessage::Eose(sub_id) => serde_json::json!(["EOSE", sub_id]),
            RelayMessage::Closed { sub_id, message } => {
                serde_json::json!(["CLOSED", sub_id, message])
            }
            RelayMessage::Notice(msg) => serde_json::json!(["NOTICE", msg]),
            RelayMessage::Ok(res) => {
                serde_json::json!(["OK", res.event_id, res.status, res.message])
            }
        };
        Ok(value.to_string())
    }

    pub fn from_json(msg: &str) -> Result<RelayMessage> {
        if msg.is_empty() {
            return Err(Error::Empty);
        }

        let mut parts: Vec<Value> = serde_json::from_str(msg)
            .map_err(|e| Error::DecodeFailed(format!("not a json array: {e}")))?;

        if parts.is_empty() {
            return Err(Error::DecodeFailed("empty message array".into()));
        }

        let kind = match parts.remove(0) {
            Value::String(s) => s,
            _ => return Err(Error::DecodeFailed("message type is not a string".into())),
        };

        match kind.as_str() {
            // ["EVENT", <subscription id>, <event JSON>]
            "EVENT" => {
                let [sub_id, event] = take_n::<2>(parts, "EVENT")?;
                let sub_id = as_string(sub_id, "EVENT subscription id")?;
                let event = Event::from_value(event)
                    .map_err(|e| Error::DecodeFailed(format!("invalid EVENT payload: {e}")))?;
                Ok(Self::event(sub_id, event))
            }

            // ["EOSE", <subscription id>]
            "EOSE" => {
                let [sub_id] = take_n::<1>(parts, "EOSE")?;
                Ok(Self::eose(as_string(sub_id, "EOSE subscription id")?))
            }

            // ["CLOSED", <subscription id>, <message>]
            "CLOSED" => {
                let mut parts = parts.into_iter();
                let sub_id = parts
                    .next()
                    .ok_or_else(|| Error::DecodeFailed("CLOSED without subscription id".into()))?;
                let message = match parts.next() {
                    Some(m) => as_string(m, "CLOSED message")?,
                    None => String::new(),
                };
                Ok(Self::closed(as_string(sub_id, "CLOSED subscription id")?, message))
            }

            // ["NOTICE", <message>]
            "NOTICE" => {
                let [msg] = take_n::<1>(parts, "NOTICE")?;
                Ok(Self::notice(as_string(msg, "NOTICE message")?))
            }

            // ["OK", <event_id>, <true|false>, <message>]
            "OK" => {
                let [event_id, status, message] = take_n::<3>(parts, "OK")?;
                let Value::Bool(status) = status else {
                    return Err(Error::DecodeFailed("bad boolean value".into()));
                };
                Ok(RelayMessage::Ok(CommandResult {
                    event_id: as_string(event_id, "OK event id")?,
                    status,
                    message: as_string(message, "OK message")?,
                }))
            }

            other => Err(Error::DecodeFailed(format!(
                "unrecognized message type: '{other}'"
            ))),
        }
    }
}

fn take_n<const N: usize>(parts: Vec<Value>, what: &str) -> Result<[Value; N]> {
    let len = parts.len();
    parts
        .try_into()
        .map_err(|_| Error::DecodeFailed(format!("{what} expects {N} fields, got {len}")))
}

fn as_string(value: Value, what: &str) -> Result<String> {
    match value {
        Value::String(s) => Ok(s),
        _ => Err(Error::DecodeFailed(format!("{what} is not a string"))),
    }
}
