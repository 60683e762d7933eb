use crate::{Error, Filter, RelayReqId};
use serde_json::json;

/// Messages sent by clients, received by relays
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientMessage {
    Req {
        sub_id: RelayReqId,
        filters: Vec<Filter>,
    },
    Close {
        sub_id: RelayReqId,
    },
    Raw(String),
}

impl ClientMessage {
    pub fn raw(raw: String) -> Self {
        ClientMessage::Raw(raw)
    }

    pub fn req(sub_id: RelayReqId, filters: Vec<Filter>) -> Self {
        ClientMessage::Req { sub_id, filters }
    }

    pub fn close(sub_id: RelayReqId) -> Self {
        ClientMessage::Close { sub_id }
    }

    pub fn sub_id(&self) -> Option<&RelayReqId> {
        match self {
            ClientMessage::Req { sub_id, .. } | ClientMessage::Close { sub_id } => Some(sub_id),
            ClientMessage::Raw(_) => None,
        }
    }

    pub fn to_json(&self) -> Result<String, Error> {
        Ok(match self {
            Self::Raw(raw) => raw.clone(),
            Self::Req { sub_id, filters } => {
                if filters.is_empty() {
                    format!("[\"REQ\",\"{}\",{{}}]", sub_id)
                } else {
                    let filters_json_str: Result<Vec<String>, Error> =
                        filters.iter().map(Filter::json).collect();
                    format!("[\"REQ\",\"{}\",{}]", sub_id, filters_json_str?.join(","))
                }
            }
            Self::Close { sub_id } => json!(["CLOSE", sub_id.0]).to_string(),
        })
    }
}
