//! Routing tag for requests that share one manager channel: `"RouterId":"<managerId>?<clientId>"`.
//!
//! Outbound: the tag is added as the leading field of the request envelope.
//! Inbound: the tag is removed from the response and the client id returned, so the
//! response can go back to the session that sent the request.

use serde_json::{Map, Value};

pub const ROUTER_ID_KEY: &str = "RouterId";

/// (manager, client) pair carried by an envelope in transit through a manager channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RoutingTag {
    pub manager_id: usize,
    pub client_id: u64,
}

impl std::fmt::Display for RoutingTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}?{}", self.manager_id, self.client_id)
    }
}

impl std::str::FromStr for RoutingTag {
    type Err = RoutingError;

    /// Manager id up to the first `?`, client id after it. The client id is parsed on its own
    /// so a tag with a broken manager half still names the session it belongs to.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let Some((mgr, client)) = s.split_once('?') else {
            return Err(RoutingError::MalformedTag {
                raw: s.to_string(),
                client_id: None,
            });
        };
        let client_id = client.trim().parse::<u64>().ok();
        match (mgr.trim().parse::<usize>(), client_id) {
            (Ok(manager_id), Some(client_id)) => Ok(Self {
                manager_id,
                client_id,
            }),
            _ => Err(RoutingError::MalformedTag {
                raw: s.to_string(),
                client_id,
            }),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RoutingError {
    #[error("envelope is not a JSON object: {0}")]
    NotAnObject(String),
    #[error("envelope has no RouterId")]
    MissingTag,
    #[error("malformed RouterId value: {raw}")]
    MalformedTag { raw: String, client_id: Option<u64> },
}

impl RoutingError {
    /// Session a malformed tag still identifies, if any.
    pub fn client_id(&self) -> Option<u64> {
        match self {
            RoutingError::MalformedTag { client_id, .. } => *client_id,
            _ => None,
        }
    }
}

fn parse_object(envelope: &str) -> Result<Map<String, Value>, RoutingError> {
    match serde_json::from_str::<Value>(envelope) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(_) => Err(RoutingError::NotAnObject(envelope.to_string())),
        Err(e) => Err(RoutingError::NotAnObject(e.to_string())),
    }
}

/// Add the routing tag as the first field of a request envelope.
pub fn tag_request(envelope: &str, tag: RoutingTag) -> Result<String, RoutingError> {
    let fields = parse_object(envelope)?;
    let mut tagged = Map::with_capacity(fields.len() + 1);
    tagged.insert(ROUTER_ID_KEY.to_string(), Value::String(tag.to_string()));
    for (k, v) in fields {
        if k != ROUTER_ID_KEY {
            tagged.insert(k, v);
        }
    }
    Ok(Value::Object(tagged).to_string())
}

/// Strip the routing tag from a response envelope. Returns the cleaned envelope and the tag.
pub fn untag_response(envelope: &str) -> Result<(String, RoutingTag), RoutingError> {
    let mut fields = parse_object(envelope)?;
    let tag = match fields.shift_remove(ROUTER_ID_KEY) {
        Some(Value::String(s)) => s.parse::<RoutingTag>()?,
        Some(other) => {
            return Err(RoutingError::MalformedTag {
                raw: other.to_string(),
                client_id: None,
            })
        }
        None => return Err(RoutingError::MissingTag),
    };
    Ok((Value::Object(fields).to_string(), tag))
}
