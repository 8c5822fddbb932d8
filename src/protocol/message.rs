//! Logical messages shared by both wire variants.
//!
//! A [`Message`] is what the session routes: a [`Request`] travelling
//! towards a responder, a [`Response`] travelling back, or a keepalive
//! [`Message::Ping`].  Both framers convert to and from the flat
//! [`WireMessage`] shape, which is also the exact JSON object the v1
//! variant puts on a line.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ErrorType, FrameError, LinkError};

pub type RequestId = u32;
pub type SubscriptionId = u32;

/// Request id carrying subscription value updates.
pub const UPDATE_RID: RequestId = 0;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Method {
    List,
    Invoke,
    Set,
    Subscribe,
    Unsubscribe,
    Close,
    Remove,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::List => "list",
            Method::Invoke => "invoke",
            Method::Set => "set",
            Method::Subscribe => "subscribe",
            Method::Unsubscribe => "unsubscribe",
            Method::Close => "close",
            Method::Remove => "remove",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Method {
    type Err = LinkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "list" => Method::List,
            "invoke" => Method::Invoke,
            "set" => Method::Set,
            "subscribe" => Method::Subscribe,
            "unsubscribe" => Method::Unsubscribe,
            "close" => Method::Close,
            "remove" => Method::Remove,
            other => {
                return Err(LinkError::new(
                    ErrorType::InvalidMethod,
                    format!("unknown method `{other}`"),
                ))
            }
        })
    }
}

/// State of a response stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamState {
    Open,
    Closed,
}

/// Permission level attached to a `set`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Permission {
    None,
    List,
    Read,
    Write,
    Config,
    Never,
}

impl Permission {
    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            0 => Permission::None,
            1 => Permission::List,
            2 => Permission::Read,
            3 => Permission::Write,
            4 => Permission::Config,
            5 => Permission::Never,
            _ => return None,
        })
    }
}

/// One entry of a batched `subscribe` request.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SubscribePath {
    pub path: String,
    pub sid: SubscriptionId,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub qos: u8,
}

fn is_zero(qos: &u8) -> bool {
    *qos == 0
}

/// Quality flag carried with a value.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueStatus {
    #[default]
    Ok,
    Stale,
    Disconnected,
    Unknown,
}

/// A value together with its status and timestamp.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ValueUpdate {
    pub value: Value,
    #[serde(default)]
    pub status: ValueStatus,
    pub ts: DateTime<Utc>,
}

impl ValueUpdate {
    pub fn now(value: Value) -> Self {
        Self {
            value,
            status: ValueStatus::Ok,
            ts: Utc::now(),
        }
    }
}

/// One subscription update as carried in the `updates` of a rid-0
/// response.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionUpdate {
    pub sid: SubscriptionId,
    #[serde(flatten)]
    pub update: ValueUpdate,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Request {
    pub rid: RequestId,
    pub method: Method,
    pub path: Option<String>,
    pub params: Option<Value>,
    pub value: Option<Value>,
    pub permit: Option<Permission>,
    pub paths: Vec<SubscribePath>,
    pub sids: Vec<SubscriptionId>,
}

impl Request {
    pub fn new(rid: RequestId, method: Method) -> Self {
        Self {
            rid,
            method,
            path: None,
            params: None,
            value: None,
            permit: None,
            paths: Vec::new(),
            sids: Vec::new(),
        }
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn close(rid: RequestId) -> Self {
        Self::new(rid, Method::Close)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Response {
    pub rid: RequestId,
    pub stream: Option<StreamState>,
    pub updates: Vec<Value>,
    pub error: Option<LinkError>,
}

impl Response {
    pub fn new(rid: RequestId, stream: StreamState) -> Self {
        Self {
            rid,
            stream: Some(stream),
            updates: Vec::new(),
            error: None,
        }
    }

    pub fn closed(rid: RequestId) -> Self {
        Self::new(rid, StreamState::Closed)
    }

    pub fn error(rid: RequestId, error: LinkError) -> Self {
        Self {
            rid,
            stream: Some(StreamState::Closed),
            updates: Vec::new(),
            error: Some(error),
        }
    }

    pub fn with_updates(mut self, updates: Vec<Value>) -> Self {
        self.updates = updates;
        self
    }

    /// Whether this response ends its stream, either explicitly or by
    /// carrying an error.
    pub fn is_closing(&self) -> bool {
        self.error.is_some() || self.stream == Some(StreamState::Closed)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Message {
    Request(Request),
    Response(Response),
    Ping,
}

/// A decoded inbound item.  `Rejected` carries a request the framer
/// could identify but not accept; the session answers it with an
/// error instead of dropping it.
#[derive(Clone, Debug, PartialEq)]
pub enum Inbound {
    Message(Message),
    Rejected { rid: RequestId, error: LinkError },
}

/// Flat wire shape of a message.  Every field is optional so a frame
/// can be parsed before it is validated.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct WireMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rid: Option<RequestId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub permit: Option<Permission>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream: Option<StreamState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updates: Option<Vec<Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub paths: Option<Vec<SubscribePath>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sids: Option<Vec<SubscriptionId>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<LinkError>,
}

impl WireMessage {
    pub fn is_empty(&self) -> bool {
        *self == WireMessage::default()
    }

    /// Validate the wire shape into a typed inbound item.
    pub fn into_inbound(self) -> Result<Inbound, FrameError> {
        if self.is_empty() {
            return Ok(Inbound::Message(Message::Ping));
        }
        let rid = self.rid.ok_or(FrameError::MissingField("rid"))?;
        let Some(method) = self.method else {
            return Ok(Inbound::Message(Message::Response(Response {
                rid,
                stream: self.stream,
                updates: self.updates.unwrap_or_default(),
                error: self.error,
            })));
        };
        let method = match method.parse::<Method>() {
            Ok(method) => method,
            Err(error) => return Ok(Inbound::Rejected { rid, error }),
        };
        Ok(Inbound::Message(Message::Request(Request {
            rid,
            method,
            path: self.path,
            params: self.params,
            value: self.value,
            permit: self.permit,
            paths: self.paths.unwrap_or_default(),
            sids: self.sids.unwrap_or_default(),
        })))
    }
}

impl From<&Message> for WireMessage {
    fn from(msg: &Message) -> Self {
        match msg {
            Message::Ping => WireMessage::default(),
            Message::Request(req) => WireMessage {
                rid: Some(req.rid),
                method: Some(req.method.as_str().to_string()),
                path: req.path.clone(),
                params: req.params.clone(),
                value: req.value.clone(),
                permit: req.permit,
                paths: (!req.paths.is_empty()).then(|| req.paths.clone()),
                sids: (!req.sids.is_empty()).then(|| req.sids.clone()),
                ..WireMessage::default()
            },
            Message::Response(resp) => WireMessage {
                rid: Some(resp.rid),
                stream: resp.stream,
                updates: (!resp.updates.is_empty()).then(|| resp.updates.clone()),
                error: resp.error.clone(),
                ..WireMessage::default()
            },
        }
    }
}

/// Check that `path` is an absolute node path: a leading `/`, no empty
/// segments and none of the reserved characters.
pub fn validate_path(path: &str) -> Result<(), LinkError> {
    const RESERVED: &[char] = &['\\', '?', '*', '|', '<', '>', '"', ':', '%'];
    if path == "/" {
        return Ok(());
    }
    let Some(rest) = path.strip_prefix('/') else {
        return Err(LinkError::invalid_path(path));
    };
    let ok = rest
        .split('/')
        .all(|seg| !seg.is_empty() && seg != "." && seg != ".." && !seg.contains(RESERVED));
    if ok {
        Ok(())
    } else {
        Err(LinkError::invalid_path(path))
    }
}
