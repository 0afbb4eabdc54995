//! Phoenix v2 JSON frame format.
//!
//! Every frame is a five element array:
//!
//! ```text
//! [join_ref, ref, topic, event, payload]
//! ```
//!
//! `join_ref` ties a frame to the join it belongs to, `ref` correlates a push
//! with its `phx_reply`. Both are null on server broadcasts.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::SyncResult;

pub const EVENT_JOIN: &str = "phx_join";
pub const EVENT_LEAVE: &str = "phx_leave";
pub const EVENT_REPLY: &str = "phx_reply";
pub const EVENT_ERROR: &str = "phx_error";
pub const EVENT_CLOSE: &str = "phx_close";
pub const EVENT_HEARTBEAT: &str = "heartbeat";
pub const HEARTBEAT_TOPIC: &str = "phoenix";
pub const PROTOCOL_VERSION: &str = "2.0.0";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "RawFrame", into = "RawFrame")]
pub struct Frame {
    pub join_ref: Option<String>,
    pub reference: Option<String>,
    pub topic: String,
    pub event: String,
    pub payload: Value,
}

#[derive(Serialize, Deserialize)]
struct RawFrame(Option<String>, Option<String>, String, String, Value);

impl From<RawFrame> for Frame {
    fn from(raw: RawFrame) -> Self {
        let RawFrame(join_ref, reference, topic, event, payload) = raw;
        Self {
            join_ref,
            reference,
            topic,
            event,
            payload,
        }
    }
}

impl From<Frame> for RawFrame {
    fn from(frame: Frame) -> Self {
        RawFrame(
            frame.join_ref,
            frame.reference,
            frame.topic,
            frame.event,
            frame.payload,
        )
    }
}

impl Frame {
    pub fn encode(&self) -> SyncResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(text: &str) -> SyncResult<Self> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn is_reply(&self) -> bool {
        self.event == EVENT_REPLY
    }
}

/// Payload of a `phx_reply` frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reply {
    pub status: String,
    #[serde(default)]
    pub response: Value,
}

impl Reply {
    pub fn is_ok(&self) -> bool {
        self.status == "ok"
    }

    /// Human-readable rejection reason carried by an error reply.
    pub fn reason(&self) -> String {
        match &self.response {
            Value::Object(map) => match map.get("reason") {
                Some(Value::String(reason)) => reason.clone(),
                Some(other) => other.to_string(),
                None => self.response.to_string(),
            },
            Value::String(reason) => reason.clone(),
            Value::Null => self.status.clone(),
            other => other.to_string(),
        }
    }
}
