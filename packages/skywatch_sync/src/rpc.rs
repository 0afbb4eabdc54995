//! Request/response correlation on top of one-way pub/sub.
//!
//! A request is pushed as `<event>` with a fresh `request_id`; the backend
//! answers on `<event>_result` echoing that id. Responses carrying any other
//! id are somebody else's and are ignored.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::{Map, Value};
use tokio::sync::oneshot;
use tracing::{debug, trace};
use uuid::Uuid;

use crate::channel::Channel;
use crate::error::{SyncError, SyncResult};
use crate::topic::Topic;

pub const REQUEST_ID_FIELD: &str = "request_id";
pub const DATA_FIELD: &str = "data";

pub fn new_request_id() -> String {
    Uuid::new_v4().to_string()
}

/// Merge `request_id` into `payload`. Non-object payloads are wrapped as
/// `{"data": payload}` first.
pub fn with_request_id(payload: Value, request_id: &str) -> Value {
    let mut map = match payload {
        Value::Object(map) => map,
        Value::Null => Map::new(),
        other => {
            let mut map = Map::new();
            map.insert(DATA_FIELD.to_string(), other);
            map
        }
    };
    map.insert(
        REQUEST_ID_FIELD.to_string(),
        Value::String(request_id.to_string()),
    );
    Value::Object(map)
}

pub fn request_id_of(payload: &Value) -> Option<&str> {
    payload.get(REQUEST_ID_FIELD).and_then(Value::as_str)
}

/// The `data` field of a response, or the whole response without its
/// `request_id` when there is none.
pub fn response_data(payload: Value) -> Value {
    match payload {
        Value::Object(mut map) => match map.remove(DATA_FIELD) {
            Some(data) => data,
            None => {
                map.remove(REQUEST_ID_FIELD);
                Value::Object(map)
            }
        },
        other => other,
    }
}

/// Send a request on a joined channel and wait for the matching response.
pub async fn request(
    channel: &Arc<Channel>,
    topic: &Topic,
    payload: Value,
    timeout: Duration,
) -> SyncResult<Value> {
    let request_id = new_request_id();
    let (tx, rx) = oneshot::channel::<Value>();
    let slot = Mutex::new(Some(tx));

    let expected = request_id.clone();
    let subscription = channel.on(&topic.result_event(), move |response| {
        if request_id_of(response) != Some(expected.as_str()) {
            trace!(expected = %expected, "ignoring response for another request");
            return;
        }
        if let Some(tx) = slot.lock().take() {
            let _ = tx.send(response.clone());
        }
    });

    channel.push(topic.event(), with_request_id(payload, &request_id))?;
    debug!(topic = %topic, request_id = %request_id, "request sent");

    let outcome = tokio::time::timeout(timeout, rx).await;
    subscription.unsubscribe();

    match outcome {
        Ok(Ok(response)) => Ok(response_data(response)),
        Ok(Err(_)) => Err(SyncError::ChannelClosed(channel.topic().to_string())),
        Err(_) => {
            debug!(topic = %topic, request_id = %request_id, "request timed out");
            Err(SyncError::RequestTimeout {
                topic: topic.to_string(),
                request_id,
                timeout_ms: timeout.as_millis() as u64,
            })
        }
    }
}
