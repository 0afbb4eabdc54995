//! In-process bus shared by every plugin.
//!
//! Topics are created on first use. A request on `<topic>` is answered on
//! `<topic>:result` with the same `request_id`, mirroring the backend RPC
//! convention.

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::RwLock;
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::trace;

use crate::error::{SyncError, SyncResult};
use crate::rpc::{self, REQUEST_ID_FIELD};

pub const RESULT_TOPIC_SUFFIX: &str = ":result";

#[derive(Debug, Clone, PartialEq)]
pub struct BusMessage {
    pub topic: String,
    /// Name of the publishing plugin.
    pub origin: String,
    pub payload: Value,
}

#[derive(Debug)]
pub struct Bus {
    topics: RwLock<HashMap<String, broadcast::Sender<BusMessage>>>,
    capacity: usize,
}

impl Bus {
    pub fn new(capacity: usize) -> Self {
        Self {
            topics: RwLock::new(HashMap::new()),
            capacity: capacity.max(1),
        }
    }

    fn sender_for(&self, topic: &str) -> broadcast::Sender<BusMessage> {
        if let Some(sender) = self.topics.read().get(topic) {
            return sender.clone();
        }
        self.topics
            .write()
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .clone()
    }

    pub fn subscribe(&self, topic: &str) -> broadcast::Receiver<BusMessage> {
        self.sender_for(topic).subscribe()
    }

    /// Returns how many subscribers received the message.
    pub fn publish(&self, topic: &str, origin: &str, payload: Value) -> usize {
        let delivered = self
            .sender_for(topic)
            .send(BusMessage {
                topic: topic.to_string(),
                origin: origin.to_string(),
                payload,
            })
            .unwrap_or(0);
        trace!(topic, origin, delivered, "bus publish");
        delivered
    }

    /// Publish a request and wait for the first `<topic>:result` message
    /// echoing its `request_id`.
    pub async fn request(
        &self,
        topic: &str,
        origin: &str,
        payload: Value,
        timeout: Duration,
    ) -> SyncResult<Value> {
        let request_id = rpc::new_request_id();
        let result_topic = result_topic(topic);
        let mut responses = self.subscribe(&result_topic);
        self.publish(topic, origin, rpc::with_request_id(payload, &request_id));

        let wait = async {
            loop {
                match responses.recv().await {
                    Ok(message)
                        if rpc::request_id_of(&message.payload) == Some(request_id.as_str()) =>
                    {
                        return Ok(rpc::response_data(message.payload));
                    }
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => {
                        return Err(SyncError::ChannelClosed(result_topic.clone()));
                    }
                }
            }
        };

        let outcome = tokio::time::timeout(timeout, wait).await;
        match outcome {
            Ok(result) => result,
            Err(_) => Err(SyncError::RequestTimeout {
                topic: topic.to_string(),
                request_id,
                timeout_ms: timeout.as_millis() as u64,
            }),
        }
    }

    /// Answer `request` on its result topic with `data`.
    pub fn respond(&self, request: &BusMessage, origin: &str, data: Value) -> usize {
        let Some(request_id) = request.payload.get(REQUEST_ID_FIELD).cloned() else {
            return 0;
        };
        let mut response = serde_json::Map::new();
        response.insert(REQUEST_ID_FIELD.to_string(), request_id);
        response.insert(rpc::DATA_FIELD.to_string(), data);
        self.publish(
            &result_topic(&request.topic),
            origin,
            Value::Object(response),
        )
    }
}

pub fn result_topic(topic: &str) -> String {
    format!("{topic}{RESULT_TOPIC_SUFFIX}")
}
