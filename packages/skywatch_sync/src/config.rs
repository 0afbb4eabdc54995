use std::time::Duration;

/// Default interval between live points kept in a trajectory.
pub const DEFAULT_APPEND_DEDUP_THRESHOLD: Duration = Duration::from_millis(500);

/// Runtime configuration for the synchronization core.
#[derive(Clone, Debug)]
pub struct SyncConfig {
    /// Base URL of the token endpoint (`{base_url}/token`).
    pub base_url: String,
    /// WebSocket endpoint of the broadcast backend.
    pub socket_url: String,
    /// How long a channel join may wait for its acknowledgement.
    pub join_timeout: Duration,
    /// Timeout applied by `Realtime::request_default`.
    pub request_timeout: Duration,
    /// Topic the RPC-backed history source sends requests on.
    pub history_topic: String,
    pub history_timeout: Duration,
    pub heartbeat_interval: Duration,
    /// Minimum time delta before a live point is appended to a trajectory.
    pub append_dedup_threshold: Duration,
    /// Per-topic capacity of the cross-plugin bus.
    pub bus_capacity: usize,
    /// Capacity of the transport's inbound event broadcast.
    pub event_capacity: usize,
    /// First delay before a supervised subscription retries a failed join.
    pub retry_backoff: Duration,
    /// Upper bound for the doubling retry delay.
    pub retry_backoff_max: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:4000/api".to_string(),
            socket_url: "ws://127.0.0.1:4000/socket/websocket".to_string(),
            join_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(10),
            history_topic: "history:trajectory".to_string(),
            history_timeout: Duration::from_secs(15),
            heartbeat_interval: Duration::from_secs(30),
            append_dedup_threshold: DEFAULT_APPEND_DEDUP_THRESHOLD,
            bus_capacity: 256,
            event_capacity: 1024,
            retry_backoff: Duration::from_millis(500),
            retry_backoff_max: Duration::from_secs(30),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = SyncConfig::default();
        assert_eq!(config.append_dedup_threshold, Duration::from_millis(500));
        assert_eq!(config.join_timeout, Duration::from_secs(10));
        assert_eq!(config.history_topic, "history:trajectory");
        assert!(config.bus_capacity > 0);
        assert!(config.retry_backoff < config.retry_backoff_max);
    }
}
