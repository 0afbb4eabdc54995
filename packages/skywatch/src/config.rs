use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use skywatch_sync::SyncConfig;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

// =============================================================================
// Unified config (figment-deserialized from defaults / config.toml / env vars)
// =============================================================================
//
//   config.toml:     [backend]
//                    base_url = "https://feeds.example.net/api"
//
//   env var:         SKYWATCH_BACKEND__BASE_URL=...   (double underscore = nesting)

/// Top-level tunable configuration, deserialized by figment.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub backend: BackendFileConfig,
    #[serde(default)]
    pub sync: SyncFileConfig,
    #[serde(default)]
    pub plugins: PluginsFileConfig,
}

/// Where the broadcast backend lives (`[backend]`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BackendFileConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_socket_url")]
    pub socket_url: String,
}

impl Default for BackendFileConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            socket_url: default_socket_url(),
        }
    }
}

/// Sync core tunables (`[sync]`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SyncFileConfig {
    #[serde(default = "default_join_timeout_ms")]
    pub join_timeout_ms: u64,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    #[serde(default = "default_history_topic")]
    pub history_topic: String,
    #[serde(default = "default_history_timeout_ms")]
    pub history_timeout_ms: u64,
    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_secs: u64,
    /// Live points closer than this to the previous one are dropped.
    #[serde(default = "default_append_dedup_ms")]
    pub append_dedup_ms: u64,
    #[serde(default = "default_bus_capacity")]
    pub bus_capacity: usize,
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
    /// First delay before a failed subscription is retried; doubles up to
    /// `retry_backoff_max_ms`.
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    #[serde(default = "default_retry_backoff_max_ms")]
    pub retry_backoff_max_ms: u64,
}

impl Default for SyncFileConfig {
    fn default() -> Self {
        Self {
            join_timeout_ms: default_join_timeout_ms(),
            request_timeout_ms: default_request_timeout_ms(),
            history_topic: default_history_topic(),
            history_timeout_ms: default_history_timeout_ms(),
            heartbeat_secs: default_heartbeat_secs(),
            append_dedup_ms: default_append_dedup_ms(),
            bus_capacity: default_bus_capacity(),
            event_capacity: default_event_capacity(),
            retry_backoff_ms: default_retry_backoff_ms(),
            retry_backoff_max_ms: default_retry_backoff_max_ms(),
        }
    }
}

/// Which plugins run and what they follow (`[plugins]`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PluginsFileConfig {
    #[serde(default = "default_true")]
    pub aircraft: bool,
    #[serde(default = "default_true")]
    pub vessels: bool,
    /// Entity ids selected as soon as they show up in a feed.
    #[serde(default)]
    pub follow: Vec<String>,
}

impl Default for PluginsFileConfig {
    fn default() -> Self {
        Self {
            aircraft: true,
            vessels: true,
            follow: Vec::new(),
        }
    }
}

fn default_base_url() -> String {
    "http://127.0.0.1:4000/api".to_string()
}
fn default_socket_url() -> String {
    "ws://127.0.0.1:4000/socket/websocket".to_string()
}
fn default_join_timeout_ms() -> u64 {
    10_000
}
fn default_request_timeout_ms() -> u64 {
    10_000
}
fn default_history_topic() -> String {
    "history:trajectory".to_string()
}
fn default_history_timeout_ms() -> u64 {
    15_000
}
fn default_heartbeat_secs() -> u64 {
    30
}
fn default_append_dedup_ms() -> u64 {
    500
}
fn default_bus_capacity() -> usize {
    256
}
fn default_event_capacity() -> usize {
    1024
}
fn default_retry_backoff_ms() -> u64 {
    500
}
fn default_retry_backoff_max_ms() -> u64 {
    30_000
}
fn default_true() -> bool {
    true
}

/// Build the layered figment: struct defaults → `config.toml` → env vars.
///
/// Env vars use double-underscore for nesting into sections:
///   `SKYWATCH_SYNC__JOIN_TIMEOUT_MS=5000`  →  `sync.join_timeout_ms = 5000`
pub fn load_config(data_dir: &Path) -> figment::Figment {
    use figment::{
        Figment,
        providers::{Env, Format, Serialized, Toml},
    };

    Figment::from(Serialized::defaults(FileConfig::default()))
        .merge(Toml::file(data_dir.join("config.toml")))
        .merge(Env::prefixed("SKYWATCH_").split("__"))
}

/// Runtime configuration for the sync core.
pub fn sync_config_from_file(fc: &FileConfig) -> SyncConfig {
    SyncConfig {
        base_url: fc.backend.base_url.clone(),
        socket_url: fc.backend.socket_url.clone(),
        join_timeout: Duration::from_millis(fc.sync.join_timeout_ms),
        request_timeout: Duration::from_millis(fc.sync.request_timeout_ms),
        history_topic: fc.sync.history_topic.clone(),
        history_timeout: Duration::from_millis(fc.sync.history_timeout_ms),
        heartbeat_interval: Duration::from_secs(fc.sync.heartbeat_secs.max(1)),
        append_dedup_threshold: Duration::from_millis(fc.sync.append_dedup_ms),
        bus_capacity: fc.sync.bus_capacity,
        event_capacity: fc.sync.event_capacity.max(1),
        retry_backoff: Duration::from_millis(fc.sync.retry_backoff_ms.max(1)),
        retry_backoff_max: Duration::from_millis(fc.sync.retry_backoff_max_ms),
    }
}

#[derive(Clone, Debug)]
pub struct SkywatchConfig {
    pub data_dir: PathBuf,
}

impl SkywatchConfig {
    pub fn new(custom_dir: Option<PathBuf>) -> Result<Self> {
        let data_dir = match custom_dir {
            Some(dir) => dir,
            None => dirs::home_dir()
                .context("Could not find home directory")?
                .join(".skywatch"),
        };

        std::fs::create_dir_all(&data_dir)
            .with_context(|| format!("Failed to create data directory: {:?}", data_dir))?;

        info!("Data directory: {}", data_dir.display());

        Ok(Self { data_dir })
    }

    pub fn config_toml_path(&self) -> PathBuf {
        self.data_dir.join("config.toml")
    }
}
