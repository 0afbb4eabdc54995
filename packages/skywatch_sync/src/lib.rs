//! Skywatch sync - realtime synchronization core shared by every plugin
//!
//! One multiplexed pub/sub connection carries every plugin's traffic.
//! Logical topics (`entities:aircraft`, `entities:vessels`) share a single
//! joined channel, requests are correlated over `<event>_result` replies, and
//! trajectory backfills are fetched at most once per entity across plugins.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use skywatch_sync::{EntityBatch, SyncConfig, SyncContext};
//!
//! #[tokio::main]
//! async fn main() {
//!     let ctx = Arc::new(SyncContext::connect(SyncConfig::default()));
//!     ctx.store().register_entity_type("aircraft");
//!     let coordinator = ctx.coordinator("aircraft", "aircraft");
//!     coordinator.spawn_selection_watcher();
//!
//!     let sink = ctx.store().clone();
//!     let _feed = ctx
//!         .realtime()
//!         .spawn_subscription("entities:aircraft", move |payload| {
//!             if let Ok(batch) = EntityBatch::from_payload("aircraft", payload) {
//!                 sink.replace_all_entities_by_type("aircraft", batch.entities);
//!             }
//!         })
//!         .unwrap();
//!
//!     tokio::signal::ctrl_c().await.unwrap();
//!     ctx.realtime().disconnect().await;
//! }
//! ```

pub mod backfill;
pub mod bus;
pub mod channel;
pub mod config;
pub mod connection;
pub mod context;
pub mod entity;
mod error;
pub mod exchange;
pub mod history;
pub mod multiplexer;
mod notify;
pub mod realtime;
pub mod rpc;
pub mod subscription;
pub mod token;
pub mod topic;
pub mod trajectory;
pub mod transport;
pub mod websocket;
pub mod wire;

#[cfg(any(test, feature = "test-support"))]
pub mod test_helpers;

pub use backfill::BackfillCoordinator;
pub use bus::{Bus, BusMessage};
pub use channel::{Channel, ChannelState};
pub use config::SyncConfig;
pub use connection::{ConnectionManager, ConnectionStatus};
pub use context::SyncContext;
pub use entity::{Entity, EntityBatch, EntityKey, EntityStore};
pub use error::{SyncError, SyncResult};
pub use exchange::{TrajectoryExchange, TrajectoryUpdate};
pub use history::{HistorySource, RpcHistorySource};
pub use notify::Revision;
pub use realtime::Realtime;
pub use subscription::Subscription;
pub use token::{HttpTokenSource, TokenGrant, TokenRequest, TokenSource};
pub use topic::Topic;
pub use trajectory::{TrajectoryCache, TrajectoryEntry, TrajectoryPoint};
pub use transport::{InboundMessage, JoinOutcome, Transport, TransportEvent};
pub use websocket::WebSocketTransport;
