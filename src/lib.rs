//! Streaming execution-update client for the Local Operator backend.
//!
//! This crate intentionally exposes a small surface:
//! - one WebSocket per message id with keep-alive and bounded fixed-delay
//!   reconnect
//! - logical subscribe/unsubscribe multiplexed over the shared transport
//! - an update reconciler that folds partial frames into one record per
//!   message with monotonic completion/streamable flags
//! - a thin REST fallback for refetching final state

pub mod api;
pub mod config;
pub mod connection;
pub mod error;
pub mod manager;
pub mod protocol;
pub mod store;

pub use api::OperatorApi;
pub use config::{StreamConfig, message_stream_url, normalize_base_url};
pub use connection::{ConnectionStatus, MessageConnection, StreamEvent};
pub use error::{ClientError, Result};
pub use manager::{StreamManager, SubscribeOptions};
pub use protocol::{ClientFrame, ExecutionUpdate, ServerFrame};
pub use store::{MessageRecord, UpdateStore};
