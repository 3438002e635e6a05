//! chainrelay-ws — logical subscriptions that survive reconnects.
//!
//! # Features
//! - Account, program, log and slot subscriptions over one physical connection
//! - Reconnect with exponential backoff and a bounded attempt count
//! - Resubscribe of every registered subscription after reconnect
//! - Periodic ping with a 0–100 connection-quality score
//!
//! The pubsub wire protocol is injected through [`PubsubConnector`].

pub mod connection;
pub mod quality;
pub mod subscriptions;

pub use connection::{PubsubConnection, PubsubConnector, SubscriptionKind, SubscriptionSpec};
pub use quality::{connection_quality, QualityThresholds};
pub use subscriptions::{
    ConnectionEvent, ConnectionState, ConnectionStatus, SubscriptionId, SubscriptionInfo,
    SubscriptionManager, SubscriptionSink, SubscriptionUpdate, WsConfig,
};
