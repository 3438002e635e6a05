//! The injected pubsub connection traits.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use chainrelay_core::error::RelayError;
use chainrelay_core::request::Commitment;

use crate::subscriptions::SubscriptionSink;

/// What a subscription listens to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionKind {
    /// Changes to one account.
    Account,
    /// Changes to any account owned by a program.
    Program,
    /// Transaction logs matching a filter.
    Logs,
    /// Slot advances. Takes no target.
    Slot,
}

impl SubscriptionKind {
    /// The pubsub method that opens this kind of subscription.
    pub fn subscribe_method(self) -> &'static str {
        match self {
            Self::Account => "accountSubscribe",
            Self::Program => "programSubscribe",
            Self::Logs => "logsSubscribe",
            Self::Slot => "slotSubscribe",
        }
    }

    pub fn unsubscribe_method(self) -> &'static str {
        match self {
            Self::Account => "accountUnsubscribe",
            Self::Program => "programUnsubscribe",
            Self::Logs => "logsUnsubscribe",
            Self::Slot => "slotUnsubscribe",
        }
    }

    pub fn requires_target(self) -> bool {
        !matches!(self, Self::Slot)
    }
}

impl std::fmt::Display for SubscriptionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Account => "account",
            Self::Program => "program",
            Self::Logs => "logs",
            Self::Slot => "slot",
        };
        f.write_str(s)
    }
}

/// Everything needed to (re)open one physical subscription.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionSpec {
    pub kind: SubscriptionKind,
    /// Account or program address, or a log filter. `None` for slot feeds.
    pub target: Option<String>,
    #[serde(default)]
    pub commitment: Commitment,
    /// Extra kind-specific options (encoding, filters...).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<Value>,
}

impl SubscriptionSpec {
    pub fn new(kind: SubscriptionKind, target: Option<String>) -> Self {
        Self {
            kind,
            target,
            commitment: Commitment::default(),
            options: None,
        }
    }

    pub fn account(address: impl Into<String>) -> Self {
        Self::new(SubscriptionKind::Account, Some(address.into()))
    }

    pub fn program(program_id: impl Into<String>) -> Self {
        Self::new(SubscriptionKind::Program, Some(program_id.into()))
    }

    pub fn logs(filter: impl Into<String>) -> Self {
        Self::new(SubscriptionKind::Logs, Some(filter.into()))
    }

    pub fn slot() -> Self {
        Self::new(SubscriptionKind::Slot, None)
    }

    pub fn with_commitment(mut self, commitment: Commitment) -> Self {
        self.commitment = commitment;
        self
    }

    pub fn validate(&self) -> Result<(), RelayError> {
        match (&self.target, self.kind.requires_target()) {
            (None, true) => Err(RelayError::Validation(format!(
                "{} subscription needs a target",
                self.kind
            ))),
            (Some(t), true) if t.trim().is_empty() => Err(RelayError::Validation(format!(
                "{} subscription target is empty",
                self.kind
            ))),
            _ => Ok(()),
        }
    }
}

/// One live pubsub connection.
///
/// # Object Safety
/// Stored as `Arc<dyn PubsubConnection>`; the manager never holds a lock
/// while awaiting any of these methods.
#[async_trait]
pub trait PubsubConnection: Send + Sync + 'static {
    /// Open a physical subscription. Notifications go to `sink`.
    /// Returns the server-assigned handle.
    async fn subscribe(&self, spec: &SubscriptionSpec, sink: SubscriptionSink) -> Result<u64, RelayError>;

    async fn unsubscribe(&self, kind: SubscriptionKind, handle: u64) -> Result<(), RelayError>;

    /// Round-trip a cheap request and return the latency.
    async fn ping(&self) -> Result<Duration, RelayError>;

    /// Resolves once the connection has been closed by either side.
    async fn closed(&self);

    /// Close the connection.
    async fn close(&self);
}

/// Opens pubsub connections.
#[async_trait]
pub trait PubsubConnector: Send + Sync + 'static {
    async fn connect(&self, url: &str) -> Result<Arc<dyn PubsubConnection>, RelayError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slot_needs_no_target_others_do() {
        assert!(SubscriptionSpec::slot().validate().is_ok());
        assert!(SubscriptionSpec::new(SubscriptionKind::Account, None).validate().is_err());
        assert!(SubscriptionSpec::program("  ").validate().is_err());
        assert!(SubscriptionSpec::logs("all").validate().is_ok());
    }

    #[test]
    fn method_names() {
        assert_eq!(SubscriptionKind::Program.subscribe_method(), "programSubscribe");
        assert_eq!(SubscriptionKind::Logs.unsubscribe_method(), "logsUnsubscribe");
    }
}
