//! Collaborators the transaction manager is built on.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use chainrelay_core::error::RelayError;
use chainrelay_core::request::Commitment;

use crate::record::TransactionError;

/// One signature-status observation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignatureStatus {
    pub slot: u64,
    /// `None` while the node has seen but not yet processed the transaction.
    pub confirmation: Option<Commitment>,
    /// Set when execution failed on the ledger.
    pub err: Option<TransactionError>,
}

/// Fee and compute data, fetched once after confirmation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TransactionDetails {
    pub fee: Option<u64>,
    pub block_time: Option<i64>,
    pub compute_units: Option<u64>,
}

/// Submits already-signed transactions and reports their progress.
#[async_trait]
pub trait TransactionBackend: Send + Sync + 'static {
    /// Submit serialized transaction bytes. Returns the signature.
    async fn submit(&self, payload: &[u8]) -> Result<String, RelayError>;

    /// `Ok(None)` when the node does not know the signature yet.
    async fn status(&self, signature: &str) -> Result<Option<SignatureStatus>, RelayError>;

    async fn details(&self, _signature: &str) -> Result<Option<TransactionDetails>, RelayError> {
        Ok(None)
    }
}

/// Applies and reverts an optimistic local update.
pub trait OptimisticHandler: Send + Sync + 'static {
    /// Apply `payload` and return the value it replaced.
    fn apply(&self, payload: &Value) -> Value;

    /// Restore the value returned by [`apply`](Self::apply).
    fn rollback(&self, original: &Value);
}
