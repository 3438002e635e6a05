//! Tracked transaction records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use chainrelay_core::error::RelayError;
use chainrelay_core::request::Commitment;

use crate::status::TransactionStatus;

/// Identifier assigned by the manager at creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TransactionId(pub u64);

impl std::fmt::Display for TransactionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "tx-{}", self.0)
    }
}

/// Execution failure captured on the record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionError {
    pub code: String,
    pub message: String,
    #[serde(default)]
    pub logs: Vec<String>,
}

impl TransactionError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            logs: Vec::new(),
        }
    }

    pub fn with_logs(mut self, logs: Vec<String>) -> Self {
        self.logs = logs;
        self
    }
}

impl From<&RelayError> for TransactionError {
    fn from(err: &RelayError) -> Self {
        match err.root() {
            RelayError::Transaction { code, message, logs } => Self {
                code: code.clone(),
                message: message.clone(),
                logs: logs.clone(),
            },
            other => Self::new(other.kind().to_string().to_ascii_uppercase(), other.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Timestamps {
    pub created: DateTime<Utc>,
    pub submitted: Option<DateTime<Utc>>,
    pub confirmed: Option<DateTime<Utc>>,
    pub finalized: Option<DateTime<Utc>>,
    pub failed: Option<DateTime<Utc>>,
    pub last_retry: Option<DateTime<Utc>>,
}

impl Timestamps {
    fn now() -> Self {
        Self {
            created: Utc::now(),
            submitted: None,
            confirmed: None,
            finalized: None,
            failed: None,
            last_retry: None,
        }
    }
}

/// What the ledger reported about the transaction.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChainDetails {
    pub slot: Option<u64>,
    pub fee: Option<u64>,
    pub confirmation_level: Option<Commitment>,
    /// Unix seconds.
    pub block_time: Option<i64>,
    pub compute_units: Option<u64>,
}

/// A snapshot of one tracked transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionRecord {
    pub id: TransactionId,
    pub signature: Option<String>,
    pub status: TransactionStatus,
    /// Caller-defined category ("stake", "register_agent", ...).
    pub kind: String,
    pub optimistic_payload: Option<Value>,
    /// The value the optimistic update replaced.
    pub original_payload: Option<Value>,
    pub error: Option<TransactionError>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub timestamps: Timestamps,
    pub chain_details: ChainDetails,
}

impl TransactionRecord {
    pub(crate) fn new(id: TransactionId, kind: String, max_retries: u32) -> Self {
        Self {
            id,
            signature: None,
            status: TransactionStatus::Pending,
            kind,
            optimistic_payload: None,
            original_payload: None,
            error: None,
            retry_count: 0,
            max_retries,
            timestamps: Timestamps::now(),
            chain_details: ChainDetails::default(),
        }
    }

    /// Time from submission to confirmation, once both are known.
    pub fn confirmation_time(&self) -> Option<chrono::Duration> {
        Some(self.timestamps.confirmed? - self.timestamps.submitted?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn execution_error_keeps_code_and_logs() {
        let err = RelayError::Transaction {
            code: "InstructionError".into(),
            message: "custom program error: 0x1".into(),
            logs: vec!["Program log: insufficient funds".into()],
        };
        let captured = TransactionError::from(&err);
        assert_eq!(captured.code, "InstructionError");
        assert_eq!(captured.logs.len(), 1);
    }

    #[test]
    fn transport_error_uses_kind_as_code() {
        let captured = TransactionError::from(&RelayError::Network("reset".into()));
        assert_eq!(captured.code, "NETWORK");
        assert!(captured.logs.is_empty());
    }

    #[test]
    fn new_record_is_pending() {
        let record = TransactionRecord::new(TransactionId(7), "stake".into(), 3);
        assert_eq!(record.id.to_string(), "tx-7");
        assert_eq!(record.status, TransactionStatus::Pending);
        assert!(record.confirmation_time().is_none());
    }
}
