use thiserror::Error;

use chainrelay_core::error::{RelayError, UserFacingError};

use crate::record::TransactionId;
use crate::status::TransactionStatus;

#[derive(Debug, Clone, Error)]
pub enum TxError {
    #[error("transaction {0} not found")]
    NotFound(TransactionId),

    #[error("transaction {id} already used its {max_retries} retries")]
    MaxRetriesExceeded { id: TransactionId, max_retries: u32 },

    #[error("transaction {id} cannot move from {from} to {to}")]
    InvalidState {
        id: TransactionId,
        from: TransactionStatus,
        to: TransactionStatus,
    },

    #[error("transaction {0} is already being submitted")]
    SubmissionInFlight(TransactionId),

    #[error(transparent)]
    Relay(#[from] RelayError),
}

impl TxError {
    pub fn to_user_facing(&self) -> UserFacingError {
        match self {
            Self::Relay(err) => err.to_user_facing(),
            Self::MaxRetriesExceeded { .. } => {
                let mut out = RelayError::Transaction {
                    code: "MAX_RETRIES_EXCEEDED".into(),
                    message: self.to_string(),
                    logs: Vec::new(),
                }
                .to_user_facing();
                out.recoverable = false;
                out
            }
            other => RelayError::Validation(other.to_string()).to_user_facing(),
        }
    }
}
