//! chainrelay-tx — Transaction lifecycle tracking.
//!
//! A [`TransactionManager`] owns one [`TransactionRecord`] per tracked
//! transaction and drives it through the [`TransactionStatus`] machine:
//! submission through a [`TransactionBackend`], status polling until the
//! target commitment, bounded retries, and optimistic update/rollback via an
//! [`OptimisticHandler`].

pub mod backend;
pub mod error;
pub mod manager;
pub mod record;
pub mod status;

pub use backend::{OptimisticHandler, SignatureStatus, TransactionBackend, TransactionDetails};
pub use error::TxError;
pub use manager::{
    retry_delay, CancelOutcome, OptimisticUpdate, TransactionConfig, TransactionEvent,
    TransactionEventKind, TransactionManager, TransactionStats, TransactionWatch,
};
pub use record::{ChainDetails, Timestamps, TransactionError, TransactionId, TransactionRecord};
pub use status::TransactionStatus;
