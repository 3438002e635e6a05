//! [`TransactionManager`] — creation, submission, status polling and retry of
//! tracked transactions.
//!
//! Every submitted transaction gets its own polling task that runs until the
//! target commitment is reached, the ledger reports an error, the deadline
//! passes, or the caller cancels.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use chainrelay_core::error::RelayError;
use chainrelay_core::request::Commitment;

use crate::backend::{OptimisticHandler, SignatureStatus, TransactionBackend};
use crate::error::TxError;
use crate::record::{TransactionError, TransactionId, TransactionRecord};
use crate::status::TransactionStatus;

const EVENT_CAPACITY: usize = 256;
const RETRY_BASE: Duration = Duration::from_millis(1_000);
const RETRY_CAP: Duration = Duration::from_millis(10_000);

/// Backoff before retry number `n` (1-based): `min(1s · 2ⁿ, 10s)`.
pub fn retry_delay(n: u32) -> Duration {
    RETRY_BASE.saturating_mul(1u32 << n.min(16)).min(RETRY_CAP)
}

/// A payload applied locally before the transaction lands.
#[derive(Clone)]
pub struct OptimisticUpdate {
    pub payload: Value,
    pub handler: Arc<dyn OptimisticHandler>,
}

impl OptimisticUpdate {
    pub fn new(payload: Value, handler: Arc<dyn OptimisticHandler>) -> Self {
        Self { payload, handler }
    }
}

impl std::fmt::Debug for OptimisticUpdate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OptimisticUpdate")
            .field("payload", &self.payload)
            .finish_non_exhaustive()
    }
}

/// Per-transaction settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct TransactionConfig {
    pub max_retries: u32,
    /// Deadline for reaching `commitment`, counted from submission.
    #[serde(with = "chainrelay_core::serde_ms", rename = "timeout-ms")]
    pub timeout: Duration,
    /// Polling stops once this level is reached.
    pub commitment: Commitment,
    #[serde(with = "chainrelay_core::serde_ms", rename = "poll-interval-ms")]
    pub poll_interval: Duration,
    pub rollback_on_failure: bool,
    #[serde(skip)]
    pub optimistic: Option<OptimisticUpdate>,
}

impl Default for TransactionConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            timeout: Duration::from_secs(60),
            commitment: Commitment::Confirmed,
            poll_interval: Duration::from_secs(2),
            rollback_on_failure: true,
            optimistic: None,
        }
    }
}

impl TransactionConfig {
    pub fn with_optimistic(mut self, payload: Value, handler: Arc<dyn OptimisticHandler>) -> Self {
        self.optimistic = Some(OptimisticUpdate::new(payload, handler));
        self
    }

    pub fn validate(&self) -> Result<(), RelayError> {
        if self.poll_interval.is_zero() {
            return Err(RelayError::Config("transaction poll interval must be > 0".into()));
        }
        if self.timeout.is_zero() {
            return Err(RelayError::Config("transaction timeout must be > 0".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionEventKind {
    Created,
    Submitted,
    StatusChanged,
    Retrying,
    Failed,
    Timeout,
    Cancelled,
}

/// A lifecycle event with the record as it was right after the change.
#[derive(Debug, Clone)]
pub struct TransactionEvent {
    pub kind: TransactionEventKind,
    pub record: TransactionRecord,
}

impl TransactionEvent {
    pub fn id(&self) -> TransactionId {
        self.record.id
    }
}

/// Events for a single transaction.
pub struct TransactionWatch {
    id: TransactionId,
    rx: broadcast::Receiver<TransactionEvent>,
}

impl TransactionWatch {
    /// Next event for this transaction; `None` once the manager is gone.
    pub async fn next(&mut self) -> Option<TransactionEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) if event.record.id == self.id => return Some(event),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(id = %self.id, skipped, "transaction watcher lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

/// What `cancel_transaction` could and could not undo.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CancelOutcome {
    pub previous_status: TransactionStatus,
    /// The transaction reached a node and may still land on the ledger;
    /// cancellation only stopped local tracking.
    pub was_submitted: bool,
}

#[derive(Debug, Clone, Default)]
pub struct TransactionStats {
    pub total: usize,
    pub by_status: BTreeMap<TransactionStatus, usize>,
    pub by_kind: BTreeMap<String, usize>,
    /// Mean submission → confirmation time.
    pub average_confirmation_time: Duration,
    /// Successes over confirmed, finalized, failed and timed-out records.
    pub success_rate: f64,
}

struct Rollback {
    handler: Arc<dyn OptimisticHandler>,
    original: Value,
}

impl Rollback {
    fn run(self) {
        self.handler.rollback(&self.original);
    }
}

struct Entry {
    record: TransactionRecord,
    config: TransactionConfig,
    monitor: Option<JoinHandle<()>>,
    submitting: bool,
    rolled_back: bool,
    details_fetched: bool,
}

impl Entry {
    fn take_rollback(&mut self) -> Option<Rollback> {
        if self.rolled_back || !self.config.rollback_on_failure {
            return None;
        }
        let handler = self.config.optimistic.as_ref()?.handler.clone();
        let original = self.record.original_payload.clone()?;
        self.rolled_back = true;
        Some(Rollback { handler, original })
    }
}

/// Apply a status change and stamp its timestamp. Returns `false` if the
/// state machine forbids it.
fn advance(record: &mut TransactionRecord, next: TransactionStatus) -> bool {
    if !record.status.can_transition_to(next) {
        return false;
    }
    let now = Utc::now();
    let ts = &mut record.timestamps;
    match next {
        TransactionStatus::Submitted => ts.submitted = Some(now),
        TransactionStatus::Confirmed => ts.confirmed = Some(now),
        TransactionStatus::Finalized => {
            ts.confirmed.get_or_insert(now);
            ts.finalized = Some(now);
        }
        TransactionStatus::Failed => ts.failed = Some(now),
        _ => {}
    }
    record.status = next;
    true
}

struct Step {
    done: bool,
    fetch_details: bool,
}

struct Shared {
    backend: Arc<dyn TransactionBackend>,
    entries: Mutex<HashMap<TransactionId, Entry>>,
    events: broadcast::Sender<TransactionEvent>,
}

impl Shared {
    fn emit(&self, kind: TransactionEventKind, record: &TransactionRecord) {
        // No subscribers is fine.
        let _ = self.events.send(TransactionEvent {
            kind,
            record: record.clone(),
        });
    }

    /// Move to `Failed`/`Timeout`, capture the error, and hand back the
    /// rollback to run once the lock is released.
    fn fail_locked(
        &self,
        entry: &mut Entry,
        next: TransactionStatus,
        error: TransactionError,
    ) -> Option<Rollback> {
        if !advance(&mut entry.record, next) {
            return None;
        }
        tracing::warn!(
            id = %entry.record.id,
            status = %next,
            code = %error.code,
            message = %error.message,
            "transaction did not complete"
        );
        entry.record.error = Some(error);
        entry.submitting = false;
        entry.monitor.take();
        let kind = match next {
            TransactionStatus::Timeout => TransactionEventKind::Timeout,
            _ => TransactionEventKind::Failed,
        };
        self.emit(kind, &entry.record);
        entry.take_rollback()
    }

    /// The submission never reached the ledger. A cancel that raced it kept
    /// the optimistic update, so undo it here.
    fn on_submit_failed(&self, id: TransactionId, err: &RelayError) {
        let rollback = {
            let mut entries = self.entries.lock().unwrap();
            let Some(entry) = entries.get_mut(&id) else {
                return;
            };
            let rollback = if entry.record.status == TransactionStatus::Cancelled {
                entry.take_rollback()
            } else {
                self.fail_locked(entry, TransactionStatus::Failed, TransactionError::from(err))
            };
            entry.submitting = false;
            rollback
        };
        if let Some(rollback) = rollback {
            tracing::debug!(%id, "rolling back optimistic update");
            rollback.run();
        }
    }

    fn on_submitted(self: &Arc<Self>, id: TransactionId, signature: &str) {
        let mut entries = self.entries.lock().unwrap();
        let Some(entry) = entries.get_mut(&id) else {
            return;
        };
        entry.submitting = false;
        entry.record.signature = Some(signature.to_string());
        // Cancelled while the submission was in flight.
        if !advance(&mut entry.record, TransactionStatus::Submitted) {
            return;
        }
        tracing::info!(%id, signature, "transaction submitted");
        let deadline = Instant::now() + entry.config.timeout;
        entry.monitor = Some(tokio::spawn(monitor(
            self.clone(),
            id,
            signature.to_string(),
            deadline,
            entry.config.poll_interval,
            entry.config.commitment,
        )));
        self.emit(TransactionEventKind::Submitted, &entry.record);
    }

    fn observe(&self, id: TransactionId, status: &SignatureStatus, commitment: Commitment) -> Step {
        let stop = Step {
            done: true,
            fetch_details: false,
        };
        let mut entries = self.entries.lock().unwrap();
        let Some(entry) = entries.get_mut(&id) else {
            return stop;
        };
        if entry.record.status.is_terminal() {
            return stop;
        }
        entry.record.chain_details.slot = Some(status.slot);
        entry.record.chain_details.confirmation_level = status.confirmation;

        if let Some(err) = &status.err {
            let rollback = self.fail_locked(entry, TransactionStatus::Failed, err.clone());
            drop(entries);
            if let Some(rollback) = rollback {
                rollback.run();
            }
            return stop;
        }

        let next = match status.confirmation {
            Some(Commitment::Finalized) => TransactionStatus::Finalized,
            Some(Commitment::Confirmed) => TransactionStatus::Confirmed,
            _ => TransactionStatus::Processing,
        };
        let prev = entry.record.status;
        if prev != next && advance(&mut entry.record, next) {
            tracing::debug!(%id, from = %prev, to = %next, slot = status.slot, "transaction status changed");
            self.emit(TransactionEventKind::StatusChanged, &entry.record);
        }

        let reached = entry.record.status;
        let done = reached == TransactionStatus::Finalized
            || (reached == TransactionStatus::Confirmed && commitment != Commitment::Finalized);
        let fetch_details = reached.is_success() && !entry.details_fetched;
        entry.details_fetched |= fetch_details;
        Step { done, fetch_details }
    }

    async fn enrich(&self, id: TransactionId, signature: &str) {
        match self.backend.details(signature).await {
            Ok(Some(details)) => {
                let mut entries = self.entries.lock().unwrap();
                if let Some(entry) = entries.get_mut(&id) {
                    let chain = &mut entry.record.chain_details;
                    chain.fee = details.fee;
                    chain.block_time = details.block_time;
                    chain.compute_units = details.compute_units;
                }
            }
            Ok(None) => {}
            Err(err) => tracing::warn!(%id, error = %err, "could not fetch transaction details"),
        }
    }

    fn on_deadline(&self, id: TransactionId) {
        let rollback = {
            let mut entries = self.entries.lock().unwrap();
            match entries.get_mut(&id) {
                // Confirmed but not yet finalized: keep the confirmation.
                Some(entry) if !entry.record.status.is_success() => self.fail_locked(
                    entry,
                    TransactionStatus::Timeout,
                    TransactionError::new("TIMEOUT", "no final status before the deadline"),
                ),
                _ => None,
            }
        };
        if let Some(rollback) = rollback {
            rollback.run();
        }
    }
}

async fn monitor(
    shared: Arc<Shared>,
    id: TransactionId,
    signature: String,
    deadline: Instant,
    poll_interval: Duration,
    commitment: Commitment,
) {
    let mut ticker = tokio::time::interval_at(Instant::now() + poll_interval, poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        if tokio::time::timeout_at(deadline, ticker.tick()).await.is_err() {
            break;
        }
        let status = match tokio::time::timeout_at(deadline, shared.backend.status(&signature)).await {
            Err(_) => break,
            Ok(Ok(Some(status))) => status,
            Ok(Ok(None)) => continue,
            Ok(Err(err)) => {
                tracing::debug!(%id, error = %err, "status poll failed");
                continue;
            }
        };
        let step = shared.observe(id, &status, commitment);
        if step.fetch_details {
            shared.enrich(id, &signature).await;
        }
        if step.done {
            return;
        }
    }
    shared.on_deadline(id);
}

/// Owns every tracked [`TransactionRecord`].
pub struct TransactionManager {
    shared: Arc<Shared>,
    defaults: TransactionConfig,
    next_id: AtomicU64,
}

impl TransactionManager {
    pub fn new(backend: Arc<dyn TransactionBackend>, defaults: TransactionConfig) -> Result<Self, TxError> {
        defaults.validate()?;
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Ok(Self {
            shared: Arc::new(Shared {
                backend,
                entries: Mutex::new(HashMap::new()),
                events,
            }),
            defaults,
            next_id: AtomicU64::new(1),
        })
    }

    /// A copy of the configured defaults, to tweak per transaction.
    pub fn defaults(&self) -> TransactionConfig {
        self.defaults.clone()
    }

    /// Start tracking a transaction. Applies the optimistic update, if any.
    pub fn create_transaction(
        &self,
        kind: impl Into<String>,
        config: TransactionConfig,
    ) -> Result<TransactionId, TxError> {
        config.validate()?;
        let id = TransactionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let mut record = TransactionRecord::new(id, kind.into(), config.max_retries);
        if let Some(optimistic) = &config.optimistic {
            record.original_payload = Some(optimistic.handler.apply(&optimistic.payload));
            record.optimistic_payload = Some(optimistic.payload.clone());
        }
        tracing::debug!(%id, kind = %record.kind, "transaction created");
        self.shared.emit(TransactionEventKind::Created, &record);
        self.shared.entries.lock().unwrap().insert(
            id,
            Entry {
                record,
                config,
                monitor: None,
                submitting: false,
                rolled_back: false,
                details_fetched: false,
            },
        );
        Ok(id)
    }

    /// Submit the signed transaction bytes and start polling.
    ///
    /// A failed submission moves the record to `Failed` (rolling back the
    /// optimistic update when configured) and returns the error.
    pub async fn submit_transaction(&self, id: TransactionId, payload: &[u8]) -> Result<String, TxError> {
        {
            let mut entries = self.shared.entries.lock().unwrap();
            let entry = entries.get_mut(&id).ok_or(TxError::NotFound(id))?;
            if entry.submitting {
                return Err(TxError::SubmissionInFlight(id));
            }
            let from = entry.record.status;
            if !from.can_transition_to(TransactionStatus::Submitted) {
                return Err(TxError::InvalidState {
                    id,
                    from,
                    to: TransactionStatus::Submitted,
                });
            }
            entry.submitting = true;
        }

        match self.shared.backend.submit(payload).await {
            Ok(signature) => {
                self.shared.on_submitted(id, &signature);
                Ok(signature)
            }
            Err(err) => {
                self.shared.on_submit_failed(id, &err);
                Err(TxError::Relay(err))
            }
        }
    }

    /// Resubmit a failed or timed-out transaction after `retry_delay`.
    pub async fn retry_transaction(&self, id: TransactionId, payload: &[u8]) -> Result<String, TxError> {
        let (delay, attempt, reapply) = {
            let mut entries = self.shared.entries.lock().unwrap();
            let entry = entries.get_mut(&id).ok_or(TxError::NotFound(id))?;
            let record = &mut entry.record;
            if record.retry_count >= record.max_retries {
                return Err(TxError::MaxRetriesExceeded {
                    id,
                    max_retries: record.max_retries,
                });
            }
            let from = record.status;
            if !matches!(from, TransactionStatus::Failed | TransactionStatus::Timeout)
                || !advance(record, TransactionStatus::Pending)
            {
                return Err(TxError::InvalidState {
                    id,
                    from,
                    to: TransactionStatus::Pending,
                });
            }
            record.retry_count += 1;
            record.timestamps.last_retry = Some(Utc::now());
            record.error = None;
            record.signature = None;
            record.chain_details = Default::default();
            entry.details_fetched = false;
            let reapply = if entry.rolled_back {
                entry.rolled_back = false;
                entry.config.optimistic.clone()
            } else {
                None
            };
            let attempt = entry.record.retry_count;
            self.shared.emit(TransactionEventKind::Retrying, &entry.record);
            (retry_delay(attempt), attempt, reapply)
        };

        if let Some(optimistic) = reapply {
            let original = optimistic.handler.apply(&optimistic.payload);
            if let Some(entry) = self.shared.entries.lock().unwrap().get_mut(&id) {
                entry.record.original_payload = Some(original);
            }
        }

        tracing::info!(%id, attempt, delay_ms = delay.as_millis() as u64, "retrying transaction");
        tokio::time::sleep(delay).await;
        self.submit_transaction(id, payload).await
    }

    /// Stop tracking. Does not (and cannot) withdraw a submitted transaction
    /// from the ledger.
    pub fn cancel_transaction(&self, id: TransactionId) -> Result<CancelOutcome, TxError> {
        let (outcome, rollback) = {
            let mut entries = self.shared.entries.lock().unwrap();
            let entry = entries.get_mut(&id).ok_or(TxError::NotFound(id))?;
            let from = entry.record.status;
            if !advance(&mut entry.record, TransactionStatus::Cancelled) {
                return Err(TxError::InvalidState {
                    id,
                    from,
                    to: TransactionStatus::Cancelled,
                });
            }
            if let Some(task) = entry.monitor.take() {
                task.abort();
            }
            let was_submitted = entry.record.signature.is_some() || entry.submitting;
            self.shared.emit(TransactionEventKind::Cancelled, &entry.record);
            // A submitted transaction may still land, so its update stays.
            let rollback = if was_submitted { None } else { entry.take_rollback() };
            (
                CancelOutcome {
                    previous_status: from,
                    was_submitted,
                },
                rollback,
            )
        };
        if let Some(rollback) = rollback {
            rollback.run();
        }
        tracing::info!(%id, was_submitted = outcome.was_submitted, "transaction cancelled");
        Ok(outcome)
    }

    pub fn transaction(&self, id: TransactionId) -> Option<TransactionRecord> {
        self.shared
            .entries
            .lock()
            .unwrap()
            .get(&id)
            .map(|e| e.record.clone())
    }

    /// All records, oldest first.
    pub fn transactions(&self) -> Vec<TransactionRecord> {
        self.filtered(|_| true)
    }

    pub fn transactions_by_status(&self, status: TransactionStatus) -> Vec<TransactionRecord> {
        self.filtered(|r| r.status == status)
    }

    pub fn transactions_by_kind(&self, kind: &str) -> Vec<TransactionRecord> {
        self.filtered(|r| r.kind == kind)
    }

    fn filtered(&self, keep: impl Fn(&TransactionRecord) -> bool) -> Vec<TransactionRecord> {
        let entries = self.shared.entries.lock().unwrap();
        let mut out: Vec<_> = entries
            .values()
            .map(|e| &e.record)
            .filter(|r| keep(r))
            .cloned()
            .collect();
        out.sort_by_key(|r| r.id);
        out
    }

    /// Events for every transaction.
    pub fn events(&self) -> broadcast::Receiver<TransactionEvent> {
        self.shared.events.subscribe()
    }

    /// Events for one transaction.
    pub fn watch(&self, id: TransactionId) -> Result<TransactionWatch, TxError> {
        if !self.shared.entries.lock().unwrap().contains_key(&id) {
            return Err(TxError::NotFound(id));
        }
        Ok(TransactionWatch {
            id,
            rx: self.shared.events.subscribe(),
        })
    }

    pub fn statistics(&self) -> TransactionStats {
        let entries = self.shared.entries.lock().unwrap();
        let mut stats = TransactionStats {
            total: entries.len(),
            ..Default::default()
        };
        let mut confirmation_total = chrono::Duration::zero();
        let mut confirmed = 0i32;
        let (mut completed, mut succeeded) = (0usize, 0usize);

        for record in entries.values().map(|e| &e.record) {
            *stats.by_status.entry(record.status).or_default() += 1;
            *stats.by_kind.entry(record.kind.clone()).or_default() += 1;
            if let Some(t) = record.confirmation_time() {
                confirmation_total = confirmation_total + t;
                confirmed += 1;
            }
            if record.status != TransactionStatus::Cancelled && record.status.is_completed() {
                completed += 1;
                if record.status.is_success() {
                    succeeded += 1;
                }
            }
        }

        if confirmed > 0 {
            stats.average_confirmation_time = (confirmation_total / confirmed).to_std().unwrap_or_default();
        }
        if completed > 0 {
            stats.success_rate = succeeded as f64 / completed as f64;
        }
        stats
    }

    /// Drop every confirmed, finalized, failed, timed-out or cancelled
    /// record. Returns how many were removed.
    pub fn clear_completed(&self) -> usize {
        let mut entries = self.shared.entries.lock().unwrap();
        let before = entries.len();
        entries.retain(|_, entry| {
            let keep = !entry.record.status.is_completed();
            if !keep {
                if let Some(task) = entry.monitor.take() {
                    task.abort();
                }
            }
            keep
        });
        before - entries.len()
    }
}

impl Drop for TransactionManager {
    fn drop(&mut self) {
        if let Ok(mut entries) = self.shared.entries.lock() {
            for entry in entries.values_mut() {
                if let Some(task) = entry.monitor.take() {
                    task.abort();
                }
            }
        }
    }
}
