//! The transaction state machine.

use serde::{Deserialize, Serialize};

/// Where a tracked transaction is in its lifecycle.
///
/// ```text
/// Pending → Submitted → Processing → Confirmed → Finalized
///    └──────────┴────────────┴───────────┴──→ Failed | Timeout | Cancelled
/// ```
///
/// `Failed` and `Timeout` may re-enter `Pending` through an explicit retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionStatus {
    /// Created, not yet accepted by a node.
    Pending,
    Submitted,
    Processing,
    Confirmed,
    /// Irreversible.
    Finalized,
    Failed,
    Timeout,
    Cancelled,
}

impl TransactionStatus {
    pub const ALL: [TransactionStatus; 8] = [
        Self::Pending,
        Self::Submitted,
        Self::Processing,
        Self::Confirmed,
        Self::Finalized,
        Self::Failed,
        Self::Timeout,
        Self::Cancelled,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Submitted => "submitted",
            Self::Processing => "processing",
            Self::Confirmed => "confirmed",
            Self::Finalized => "finalized",
            Self::Failed => "failed",
            Self::Timeout => "timeout",
            Self::Cancelled => "cancelled",
        }
    }

    /// No further status changes happen without caller action.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Finalized | Self::Failed | Self::Timeout | Self::Cancelled
        )
    }

    /// Eligible for `clear_completed`.
    pub fn is_completed(self) -> bool {
        self == Self::Confirmed || self.is_terminal()
    }

    pub fn is_success(self) -> bool {
        matches!(self, Self::Confirmed | Self::Finalized)
    }

    pub fn can_transition_to(self, next: Self) -> bool {
        use TransactionStatus::*;
        match (self, next) {
            (Failed | Timeout, Pending) => true,
            (from, Failed | Timeout | Cancelled) => !from.is_terminal(),
            (Pending, Submitted) => true,
            // Polling may observe any later stage first.
            (Submitted, Processing | Confirmed | Finalized) => true,
            (Processing, Confirmed | Finalized) => true,
            (Confirmed, Finalized) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::TransactionStatus::*;
    use super::*;

    #[test]
    fn forward_path() {
        assert!(Pending.can_transition_to(Submitted));
        assert!(Submitted.can_transition_to(Processing));
        assert!(Submitted.can_transition_to(Confirmed));
        assert!(Processing.can_transition_to(Confirmed));
        assert!(Confirmed.can_transition_to(Finalized));
        assert!(!Pending.can_transition_to(Confirmed));
        assert!(!Confirmed.can_transition_to(Processing));
    }

    #[test]
    fn failure_states_reachable_from_any_non_terminal() {
        for from in [Pending, Submitted, Processing, Confirmed] {
            for to in [Failed, Timeout, Cancelled] {
                assert!(from.can_transition_to(to), "{from} -> {to}");
            }
        }
        for from in [Finalized, Failed, Timeout, Cancelled] {
            assert!(!from.can_transition_to(Cancelled), "{from} -> cancelled");
        }
    }

    #[test]
    fn only_failures_can_be_retried() {
        assert!(Failed.can_transition_to(Pending));
        assert!(Timeout.can_transition_to(Pending));
        assert!(!Cancelled.can_transition_to(Pending));
        assert!(!Finalized.can_transition_to(Pending));
    }

    #[test]
    fn classification() {
        let terminal: Vec<_> = TransactionStatus::ALL.into_iter().filter(|s| s.is_terminal()).collect();
        assert_eq!(terminal, vec![Finalized, Failed, Timeout, Cancelled]);
        assert!(Confirmed.is_completed());
        assert!(!Processing.is_completed());
        assert!(Confirmed.is_success() && Finalized.is_success());
        assert!(!Timeout.is_success());
    }
}
