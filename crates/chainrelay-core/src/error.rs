//! Error taxonomy shared by every ChainRelay component.
//!
//! [`RelayError`] is what components return to each other. It is `Clone`
//! because deduplicated callers must all observe the *same* error value.
//! [`UserFacingError`] is the normalized shape handed to the consuming layer.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::request::JsonRpcError;

/// Coarse error classes the consuming layer renders uniformly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Network,
    RateLimit,
    Deserialization,
    Validation,
    Transaction,
    Timeout,
    Unknown,
}

impl ErrorKind {
    /// Transient kinds are retried locally before being surfaced.
    pub fn is_transient(self) -> bool {
        matches!(self, Self::Network | Self::RateLimit | Self::Timeout)
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Network => "network",
            Self::RateLimit => "rate_limit",
            Self::Deserialization => "deserialization",
            Self::Validation => "validation",
            Self::Transaction => "transaction",
            Self::Timeout => "timeout",
            Self::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// Errors produced anywhere in the relay pipeline.
#[derive(Debug, Clone, Error)]
pub enum RelayError {
    /// Connectivity failure (refused, reset, DNS, TLS...).
    #[error("network error: {0}")]
    Network(String),

    /// Non-success HTTP status from an endpoint.
    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: String },

    /// JSON-RPC protocol-level error returned by the node.
    #[error("RPC error {}: {}", .0.code, .0.message)]
    Rpc(JsonRpcError),

    /// Provider quota exhausted or the local limiter refused admission.
    #[error("rate limit exceeded (provider: {provider}): {reason}")]
    RateLimited { provider: String, reason: String },

    /// Every configured endpoint is currently marked unhealthy.
    #[error("no healthy RPC endpoint available")]
    NoHealthyEndpoint,

    /// Deadline exceeded.
    #[error("request timed out after {ms}ms")]
    Timeout { ms: u64 },

    /// Payload could not be decoded.
    #[error("deserialization error: {0}")]
    Deserialization(String),

    /// Semantic or schema failure.
    #[error("validation error: {0}")]
    Validation(String),

    /// Configuration rejected at construction time.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// On-ledger execution failure.
    #[error("transaction failed ({code}): {message}")]
    Transaction {
        code: String,
        message: String,
        logs: Vec<String>,
    },

    /// The retry executor ran out of attempts.
    #[error("giving up after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: Box<RelayError> },

    /// The component was shut down while the request was pending.
    #[error("{component} shut down")]
    Shutdown { component: &'static str },

    #[error("{0}")]
    Other(String),
}

impl RelayError {
    /// Build a timeout error from a duration.
    pub fn timeout(after: std::time::Duration) -> Self {
        Self::Timeout {
            ms: after.as_millis() as u64,
        }
    }

    /// The innermost error, looking through `RetriesExhausted`.
    pub fn root(&self) -> &RelayError {
        match self {
            Self::RetriesExhausted { last, .. } => last.root(),
            other => other,
        }
    }

    /// Classify into the coarse taxonomy.
    pub fn kind(&self) -> ErrorKind {
        match self.root() {
            e if e.is_rate_limit() => ErrorKind::RateLimit,
            Self::Network(_) | Self::NoHealthyEndpoint | Self::Http { .. } => ErrorKind::Network,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::Deserialization(_) => ErrorKind::Deserialization,
            Self::Validation(_) | Self::Config(_) => ErrorKind::Validation,
            Self::Transaction { .. } => ErrorKind::Transaction,
            _ => ErrorKind::Unknown,
        }
    }

    /// Returns `true` if the provider signalled throttling.
    pub fn is_rate_limit(&self) -> bool {
        match self {
            Self::RateLimited { .. } => true,
            Self::Http { status, .. } => *status == 429,
            Self::Rpc(err) => err.is_throttling(),
            Self::RetriesExhausted { last, .. } => last.is_rate_limit(),
            _ => false,
        }
    }

    /// Returns `true` if this error is transient and worth another attempt.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Network(_) | Self::Timeout { .. } | Self::RateLimited { .. } => true,
            Self::Http { status, .. } => *status == 429 || (500..600).contains(status),
            Self::Rpc(_) => self.is_rate_limit(),
            _ => false,
        }
    }

    /// Returns `true` if this is a definitive on-ledger failure.
    pub fn is_execution_error(&self) -> bool {
        matches!(self.root(), Self::Transaction { .. })
    }

    /// Normalize into the shape the consuming layer renders.
    pub fn to_user_facing(&self) -> UserFacingError {
        UserFacingError::from(self)
    }
}

impl From<serde_json::Error> for RelayError {
    fn from(err: serde_json::Error) -> Self {
        Self::Deserialization(err.to_string())
    }
}

/// Uniform error shape: `{kind, message, suggestion, recoverable, technical_details}`.
#[derive(Debug, Clone, Serialize)]
pub struct UserFacingError {
    pub kind: ErrorKind,
    pub message: String,
    pub suggestion: String,
    pub recoverable: bool,
    pub technical_details: BTreeMap<String, String>,
    #[serde(skip)]
    pub source: Option<RelayError>,
}

impl std::fmt::Display for UserFacingError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.message, self.kind)
    }
}

impl std::error::Error for UserFacingError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_ref()
            .map(|e| e as &(dyn std::error::Error + 'static))
    }
}

impl From<&RelayError> for UserFacingError {
    fn from(err: &RelayError) -> Self {
        let kind = err.kind();
        let (message, suggestion, recoverable) = match kind {
            ErrorKind::Timeout => (
                "Request timed out. Please try again.",
                "Check your internet connection and try again.",
                true,
            ),
            ErrorKind::Network => (
                "Network connection failed.",
                "Check your internet connection and try again.",
                true,
            ),
            ErrorKind::RateLimit => (
                "Too many requests. Please wait a moment.",
                "Wait a few seconds before trying again.",
                true,
            ),
            ErrorKind::Deserialization => (
                "Received data could not be read.",
                "The on-chain data may be malformed. Try again later or contact support.",
                false,
            ),
            ErrorKind::Validation => (
                "The data failed validation.",
                "Check the input and try again.",
                false,
            ),
            ErrorKind::Transaction => (
                "The transaction was rejected by the network.",
                "Review the transaction details and retry.",
                true,
            ),
            ErrorKind::Unknown => (
                "An unexpected error occurred.",
                "Please try again or contact support if the problem persists.",
                true,
            ),
        };

        let mut technical_details = BTreeMap::new();
        technical_details.insert("original_error".to_string(), err.root().to_string());
        if let RelayError::RetriesExhausted { attempts, .. } = err {
            technical_details.insert("attempts".to_string(), attempts.to_string());
        }
        match err.root() {
            RelayError::RateLimited { provider, .. } => {
                technical_details.insert("provider".to_string(), provider.clone());
            }
            RelayError::Transaction { code, .. } => {
                technical_details.insert("code".to_string(), code.clone());
            }
            RelayError::Rpc(rpc) => {
                technical_details.insert("code".to_string(), rpc.code.to_string());
            }
            _ => {}
        }

        Self {
            kind,
            message: message.to_string(),
            suggestion: suggestion.to_string(),
            recoverable,
            technical_details,
            source: Some(err.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_429_is_rate_limit_and_retryable() {
        let err = RelayError::Http {
            status: 429,
            body: "slow down".into(),
        };
        assert!(err.is_rate_limit());
        assert!(err.is_retryable());
        assert_eq!(err.kind(), ErrorKind::RateLimit);
    }

    #[test]
    fn server_errors_are_retryable_client_errors_are_not() {
        let bad_gateway = RelayError::Http { status: 502, body: String::new() };
        let not_found = RelayError::Http { status: 404, body: String::new() };
        assert!(bad_gateway.is_retryable());
        assert!(!not_found.is_retryable());
    }

    #[test]
    fn rpc_rate_limit_detected_by_message() {
        let err = RelayError::Rpc(JsonRpcError {
            code: -32000,
            message: "Too Many Requests for this key".into(),
            data: None,
        });
        assert!(err.is_rate_limit());
        assert!(err.is_retryable());
    }

    #[test]
    fn validation_and_transaction_errors_not_retryable() {
        assert!(!RelayError::Validation("bad".into()).is_retryable());
        let tx = RelayError::Transaction {
            code: "0x1".into(),
            message: "insufficient funds".into(),
            logs: vec![],
        };
        assert!(!tx.is_retryable());
        assert!(tx.is_execution_error());
    }

    #[test]
    fn exhausted_retries_keep_root_classification() {
        let err = RelayError::RetriesExhausted {
            attempts: 4,
            last: Box::new(RelayError::Timeout { ms: 500 }),
        };
        assert_eq!(err.kind(), ErrorKind::Timeout);

        let facing = err.to_user_facing();
        assert!(facing.recoverable);
        assert_eq!(facing.technical_details["attempts"], "4");
        assert!(facing.technical_details["original_error"].contains("500ms"));
        assert!(facing.source.is_some());
    }

    #[test]
    fn deserialization_is_not_recoverable() {
        let facing = RelayError::Deserialization("truncated".into()).to_user_facing();
        assert_eq!(facing.kind, ErrorKind::Deserialization);
        assert!(!facing.recoverable);
    }
}
