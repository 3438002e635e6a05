//! Read-side types: decoders, queries, pagination and fetch results.

use base64::Engine as _;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use chainrelay_core::error::RelayError;
use chainrelay_core::policy::RequestPriority;
use chainrelay_core::request::Commitment;

use crate::cache::FetchSource;

/// Turns raw account bytes into a domain record.
pub trait RecordDecoder: Send + Sync {
    type Record;

    fn decode(&self, bytes: &[u8]) -> Result<Self::Record, RelayError>;
}

/// Options for one call through the pipeline.
#[derive(Debug, Clone)]
pub struct CallOptions {
    pub priority: RequestPriority,
    /// Overrides the configured default.
    pub commitment: Option<Commitment>,
    /// Tried first when healthy.
    pub preferred_endpoint: Option<String>,
    /// Serve and store results in the response cache (reads only).
    pub use_cache: bool,
}

impl Default for CallOptions {
    fn default() -> Self {
        Self {
            priority: RequestPriority::Medium,
            commitment: None,
            preferred_endpoint: None,
            use_cache: true,
        }
    }
}

impl CallOptions {
    pub fn with_priority(mut self, priority: RequestPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_commitment(mut self, commitment: Commitment) -> Self {
        self.commitment = Some(commitment);
        self
    }

    pub fn no_cache(mut self) -> Self {
        self.use_cache = false;
        self
    }
}

/// Accounts owned by one program, optionally filtered server-side.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgramQuery {
    pub program_id: String,
    /// Raw `getProgramAccounts` filters (`memcmp`, `dataSize`).
    #[serde(default)]
    pub filters: Vec<Value>,
}

impl ProgramQuery {
    pub fn new(program_id: impl Into<String>) -> Self {
        Self {
            program_id: program_id.into(),
            filters: Vec::new(),
        }
    }

    pub fn with_data_size(mut self, size: u64) -> Self {
        self.filters.push(json!({ "dataSize": size }));
        self
    }

    pub fn with_memcmp(mut self, offset: u64, bytes_b58: impl Into<String>) -> Self {
        self.filters
            .push(json!({ "memcmp": { "offset": offset, "bytes": bytes_b58.into() } }));
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pagination {
    /// 1-based.
    pub page: usize,
    pub page_size: usize,
}

impl Default for Pagination {
    fn default() -> Self {
        Self { page: 1, page_size: 20 }
    }
}

impl Pagination {
    pub fn new(page: usize, page_size: usize) -> Self {
        Self { page, page_size }
    }

    pub fn validate(&self) -> Result<(), RelayError> {
        if self.page == 0 || self.page_size == 0 {
            return Err(RelayError::Validation("page and page size must be >= 1".into()));
        }
        Ok(())
    }
}

/// A decoded record and the address it was read from.
#[derive(Debug, Clone, PartialEq)]
pub struct Keyed<R> {
    pub address: String,
    pub record: R,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Page<R> {
    pub items: Vec<R>,
    pub page: usize,
    pub page_size: usize,
    /// Decodable records across all pages.
    pub total: usize,
    pub has_next: bool,
    /// Accounts dropped because they failed to decode.
    pub skipped: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FetchResult<T> {
    pub data: T,
    pub source: FetchSource,
}

impl<T> FetchResult<T> {
    pub fn is_stale(&self) -> bool {
        self.source == FetchSource::StaleCache
    }
}

/// Decode the base64 `data` field of an account object.
pub(crate) fn account_bytes(account: &Value) -> Result<Vec<u8>, RelayError> {
    let encoded = match &account["data"] {
        Value::Array(parts) => parts.first().and_then(Value::as_str),
        Value::String(s) => Some(s.as_str()),
        _ => None,
    }
    .ok_or_else(|| RelayError::Deserialization("account has no base64 data".into()))?;
    base64::engine::general_purpose::STANDARD
        .decode(encoded)
        .map_err(|e| RelayError::Deserialization(format!("invalid base64 account data: {e}")))
}

/// Decode a `getProgramAccounts` result and cut out one page. Records that
/// fail to decode are skipped and counted.
pub(crate) fn paginate<D: RecordDecoder>(
    decoder: &D,
    raw: &Value,
    pagination: Pagination,
) -> Result<Page<Keyed<D::Record>>, RelayError> {
    let accounts = raw
        .as_array()
        .ok_or_else(|| RelayError::Deserialization("getProgramAccounts result is not an array".into()))?;

    let mut skipped = 0;
    let mut decoded = Vec::with_capacity(accounts.len());
    for entry in accounts {
        let address = entry["pubkey"].as_str().unwrap_or_default().to_string();
        match account_bytes(&entry["account"]).and_then(|bytes| decoder.decode(&bytes)) {
            Ok(record) => decoded.push(Keyed { address, record }),
            Err(err) => {
                skipped += 1;
                tracing::debug!(%address, error = %err, "skipping undecodable account");
            }
        }
    }
    decoded.sort_by(|a, b| a.address.cmp(&b.address));

    let total = decoded.len();
    let start = (pagination.page - 1).saturating_mul(pagination.page_size);
    let items: Vec<_> = decoded
        .into_iter()
        .skip(start)
        .take(pagination.page_size)
        .collect();
    Ok(Page {
        has_next: start + items.len() < total,
        items,
        page: pagination.page,
        page_size: pagination.page_size,
        total,
        skipped,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Utf8;

    impl RecordDecoder for Utf8 {
        type Record = String;

        fn decode(&self, bytes: &[u8]) -> Result<String, RelayError> {
            String::from_utf8(bytes.to_vec()).map_err(|e| RelayError::Validation(e.to_string()))
        }
    }

    fn account(pubkey: &str, bytes: &[u8]) -> Value {
        let data = base64::engine::general_purpose::STANDARD.encode(bytes);
        json!({ "pubkey": pubkey, "account": { "data": [data, "base64"], "lamports": 1 } })
    }

    #[test]
    fn pages_and_skips() {
        let raw = json!([
            account("C", b"charlie"),
            account("A", b"alpha"),
            account("X", &[0xff, 0xfe]),
            account("B", b"bravo"),
        ]);
        let page = paginate(&Utf8, &raw, Pagination::new(1, 2)).unwrap();
        assert_eq!(page.total, 3);
        assert_eq!(page.skipped, 1);
        assert!(page.has_next);
        let names: Vec<_> = page.items.iter().map(|k| k.record.as_str()).collect();
        assert_eq!(names, ["alpha", "bravo"]);

        let last = paginate(&Utf8, &raw, Pagination::new(2, 2)).unwrap();
        assert_eq!(last.items.len(), 1);
        assert_eq!(last.items[0].address, "C");
        assert!(!last.has_next);

        let past_end = paginate(&Utf8, &raw, Pagination::new(5, 2)).unwrap();
        assert!(past_end.items.is_empty());
        assert!(!past_end.has_next);
    }

    #[test]
    fn non_array_result_is_rejected() {
        let err = paginate(&Utf8, &json!({"oops": true}), Pagination::default()).unwrap_err();
        assert!(matches!(err, RelayError::Deserialization(_)));
    }

    #[test]
    fn missing_data_is_deserialization_error() {
        assert!(account_bytes(&json!({ "lamports": 5 })).is_err());
        assert_eq!(account_bytes(&json!({ "data": ["aGk=", "base64"] })).unwrap(), b"hi");
    }

    #[test]
    fn zero_page_rejected() {
        assert!(Pagination::new(0, 10).validate().is_err());
    }
}
