//! The JSON-RPC envelope the HTTP transport speaks, and the commitment
//! (consistency) level reads and confirmations target.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Error codes providers use to signal throttling.
const THROTTLING_CODES: &[i64] = &[429, -32005, -32429];

/// Outbound call envelope. Borrows the method and params for the duration of
/// one POST; ids are per-client counters, never strings.
#[derive(Debug, Serialize)]
pub struct RpcCall<'a> {
    jsonrpc: &'static str,
    pub id: u64,
    pub method: &'a str,
    pub params: &'a [Value],
}

impl<'a> RpcCall<'a> {
    pub fn new(id: u64, method: &'a str, params: &'a [Value]) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            method,
            params,
        }
    }
}

/// The `error` member of a reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl JsonRpcError {
    /// Throttling reported in-band, either by code or by message text.
    pub fn is_throttling(&self) -> bool {
        if THROTTLING_CODES.contains(&self.code) {
            return true;
        }
        let msg = self.message.to_ascii_lowercase();
        msg.contains("rate limit") || msg.contains("too many requests")
    }
}

impl std::fmt::Display for JsonRpcError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "rpc error {}: {}", self.code, self.message)
    }
}

/// Inbound reply. The id is not read back: one POST carries one call.
#[derive(Debug, Deserialize)]
pub struct RpcReply {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<JsonRpcError>,
}

impl RpcReply {
    /// The result, or the node's error object. A missing result reads as null.
    pub fn into_result(self) -> Result<Value, JsonRpcError> {
        match self.error {
            Some(err) => Err(err),
            None => Ok(self.result.unwrap_or(Value::Null)),
        }
    }
}

/// Ledger consistency level a read or confirmation targets.
///
/// Ordered by strength: `Processed < Confirmed < Finalized`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Commitment {
    Processed,
    #[default]
    Confirmed,
    Finalized,
}

impl Commitment {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Processed => "processed",
            Self::Confirmed => "confirmed",
            Self::Finalized => "finalized",
        }
    }

    /// Parse the `confirmationStatus` string a node reports.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "processed" => Some(Self::Processed),
            "confirmed" => Some(Self::Confirmed),
            "finalized" => Some(Self::Finalized),
            _ => None,
        }
    }
}

impl std::fmt::Display for Commitment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn call_envelope_shape() {
        let params = vec![json!("Vote111111111111111111111111111111111111111")];
        let body = serde_json::to_value(RpcCall::new(7, "getBalance", &params)).unwrap();
        assert_eq!(
            body,
            json!({
                "jsonrpc": "2.0",
                "id": 7,
                "method": "getBalance",
                "params": ["Vote111111111111111111111111111111111111111"],
            })
        );
    }

    #[test]
    fn reply_error_wins_over_result() {
        let reply: RpcReply = serde_json::from_str(
            r#"{"jsonrpc":"2.0","id":"abc","error":{"code":-32002,"message":"Transaction simulation failed"}}"#,
        )
        .unwrap();
        let err = reply.into_result().unwrap_err();
        assert_eq!(err.code, -32002);
        assert!(err.data.is_none());
        assert!(!err.is_throttling());
    }

    #[test]
    fn null_result_is_ok() {
        let reply: RpcReply = serde_json::from_str(r#"{"jsonrpc":"2.0","id":3,"result":null}"#).unwrap();
        assert_eq!(reply.into_result().unwrap(), Value::Null);
    }

    #[test]
    fn throttling_by_code_or_message() {
        let by_code = JsonRpcError { code: -32005, message: "busy".into(), data: None };
        let by_text = JsonRpcError { code: -32000, message: "Too Many Requests for this key".into(), data: None };
        assert!(by_code.is_throttling());
        assert!(by_text.is_throttling());
        assert_eq!(by_code.to_string(), "rpc error -32005: busy");
    }

    #[test]
    fn commitment_ordering_and_parse() {
        assert!(Commitment::Processed < Commitment::Confirmed);
        assert!(Commitment::Confirmed < Commitment::Finalized);
        assert_eq!(Commitment::parse("finalized"), Some(Commitment::Finalized));
        assert_eq!(Commitment::parse("recent"), None);
        assert_eq!(Commitment::default(), Commitment::Confirmed);
    }
}
