//! [`TransactionBackend`] over the JSON-RPC pipeline.

use std::sync::Arc;

use async_trait::async_trait;
use base64::Engine as _;
use serde_json::{json, Value};

use chainrelay_core::error::RelayError;
use chainrelay_core::policy::RequestPriority;
use chainrelay_core::request::Commitment;
use chainrelay_tx::{SignatureStatus, TransactionBackend, TransactionDetails, TransactionError};

use crate::fetch::CallOptions;
use crate::pipeline::RpcPipeline;

/// Preflight simulation failed; the node attaches the program logs.
const PREFLIGHT_FAILURE: i64 = -32002;

/// `sendTransaction`, `getSignatureStatuses` and `getTransaction` through
/// the shared pipeline. Writes are never cached.
pub struct RpcTransactionBackend {
    pipeline: Arc<RpcPipeline>,
}

impl RpcTransactionBackend {
    pub fn new(pipeline: Arc<RpcPipeline>) -> Self {
        Self { pipeline }
    }

    async fn call(&self, method: &str, params: Vec<Value>, priority: RequestPriority) -> Result<Value, RelayError> {
        let options = CallOptions::default().with_priority(priority).no_cache();
        let request = self.pipeline.request(method, params, &options);
        self.pipeline.call(request, &options).await
    }
}

#[async_trait]
impl TransactionBackend for RpcTransactionBackend {
    async fn submit(&self, payload: &[u8]) -> Result<String, RelayError> {
        let encoded = base64::engine::general_purpose::STANDARD.encode(payload);
        let params = vec![
            json!(encoded),
            json!({ "encoding": "base64", "skipPreflight": false, "maxRetries": 0 }),
        ];
        let result = self
            .call("sendTransaction", params, RequestPriority::High)
            .await
            .map_err(preflight_to_transaction_error)?;
        result
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| RelayError::Deserialization("sendTransaction returned no signature".into()))
    }

    async fn status(&self, signature: &str) -> Result<Option<SignatureStatus>, RelayError> {
        let params = vec![json!([signature]), json!({ "searchTransactionHistory": true })];
        let result = self
            .call("getSignatureStatuses", params, RequestPriority::High)
            .await?;
        Ok(parse_signature_status(&result))
    }

    async fn details(&self, signature: &str) -> Result<Option<TransactionDetails>, RelayError> {
        let params = vec![
            json!(signature),
            json!({ "encoding": "json", "commitment": "confirmed", "maxSupportedTransactionVersion": 0 }),
        ];
        let result = self.call("getTransaction", params, RequestPriority::Low).await?;
        if result.is_null() {
            return Ok(None);
        }
        Ok(Some(TransactionDetails {
            fee: result["meta"]["fee"].as_u64(),
            block_time: result["blockTime"].as_i64(),
            compute_units: result["meta"]["computeUnitsConsumed"].as_u64(),
        }))
    }
}

fn preflight_to_transaction_error(err: RelayError) -> RelayError {
    match &err {
        RelayError::Rpc(rpc) if rpc.code == PREFLIGHT_FAILURE => {
            let data = rpc.data.clone().unwrap_or(Value::Null);
            let logs = data["logs"]
                .as_array()
                .map(|l| l.iter().filter_map(|s| s.as_str().map(str::to_string)).collect())
                .unwrap_or_default();
            let code = error_code(&data["err"]).unwrap_or_else(|| "PREFLIGHT_FAILURE".to_string());
            RelayError::Transaction {
                code,
                message: rpc.message.clone(),
                logs,
            }
        }
        _ => err,
    }
}

/// `"AccountNotFound"` or `{"InstructionError": [...]}` → the variant name.
fn error_code(err: &Value) -> Option<String> {
    match err {
        Value::String(s) => Some(s.clone()),
        Value::Object(map) => map.keys().next().cloned(),
        _ => None,
    }
}

/// Parse the `getSignatureStatuses` result for a single signature.
pub(crate) fn parse_signature_status(result: &Value) -> Option<SignatureStatus> {
    let status = result["value"].get(0).filter(|s| !s.is_null())?;
    let err = match &status["err"] {
        Value::Null => None,
        other => Some(TransactionError::new(
            error_code(other).unwrap_or_else(|| "UNKNOWN_ERROR".to_string()),
            other.to_string(),
        )),
    };
    Some(SignatureStatus {
        slot: status["slot"].as_u64().unwrap_or_default(),
        confirmation: status["confirmationStatus"].as_str().and_then(Commitment::parse),
        err,
    })
}
