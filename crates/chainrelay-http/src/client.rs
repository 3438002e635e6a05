//! HTTP JSON-RPC client backed by `reqwest`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use chainrelay_core::endpoint::EndpointConfig;
use chainrelay_core::error::RelayError;
use chainrelay_core::request::{RpcCall, RpcReply};
use chainrelay_core::transport::{ClientFactory, RpcClient};

/// Configuration for `HttpRpcClient`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct HttpClientConfig {
    #[serde(with = "chainrelay_core::serde_ms", rename = "request-timeout-ms")]
    pub request_timeout: Duration,
    #[serde(with = "chainrelay_core::serde_ms", rename = "connect-timeout-ms")]
    pub connect_timeout: Duration,
    /// Extra headers sent with every request (API keys and the like).
    pub headers: HashMap<String, String>,
    pub user_agent: String,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            headers: HashMap::new(),
            user_agent: concat!("chainrelay/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

impl HttpClientConfig {
    fn build(&self) -> Result<reqwest::Client, RelayError> {
        let mut headers = reqwest::header::HeaderMap::new();
        for (name, value) in &self.headers {
            let name = reqwest::header::HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| RelayError::Config(format!("header name {name:?}: {e}")))?;
            let value = reqwest::header::HeaderValue::from_str(value)
                .map_err(|e| RelayError::Config(format!("header value for {name}: {e}")))?;
            headers.insert(name, value);
        }
        reqwest::Client::builder()
            .timeout(self.request_timeout)
            .connect_timeout(self.connect_timeout)
            .user_agent(self.user_agent.clone())
            .default_headers(headers)
            .build()
            .map_err(|e| RelayError::Config(format!("failed to build HTTP client: {e}")))
    }
}

/// One JSON-RPC endpoint over HTTP. Makes a single request per call.
pub struct HttpRpcClient {
    url: String,
    http: reqwest::Client,
    request_timeout: Duration,
    next_id: AtomicU64,
}

impl HttpRpcClient {
    pub fn new(url: impl Into<String>, config: &HttpClientConfig) -> Result<Self, RelayError> {
        Ok(Self {
            url: url.into(),
            http: config.build()?,
            request_timeout: config.request_timeout,
            next_id: AtomicU64::new(1),
        })
    }

    /// Share an existing `reqwest::Client` (and its connection pool).
    pub fn with_client(url: impl Into<String>, http: reqwest::Client, request_timeout: Duration) -> Self {
        Self {
            url: url.into(),
            http,
            request_timeout,
            next_id: AtomicU64::new(1),
        }
    }

    fn map_send_error(&self, err: reqwest::Error) -> RelayError {
        if err.is_timeout() {
            RelayError::timeout(self.request_timeout)
        } else {
            RelayError::Network(err.to_string())
        }
    }
}

#[async_trait]
impl RpcClient for HttpRpcClient {
    async fn call(&self, method: &str, params: Vec<Value>) -> Result<Value, RelayError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let req = RpcCall::new(id, method, &params);

        let resp = self
            .http
            .post(&self.url)
            .json(&req)
            .send()
            .await
            .map_err(|e| self.map_send_error(e))?;

        let status = resp.status().as_u16();
        let body = resp.text().await.map_err(|e| self.map_send_error(e))?;
        tracing::trace!(method, status, url = %self.url, "rpc response");
        parse_response(status, &body)
    }

    fn url(&self) -> &str {
        &self.url
    }
}

/// Map an HTTP status and body to the call result.
pub fn parse_response(status: u16, body: &str) -> Result<Value, RelayError> {
    if !(200..300).contains(&status) {
        return Err(RelayError::Http {
            status,
            body: truncate(body, 512),
        });
    }
    let reply: RpcReply = serde_json::from_str(body)
        .map_err(|e| RelayError::Deserialization(format!("invalid JSON-RPC response: {e}")))?;
    reply.into_result().map_err(RelayError::Rpc)
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}…", &s[..end])
}

/// Creates [`HttpRpcClient`] handles. All handles share one `reqwest::Client`.
pub struct HttpClientFactory {
    http: reqwest::Client,
    request_timeout: Duration,
}

impl HttpClientFactory {
    pub fn new(config: &HttpClientConfig) -> Result<Self, RelayError> {
        Ok(Self {
            http: config.build()?,
            request_timeout: config.request_timeout,
        })
    }
}

impl ClientFactory for HttpClientFactory {
    fn create(&self, endpoint: &EndpointConfig) -> Result<Arc<dyn RpcClient>, RelayError> {
        Ok(Arc::new(HttpRpcClient::with_client(
            endpoint.url.clone(),
            self.http.clone(),
            self.request_timeout,
        )))
    }
}
