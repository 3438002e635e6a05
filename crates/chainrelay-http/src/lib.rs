//! chainrelay-http — `reqwest`-backed [`RpcClient`](chainrelay_core::RpcClient).
//!
//! The pool creates one [`HttpRpcClient`] per handle through
//! [`HttpClientFactory`]. Retry, rate limiting and failover live in the
//! policy layer above, so this client makes exactly one HTTP request per call.

pub mod client;

pub use client::{HttpClientConfig, HttpClientFactory, HttpRpcClient};
