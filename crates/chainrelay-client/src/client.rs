//! [`RelayClient`] — the single entry point applications use.

use std::sync::Arc;

use serde_json::{json, Value};
use tokio::sync::{broadcast, mpsc};

use chainrelay_core::endpoint::{EndpointConfig, EndpointRegistry, RegistryStats};
use chainrelay_core::error::RelayError;
use chainrelay_core::health::{HealthMonitor, HealthMonitorHandle};
use chainrelay_core::policy::{
    DedupStats, RateLimiter, RateLimiterStats, RequestDeduplicator, RetryExecutor,
};
use chainrelay_core::pool::{ConnectionPool, PoolStats};
use chainrelay_core::transport::{ClientFactory, HealthStatus};
use chainrelay_http::HttpClientFactory;
use chainrelay_tx::{
    CancelOutcome, TransactionBackend, TransactionConfig, TransactionEvent, TransactionId,
    TransactionManager, TransactionRecord, TxError,
};
use chainrelay_ws::{
    ConnectionEvent, ConnectionStatus, PubsubConnector, SubscriptionId, SubscriptionManager,
    SubscriptionSpec, SubscriptionUpdate,
};

use crate::backend::RpcTransactionBackend;
use crate::cache::{CacheStats, FetchSource, ResponseCache};
use crate::config::RelayConfig;
use crate::fetch::{account_bytes, paginate, CallOptions, FetchResult, Keyed, Page, Pagination, ProgramQuery, RecordDecoder};
use crate::pipeline::RpcPipeline;

/// Point-in-time counters from every component.
#[derive(Debug, Clone)]
pub struct RelayStats {
    pub endpoints: RegistryStats,
    pub pool: PoolStats,
    pub rate_limiter: RateLimiterStats,
    pub dedup: DedupStats,
    pub cache: CacheStats,
}

/// Assembles a [`RelayClient`], with optional injected collaborators.
pub struct RelayClientBuilder {
    config: RelayConfig,
    factory: Option<Arc<dyn ClientFactory>>,
    connector: Option<Arc<dyn PubsubConnector>>,
    backend: Option<Arc<dyn TransactionBackend>>,
}

impl RelayClientBuilder {
    pub fn new(config: RelayConfig) -> Self {
        Self {
            config,
            factory: None,
            connector: None,
            backend: None,
        }
    }

    /// Replace the default HTTP client factory.
    pub fn client_factory(mut self, factory: Arc<dyn ClientFactory>) -> Self {
        self.factory = Some(factory);
        self
    }

    /// Enables subscriptions.
    pub fn pubsub_connector(mut self, connector: Arc<dyn PubsubConnector>) -> Self {
        self.connector = Some(connector);
        self
    }

    /// Replace the default JSON-RPC transaction backend.
    pub fn transaction_backend(mut self, backend: Arc<dyn TransactionBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    /// Validate the configuration and start background tasks. Must be called
    /// inside a Tokio runtime.
    pub fn build(self) -> Result<RelayClient, RelayError> {
        let config = self.config;
        config.validate()?;

        let endpoints = config.resolved_endpoints();
        let registry = Arc::new(EndpointRegistry::new(endpoints, config.health.unhealthy_threshold)?);
        let factory: Arc<dyn ClientFactory> = match self.factory {
            Some(factory) => factory,
            None => Arc::new(HttpClientFactory::new(&config.http)?),
        };
        let pool = Arc::new(ConnectionPool::new(registry.clone(), factory.clone()));

        let pipeline = Arc::new(RpcPipeline::new(
            pool,
            RateLimiter::new(config.resolved_rate_limiter()),
            RequestDeduplicator::new(config.dedup.clone()),
            RetryExecutor::new(config.retry.clone()),
            config.request_timeout,
            config.queue_timeout,
            config.commitment,
        ));

        let health = Arc::new(HealthMonitor::new(registry.clone(), factory, config.health.clone()));
        let health_task = config
            .background_health_checks
            .then(|| health.clone().spawn());

        let subscriptions = self
            .connector
            .map(|connector| SubscriptionManager::new(registry.clone(), connector, config.websocket.clone()));

        let backend: Arc<dyn TransactionBackend> = match self.backend {
            Some(backend) => backend,
            None => Arc::new(RpcTransactionBackend::new(pipeline.clone())),
        };
        let transactions = TransactionManager::new(backend, config.transactions.clone())
            .map_err(|e| RelayError::Config(e.to_string()))?;

        tracing::info!(
            endpoints = registry.len(),
            primary = ?registry.primary_endpoint(),
            subscriptions = subscriptions.is_some(),
            "relay client ready"
        );

        Ok(RelayClient {
            cache: ResponseCache::new(config.cache.clone()),
            config,
            registry,
            pipeline,
            health,
            _health_task: health_task,
            subscriptions,
            transactions,
        })
    }
}

/// Pooled, rate-limited, deduplicated, retried RPC access plus subscriptions
/// and transaction tracking.
pub struct RelayClient {
    config: RelayConfig,
    registry: Arc<EndpointRegistry>,
    pipeline: Arc<RpcPipeline>,
    cache: ResponseCache,
    health: Arc<HealthMonitor>,
    _health_task: Option<HealthMonitorHandle>,
    subscriptions: Option<SubscriptionManager>,
    transactions: TransactionManager,
}

impl RelayClient {
    /// Build with the default HTTP transport and no subscriptions.
    pub fn new(config: RelayConfig) -> Result<Self, RelayError> {
        RelayClientBuilder::new(config).build()
    }

    pub fn builder(config: RelayConfig) -> RelayClientBuilder {
        RelayClientBuilder::new(config)
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<EndpointRegistry> {
        &self.registry
    }

    pub fn pipeline(&self) -> &Arc<RpcPipeline> {
        &self.pipeline
    }

    // ── reads ────────────────────────────────────────────────────────────────

    /// One JSON-RPC call through the full pipeline. Not cached.
    pub async fn call(&self, method: &str, params: Vec<Value>, options: &CallOptions) -> Result<Value, RelayError> {
        let request = self.pipeline.request(method, params, options);
        self.pipeline.call(request, options).await
    }

    /// Like [`call`](Self::call) but served from, and stored in, the response
    /// cache. A failed network read falls back to an expired entry.
    pub async fn cached_call(
        &self,
        method: &str,
        params: Vec<Value>,
        options: &CallOptions,
    ) -> Result<FetchResult<Value>, RelayError> {
        let request = self.pipeline.request(method, params, options);
        if !options.use_cache {
            let data = self.pipeline.call(request, options).await?;
            return Ok(FetchResult {
                data,
                source: FetchSource::Network,
            });
        }

        let key = request.fingerprint();
        if let Some(data) = self.cache.get_fresh(&key) {
            return Ok(FetchResult {
                data,
                source: FetchSource::Cache,
            });
        }
        match self.pipeline.call(request, options).await {
            Ok(data) => {
                self.cache.insert(key, data.clone());
                Ok(FetchResult {
                    data,
                    source: FetchSource::Network,
                })
            }
            Err(err) => match self.cache.get_stale(&key) {
                Some(data) => {
                    tracing::warn!(%method, error = %err, "serving stale cached result");
                    Ok(FetchResult {
                        data,
                        source: FetchSource::StaleCache,
                    })
                }
                None => Err(err),
            },
        }
    }

    /// One page of decoded program accounts.
    pub async fn fetch_page<D: RecordDecoder>(
        &self,
        decoder: &D,
        query: &ProgramQuery,
        pagination: Pagination,
        options: &CallOptions,
    ) -> Result<FetchResult<Page<Keyed<D::Record>>>, RelayError> {
        pagination.validate()?;
        let mut config = json!({
            "encoding": "base64",
            "commitment": self.pipeline.commitment(options).as_str(),
        });
        if !query.filters.is_empty() {
            config["filters"] = Value::Array(query.filters.clone());
        }
        let raw = self
            .cached_call("getProgramAccounts", vec![json!(query.program_id), config], options)
            .await?;
        let page = paginate(decoder, &raw.data, pagination)?;
        tracing::debug!(
            program = %query.program_id,
            total = page.total,
            skipped = page.skipped,
            source = ?raw.source,
            "fetched program accounts"
        );
        Ok(FetchResult {
            data: page,
            source: raw.source,
        })
    }

    /// One decoded account; `None` if it does not exist.
    pub async fn fetch_one<D: RecordDecoder>(
        &self,
        decoder: &D,
        address: &str,
        options: &CallOptions,
    ) -> Result<FetchResult<Option<D::Record>>, RelayError> {
        let config = json!({
            "encoding": "base64",
            "commitment": self.pipeline.commitment(options).as_str(),
        });
        let raw = self
            .cached_call("getAccountInfo", vec![json!(address), config], options)
            .await?;
        let account = &raw.data["value"];
        let data = if account.is_null() {
            None
        } else {
            Some(decoder.decode(&account_bytes(account)?)?)
        };
        Ok(FetchResult {
            data,
            source: raw.source,
        })
    }

    pub fn invalidate_cache(&self) {
        self.cache.clear();
    }

    // ── endpoints ────────────────────────────────────────────────────────────

    pub fn add_endpoint(&self, endpoint: EndpointConfig) -> Result<(), RelayError> {
        let mut endpoints = [endpoint];
        chainrelay_providers::tag_endpoints(&mut endpoints);
        let [endpoint] = endpoints;
        endpoint.validate()?;
        self.registry.add_endpoint(endpoint)
    }

    pub fn remove_endpoint(&self, url: &str) -> bool {
        self.pipeline.pool().remove_endpoint(url)
    }

    pub fn health(&self) -> HealthStatus {
        self.registry.health()
    }

    /// Probe every endpoint now.
    pub async fn force_health_check(&self) -> HealthStatus {
        self.health.force_health_check().await
    }

    pub fn stats(&self) -> RelayStats {
        RelayStats {
            endpoints: self.registry.stats(),
            pool: self.pipeline.pool().stats(),
            rate_limiter: self.pipeline.limiter().stats(),
            dedup: self.pipeline.dedup().stats(),
            cache: self.cache.stats(),
        }
    }

    pub fn reset_stats(&self) {
        self.registry.reset_stats();
        self.pipeline.pool().reset_stats();
    }

    // ── subscriptions ────────────────────────────────────────────────────────

    fn subscriptions(&self) -> Result<&SubscriptionManager, RelayError> {
        self.subscriptions
            .as_ref()
            .ok_or_else(|| RelayError::Config("no pubsub connector configured".into()))
    }

    /// Register a subscription, starting the connection on first use.
    pub async fn subscribe(
        &self,
        spec: SubscriptionSpec,
    ) -> Result<(SubscriptionId, mpsc::Receiver<SubscriptionUpdate>), RelayError> {
        let manager = self.subscriptions()?;
        manager.start();
        manager.subscribe(spec).await
    }

    pub async fn unsubscribe(&self, id: SubscriptionId) -> Result<bool, RelayError> {
        Ok(self.subscriptions()?.unsubscribe(id).await)
    }

    pub fn connection_events(&self) -> Result<broadcast::Receiver<ConnectionEvent>, RelayError> {
        Ok(self.subscriptions()?.events())
    }

    pub fn connection_status(&self) -> Result<ConnectionStatus, RelayError> {
        Ok(self.subscriptions()?.status())
    }

    pub fn subscription_manager(&self) -> Option<&SubscriptionManager> {
        self.subscriptions.as_ref()
    }

    // ── transactions ─────────────────────────────────────────────────────────

    /// Start tracking a transaction with the configured defaults.
    pub fn create_transaction(&self, kind: &str, config: Option<TransactionConfig>) -> Result<TransactionId, TxError> {
        let config = config.unwrap_or_else(|| self.transactions.defaults());
        self.transactions.create_transaction(kind, config)
    }

    pub async fn submit_transaction(&self, id: TransactionId, payload: &[u8]) -> Result<String, TxError> {
        self.transactions.submit_transaction(id, payload).await
    }

    pub async fn retry_transaction(&self, id: TransactionId, payload: &[u8]) -> Result<String, TxError> {
        self.transactions.retry_transaction(id, payload).await
    }

    pub fn cancel_transaction(&self, id: TransactionId) -> Result<CancelOutcome, TxError> {
        self.transactions.cancel_transaction(id)
    }

    pub fn transaction(&self, id: TransactionId) -> Option<TransactionRecord> {
        self.transactions.transaction(id)
    }

    pub fn transaction_events(&self) -> broadcast::Receiver<TransactionEvent> {
        self.transactions.events()
    }

    pub fn transactions(&self) -> &TransactionManager {
        &self.transactions
    }

    /// Reject queued requests and stop reconnecting.
    pub async fn shutdown(&self) {
        self.pipeline.limiter().shutdown();
        self.pipeline.dedup().clear();
        if let Some(manager) = &self.subscriptions {
            manager.disconnect().await;
        }
        tracing::info!("relay client shut down");
    }
}
