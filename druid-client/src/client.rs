//! Client facade: issue queries against one broker and stream their results

use druid_core::{DruidError, DruidResult, Query, QueryFailure};
use futures::{StreamExt, TryStreamExt};
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::ClientConfig;
use crate::connection::{body_error, request_error, ConnectionPool};
use crate::decoder::{ResultRows, RowStream};
use crate::encoder::QueryEncoder;
use crate::metrics::ClientMetrics;

/// Response header carrying the id the broker assigned to a query
pub const QUERY_ID_HEADER: &str = "X-Druid-Query-Id";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PoolOwnership {
    /// Created by this client and released on close
    Owned,
    /// Supplied by the caller, who keeps responsibility for it
    Borrowed,
}

/// Query client bound to a single broker.
///
/// A client is either the sole owner of its connection pool, created with
/// [`DruidClient::create`], or borrows a pool the caller shares between
/// clients via [`DruidClient::create_shared`]. Queries may be issued
/// concurrently from several tasks through a shared reference.
pub struct DruidClient {
    config: ClientConfig,
    pool: ConnectionPool,
    ownership: PoolOwnership,
    encoder: QueryEncoder,
    metrics: Arc<ClientMetrics>,
    closed: AtomicBool,
}

impl DruidClient {
    /// Connect to `host` (`host:port`) with a connection pool owned by the
    /// client and default HTTP settings.
    pub async fn create<S: Into<String>>(host: S) -> DruidResult<Self> {
        Self::create_with_config(ClientConfig::for_broker(host)).await
    }

    /// Connect with explicit settings. The broker address must resolve.
    pub async fn create_with_config(config: ClientConfig) -> DruidResult<Self> {
        config.validate()?;
        resolve_broker(&config).await?;

        let pool = ConnectionPool::new(&config.http)?;
        info!(broker = %config.broker, "Created Druid client");

        Ok(Self::with_pool(config, pool, PoolOwnership::Owned))
    }

    /// Client for `host` that issues requests through a pool owned by the
    /// caller. Closing this client leaves the pool open.
    pub fn create_shared<S: Into<String>>(host: S, pool: ConnectionPool) -> DruidResult<Self> {
        let config = ClientConfig {
            http: pool.config().clone(),
            ..ClientConfig::for_broker(host)
        };
        config.validate()?;

        if pool.is_closed() {
            return Err(DruidError::ClientClosed);
        }

        debug!(broker = %config.broker, "Created Druid client on shared connection pool");
        Ok(Self::with_pool(config, pool, PoolOwnership::Borrowed))
    }

    fn with_pool(config: ClientConfig, pool: ConnectionPool, ownership: PoolOwnership) -> Self {
        Self {
            config,
            pool,
            ownership,
            encoder: QueryEncoder::new(),
            metrics: Arc::new(ClientMetrics::new()),
            closed: AtomicBool::new(false),
        }
    }

    /// Run a query and stream its results as rows.
    ///
    /// Returns once the broker has accepted the query and sent response
    /// headers. Rows are decoded as the caller polls the returned stream;
    /// dropping it abandons the rest of the response.
    pub async fn execute(&self, query: &Query) -> DruidResult<ResultRows> {
        let elements = self.execute_typed::<Value>(query).await?;
        Ok(ResultRows::new(elements))
    }

    /// Run a query given as a JSON object
    pub async fn execute_value(&self, query: Value) -> DruidResult<ResultRows> {
        let query = Query::from_value(query)?;
        self.execute(&query).await
    }

    /// Run a query and decode each top-level response element as `T`
    pub async fn execute_typed<T: DeserializeOwned>(
        &self,
        query: &Query,
    ) -> DruidResult<RowStream<T>> {
        if self.is_closed() {
            return Err(DruidError::ClientClosed);
        }
        let http = self.pool.http_client()?;

        let encoded = self.encoder.encode(query).map_err(|e| {
            self.metrics.record_error();
            e
        })?;

        let permit = self.pool.acquire().await?;

        self.metrics.record_query();
        debug!(
            query_id = %encoded.query_id,
            query_type = query.name(),
            data_source = query.data_source(),
            broker = %self.config.broker,
            "Issuing query"
        );

        let response = http
            .post(self.config.query_url())
            .header(CONTENT_TYPE, QueryEncoder::CONTENT_TYPE)
            .header(ACCEPT, QueryEncoder::CONTENT_TYPE)
            .body(encoded.body)
            .send()
            .await
            .map_err(|e| {
                self.metrics.record_error();
                request_error(e)
            })?;

        let status = response.status();
        if !status.is_success() {
            self.metrics.record_error();
            let body = response.text().await.unwrap_or_default();
            let failure = QueryFailure::from_response(status.as_u16(), &body);
            warn!(
                query_id = %encoded.query_id,
                status = status.as_u16(),
                error = failure.message(),
                "Broker rejected query"
            );
            return Err(DruidError::Query(failure));
        }

        let query_id = response
            .headers()
            .get(QUERY_ID_HEADER)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string)
            .unwrap_or(encoded.query_id);

        let body = response.bytes_stream().map_err(body_error).boxed();
        Ok(RowStream::new(body, query_id, self.metrics.clone()).with_permit(permit))
    }

    /// Stop issuing queries and, when the pool is owned, release it.
    /// Calling this more than once has no further effect.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        match self.ownership {
            PoolOwnership::Owned => {
                self.pool.close();
                info!(broker = %self.config.broker, "Closed Druid client");
            }
            PoolOwnership::Borrowed => {
                debug!(broker = %self.config.broker, "Closed Druid client, shared pool left open");
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Whether closing this client releases its connection pool
    pub fn owns_pool(&self) -> bool {
        self.ownership == PoolOwnership::Owned
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn metrics(&self) -> &ClientMetrics {
        &self.metrics
    }
}

impl Drop for DruidClient {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for DruidClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DruidClient")
            .field("broker", &self.config.broker)
            .field("owns_pool", &self.owns_pool())
            .field("closed", &self.is_closed())
            .finish()
    }
}

async fn resolve_broker(config: &ClientConfig) -> DruidResult<()> {
    let address = config.socket_address();
    let mut resolved = tokio::net::lookup_host(address.as_str())
        .await
        .map_err(|e| {
            DruidError::connection(format!(
                "Failed to resolve broker '{}': {}",
                config.broker, e
            ))
        })?;

    if resolved.next().is_none() {
        return Err(DruidError::connection(format!(
            "Broker '{}' resolved to no addresses",
            config.broker
        )));
    }

    Ok(())
}
