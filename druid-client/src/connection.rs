//! Pooled HTTP connections to a broker

use druid_core::{DruidError, DruidResult};
use parking_lot::RwLock;
use std::error::Error as StdError;
use std::fmt;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info};

use crate::config::HttpClientConfig;

/// Shareable handle to a pool of persistent HTTP connections.
///
/// Clones share the same pool. At most `num_connections` requests are in
/// flight at once; each holds a permit until its response stream ends or is
/// dropped, so no more connections than that are ever open. Closing drops
/// the underlying HTTP client so idle sockets are released; requests already
/// in flight keep their own connection until their response stream is
/// dropped.
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    http: RwLock<Option<reqwest::Client>>,
    permits: Arc<Semaphore>,
    config: HttpClientConfig,
    releases: AtomicU64,
}

impl ConnectionPool {
    /// Build a new pool from HTTP settings
    pub fn new(config: &HttpClientConfig) -> DruidResult<Self> {
        if config.num_connections == 0 {
            return Err(DruidError::configuration(
                "Number of connections must be greater than 0",
            ));
        }

        let http = reqwest::Client::builder()
            .pool_max_idle_per_host(config.num_connections)
            .connect_timeout(config.connect_timeout())
            .read_timeout(config.read_timeout())
            .user_agent(config.user_agent.clone())
            .build()
            .map_err(|e| DruidError::connection(format!("Failed to create HTTP client: {}", e)))?;

        info!(
            num_connections = config.num_connections,
            read_timeout_ms = config.read_timeout_ms,
            "Created broker connection pool"
        );

        Ok(Self {
            inner: Arc::new(PoolInner {
                http: RwLock::new(Some(http)),
                permits: Arc::new(Semaphore::new(config.num_connections)),
                config: config.clone(),
                releases: AtomicU64::new(0),
            }),
        })
    }

    /// HTTP client handle for issuing a request
    pub(crate) fn http_client(&self) -> DruidResult<reqwest::Client> {
        self.inner
            .http
            .read()
            .as_ref()
            .cloned()
            .ok_or(DruidError::ClientClosed)
    }

    /// Wait for a free connection slot. The slot is held until the permit is
    /// dropped.
    pub(crate) async fn acquire(&self) -> DruidResult<OwnedSemaphorePermit> {
        self.inner
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| DruidError::ClientClosed)
    }

    /// Connection slots not currently held by a request
    pub fn available_connections(&self) -> usize {
        self.inner.permits.available_permits()
    }

    /// Release the pooled connections. Returns `true` only for the call that
    /// actually released them; later calls are no-ops.
    pub fn close(&self) -> bool {
        let released = self.inner.http.write().take();
        match released {
            Some(http) => {
                drop(http);
                self.inner.permits.close();
                self.inner.releases.fetch_add(1, Ordering::SeqCst);
                info!("Released broker connection pool");
                true
            }
            None => {
                debug!("Connection pool already closed");
                false
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.http.read().is_none()
    }

    /// Number of times the pool has been released (0 or 1)
    pub fn release_count(&self) -> u64 {
        self.inner.releases.load(Ordering::SeqCst)
    }

    pub fn config(&self) -> &HttpClientConfig {
        &self.inner.config
    }
}

impl fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("num_connections", &self.inner.config.num_connections)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Classify a failure to send a request or receive its headers
pub(crate) fn request_error(err: reqwest::Error) -> DruidError {
    if err.is_timeout() {
        DruidError::network(format!("Request to broker timed out: {}", err))
    } else if err.is_connect() {
        DruidError::network(format!("Failed to connect to broker: {}", err))
    } else {
        DruidError::network(format!("Request to broker failed: {}", err))
    }
}

/// Classify a failure while streaming a response body. Timeouts and lost
/// connections are network errors; a body cut short of its declared length
/// is a decode error.
pub(crate) fn body_error(err: reqwest::Error) -> DruidError {
    if err.is_timeout() {
        DruidError::network(format!("Timed out reading response: {}", err))
    } else if err.is_connect() || is_connection_lost(&err) {
        DruidError::network(format!("Connection lost reading response: {}", err))
    } else {
        DruidError::decode(format!("Incomplete response body: {}", err))
    }
}

/// Whether any error in the `source()` chain is an I/O error for a reset,
/// aborted or broken connection
fn is_connection_lost(err: &(dyn StdError + 'static)) -> bool {
    let mut current = Some(err);
    while let Some(err) = current {
        if let Some(io_err) = err.downcast_ref::<io::Error>() {
            if matches!(
                io_err.kind(),
                io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::BrokenPipe
            ) {
                return true;
            }
        }
        current = err.source();
    }
    false
}
