use anyhow::Result;
use druid_core::{DruidError, DruidResult};
use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

/// Configuration for a broker client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Broker host and port, e.g. `localhost:8082`
    pub broker: String,

    /// `http` or `https`
    pub scheme: String,

    /// Native query endpoint path
    pub query_path: String,

    /// HTTP connection settings
    pub http: HttpClientConfig,
}

/// HTTP connection pool settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpClientConfig {
    /// Maximum number of connections, and so of requests in flight, to the
    /// broker
    pub num_connections: usize,

    /// Maximum time to wait for the next chunk of a response, in milliseconds
    pub read_timeout_ms: u64,

    /// TCP connect timeout in milliseconds
    pub connect_timeout_ms: u64,

    /// User-Agent header sent with every request
    pub user_agent: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            broker: "localhost:8082".to_string(),
            scheme: "http".to_string(),
            query_path: "/druid/v2/".to_string(),
            http: HttpClientConfig::default(),
        }
    }
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            num_connections: 20,
            read_timeout_ms: 15 * 60 * 1000, // 15 minutes
            connect_timeout_ms: 10_000,
            user_agent: format!("druid-client-rs/{}", druid_core::VERSION),
        }
    }
}

impl HttpClientConfig {
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

impl ClientConfig {
    /// Configuration for the given broker with default HTTP settings
    pub fn for_broker<S: Into<String>>(broker: S) -> Self {
        Self {
            broker: broker.into(),
            ..Self::default()
        }
    }

    /// Load configuration from environment variables and defaults
    pub fn load() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(broker) = env::var("DRUID_BROKER") {
            config.broker = broker;
        }

        if let Ok(scheme) = env::var("DRUID_BROKER_SCHEME") {
            config.scheme = scheme;
        }

        if let Ok(num_connections) = env::var("DRUID_CLIENT_HTTP_NUM_CONNECTIONS") {
            config.http.num_connections = num_connections.parse()?;
        }

        if let Ok(read_timeout) = env::var("DRUID_CLIENT_HTTP_READ_TIMEOUT_MS") {
            config.http.read_timeout_ms = read_timeout.parse()?;
        }

        if let Ok(connect_timeout) = env::var("DRUID_CLIENT_HTTP_CONNECT_TIMEOUT_MS") {
            config.http.connect_timeout_ms = connect_timeout.parse()?;
        }

        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> DruidResult<()> {
        if self.broker.trim().is_empty() {
            return Err(DruidError::configuration("Broker host cannot be empty"));
        }

        if self.broker.contains("://") || self.broker.contains('/') {
            return Err(DruidError::configuration(format!(
                "Broker must be host:port without scheme or path, got '{}'",
                self.broker
            )));
        }

        if self.scheme != "http" && self.scheme != "https" {
            return Err(DruidError::configuration(format!(
                "Unsupported scheme '{}'",
                self.scheme
            )));
        }

        if !self.query_path.starts_with('/') {
            return Err(DruidError::configuration("Query path must start with '/'"));
        }

        if self.http.num_connections == 0 {
            return Err(DruidError::configuration(
                "Number of connections must be greater than 0",
            ));
        }

        if self.http.read_timeout_ms == 0 {
            return Err(DruidError::configuration(
                "Read timeout must be greater than 0",
            ));
        }

        if self.http.connect_timeout_ms == 0 {
            return Err(DruidError::configuration(
                "Connect timeout must be greater than 0",
            ));
        }

        Ok(())
    }

    /// Full URL of the native query endpoint
    pub fn query_url(&self) -> String {
        format!("{}://{}{}", self.scheme, self.broker, self.query_path)
    }

    /// `host:port` pair used for DNS resolution, with the scheme's default
    /// port filled in when missing
    pub fn socket_address(&self) -> String {
        if self.broker.rsplit_once(':').map_or(false, |(_, port)| port.parse::<u16>().is_ok()) {
            self.broker.clone()
        } else {
            let port = if self.scheme == "https" { 443 } else { 80 };
            format!("{}:{}", self.broker, port)
        }
    }
}
