//! Error types for Druid client operations

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Result type for Druid client operations
pub type DruidResult<T> = Result<T, DruidError>;

/// Error kinds surfaced by the client
#[derive(Error, Debug)]
pub enum DruidError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Query error: {0}")]
    Query(QueryFailure),

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Time range error: {0}")]
    TimeRange(String),

    #[error("Client has been closed")]
    ClientClosed,
}

/// Why a query failed: either rejected locally before sending, or rejected
/// by the broker with an HTTP error status.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryFailure {
    /// HTTP status returned by the broker, `None` for local validation failures
    #[serde(skip)]
    pub status: Option<u16>,

    /// Short error code, e.g. "Query not supported"
    #[serde(default)]
    pub error: Option<String>,

    /// Human readable message
    #[serde(default)]
    pub error_message: Option<String>,

    /// Java exception class reported by the broker
    #[serde(default)]
    pub error_class: Option<String>,

    /// Broker or historical host that failed
    #[serde(default)]
    pub host: Option<String>,
}

impl QueryFailure {
    /// Failure detected before the query left the client
    pub fn invalid<S: Into<String>>(message: S) -> Self {
        Self {
            error: Some("Invalid query".to_string()),
            error_message: Some(message.into()),
            ..Self::default()
        }
    }

    /// Failure reported by the broker. The body is parsed as Druid's error
    /// JSON when possible, otherwise kept verbatim as the message.
    pub fn from_response(status: u16, body: &str) -> Self {
        let mut failure = serde_json::from_str::<QueryFailure>(body).unwrap_or_else(|_| {
            let trimmed = body.trim();
            QueryFailure {
                error_message: (!trimmed.is_empty()).then(|| trimmed.to_string()),
                ..QueryFailure::default()
            }
        });
        failure.status = Some(status);
        failure
    }

    /// Best available description of the failure
    pub fn message(&self) -> &str {
        self.error_message
            .as_deref()
            .or(self.error.as_deref())
            .unwrap_or("unknown error")
    }
}

impl fmt::Display for QueryFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(status) = self.status {
            write!(f, "broker returned HTTP {}: ", status)?;
        }
        write!(f, "{}", self.message())?;
        if let Some(class) = &self.error_class {
            write!(f, " ({})", class)?;
        }
        if let Some(host) = &self.host {
            write!(f, " on {}", host)?;
        }
        Ok(())
    }
}

impl DruidError {
    /// Create a new connection error
    pub fn connection<S: Into<String>>(message: S) -> Self {
        Self::Connection(message.into())
    }

    /// Create a new network error
    pub fn network<S: Into<String>>(message: S) -> Self {
        Self::Network(message.into())
    }

    /// Create a query error for a query rejected before sending
    pub fn invalid_query<S: Into<String>>(message: S) -> Self {
        Self::Query(QueryFailure::invalid(message))
    }

    /// Create a new decode error
    pub fn decode<S: Into<String>>(message: S) -> Self {
        Self::Decode(message.into())
    }

    /// Create a new configuration error
    pub fn configuration<S: Into<String>>(message: S) -> Self {
        Self::Configuration(message.into())
    }

    /// Check if this is a retriable error
    pub fn is_retriable(&self) -> bool {
        matches!(self, DruidError::Connection(_) | DruidError::Network(_))
    }

    /// HTTP status of a broker rejection, if any
    pub fn status(&self) -> Option<u16> {
        match self {
            DruidError::Query(failure) => failure.status,
            _ => None,
        }
    }

    /// Get the error category for logging/metrics
    pub fn category(&self) -> &'static str {
        match self {
            DruidError::Connection(_) => "connection",
            DruidError::Network(_) => "network",
            DruidError::Query(_) => "query",
            DruidError::Decode(_) => "decode",
            DruidError::Configuration(_) => "configuration",
            DruidError::TimeRange(_) => "time_range",
            DruidError::ClientClosed => "client_closed",
        }
    }
}
