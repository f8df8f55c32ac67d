//! Druid Client Library
//!
//! A thin streaming client for a Druid broker. Queries are sent as JSON to
//! the broker's native query endpoint and the response array is decoded
//! lazily, one element at a time, as the caller consumes the returned stream.

pub mod client;
pub mod config;
pub mod connection;
pub mod decoder;
pub mod encoder;
pub mod metrics;

// Re-export commonly used types
pub use client::{DruidClient, QUERY_ID_HEADER};
pub use config::{ClientConfig, HttpClientConfig};
pub use connection::ConnectionPool;
pub use decoder::{ArrayDecoder, ResultRows, RowStream};
pub use encoder::{EncodedQuery, QueryEncoder};
pub use metrics::{ClientMetrics, ClientMetricsSnapshot};

pub use druid_core::{
    DruidError, DruidResult, Filter, Granularity, Interval, PagingSpec, Query, QueryFailure,
    ResultRow, ScanQuery, SelectQuery,
};
