//! # Druid Core Library
//!
//! Shared types for talking to a Druid broker: the native query model,
//! dimension filters, ISO-8601 intervals, result rows and the error type
//! used by the client crate.
//!
//! ## Features
//!
//! - **Queries**: Immutable `select` and `scan` queries built with builders
//! - **Filters**: Tagged `selector` / `and` / `or` / `not` expressions
//! - **Intervals**: Joda-compatible `start/end` interval parsing
//! - **Rows**: Expansion of streamed result envelopes into positioned rows
//!
//! Nothing in this crate performs I/O; it only describes what goes over the
//! wire and what comes back.

pub mod error;
pub mod filter;
pub mod query;
pub mod row;
pub mod time;

// Re-export commonly used types
pub use error::{DruidError, DruidResult, QueryFailure};
pub use filter::Filter;
pub use query::{
    Granularity, PagingSpec, Query, QueryContext, ScanOrder, ScanQuery, ScanResultFormat,
    SelectQuery,
};
pub use row::{
    EventHolder, ResultRow, RowExpander, RowPosition, ScanBatch, SelectResult, SelectResultValue,
};
pub use time::Interval;

/// Version information for druid-client-rs
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Context key the broker uses to identify a query
pub const QUERY_ID_CONTEXT_KEY: &str = "queryId";
