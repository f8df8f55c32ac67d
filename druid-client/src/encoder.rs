//! Query serialization

use bytes::Bytes;
use druid_core::{DruidError, DruidResult, Query};
use uuid::Uuid;

/// A query ready to be sent
#[derive(Debug, Clone)]
pub struct EncodedQuery {
    pub query_id: String,
    pub body: Bytes,
}

/// Serializes queries into the broker's JSON wire format
#[derive(Debug, Clone, Copy, Default)]
pub struct QueryEncoder;

impl QueryEncoder {
    pub const CONTENT_TYPE: &'static str = "application/json";

    pub fn new() -> Self {
        Self
    }

    /// Validate and serialize a query, assigning a `queryId` when the caller
    /// did not set one.
    pub fn encode(&self, query: &Query) -> DruidResult<EncodedQuery> {
        query.validate_self()?;

        let query = match query.query_id() {
            Some(_) => query.clone(),
            None => query.clone().with_query_id(Uuid::new_v4().to_string()),
        };
        let query_id = query.query_id().unwrap_or_default().to_string();

        let body = serde_json::to_vec(&query).map_err(|e| {
            DruidError::invalid_query(format!("Failed to serialize query: {}", e))
        })?;

        Ok(EncodedQuery {
            query_id,
            body: Bytes::from(body),
        })
    }
}
