//! Native Druid query types
//!
//! Only the row-returning query types are modelled: `select` (paged raw
//! events) and `scan` (streamed raw events). Both are immutable values built
//! through builders that validate on `build()`.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Duration;
use validator::Validate;

use crate::error::{DruidError, DruidResult};
use crate::filter::Filter;
use crate::time::Interval;
use crate::QUERY_ID_CONTEXT_KEY;

/// Query context: free-form settings such as `queryId` or `timeout`
pub type QueryContext = BTreeMap<String, Value>;

/// A query the broker can execute
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "queryType", rename_all = "camelCase")]
pub enum Query {
    Select(SelectQuery),
    Scan(ScanQuery),
}

/// Paged raw-event query
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct SelectQuery {
    /// Data source (table) to read from
    #[validate(length(min = 1))]
    pub data_source: String,

    /// Time intervals to scan
    #[validate(length(min = 1, max = 1000))]
    pub intervals: Vec<Interval>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<Filter>,

    /// Dimensions to return; empty means all
    #[serde(default)]
    pub dimensions: Vec<String>,

    /// Metrics to return; empty means all
    #[serde(default)]
    pub metrics: Vec<String>,

    #[serde(default)]
    pub granularity: Granularity,

    #[serde(default)]
    pub descending: bool,

    pub paging_spec: PagingSpec,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub context: QueryContext,
}

/// Pagination cursor for select queries
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PagingSpec {
    /// Last offset seen per segment
    #[serde(default)]
    pub paging_identifiers: BTreeMap<String, i64>,

    /// Maximum number of events per page
    pub threshold: usize,

    /// Resume after (not at) the given offsets
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_next: Option<bool>,
}

/// Streaming raw-event query
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct ScanQuery {
    #[validate(length(min = 1))]
    pub data_source: String,

    #[validate(length(min = 1, max = 1000))]
    pub intervals: Vec<Interval>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<Filter>,

    /// Columns to return; empty means all
    #[serde(default)]
    pub columns: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offset: Option<u64>,

    /// Rows per batch the broker emits
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_size: Option<usize>,

    #[serde(default)]
    pub result_format: ScanResultFormat,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order: Option<ScanOrder>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub context: QueryContext,
}

/// Layout of scan events
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ScanResultFormat {
    /// Each event is a column → value object
    #[default]
    List,
    /// Each event is an array aligned with the batch's `columns`
    CompactedList,
}

/// Time ordering of scan results
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScanOrder {
    None,
    Ascending,
    Descending,
}

/// Query granularity
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Granularity {
    #[default]
    All,
    None,
    Second,
    Minute,
    FifteenMinute,
    ThirtyMinute,
    Hour,
    Day,
    Week,
    Month,
    Quarter,
    Year,
}

impl Query {
    /// Convert an untyped JSON query (e.g. loaded from a file) into a
    /// validated `Query`.
    pub fn from_value(value: Value) -> DruidResult<Self> {
        let query: Query = serde_json::from_value(value)
            .map_err(|e| DruidError::invalid_query(format!("Unrecognized query: {}", e)))?;
        query.validate_self()?;
        Ok(query)
    }

    /// Get the query type name
    pub fn name(&self) -> &'static str {
        match self {
            Query::Select(_) => "select",
            Query::Scan(_) => "scan",
        }
    }

    pub fn data_source(&self) -> &str {
        match self {
            Query::Select(q) => &q.data_source,
            Query::Scan(q) => &q.data_source,
        }
    }

    pub fn intervals(&self) -> &[Interval] {
        match self {
            Query::Select(q) => &q.intervals,
            Query::Scan(q) => &q.intervals,
        }
    }

    pub fn context(&self) -> &QueryContext {
        match self {
            Query::Select(q) => &q.context,
            Query::Scan(q) => &q.context,
        }
    }

    pub fn context_mut(&mut self) -> &mut QueryContext {
        match self {
            Query::Select(q) => &mut q.context,
            Query::Scan(q) => &mut q.context,
        }
    }

    /// The `queryId` context entry, if set
    pub fn query_id(&self) -> Option<&str> {
        self.context()
            .get(QUERY_ID_CONTEXT_KEY)
            .and_then(Value::as_str)
    }

    pub fn with_query_id<S: Into<String>>(mut self, id: S) -> Self {
        self.context_mut()
            .insert(QUERY_ID_CONTEXT_KEY.to_string(), Value::String(id.into()));
        self
    }

    /// Set the broker-side timeout (`timeout` context entry, milliseconds)
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.context_mut().insert(
            "timeout".to_string(),
            Value::from(timeout.as_millis() as u64),
        );
        self
    }

    /// Validate the query
    pub fn validate_self(&self) -> DruidResult<()> {
        match self {
            Query::Select(q) => q.validate_self(),
            Query::Scan(q) => q.validate_self(),
        }
    }
}

impl From<SelectQuery> for Query {
    fn from(query: SelectQuery) -> Self {
        Query::Select(query)
    }
}

impl From<ScanQuery> for Query {
    fn from(query: ScanQuery) -> Self {
        Query::Scan(query)
    }
}

impl SelectQuery {
    pub fn builder() -> SelectQueryBuilder {
        SelectQueryBuilder::default()
    }

    /// Validate the select query
    pub fn validate_self(&self) -> DruidResult<()> {
        self.validate()
            .map_err(|e| DruidError::invalid_query(format!("Invalid select query: {}", e)))?;

        if self.paging_spec.threshold == 0 {
            return Err(DruidError::invalid_query(
                "Select paging threshold must be greater than 0",
            ));
        }

        if let Some(filter) = &self.filter {
            filter.validate_self()?;
        }

        Ok(())
    }

    /// Query for the page following the one that produced `paging_identifiers`.
    ///
    /// Any `queryId` is dropped so the next page is tracked separately.
    pub fn next_page(&self, paging_identifiers: &BTreeMap<String, i64>) -> SelectQuery {
        let mut next = self.clone();
        next.paging_spec.paging_identifiers = paging_identifiers.clone();
        next.paging_spec.from_next = Some(true);
        next.context.remove(QUERY_ID_CONTEXT_KEY);
        next
    }
}

impl ScanQuery {
    pub fn builder() -> ScanQueryBuilder {
        ScanQueryBuilder::default()
    }

    /// Validate the scan query
    pub fn validate_self(&self) -> DruidResult<()> {
        self.validate()
            .map_err(|e| DruidError::invalid_query(format!("Invalid scan query: {}", e)))?;

        if self.batch_size == Some(0) {
            return Err(DruidError::invalid_query(
                "Scan batch size must be greater than 0",
            ));
        }

        if let Some(filter) = &self.filter {
            filter.validate_self()?;
        }

        Ok(())
    }
}

/// Builder for [`SelectQuery`]
#[derive(Debug, Default)]
pub struct SelectQueryBuilder {
    data_source: String,
    intervals: Vec<Interval>,
    filter: Option<Filter>,
    dimensions: Vec<String>,
    metrics: Vec<String>,
    granularity: Granularity,
    descending: bool,
    paging_spec: PagingSpec,
    context: QueryContext,
}

impl SelectQueryBuilder {
    pub fn data_source<S: Into<String>>(mut self, data_source: S) -> Self {
        self.data_source = data_source.into();
        self
    }

    pub fn interval(mut self, interval: Interval) -> Self {
        self.intervals.push(interval);
        self
    }

    pub fn intervals<I: IntoIterator<Item = Interval>>(mut self, intervals: I) -> Self {
        self.intervals.extend(intervals);
        self
    }

    pub fn filter(mut self, filter: Filter) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn dimensions<I, S>(mut self, dimensions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dimensions = dimensions.into_iter().map(Into::into).collect();
        self
    }

    pub fn metrics<I, S>(mut self, metrics: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.metrics = metrics.into_iter().map(Into::into).collect();
        self
    }

    pub fn granularity(mut self, granularity: Granularity) -> Self {
        self.granularity = granularity;
        self
    }

    pub fn descending(mut self, descending: bool) -> Self {
        self.descending = descending;
        self
    }

    /// Page size
    pub fn threshold(mut self, threshold: usize) -> Self {
        self.paging_spec.threshold = threshold;
        self
    }

    pub fn paging_spec(mut self, paging_spec: PagingSpec) -> Self {
        self.paging_spec = paging_spec;
        self
    }

    pub fn context<K: Into<String>>(mut self, key: K, value: Value) -> Self {
        self.context.insert(key.into(), value);
        self
    }

    pub fn build(self) -> DruidResult<SelectQuery> {
        let query = SelectQuery {
            data_source: self.data_source,
            intervals: self.intervals,
            filter: self.filter,
            dimensions: self.dimensions,
            metrics: self.metrics,
            granularity: self.granularity,
            descending: self.descending,
            paging_spec: self.paging_spec,
            context: self.context,
        };
        query.validate_self()?;
        Ok(query)
    }
}

/// Builder for [`ScanQuery`]
#[derive(Debug, Default)]
pub struct ScanQueryBuilder {
    data_source: String,
    intervals: Vec<Interval>,
    filter: Option<Filter>,
    columns: Vec<String>,
    limit: Option<u64>,
    offset: Option<u64>,
    batch_size: Option<usize>,
    result_format: ScanResultFormat,
    order: Option<ScanOrder>,
    context: QueryContext,
}

impl ScanQueryBuilder {
    pub fn data_source<S: Into<String>>(mut self, data_source: S) -> Self {
        self.data_source = data_source.into();
        self
    }

    pub fn interval(mut self, interval: Interval) -> Self {
        self.intervals.push(interval);
        self
    }

    pub fn filter(mut self, filter: Filter) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn columns<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.columns = columns.into_iter().map(Into::into).collect();
        self
    }

    pub fn limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: u64) -> Self {
        self.offset = Some(offset);
        self
    }

    pub fn batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = Some(batch_size);
        self
    }

    pub fn result_format(mut self, result_format: ScanResultFormat) -> Self {
        self.result_format = result_format;
        self
    }

    pub fn order(mut self, order: ScanOrder) -> Self {
        self.order = Some(order);
        self
    }

    pub fn context<K: Into<String>>(mut self, key: K, value: Value) -> Self {
        self.context.insert(key.into(), value);
        self
    }

    pub fn build(self) -> DruidResult<ScanQuery> {
        let query = ScanQuery {
            data_source: self.data_source,
            intervals: self.intervals,
            filter: self.filter,
            columns: self.columns,
            limit: self.limit,
            offset: self.offset,
            batch_size: self.batch_size,
            result_format: self.result_format,
            order: self.order,
            context: self.context,
        };
        query.validate_self()?;
        Ok(query)
    }
}
