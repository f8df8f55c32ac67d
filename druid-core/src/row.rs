//! Result rows and the response envelopes they are unpacked from

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::fmt;

use crate::error::{DruidError, DruidResult};

/// One decoded row: column name → value, plus where it came from.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResultRow {
    pub columns: Map<String, Value>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub position: Option<RowPosition>,
}

/// Positional and paging metadata of a row
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RowPosition {
    /// Segment the row was read from
    pub segment_id: String,

    /// Offset of the row within its segment
    pub offset: i64,

    /// Timestamp of the result bucket, when the broker reports one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
}

impl ResultRow {
    pub fn new(columns: Map<String, Value>) -> Self {
        Self {
            columns,
            position: None,
        }
    }

    pub fn with_position(mut self, position: RowPosition) -> Self {
        self.position = Some(position);
        self
    }

    pub fn get(&self, column: &str) -> Option<&Value> {
        self.columns.get(column)
    }

    /// Get a string column
    pub fn get_str(&self, column: &str) -> Option<&str> {
        self.columns.get(column).and_then(Value::as_str)
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    pub fn into_columns(self) -> Map<String, Value> {
        self.columns
    }
}

impl fmt::Display for ResultRow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rendered = serde_json::to_string(&self.columns).map_err(|_| fmt::Error)?;
        f.write_str(&rendered)
    }
}

/// One element of a select query response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectResult {
    #[serde(default)]
    pub timestamp: Option<String>,

    pub result: SelectResultValue,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SelectResultValue {
    /// Cursor to continue from with `SelectQuery::next_page`
    #[serde(default)]
    pub paging_identifiers: BTreeMap<String, i64>,

    #[serde(default)]
    pub dimensions: Vec<String>,

    #[serde(default)]
    pub metrics: Vec<String>,

    #[serde(default)]
    pub events: Vec<EventHolder>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventHolder {
    pub segment_id: String,
    pub offset: i64,
    pub event: Map<String, Value>,
}

/// One batch of a scan query response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanBatch {
    #[serde(default)]
    pub segment_id: Option<String>,

    #[serde(default)]
    pub columns: Vec<String>,

    /// Objects for `list` format, arrays aligned with `columns` for
    /// `compactedList`
    #[serde(default)]
    pub events: Vec<Value>,
}

/// Turns streamed response elements into rows.
///
/// - select envelopes yield one positioned row per event and update the
///   paging cursor,
/// - scan batches yield one row per event, offsets counted per segment,
/// - any other object is a row by itself,
/// - anything else is a decode error.
#[derive(Debug, Default)]
pub struct RowExpander {
    paging_identifiers: BTreeMap<String, i64>,
    scan_offsets: HashMap<String, i64>,
}

impl RowExpander {
    pub fn new() -> Self {
        Self::default()
    }

    /// Latest select paging identifiers seen so far
    pub fn paging_identifiers(&self) -> &BTreeMap<String, i64> {
        &self.paging_identifiers
    }

    pub fn expand(&mut self, element: Value) -> DruidResult<Vec<ResultRow>> {
        let object = match element {
            Value::Object(object) => object,
            other => {
                return Err(DruidError::decode(format!(
                    "Expected a JSON object per result, got {}",
                    json_type_name(&other)
                )))
            }
        };

        if is_select_envelope(&object) {
            let envelope: SelectResult = serde_json::from_value(Value::Object(object))
                .map_err(|e| DruidError::decode(format!("Malformed select result: {}", e)))?;
            return Ok(self.expand_select(envelope));
        }

        if is_scan_batch(&object) {
            let batch: ScanBatch = serde_json::from_value(Value::Object(object))
                .map_err(|e| DruidError::decode(format!("Malformed scan batch: {}", e)))?;
            return self.expand_scan(batch);
        }

        Ok(vec![ResultRow::new(object)])
    }

    fn expand_select(&mut self, envelope: SelectResult) -> Vec<ResultRow> {
        let SelectResult { timestamp, result } = envelope;
        self.paging_identifiers.extend(result.paging_identifiers);

        result
            .events
            .into_iter()
            .map(|holder| {
                ResultRow::new(holder.event).with_position(RowPosition {
                    segment_id: holder.segment_id,
                    offset: holder.offset,
                    timestamp: timestamp.clone(),
                })
            })
            .collect()
    }

    fn expand_scan(&mut self, batch: ScanBatch) -> DruidResult<Vec<ResultRow>> {
        let ScanBatch {
            segment_id,
            columns,
            events,
        } = batch;

        let mut rows = Vec::with_capacity(events.len());
        for event in events {
            let values = match event {
                Value::Object(values) => values,
                Value::Array(values) => {
                    if values.len() != columns.len() {
                        return Err(DruidError::decode(format!(
                            "Compacted scan event has {} values for {} columns",
                            values.len(),
                            columns.len()
                        )));
                    }
                    columns.iter().cloned().zip(values).collect()
                }
                other => {
                    return Err(DruidError::decode(format!(
                        "Unexpected scan event type: {}",
                        json_type_name(&other)
                    )))
                }
            };

            let row = ResultRow::new(values);
            rows.push(match &segment_id {
                Some(segment) => {
                    let offset = self.scan_offsets.entry(segment.clone()).or_insert(0);
                    let position = RowPosition {
                        segment_id: segment.clone(),
                        offset: *offset,
                        timestamp: None,
                    };
                    *offset += 1;
                    row.with_position(position)
                }
                None => row,
            });
        }

        Ok(rows)
    }
}

fn is_select_envelope(object: &Map<String, Value>) -> bool {
    object
        .get("result")
        .and_then(Value::as_object)
        .map_or(false, |result| result.get("events").map_or(false, Value::is_array))
}

fn is_scan_batch(object: &Map<String, Value>) -> bool {
    object.get("events").map_or(false, Value::is_array)
        && (object.contains_key("segmentId") || object.contains_key("columns"))
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
