//! Dimension filter expressions

use serde::{Deserialize, Serialize};

use crate::error::{DruidError, DruidResult};

/// Dimension filter, serialized in Druid's native `{"type": ...}` form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Filter {
    /// Matches rows whose dimension equals `value` (`None` matches null/empty)
    Selector {
        dimension: String,
        value: Option<String>,
    },

    /// Matches rows accepted by every field
    And { fields: Vec<Filter> },

    /// Matches rows accepted by at least one field
    Or { fields: Vec<Filter> },

    /// Matches rows the inner filter rejects
    Not { field: Box<Filter> },
}

impl Filter {
    pub fn selector<D: Into<String>, V: Into<String>>(dimension: D, value: V) -> Self {
        Filter::Selector {
            dimension: dimension.into(),
            value: Some(value.into()),
        }
    }

    /// Selector matching null or empty dimension values
    pub fn is_null<D: Into<String>>(dimension: D) -> Self {
        Filter::Selector {
            dimension: dimension.into(),
            value: None,
        }
    }

    pub fn and<I: IntoIterator<Item = Filter>>(fields: I) -> Self {
        Filter::And {
            fields: fields.into_iter().collect(),
        }
    }

    pub fn or<I: IntoIterator<Item = Filter>>(fields: I) -> Self {
        Filter::Or {
            fields: fields.into_iter().collect(),
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn not(field: Filter) -> Self {
        Filter::Not {
            field: Box::new(field),
        }
    }

    /// Validate the filter tree
    pub fn validate_self(&self) -> DruidResult<()> {
        match self {
            Filter::Selector { dimension, .. } => {
                if dimension.is_empty() {
                    return Err(DruidError::invalid_query(
                        "Selector filter requires a dimension",
                    ));
                }
                Ok(())
            }
            Filter::And { fields } | Filter::Or { fields } => {
                if fields.is_empty() {
                    return Err(DruidError::invalid_query(format!(
                        "'{}' filter requires at least one field",
                        self.name()
                    )));
                }
                fields.iter().try_for_each(Filter::validate_self)
            }
            Filter::Not { field } => field.validate_self(),
        }
    }

    /// Get the filter type name
    pub fn name(&self) -> &'static str {
        match self {
            Filter::Selector { .. } => "selector",
            Filter::And { .. } => "and",
            Filter::Or { .. } => "or",
            Filter::Not { .. } => "not",
        }
    }
}
