use std::cmp::Ordering;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::protocol::Table;

/// Row predicate understood by the remote store. Missing columns read as null.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Filter {
    All,
    Eq { column: String, value: Value },
    IsNull { column: String },
    In { column: String, values: Vec<Value> },
    And { filters: Vec<Filter> },
    Or { filters: Vec<Filter> },
}

impl Filter {
    pub fn eq(column: impl Into<String>, value: impl Into<Value>) -> Self {
        Filter::Eq {
            column: column.into(),
            value: value.into(),
        }
    }

    pub fn is_null(column: impl Into<String>) -> Self {
        Filter::IsNull {
            column: column.into(),
        }
    }

    pub fn is_in<V: Into<Value>>(column: impl Into<String>, values: impl IntoIterator<Item = V>) -> Self {
        Filter::In {
            column: column.into(),
            values: values.into_iter().map(Into::into).collect(),
        }
    }

    pub fn and(filters: impl IntoIterator<Item = Filter>) -> Self {
        Filter::And {
            filters: filters.into_iter().collect(),
        }
    }

    pub fn or(filters: impl IntoIterator<Item = Filter>) -> Self {
        Filter::Or {
            filters: filters.into_iter().collect(),
        }
    }

    pub fn matches(&self, row: &Value) -> bool {
        match self {
            Filter::All => true,
            Filter::Eq { column, value } => row.get(column).is_some_and(|v| v == value),
            Filter::IsNull { column } => row.get(column).map_or(true, Value::is_null),
            Filter::In { column, values } => row
                .get(column)
                .is_some_and(|v| !v.is_null() && values.contains(v)),
            Filter::And { filters } => filters.iter().all(|f| f.matches(row)),
            Filter::Or { filters } => filters.iter().any(|f| f.matches(row)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Ascending,
    Descending,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Order {
    pub column: String,
    pub direction: Direction,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Query {
    pub table: Table,
    pub filter: Filter,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order: Option<Order>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
}

impl Query {
    pub fn new(table: Table) -> Self {
        Self {
            table,
            filter: Filter::All,
            order: None,
            limit: None,
        }
    }

    pub fn filter(mut self, filter: Filter) -> Self {
        self.filter = filter;
        self
    }

    pub fn order_by(mut self, column: impl Into<String>, direction: Direction) -> Self {
        self.order = Some(Order {
            column: column.into(),
            direction,
        });
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// Total order over column values: nulls first, then timestamps, numbers, booleans, strings.
pub fn compare_values(left: Option<&Value>, right: Option<&Value>) -> Ordering {
    let left = left.filter(|v| !v.is_null());
    let right = right.filter(|v| !v.is_null());
    match (left, right) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(Value::String(a)), Some(Value::String(b))) => {
            match (parse_timestamp(a), parse_timestamp(b)) {
                (Some(a), Some(b)) => a.cmp(&b),
                _ => a.cmp(b),
            }
        }
        (Some(Value::Number(a)), Some(Value::Number(b))) => a
            .as_f64()
            .zip(b.as_f64())
            .and_then(|(a, b)| a.partial_cmp(&b))
            .unwrap_or(Ordering::Equal),
        (Some(Value::Bool(a)), Some(Value::Bool(b))) => a.cmp(b),
        (Some(a), Some(b)) => a.to_string().cmp(&b.to_string()),
    }
}

fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|ts| ts.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn legacy_union_filter_matches_tagged_and_untagged_public_rows() {
        let filter = Filter::or([
            Filter::eq("channel_id", "general"),
            Filter::and([Filter::is_null("channel_id"), Filter::is_null("recipient_id")]),
        ]);

        assert!(filter.matches(&json!({ "channel_id": "general" })));
        assert!(filter.matches(&json!({ "channel_id": null, "recipient_id": null })));
        assert!(filter.matches(&json!({})));
        assert!(!filter.matches(&json!({ "channel_id": null, "recipient_id": "bob" })));
        assert!(!filter.matches(&json!({ "channel_id": "random" })));
    }

    #[test]
    fn in_filter_never_matches_null() {
        let filter = Filter::is_in("recipient_id", ["alice", "bob"]);
        assert!(filter.matches(&json!({ "recipient_id": "bob" })));
        assert!(!filter.matches(&json!({ "recipient_id": null })));
    }

    #[test]
    fn timestamps_compare_chronologically_across_precisions() {
        let a = json!("2024-05-01T10:00:00.500Z");
        let b = json!("2024-05-01T10:00:00Z");
        assert_eq!(compare_values(Some(&a), Some(&b)), Ordering::Greater);
    }
}
