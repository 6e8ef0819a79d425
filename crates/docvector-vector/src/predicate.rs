//! Payload keys promoted to real Lance columns, and the SQL pushed down for
//! filters on them.
//!
//! A pushed-down predicate only narrows the rows Lance hands back; callers
//! still evaluate the full [`Filter`] against each decoded payload.
use serde_json::Value;

use docvector_core::filter::{Condition, Filter, Range};
use docvector_core::types::Payload;

use crate::table::sql_quote;

pub const SOURCE_ID_KEY: &str = "source_id";
pub const CHUNK_INDEX_KEY: &str = "chunk_index";

/// `source_id` column value: set only for string payload values.
pub fn source_id_of(payload: &Payload) -> Option<String> {
    payload.get(SOURCE_ID_KEY).and_then(Value::as_str).map(str::to_string)
}

/// `chunk_index` column value: set only for numeric payload values.
pub fn chunk_index_of(payload: &Payload) -> Option<f64> {
    payload.get(CHUNK_INDEX_KEY).and_then(Value::as_f64)
}

/// SQL implied by `filter`, or `None` when nothing can be pushed down.
pub fn pushdown(filter: &Filter) -> Option<String> {
    match filter {
        Filter::All(children) => {
            let parts: Vec<String> = children.iter().filter_map(pushdown).collect();
            join(parts, " AND ")
        }
        Filter::Any(children) => {
            let parts: Option<Vec<String>> = children.iter().map(pushdown).collect();
            join(parts?, " OR ")
        }
        Filter::Field { key, condition } => match (key.as_str(), condition) {
            (SOURCE_ID_KEY, Condition::Eq(Value::String(s))) => {
                // arrays of ids leave the column null and are matched in process
                Some(format!("({SOURCE_ID_KEY} = {} OR {SOURCE_ID_KEY} IS NULL)", sql_quote(s)))
            }
            (SOURCE_ID_KEY, Condition::In(values)) => {
                let quoted: Option<Vec<String>> = values.iter().map(|v| v.as_str().map(sql_quote)).collect();
                let quoted = quoted.filter(|q| !q.is_empty())?;
                Some(format!("({SOURCE_ID_KEY} IN ({}) OR {SOURCE_ID_KEY} IS NULL)", quoted.join(", ")))
            }
            (CHUNK_INDEX_KEY, Condition::Range(range)) => range_sql(CHUNK_INDEX_KEY, range),
            _ => None,
        },
    }
}

fn range_sql(column: &str, range: &Range) -> Option<String> {
    let bounds = [(">", range.gt), (">=", range.gte), ("<", range.lt), ("<=", range.lte)];
    let parts: Vec<String> = bounds
        .iter()
        .filter_map(|(op, bound)| bound.filter(|b| b.is_finite()).map(|b| format!("{column} {op} {b:?}")))
        .collect();
    join(parts, " AND ")
}

fn join(parts: Vec<String>, sep: &str) -> Option<String> {
    match parts.len() {
        0 => None,
        1 => parts.into_iter().next(),
        _ => Some(format!("({})", parts.join(sep))),
    }
}
