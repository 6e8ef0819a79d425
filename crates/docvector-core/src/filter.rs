//! Payload filters.
//!
//! Parsed from a Mongo-style JSON object (`{"lang": "rust", "year": {"$gte": 2020}}`),
//! evaluated in-process by the embedded store and translated to native
//! filters by remote backends.
use serde_json::Value;

use crate::error::{Error, Result};
use crate::types::Payload;

#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    /// Every child must match. An empty list matches everything.
    All(Vec<Filter>),
    /// At least one child must match.
    Any(Vec<Filter>),
    Field { key: String, condition: Condition },
}

#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    Eq(Value),
    Ne(Value),
    In(Vec<Value>),
    Range(Range),
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Range {
    pub gt: Option<f64>,
    pub gte: Option<f64>,
    pub lt: Option<f64>,
    pub lte: Option<f64>,
}

impl Range {
    fn contains(&self, x: f64) -> bool {
        self.gt.map_or(true, |b| x > b)
            && self.gte.map_or(true, |b| x >= b)
            && self.lt.map_or(true, |b| x < b)
            && self.lte.map_or(true, |b| x <= b)
    }
}

impl Filter {
    pub fn eq(key: impl Into<String>, value: impl Into<Value>) -> Self {
        Filter::Field { key: key.into(), condition: Condition::Eq(value.into()) }
    }

    pub fn ne(key: impl Into<String>, value: impl Into<Value>) -> Self {
        Filter::Field { key: key.into(), condition: Condition::Ne(value.into()) }
    }

    pub fn any_of(key: impl Into<String>, values: Vec<Value>) -> Self {
        Filter::Field { key: key.into(), condition: Condition::In(values) }
    }

    pub fn range(key: impl Into<String>, range: Range) -> Self {
        Filter::Field { key: key.into(), condition: Condition::Range(range) }
    }

    /// Parse a JSON object. Top-level keys are AND-ed.
    pub fn from_json(value: &Value) -> Result<Self> {
        let obj = value
            .as_object()
            .ok_or_else(|| Error::InvalidConfig("filter must be a JSON object".into()))?;
        let mut clauses = Vec::with_capacity(obj.len());
        for (key, v) in obj {
            match key.as_str() {
                "$and" => clauses.push(Filter::All(parse_list(key, v)?)),
                "$or" => clauses.push(Filter::Any(parse_list(key, v)?)),
                k if k.starts_with('$') => {
                    return Err(Error::InvalidConfig(format!("unsupported filter operator '{k}'")));
                }
                field => clauses.extend(parse_field(field, v)?),
            }
        }
        Ok(if clauses.len() == 1 { clauses.remove(0) } else { Filter::All(clauses) })
    }

    pub fn matches(&self, payload: &Payload) -> bool {
        match self {
            Filter::All(children) => children.iter().all(|f| f.matches(payload)),
            Filter::Any(children) => children.iter().any(|f| f.matches(payload)),
            Filter::Field { key, condition } => {
                let found = lookup(payload, key);
                match condition {
                    Condition::Eq(v) => found.is_some_and(|x| value_matches(x, v)),
                    Condition::Ne(v) => !found.is_some_and(|x| value_matches(x, v)),
                    Condition::In(vs) => found.is_some_and(|x| vs.iter().any(|v| value_matches(x, v))),
                    Condition::Range(r) => found.and_then(Value::as_f64).is_some_and(|x| r.contains(x)),
                }
            }
        }
    }
}

fn parse_list(op: &str, v: &Value) -> Result<Vec<Filter>> {
    v.as_array()
        .ok_or_else(|| Error::InvalidConfig(format!("'{op}' expects an array")))?
        .iter()
        .map(Filter::from_json)
        .collect()
}

fn parse_field(key: &str, v: &Value) -> Result<Vec<Filter>> {
    let Some(ops) = v.as_object().filter(|o| o.keys().any(|k| k.starts_with('$'))) else {
        return Ok(vec![Filter::eq(key, v.clone())]);
    };
    let mut out = Vec::new();
    let mut range = Range::default();
    let mut has_range = false;
    for (op, arg) in ops {
        match op.as_str() {
            "$eq" => out.push(Filter::eq(key, arg.clone())),
            "$ne" => out.push(Filter::ne(key, arg.clone())),
            "$in" => {
                let values = arg
                    .as_array()
                    .ok_or_else(|| Error::InvalidConfig(format!("'$in' on '{key}' expects an array")))?;
                out.push(Filter::any_of(key, values.clone()));
            }
            "$gt" | "$gte" | "$lt" | "$lte" => {
                let bound = arg
                    .as_f64()
                    .ok_or_else(|| Error::InvalidConfig(format!("'{op}' on '{key}' expects a number")))?;
                match op.as_str() {
                    "$gt" => range.gt = Some(bound),
                    "$gte" => range.gte = Some(bound),
                    "$lt" => range.lt = Some(bound),
                    _ => range.lte = Some(bound),
                }
                has_range = true;
            }
            other => {
                return Err(Error::InvalidConfig(format!("unsupported filter operator '{other}'")));
            }
        }
    }
    if has_range {
        out.push(Filter::range(key, range));
    }
    Ok(out)
}

/// Dotted keys walk nested objects.
fn lookup<'a>(payload: &'a Payload, key: &str) -> Option<&'a Value> {
    let mut parts = key.split('.');
    let mut cur = payload.get(parts.next()?)?;
    for part in parts {
        cur = cur.as_object()?.get(part)?;
    }
    Some(cur)
}

/// Arrays match when any element matches; numbers compare numerically.
fn value_matches(found: &Value, wanted: &Value) -> bool {
    match (found, wanted) {
        (Value::Array(items), w) if !w.is_array() => items.iter().any(|i| value_matches(i, w)),
        (Value::Number(a), Value::Number(b)) => a.as_f64() == b.as_f64(),
        (a, b) => a == b,
    }
}
