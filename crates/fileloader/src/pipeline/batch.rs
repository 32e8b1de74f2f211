//! Raw and typed record values handed between pipeline stages
//!
//! A `Batch` is the unit of hand-off: an ordered run of records with a
//! stable, monotone starting row number. Batches are produced by a reader,
//! refined by the validator and drained by the writer; they never exist
//! outside memory and each is owned by exactly one stage at a time.

use chrono::{DateTime, NaiveDate, Utc};
use std::collections::HashMap;

/// A single field value, raw (as read from the file) or typed (after
/// validation coerces it to the declared semantic type).
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Text(String),
    Integer(i64),
    Float(f64),
    Boolean(bool),
    Date(NaiveDate),
    Timestamp(DateTime<Utc>),
    Json(serde_json::Value),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Text(_) => "text",
            Value::Integer(_) => "integer",
            Value::Float(_) => "float",
            Value::Boolean(_) => "boolean",
            Value::Date(_) => "date",
            Value::Timestamp(_) => "timestamp",
            Value::Json(_) => "json",
        }
    }

    /// JSON rendering used for DLQ row serialization and grain keys.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Null => serde_json::Value::Null,
            Value::Text(s) => serde_json::Value::String(s.clone()),
            Value::Integer(i) => serde_json::Value::from(*i),
            Value::Float(f) => serde_json::Value::from(*f),
            Value::Boolean(b) => serde_json::Value::Bool(*b),
            Value::Date(d) => serde_json::Value::String(d.to_string()),
            Value::Timestamp(ts) => serde_json::Value::String(ts.to_rfc3339()),
            Value::Json(v) => v.clone(),
        }
    }

    /// Canonical text rendering, used for grain keys and row hashing.
    pub fn render(&self) -> String {
        match self {
            Value::Null => String::new(),
            Value::Text(s) => s.clone(),
            Value::Integer(i) => i.to_string(),
            Value::Float(f) => f.to_string(),
            Value::Boolean(b) => b.to_string(),
            Value::Date(d) => d.to_string(),
            Value::Timestamp(ts) => ts.to_rfc3339(),
            Value::Json(v) => v.to_string(),
        }
    }

    pub fn from_json(v: &serde_json::Value) -> Value {
        match v {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Boolean(*b),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Value::Integer(i)
                } else {
                    Value::Float(n.as_f64().unwrap_or(f64::NAN))
                }
            },
            serde_json::Value::String(s) => Value::Text(s.clone()),
            other => Value::Json(other.clone()),
        }
    }
}

/// One record read from a file, keyed by file column name (lowercased).
///
/// `row_number` is the 1-based position in the source file, used for DLQ
/// attribution; for formats with a header row the first data row is 2.
#[derive(Debug, Clone)]
pub struct Record {
    pub row_number: u64,
    pub fields: HashMap<String, Value>,
}

impl Record {
    pub fn new(row_number: u64) -> Self {
        Self {
            row_number,
            fields: HashMap::new(),
        }
    }

    pub fn get(&self, field: &str) -> &Value {
        self.fields.get(field).unwrap_or(&Value::Null)
    }

    /// Serialize the raw record for DLQ persistence.
    pub fn to_json(&self) -> serde_json::Value {
        let map: serde_json::Map<String, serde_json::Value> = self
            .fields
            .iter()
            .map(|(k, v)| (k.clone(), v.to_json()))
            .collect();
        serde_json::Value::Object(map)
    }
}

/// An ordered run of records with a stable monotone starting row number.
#[derive(Debug, Clone)]
pub struct Batch {
    pub starting_row_number: u64,
    pub records: Vec<Record>,
}

impl Batch {
    pub fn new(starting_row_number: u64) -> Self {
        Self {
            starting_row_number,
            records: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_field_reads_as_null() {
        let record = Record::new(2);
        assert!(record.get("absent").is_null());
    }

    #[test]
    fn json_rendering_round_trips_scalars() {
        assert_eq!(Value::from_json(&serde_json::json!(42)), Value::Integer(42));
        assert_eq!(
            Value::from_json(&serde_json::json!("a")),
            Value::Text("a".into())
        );
        assert_eq!(Value::from_json(&serde_json::json!(null)), Value::Null);
        assert_eq!(
            Value::from_json(&serde_json::json!(1.5)),
            Value::Float(1.5)
        );
    }

    #[test]
    fn render_is_stable_for_grain_keys() {
        assert_eq!(Value::Integer(7).render(), "7");
        assert_eq!(Value::Text("x".into()).render(), "x");
        assert_eq!(Value::Null.render(), "");
    }
}
