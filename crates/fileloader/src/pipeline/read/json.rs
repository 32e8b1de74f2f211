//! JSON reader
//!
//! Resolves an optional dot-separated record path to the record array, then
//! yields each element as a record. Nested objects are flattened with `_`
//! separators and lowercased keys, so `{"Entry": {"ID": 1}}` matches a
//! field declared against column `entry_id`. The document is parsed
//! eagerly; batching below the configured size keeps the downstream
//! hand-off bounded.

use super::{check_required_columns, ReaderContext, RecordSource};
use crate::pipeline::batch::{Batch, Record, Value};
use crate::sources::{FileType, SourceConfig};
use fileloader_common::{LoadError, LoadResult};
use std::io::Read;
use std::sync::Arc;
use tracing::debug;

pub struct JsonSource {
    source: Arc<SourceConfig>,
    filename: String,
    batch_size: usize,
    stream: Option<Box<dyn Read + Send>>,
    records: Vec<serde_json::Value>,
    position: usize,
    rows_read: u64,
}

impl JsonSource {
    pub fn new(ctx: ReaderContext) -> Self {
        Self {
            source: ctx.source,
            filename: ctx.filename,
            batch_size: ctx.batch_size,
            stream: Some(ctx.stream),
            records: Vec::new(),
            position: 0,
            rows_read: 0,
        }
    }

    fn record_path(&self) -> Option<String> {
        match &self.source.file_type {
            FileType::Json { record_path } => record_path.clone(),
            _ => None,
        }
    }

    /// Walk a dot-separated path down through JSON objects.
    fn resolve_path<'a>(
        &self,
        root: &'a serde_json::Value,
        path: &str,
    ) -> LoadResult<&'a serde_json::Value> {
        let mut node = root;
        for segment in path.split('.') {
            node = node.get(segment).ok_or_else(|| {
                LoadError::malformed(
                    &self.filename,
                    format!("record path '{path}' not found (missing '{segment}')"),
                )
            })?;
        }
        Ok(node)
    }
}

/// Flatten one JSON object into lowercased `a_b_c` keys.
fn flatten_into(
    prefix: &str,
    object: &serde_json::Map<String, serde_json::Value>,
    out: &mut Record,
) {
    for (key, value) in object {
        let flat_key = if prefix.is_empty() {
            key.to_lowercase()
        } else {
            format!("{prefix}_{}", key.to_lowercase())
        };
        match value {
            serde_json::Value::Object(nested) => flatten_into(&flat_key, nested, out),
            serde_json::Value::Array(items)
                if items.first().map(|i| i.is_object()).unwrap_or(false) =>
            {
                for (index, item) in items.iter().enumerate() {
                    if let serde_json::Value::Object(nested) = item {
                        flatten_into(&format!("{flat_key}_{index}"), nested, out);
                    }
                }
            },
            serde_json::Value::Array(items) => {
                out.fields.insert(
                    flat_key,
                    Value::Text(serde_json::Value::Array(items.clone()).to_string()),
                );
            },
            scalar => {
                out.fields.insert(flat_key, Value::from_json(scalar));
            },
        }
    }
}

fn to_record(row_number: u64, filename: &str, value: &serde_json::Value) -> LoadResult<Record> {
    let mut record = Record::new(row_number);
    match value {
        serde_json::Value::Object(object) => {
            flatten_into("", object, &mut record);
            Ok(record)
        },
        other => Err(LoadError::malformed(
            filename,
            format!("record at row {row_number} is not an object: {other}"),
        )),
    }
}

impl RecordSource for JsonSource {
    fn open(&mut self) -> LoadResult<()> {
        let mut stream = self.stream.take().ok_or_else(|| {
            LoadError::malformed(&self.filename, "reader opened twice")
        })?;
        let mut raw = Vec::new();
        stream.read_to_end(&mut raw)?;

        let document: serde_json::Value = serde_json::from_slice(&raw)
            .map_err(|e| LoadError::malformed(&self.filename, e.to_string()))?;

        let node = match self.record_path() {
            Some(path) => self.resolve_path(&document, &path)?.clone(),
            None => document,
        };
        let records = match node {
            serde_json::Value::Array(items) => items,
            other => {
                return Err(LoadError::malformed(
                    &self.filename,
                    format!("record path must resolve to an array, got {}", type_of(&other)),
                ));
            },
        };
        if records.is_empty() {
            return Err(LoadError::NoDataInFile {
                file: self.filename.clone(),
            });
        }

        // structure check against the first record
        let first = to_record(1, &self.filename, &records[0])?;
        let headers: Vec<String> = first.fields.keys().cloned().collect();
        check_required_columns(&self.filename, &headers, &self.source)?;

        debug!(file = %self.filename, records = records.len(), "Opened JSON");
        self.records = records;
        Ok(())
    }

    fn next_batch(&mut self) -> LoadResult<Option<Batch>> {
        if self.position >= self.records.len() {
            return Ok(None);
        }
        let start_row = self.starting_row_number() + self.rows_read;
        let mut batch = Batch::new(start_row);
        let end = (self.position + self.batch_size).min(self.records.len());
        for value in &self.records[self.position..end] {
            let row_number = self.starting_row_number() + self.rows_read;
            batch
                .records
                .push(to_record(row_number, &self.filename, value)?);
            self.rows_read += 1;
        }
        self.position = end;
        Ok(Some(batch))
    }

    fn rows_read(&self) -> u64 {
        self.rows_read
    }

    fn starting_row_number(&self) -> u64 {
        1
    }

    fn close(&mut self) {
        self.records = Vec::new();
        self.stream = None;
    }
}

fn type_of(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "bool",
        serde_json::Value::Number(_) => "number",
        serde_json::Value::String(_) => "string",
        serde_json::Value::Array(_) => "array",
        serde_json::Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sources::{FieldSpec, SemanticType};
    use std::io::Cursor;

    fn json_source(record_path: Option<&str>) -> Arc<SourceConfig> {
        Arc::new(
            SourceConfig::builder("orders")
                .pattern(r".*")
                .file_type(FileType::Json {
                    record_path: record_path.map(|s| s.to_string()),
                })
                .target_table("orders")
                .field(FieldSpec::new("order_id", SemanticType::Integer))
                .field(FieldSpec::new("customer_name", SemanticType::Text))
                .grain(&["order_id"])
                .build()
                .unwrap(),
        )
    }

    fn open(data: &str, source: Arc<SourceConfig>, batch_size: usize) -> JsonSource {
        let mut reader = JsonSource::new(ReaderContext {
            stream: Box::new(Cursor::new(data.to_string().into_bytes())),
            source,
            filename: "orders.json".into(),
            batch_size,
        });
        reader.open().unwrap();
        reader
    }

    #[test]
    fn resolves_record_path_and_flattens_nested_keys() {
        let data = r#"{"data": {"orders": [
            {"order_id": 1, "Customer": {"Name": "alice"}},
            {"order_id": 2, "Customer": {"Name": "bob"}}
        ]}}"#;
        let mut reader = open(data, json_source(Some("data.orders")), 10);
        let batch = reader.next_batch().unwrap().unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch.records[0].get("order_id"), &Value::Integer(1));
        assert_eq!(
            batch.records[0].get("customer_name"),
            &Value::Text("alice".into())
        );
        assert_eq!(batch.records[1].row_number, 2);
        assert!(reader.next_batch().unwrap().is_none());
    }

    #[test]
    fn top_level_array_without_path() {
        let data = r#"[{"order_id": 5, "customer_name": "eve"}]"#;
        let mut reader = open(data, json_source(None), 10);
        let batch = reader.next_batch().unwrap().unwrap();
        assert_eq!(batch.records[0].get("order_id"), &Value::Integer(5));
    }

    #[test]
    fn empty_array_is_no_data() {
        let mut reader = JsonSource::new(ReaderContext {
            stream: Box::new(Cursor::new(br#"{"data": {"orders": []}}"#.to_vec())),
            source: json_source(Some("data.orders")),
            filename: "orders.json".into(),
            batch_size: 10,
        });
        let err = reader.open().unwrap_err();
        assert!(matches!(err, LoadError::NoDataInFile { .. }));
    }

    #[test]
    fn non_array_record_path_is_malformed() {
        let mut reader = JsonSource::new(ReaderContext {
            stream: Box::new(Cursor::new(br#"{"data": {"orders": {"a": 1}}}"#.to_vec())),
            source: json_source(Some("data.orders")),
            filename: "orders.json".into(),
            batch_size: 10,
        });
        let err = reader.open().unwrap_err();
        assert!(matches!(err, LoadError::MalformedFile { .. }));
    }

    #[test]
    fn missing_path_segment_is_malformed() {
        let mut reader = JsonSource::new(ReaderContext {
            stream: Box::new(Cursor::new(br#"{"data": {}}"#.to_vec())),
            source: json_source(Some("data.orders")),
            filename: "orders.json".into(),
            batch_size: 10,
        });
        let err = reader.open().unwrap_err();
        assert!(err.to_string().contains("record path"));
    }

    #[test]
    fn batching_respects_the_limit() {
        let data = r#"[{"order_id": 1, "customer_name": "a"},
                       {"order_id": 2, "customer_name": "b"},
                       {"order_id": 3, "customer_name": "c"}]"#;
        let mut reader = open(data, json_source(None), 2);
        assert_eq!(reader.next_batch().unwrap().unwrap().len(), 2);
        let second = reader.next_batch().unwrap().unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(second.starting_row_number, 3);
    }
}
