//! CSV reader
//!
//! Honours the source's delimiter, encoding and header-skip options. Values
//! are yielded as raw text; the validator owns type coercion.

use super::{check_required_columns, configured_skip_rows, ReaderContext, RecordSource};
use crate::pipeline::batch::{Batch, Record, Value};
use crate::sources::FileType;
use crate::sources::SourceConfig;
use encoding_rs_io::DecodeReaderBytesBuilder;
use fileloader_common::{LoadError, LoadResult};
use std::io::Read;
use std::sync::Arc;
use tracing::debug;

pub struct CsvSource {
    source: Arc<SourceConfig>,
    filename: String,
    batch_size: usize,
    skip_rows: u64,
    stream: Option<Box<dyn Read + Send>>,
    reader: Option<::csv::Reader<Box<dyn Read + Send>>>,
    headers: Vec<String>,
    rows_read: u64,
    rows_skipped: u64,
}

impl CsvSource {
    pub fn new(ctx: ReaderContext) -> Self {
        Self {
            skip_rows: configured_skip_rows(&ctx.source.file_type),
            source: ctx.source,
            filename: ctx.filename,
            batch_size: ctx.batch_size,
            stream: Some(ctx.stream),
            reader: None,
            headers: Vec::new(),
            rows_read: 0,
            rows_skipped: 0,
        }
    }

    fn options(&self) -> (u8, String) {
        match &self.source.file_type {
            FileType::Csv {
                delimiter,
                encoding,
                ..
            } => (*delimiter, encoding.clone()),
            _ => (b',', "utf-8".to_string()),
        }
    }
}

impl RecordSource for CsvSource {
    fn open(&mut self) -> LoadResult<()> {
        let stream = self.stream.take().ok_or_else(|| {
            LoadError::malformed(&self.filename, "reader opened twice")
        })?;
        let (delimiter, encoding) = self.options();

        let decoded: Box<dyn Read + Send> = if encoding.eq_ignore_ascii_case("utf-8") {
            stream
        } else {
            let encoding = encoding_rs::Encoding::for_label(encoding.as_bytes()).ok_or_else(
                || LoadError::config(format!("unknown CSV encoding '{encoding}'")),
            )?;
            Box::new(
                DecodeReaderBytesBuilder::new()
                    .encoding(Some(encoding))
                    .build(stream),
            )
        };

        let mut reader = ::csv::ReaderBuilder::new()
            .delimiter(delimiter)
            .flexible(true)
            .from_reader(decoded);

        let headers: Vec<String> = reader
            .headers()
            .map_err(|e| LoadError::malformed(&self.filename, e.to_string()))?
            .iter()
            .map(|h| h.trim().to_string())
            .collect();
        check_required_columns(&self.filename, &headers, &self.source)?;

        self.headers = headers.iter().map(|h| h.to_lowercase()).collect();
        self.reader = Some(reader);
        debug!(file = %self.filename, columns = self.headers.len(), "Opened CSV");
        Ok(())
    }

    fn next_batch(&mut self) -> LoadResult<Option<Batch>> {
        let base_row_number = self.starting_row_number();
        let reader = self.reader.as_mut().ok_or_else(|| {
            LoadError::malformed(&self.filename, "next_batch before open")
        })?;

        let mut batch = Batch::new(base_row_number + self.rows_read);
        let mut csv_record = ::csv::StringRecord::new();

        while batch.len() < self.batch_size {
            let more = reader
                .read_record(&mut csv_record)
                .map_err(|e| LoadError::malformed(&self.filename, e.to_string()))?;
            if !more {
                break;
            }
            if self.rows_skipped < self.skip_rows {
                self.rows_skipped += 1;
                continue;
            }

            let mut record = Record::new(base_row_number + self.rows_read);
            for (i, header) in self.headers.iter().enumerate() {
                let value = csv_record
                    .get(i)
                    .map(|raw| {
                        if raw.is_empty() {
                            Value::Null
                        } else {
                            Value::Text(raw.to_string())
                        }
                    })
                    .unwrap_or(Value::Null);
                record.fields.insert(header.clone(), value);
            }
            self.rows_read += 1;
            batch.records.push(record);
        }

        if batch.is_empty() {
            if self.rows_read == 0 {
                return Err(LoadError::NoDataInFile {
                    file: self.filename.clone(),
                });
            }
            return Ok(None);
        }
        Ok(Some(batch))
    }

    fn rows_read(&self) -> u64 {
        self.rows_read
    }

    fn starting_row_number(&self) -> u64 {
        // row 1 is the header
        2 + self.skip_rows
    }

    fn close(&mut self) {
        self.reader = None;
        self.stream = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sources::{FieldSpec, SemanticType};
    use std::io::Cursor;

    fn csv_source(delimiter: u8, skip_rows: u64) -> Arc<SourceConfig> {
        Arc::new(
            SourceConfig::builder("customers")
                .pattern(r".*")
                .file_type(FileType::Csv {
                    delimiter,
                    encoding: "utf-8".into(),
                    skip_rows,
                })
                .target_table("customers")
                .field(FieldSpec::new("id", SemanticType::Integer))
                .field(FieldSpec::new("name", SemanticType::Text))
                .grain(&["id"])
                .build()
                .unwrap(),
        )
    }

    fn open(data: &str, source: Arc<SourceConfig>, batch_size: usize) -> CsvSource {
        let mut reader = CsvSource::new(ReaderContext {
            stream: Box::new(Cursor::new(data.to_string().into_bytes())),
            source,
            filename: "customers.csv".into(),
            batch_size,
        });
        reader.open().unwrap();
        reader
    }

    #[test]
    fn reads_in_order_with_row_numbers() {
        let mut reader = open("id,name\n1,a\n2,b\n3,c\n", csv_source(b',', 0), 2);

        let batch = reader.next_batch().unwrap().unwrap();
        assert_eq!(batch.starting_row_number, 2);
        assert_eq!(batch.len(), 2);
        assert_eq!(batch.records[0].get("id"), &Value::Text("1".into()));
        assert_eq!(batch.records[1].row_number, 3);

        let batch = reader.next_batch().unwrap().unwrap();
        assert_eq!(batch.starting_row_number, 4);
        assert_eq!(batch.len(), 1);

        assert!(reader.next_batch().unwrap().is_none());
        assert_eq!(reader.rows_read(), 3);
    }

    #[test]
    fn custom_delimiter_and_skip_rows() {
        let source = csv_source(b';', 1);
        let mut reader = open("id;name\nskipme;x\n7;real\n", source, 100);
        assert_eq!(reader.starting_row_number(), 3);
        let batch = reader.next_batch().unwrap().unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch.records[0].get("id"), &Value::Text("7".into()));
        assert_eq!(batch.records[0].row_number, 3);
    }

    #[test]
    fn missing_column_is_detected_at_open() {
        let mut reader = CsvSource::new(ReaderContext {
            stream: Box::new(Cursor::new(b"id,other\n1,x\n".to_vec())),
            source: csv_source(b',', 0),
            filename: "customers.csv".into(),
            batch_size: 10,
        });
        let err = reader.open().unwrap_err();
        assert!(matches!(err, LoadError::MissingColumns { .. }));
    }

    #[test]
    fn empty_file_yields_no_data_error() {
        let mut reader = open("id,name\n", csv_source(b',', 0), 10);
        let err = reader.next_batch().unwrap_err();
        assert!(matches!(err, LoadError::NoDataInFile { .. }));
    }

    #[test]
    fn blank_values_become_null() {
        let mut reader = open("id,name\n1,\n", csv_source(b',', 0), 10);
        let batch = reader.next_batch().unwrap().unwrap();
        assert_eq!(batch.records[0].get("name"), &Value::Null);
    }
}
