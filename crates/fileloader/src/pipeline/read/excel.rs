//! Excel reader
//!
//! Reads one configured sheet, first row as header. Workbooks are buffered
//! (the format needs random access). Date serials are converted at read
//! time for fields declared Date/Timestamp, using the 1899-12-30 epoch so
//! serial 1 is 1900-01-01, compatible with the 1900 leap-year bug.

use super::{check_required_columns, configured_skip_rows, ReaderContext, RecordSource};
use crate::pipeline::batch::{Batch, Record, Value};
use crate::sources::{FileType, SemanticType, SourceConfig};
use calamine::{open_workbook_auto_from_rs, Data, Reader};
use chrono::{DateTime, Duration, NaiveDate, Utc};
use fileloader_common::{LoadError, LoadResult};
use std::collections::HashMap;
use std::io::{Cursor, Read};
use std::sync::Arc;
use tracing::debug;

pub struct ExcelSource {
    source: Arc<SourceConfig>,
    filename: String,
    batch_size: usize,
    skip_rows: u64,
    stream: Option<Box<dyn Read + Send>>,
    headers: Vec<String>,
    rows: Vec<Vec<Data>>,
    /// file column (lowercased) -> declared date/timestamp type
    date_fields: HashMap<String, SemanticType>,
    position: usize,
    rows_read: u64,
}

/// Excel epoch (with the 1900 leap-year bug accounted for).
fn excel_epoch() -> NaiveDate {
    // the construction is infallible for this fixed date
    NaiveDate::from_ymd_opt(1899, 12, 30).unwrap_or_default()
}

/// Convert an Excel date serial to a timestamp.
fn serial_to_timestamp(serial: f64) -> DateTime<Utc> {
    let days = serial.trunc() as i64;
    let seconds = ((serial - serial.trunc()) * 86_400.0).round() as i64;
    let naive = excel_epoch()
        .and_hms_opt(0, 0, 0)
        .unwrap_or_default()
        + Duration::days(days)
        + Duration::seconds(seconds);
    DateTime::from_naive_utc_and_offset(naive, Utc)
}

impl ExcelSource {
    pub fn new(ctx: ReaderContext) -> Self {
        let date_fields = ctx
            .source
            .fields
            .iter()
            .filter(|f| {
                matches!(
                    f.semantic_type,
                    SemanticType::Date | SemanticType::Timestamp
                )
            })
            .map(|f| (f.file_key(), f.semantic_type))
            .collect();
        Self {
            skip_rows: configured_skip_rows(&ctx.source.file_type),
            source: ctx.source,
            filename: ctx.filename,
            batch_size: ctx.batch_size,
            stream: Some(ctx.stream),
            headers: Vec::new(),
            rows: Vec::new(),
            date_fields,
            position: 0,
            rows_read: 0,
        }
    }

    fn sheet_name(&self) -> String {
        match &self.source.file_type {
            FileType::Excel { sheet, .. } => sheet.clone(),
            _ => "Sheet1".to_string(),
        }
    }

    fn cell_to_value(&self, header: &str, cell: &Data) -> Value {
        let declared_date = self.date_fields.get(header).copied();
        match cell {
            Data::Empty => Value::Null,
            Data::String(s) if s.is_empty() => Value::Null,
            Data::String(s) => Value::Text(s.clone()),
            Data::Bool(b) => Value::Boolean(*b),
            Data::Int(i) => match declared_date {
                Some(SemanticType::Date) => Value::Date(serial_to_timestamp(*i as f64).date_naive()),
                Some(SemanticType::Timestamp) => Value::Timestamp(serial_to_timestamp(*i as f64)),
                _ => Value::Integer(*i),
            },
            Data::Float(f) => match declared_date {
                Some(SemanticType::Date) => Value::Date(serial_to_timestamp(*f).date_naive()),
                Some(SemanticType::Timestamp) => Value::Timestamp(serial_to_timestamp(*f)),
                _ => Value::Float(*f),
            },
            Data::DateTime(dt) => {
                let ts = serial_to_timestamp(dt.as_f64());
                match declared_date {
                    Some(SemanticType::Date) => Value::Date(ts.date_naive()),
                    _ => Value::Timestamp(ts),
                }
            },
            Data::DateTimeIso(s) | Data::DurationIso(s) => Value::Text(s.clone()),
            Data::Error(e) => Value::Text(format!("#ERR {e:?}")),
        }
    }
}

impl RecordSource for ExcelSource {
    fn open(&mut self) -> LoadResult<()> {
        let mut stream = self.stream.take().ok_or_else(|| {
            LoadError::malformed(&self.filename, "reader opened twice")
        })?;
        let mut raw = Vec::new();
        stream.read_to_end(&mut raw)?;

        let mut workbook = open_workbook_auto_from_rs(Cursor::new(raw))
            .map_err(|e| LoadError::malformed(&self.filename, e.to_string()))?;
        let sheet = self.sheet_name();
        let range = workbook
            .worksheet_range(&sheet)
            .map_err(|e| {
                LoadError::malformed(&self.filename, format!("sheet '{sheet}': {e}"))
            })?;

        let mut rows = range.rows();
        let header_row = rows.next().ok_or_else(|| LoadError::NoDataInFile {
            file: self.filename.clone(),
        })?;

        let headers: Vec<String> = header_row
            .iter()
            .map(|cell| match cell {
                Data::String(s) => s.trim().to_string(),
                Data::Empty => String::new(),
                other => other.to_string().trim().to_string(),
            })
            .collect();

        // headers that are all blank or all spreadsheet default names
        let all_defaults = !headers.is_empty()
            && headers.iter().all(|h| {
                h.is_empty() || h.trim_start_matches('-').chars().all(|c| c.is_ascii_digit())
            });
        if all_defaults {
            return Err(LoadError::MissingHeader {
                file: self.filename.clone(),
            });
        }
        check_required_columns(&self.filename, &headers, &self.source)?;

        self.headers = headers.iter().map(|h| h.to_lowercase()).collect();
        self.rows = rows
            .skip(self.skip_rows as usize)
            .map(|r| r.to_vec())
            .collect();
        if self.rows.is_empty() {
            return Err(LoadError::NoDataInFile {
                file: self.filename.clone(),
            });
        }
        debug!(file = %self.filename, sheet, rows = self.rows.len(), "Opened Excel");
        Ok(())
    }

    fn next_batch(&mut self) -> LoadResult<Option<Batch>> {
        if self.position >= self.rows.len() {
            return Ok(None);
        }
        let mut batch = Batch::new(self.starting_row_number() + self.rows_read);
        let end = (self.position + self.batch_size).min(self.rows.len());
        for row in &self.rows[self.position..end] {
            let mut record = Record::new(self.starting_row_number() + self.rows_read);
            for (i, header) in self.headers.iter().enumerate() {
                let value = row
                    .get(i)
                    .map(|cell| self.cell_to_value(header, cell))
                    .unwrap_or(Value::Null);
                record.fields.insert(header.clone(), value);
            }
            self.rows_read += 1;
            batch.records.push(record);
        }
        self.position = end;
        Ok(Some(batch))
    }

    fn rows_read(&self) -> u64 {
        self.rows_read
    }

    fn starting_row_number(&self) -> u64 {
        2 + self.skip_rows
    }

    fn close(&mut self) {
        self.rows = Vec::new();
        self.stream = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serial_1_is_1900_01_01() {
        let ts = serial_to_timestamp(1.0);
        assert_eq!(
            ts.date_naive(),
            NaiveDate::from_ymd_opt(1900, 1, 1).unwrap()
        );
    }

    #[test]
    fn fractional_serials_carry_time_of_day() {
        // 0.5 of a day is noon
        let ts = serial_to_timestamp(45_000.5);
        assert_eq!(ts.time(), chrono::NaiveTime::from_hms_opt(12, 0, 0).unwrap());
    }

    #[test]
    fn serial_45000_matches_known_date() {
        // serial 45000 = 2023-03-15
        let ts = serial_to_timestamp(45_000.0);
        assert_eq!(
            ts.date_naive(),
            NaiveDate::from_ymd_opt(2023, 3, 15).unwrap()
        );
    }
}
