//! Parquet reader
//!
//! Streams row groups through the arrow reader and re-batches to the
//! configured size. Column values are mapped onto engine values; the
//! validator still owns coercion into the declared semantic types.

use super::{check_required_columns, ReaderContext, RecordSource};
use crate::pipeline::batch::{Batch, Record, Value};
use crate::sources::SourceConfig;
use arrow::array::{
    Array, ArrayRef, BooleanArray, Date32Array, Decimal128Array, Float32Array, Float64Array,
    Int16Array, Int32Array, Int64Array, Int8Array, LargeStringArray, StringArray,
    TimestampMicrosecondArray, TimestampMillisecondArray, TimestampNanosecondArray,
    TimestampSecondArray, UInt16Array, UInt32Array, UInt64Array, UInt8Array,
};
use arrow::datatypes::{DataType, TimeUnit};
use arrow::record_batch::RecordBatch;
use bytes::Bytes;
use chrono::{DateTime, Duration, NaiveDate, Utc};
use fileloader_common::{LoadError, LoadResult};
use parquet::arrow::arrow_reader::{ParquetRecordBatchReader, ParquetRecordBatchReaderBuilder};
use std::io::Read;
use std::sync::Arc;
use tracing::debug;

pub struct ParquetSource {
    source: Arc<SourceConfig>,
    filename: String,
    batch_size: usize,
    stream: Option<Box<dyn Read + Send>>,
    reader: Option<ParquetRecordBatchReader>,
    columns: Vec<String>,
    rows_read: u64,
}

impl ParquetSource {
    pub fn new(ctx: ReaderContext) -> Self {
        Self {
            source: ctx.source,
            filename: ctx.filename,
            batch_size: ctx.batch_size,
            stream: Some(ctx.stream),
            reader: None,
            columns: Vec::new(),
            rows_read: 0,
        }
    }

    fn convert_batch(&mut self, arrow_batch: &RecordBatch) -> LoadResult<Batch> {
        let mut batch = Batch::new(self.starting_row_number() + self.rows_read);
        for row in 0..arrow_batch.num_rows() {
            let mut record = Record::new(self.starting_row_number() + self.rows_read);
            for (col, column_name) in self.columns.iter().enumerate() {
                let value = arrow_cell(&self.filename, arrow_batch.column(col), row)?;
                record.fields.insert(column_name.clone(), value);
            }
            self.rows_read += 1;
            batch.records.push(record);
        }
        Ok(batch)
    }
}

fn unix_epoch_date() -> NaiveDate {
    NaiveDate::from_ymd_opt(1970, 1, 1).unwrap_or_default()
}

fn timestamp_value(filename: &str, seconds: i64, nanos: u32) -> LoadResult<Value> {
    DateTime::<Utc>::from_timestamp(seconds, nanos)
        .map(Value::Timestamp)
        .ok_or_else(|| LoadError::malformed(filename, format!("timestamp out of range: {seconds}s")))
}

/// Map one arrow cell onto an engine value.
fn arrow_cell(filename: &str, column: &ArrayRef, row: usize) -> LoadResult<Value> {
    if column.is_null(row) {
        return Ok(Value::Null);
    }

    macro_rules! downcast {
        ($ty:ty) => {
            column.as_any().downcast_ref::<$ty>().ok_or_else(|| {
                LoadError::malformed(filename, "column type/array mismatch".to_string())
            })?
        };
    }

    let value = match column.data_type() {
        DataType::Utf8 => Value::Text(downcast!(StringArray).value(row).to_string()),
        DataType::LargeUtf8 => Value::Text(downcast!(LargeStringArray).value(row).to_string()),
        DataType::Boolean => Value::Boolean(downcast!(BooleanArray).value(row)),
        DataType::Int8 => Value::Integer(downcast!(Int8Array).value(row) as i64),
        DataType::Int16 => Value::Integer(downcast!(Int16Array).value(row) as i64),
        DataType::Int32 => Value::Integer(downcast!(Int32Array).value(row) as i64),
        DataType::Int64 => Value::Integer(downcast!(Int64Array).value(row)),
        DataType::UInt8 => Value::Integer(downcast!(UInt8Array).value(row) as i64),
        DataType::UInt16 => Value::Integer(downcast!(UInt16Array).value(row) as i64),
        DataType::UInt32 => Value::Integer(downcast!(UInt32Array).value(row) as i64),
        DataType::UInt64 => {
            let v = downcast!(UInt64Array).value(row);
            i64::try_from(v)
                .map(Value::Integer)
                .unwrap_or(Value::Float(v as f64))
        },
        DataType::Float32 => Value::Float(downcast!(Float32Array).value(row) as f64),
        DataType::Float64 => Value::Float(downcast!(Float64Array).value(row)),
        DataType::Date32 => {
            let days = downcast!(Date32Array).value(row);
            Value::Date(unix_epoch_date() + Duration::days(days as i64))
        },
        DataType::Timestamp(TimeUnit::Second, _) => {
            let v = downcast!(TimestampSecondArray).value(row);
            timestamp_value(filename, v, 0)?
        },
        DataType::Timestamp(TimeUnit::Millisecond, _) => {
            let v = downcast!(TimestampMillisecondArray).value(row);
            timestamp_value(filename, v.div_euclid(1_000), (v.rem_euclid(1_000) * 1_000_000) as u32)?
        },
        DataType::Timestamp(TimeUnit::Microsecond, _) => {
            let v = downcast!(TimestampMicrosecondArray).value(row);
            timestamp_value(filename, v.div_euclid(1_000_000), (v.rem_euclid(1_000_000) * 1_000) as u32)?
        },
        DataType::Timestamp(TimeUnit::Nanosecond, _) => {
            let v = downcast!(TimestampNanosecondArray).value(row);
            timestamp_value(filename, v.div_euclid(1_000_000_000), v.rem_euclid(1_000_000_000) as u32)?
        },
        DataType::Decimal128(_, scale) => {
            let v = downcast!(Decimal128Array).value(row);
            Value::Float(v as f64 / 10f64.powi(*scale as i32))
        },
        other => {
            return Err(LoadError::malformed(
                filename,
                format!("unsupported parquet column type {other}"),
            ));
        },
    };
    Ok(value)
}

impl RecordSource for ParquetSource {
    fn open(&mut self) -> LoadResult<()> {
        let mut stream = self.stream.take().ok_or_else(|| {
            LoadError::malformed(&self.filename, "reader opened twice")
        })?;
        let mut raw = Vec::new();
        stream.read_to_end(&mut raw)?;

        let builder = ParquetRecordBatchReaderBuilder::try_new(Bytes::from(raw))
            .map_err(|e| LoadError::malformed(&self.filename, e.to_string()))?;

        let columns: Vec<String> = builder
            .schema()
            .fields()
            .iter()
            .map(|f| f.name().trim().to_string())
            .collect();
        check_required_columns(&self.filename, &columns, &self.source)?;

        if builder.metadata().file_metadata().num_rows() == 0 {
            return Err(LoadError::NoDataInFile {
                file: self.filename.clone(),
            });
        }

        let reader = builder
            .with_batch_size(self.batch_size)
            .build()
            .map_err(|e| LoadError::malformed(&self.filename, e.to_string()))?;

        debug!(file = %self.filename, columns = columns.len(), "Opened Parquet");
        self.columns = columns.iter().map(|c| c.to_lowercase()).collect();
        self.reader = Some(reader);
        Ok(())
    }

    fn next_batch(&mut self) -> LoadResult<Option<Batch>> {
        let reader = self.reader.as_mut().ok_or_else(|| {
            LoadError::malformed(&self.filename, "next_batch before open")
        })?;
        loop {
            match reader.next() {
                None => return Ok(None),
                Some(Err(e)) => {
                    return Err(LoadError::malformed(&self.filename, e.to_string()));
                },
                Some(Ok(arrow_batch)) if arrow_batch.num_rows() == 0 => continue,
                Some(Ok(arrow_batch)) => {
                    return Ok(Some(self.convert_batch(&arrow_batch)?));
                },
            }
        }
    }

    fn rows_read(&self) -> u64 {
        self.rows_read
    }

    fn starting_row_number(&self) -> u64 {
        1
    }

    fn close(&mut self) {
        self.reader = None;
        self.stream = None;
    }
}
