//! Readers: structure validation and batched streaming
//!
//! A reader is the producing end of the per-file pipeline: `open` validates
//! the file's structure (header present, all required columns), `next_batch`
//! yields batches of at most the configured size in source order, each
//! record carrying its 1-based source row number.
//!
//! Readers are registered against their file-type tag at startup; dispatch
//! is a keyed lookup returning a constructor, so new formats are
//! compile-time additions.

pub mod csv;
pub mod excel;
pub mod json;
pub mod parquet;

use crate::pipeline::batch::Batch;
use crate::sources::{FileType, SourceConfig};
use crate::store::is_gzip_path;
use fileloader_common::{LoadError, LoadResult};
use flate2::read::GzDecoder;
use std::collections::HashMap;
use std::io::Read;
use std::sync::Arc;

/// Producing side of the pipeline: open, stream batches, close.
pub trait RecordSource: Send {
    /// Validate structure and prepare streaming. Must be called before
    /// `next_batch`.
    fn open(&mut self) -> LoadResult<()>;

    /// The next batch in source order, or `None` at end of file.
    fn next_batch(&mut self) -> LoadResult<Option<Batch>>;

    /// Records yielded so far.
    fn rows_read(&self) -> u64;

    /// 1-based source row number of the first data record.
    fn starting_row_number(&self) -> u64;

    /// Release per-file resources. Idempotent.
    fn close(&mut self) {}
}

/// Everything a reader constructor needs.
pub struct ReaderContext {
    /// Decoded byte stream (gzip already transparent).
    pub stream: Box<dyn Read + Send>,
    pub source: Arc<SourceConfig>,
    /// Base filename, for error attribution.
    pub filename: String,
    pub batch_size: usize,
}

type ReaderCtor = fn(ReaderContext) -> LoadResult<Box<dyn RecordSource>>;

/// Static registry mapping file-type tags to reader constructors.
pub struct ReaderRegistry {
    constructors: HashMap<&'static str, ReaderCtor>,
}

impl ReaderRegistry {
    pub fn new() -> Self {
        Self {
            constructors: HashMap::new(),
        }
    }

    pub fn register(&mut self, tag: &'static str, ctor: ReaderCtor) {
        self.constructors.insert(tag, ctor);
    }

    /// Registry with all built-in formats.
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        registry.register("csv", |ctx| Ok(Box::new(csv::CsvSource::new(ctx))));
        registry.register("excel", |ctx| Ok(Box::new(excel::ExcelSource::new(ctx))));
        registry.register("json", |ctx| Ok(Box::new(json::JsonSource::new(ctx))));
        registry.register("parquet", |ctx| {
            Ok(Box::new(parquet::ParquetSource::new(ctx)))
        });
        registry
    }

    /// Construct the reader for a source over an already-opened raw stream,
    /// wrapping gzip decoding when the source or the filename calls for it.
    pub fn open_reader(
        &self,
        source: Arc<SourceConfig>,
        raw: Box<dyn Read + Send>,
        filename: &str,
        batch_size: usize,
    ) -> LoadResult<Box<dyn RecordSource>> {
        let tag = source.file_type.tag();
        let ctor = self.constructors.get(tag).ok_or_else(|| {
            LoadError::config(format!("no reader registered for file type '{tag}'"))
        })?;

        let stream: Box<dyn Read + Send> = if source.gzip || is_gzip_path(filename) {
            Box::new(GzDecoder::new(raw))
        } else {
            raw
        };

        let mut reader = ctor(ReaderContext {
            stream,
            source,
            filename: filename.to_string(),
            batch_size,
        })?;
        reader.open()?;
        Ok(reader)
    }
}

impl Default for ReaderRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

/// Shared header validation: the header must exist and be non-blank, and
/// every source field must appear as a column (case-insensitive; extra
/// columns are ignored).
pub fn check_required_columns(
    filename: &str,
    headers: &[String],
    source: &SourceConfig,
) -> LoadResult<()> {
    if headers.is_empty() || headers.iter().all(|h| h.trim().is_empty()) {
        return Err(LoadError::MissingHeader {
            file: filename.to_string(),
        });
    }
    let actual: std::collections::HashSet<String> =
        headers.iter().map(|h| h.trim().to_lowercase()).collect();
    let mut missing: Vec<String> = source
        .fields
        .iter()
        .map(|f| f.file_key())
        .filter(|required| !actual.contains(required))
        .collect();
    if !missing.is_empty() {
        missing.sort();
        return Err(LoadError::MissingColumns {
            file: filename.to_string(),
            missing,
        });
    }
    Ok(())
}

/// Number of data rows to skip for the configured file type.
pub(crate) fn configured_skip_rows(file_type: &FileType) -> u64 {
    match file_type {
        FileType::Csv { skip_rows, .. } | FileType::Excel { skip_rows, .. } => *skip_rows,
        _ => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sources::{FieldSpec, SemanticType};

    fn source() -> SourceConfig {
        SourceConfig::builder("orders")
            .pattern(r".*")
            .target_table("orders")
            .field(FieldSpec::new("order_id", SemanticType::Integer).from_column("Order ID"))
            .field(FieldSpec::new("amount", SemanticType::Float))
            .grain(&["order_id"])
            .build()
            .unwrap()
    }

    #[test]
    fn blank_header_is_missing_header() {
        let err = check_required_columns("x.csv", &[" ".into(), "".into()], &source()).unwrap_err();
        assert!(matches!(err, LoadError::MissingHeader { .. }));
        let err = check_required_columns("x.csv", &[], &source()).unwrap_err();
        assert!(matches!(err, LoadError::MissingHeader { .. }));
    }

    #[test]
    fn column_matching_is_case_insensitive_and_alias_aware() {
        let headers = vec!["ORDER id".to_string(), "Amount".to_string(), "extra".to_string()];
        check_required_columns("x.csv", &headers, &source()).unwrap();
    }

    #[test]
    fn missing_columns_are_listed_sorted() {
        let err = check_required_columns("x.csv", &["other".into()], &source()).unwrap_err();
        match err {
            LoadError::MissingColumns { missing, .. } => {
                assert_eq!(missing, vec!["amount".to_string(), "order id".to_string()]);
            },
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn builtin_registry_knows_all_formats() {
        let registry = ReaderRegistry::builtin();
        for tag in ["csv", "excel", "json", "parquet"] {
            assert!(registry.constructors.contains_key(tag), "missing {tag}");
        }
    }
}
