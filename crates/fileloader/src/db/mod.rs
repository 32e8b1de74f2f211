//! DbAdapter capability and persisted state layout
//!
//! The pipeline engine is adapter-agnostic: every database touch goes
//! through [`DbAdapter`]. Dialect-specific SQL lives in [`dialect`]
//! implementations; the Postgres adapter executes it over sqlx, the memory
//! adapter interprets the same operations in-process for tests and local
//! dry runs.

pub mod dialect;
pub mod memory;
pub mod postgres;

use crate::config::{DbKind, Settings};
use crate::pipeline::batch::Value;
use crate::sources::SourceConfig;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fileloader_common::{LoadError, LoadResult};
use std::sync::Arc;

/// Name of the append-only per-file load log table.
pub const LOAD_LOG_TABLE: &str = "file_load_log";

/// Name of the cross-file dead-letter table.
pub const DLQ_TABLE: &str = "file_load_dlq";

/// Deterministic stage table name for one file load.
pub fn stage_table_name(source_name: &str, file_load_id: i64) -> String {
    format!("stg_{source_name}_{file_load_id}")
}

/// Terminal and in-flight states of a file load.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadState {
    Running,
    Succeeded,
    Failed,
    Duplicate,
    Cancelled,
}

impl LoadState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LoadState::Running => "running",
            LoadState::Succeeded => "succeeded",
            LoadState::Failed => "failed",
            LoadState::Duplicate => "duplicate",
            LoadState::Cancelled => "cancelled",
        }
    }
}

/// One row of `file_load_log`.
#[derive(Debug, Clone)]
pub struct LoadLogRow {
    pub file_load_id: i64,
    pub source_name: String,
    pub filename: String,
    pub content_hash: Option<String>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub state: LoadState,
    pub rows_read: u64,
    pub rows_valid: u64,
    pub rows_invalid: u64,
    pub rows_published: u64,
    pub error_kind: Option<String>,
    pub error_detail: Option<String>,
    /// Per-stage started/ended timestamps, keyed by stage name.
    pub stage_timings: serde_json::Value,
}

/// Partial update applied to a load-log row as the pipeline advances.
#[derive(Debug, Clone, Default)]
pub struct LoadLogPatch {
    pub content_hash: Option<String>,
    pub state: Option<LoadState>,
    pub rows_read: Option<u64>,
    pub rows_valid: Option<u64>,
    pub rows_invalid: Option<u64>,
    pub rows_published: Option<u64>,
    pub error_kind: Option<String>,
    pub error_detail: Option<String>,
    pub ended_at: Option<DateTime<Utc>>,
    pub stage_timings: Option<serde_json::Value>,
}

/// One validated row bound for the stage table, in `stage_columns()` order.
#[derive(Debug, Clone)]
pub struct StageRow {
    pub values: Vec<Value>,
}

/// One row bound for the DLQ table.
#[derive(Debug, Clone)]
pub struct DlqRow {
    pub file_load_id: i64,
    pub source_name: String,
    pub source_row_number: u64,
    pub grain_key: String,
    pub failed_fields: Vec<String>,
    pub reasons: Vec<String>,
    pub original_row_json: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// Outcome of a merge into the target.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeCounts {
    pub inserted: u64,
    pub updated: u64,
}

/// Scalar produced by an audit query.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ScalarValue {
    Int(i64),
    Float(f64),
    Null,
}

impl ScalarValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ScalarValue::Int(i) => Some(*i as f64),
            ScalarValue::Float(f) => Some(*f),
            ScalarValue::Null => None,
        }
    }
}

impl std::fmt::Display for ScalarValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ScalarValue::Int(i) => write!(f, "{i}"),
            ScalarValue::Float(v) => write!(f, "{v}"),
            ScalarValue::Null => write!(f, "NULL"),
        }
    }
}

/// Everything the pipeline needs from a database.
///
/// Implementations own their transactional boundaries: `merge_stage_to_target`
/// and the dialect fallbacks that need multiple statements run them inside a
/// single transaction.
#[async_trait]
pub trait DbAdapter: Send + Sync {
    fn kind(&self) -> DbKind;

    /// Create `file_load_log` / `file_load_dlq` (and any allocator tables)
    /// if missing.
    async fn ensure_system_tables(&self) -> LoadResult<()>;

    /// Allocate a file_load_id and insert a `running` log row.
    async fn start_load_log(
        &self,
        source_name: &str,
        filename: &str,
        started_at: DateTime<Utc>,
    ) -> LoadResult<i64>;

    async fn update_load_log(&self, file_load_id: i64, patch: &LoadLogPatch) -> LoadResult<()>;

    async fn get_load_log(&self, file_load_id: i64) -> LoadResult<Option<LoadLogRow>>;

    /// file_load_id of a prior `succeeded` load with the same filename and
    /// content hash, if any.
    async fn find_succeeded_load(
        &self,
        filename: &str,
        content_hash: &str,
    ) -> LoadResult<Option<i64>>;

    /// Create the per-file stage table (schema = target schema) plus an
    /// index on the grain fields.
    async fn create_stage_table(&self, stage: &str, source: &SourceConfig) -> LoadResult<()>;

    async fn drop_stage_table(&self, stage: &str) -> LoadResult<()>;

    async fn insert_stage_rows(
        &self,
        stage: &str,
        source: &SourceConfig,
        rows: &[StageRow],
    ) -> LoadResult<()>;

    async fn insert_dlq_rows(&self, rows: &[DlqRow]) -> LoadResult<()>;

    /// Example grain tuples that occur more than once in the stage table,
    /// up to `limit`.
    async fn grain_duplicates(
        &self,
        stage: &str,
        source: &SourceConfig,
        limit: u32,
    ) -> LoadResult<Vec<String>>;

    /// Run a read-only scalar query (audits).
    async fn execute_scalar(&self, sql: &str) -> LoadResult<ScalarValue>;

    /// Upsert stage rows into the target by grain key.
    async fn merge_stage_to_target(
        &self,
        stage: &str,
        source: &SourceConfig,
    ) -> LoadResult<MergeCounts>;

    /// Delete DLQ rows for this source whose grain now exists in the target.
    async fn clear_resolved_dlq(&self, source: &SourceConfig) -> LoadResult<u64>;

    /// Per-adapter value conversion applied to each stage row before
    /// binding (driver-native datetimes, decimal precision, nested JSON).
    fn convert_record(&self, row: &mut StageRow) {
        let _ = row;
    }
}

/// Build the configured DbAdapter.
pub async fn build_adapter(settings: &Settings) -> LoadResult<Arc<dyn DbAdapter>> {
    match settings.db_kind {
        DbKind::Memory => Ok(Arc::new(memory::MemoryDb::new())),
        DbKind::Postgresql => Ok(Arc::new(postgres::PostgresAdapter::connect(settings).await?)),
        DbKind::Mysql | DbKind::Mssql | DbKind::Bigquery => Err(LoadError::config(format!(
            "no driver integration for '{}' in this build; its SQL dialect is available to embedders",
            settings.db_kind.as_str()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_names_are_deterministic() {
        assert_eq!(stage_table_name("orders", 42), "stg_orders_42");
    }

    #[test]
    fn scalar_rendering() {
        assert_eq!(ScalarValue::Int(3).to_string(), "3");
        assert_eq!(ScalarValue::Null.to_string(), "NULL");
        assert_eq!(ScalarValue::Float(0.5).as_f64(), Some(0.5));
        assert_eq!(ScalarValue::Null.as_f64(), None);
    }
}
