//! In-memory DbAdapter
//!
//! Backs the test suite and `memory://` dry runs with the same operation
//! contract as the real adapters. Audit scalars support the aggregate
//! shapes the engine itself generates (`COUNT(*)`, `SUM/MIN/MAX/AVG(col)`
//! over one table); anything else is an error rather than a silent zero.

use super::{
    DbAdapter, DlqRow, LoadLogPatch, LoadLogRow, LoadState, MergeCounts, ScalarValue, StageRow,
};
use crate::config::DbKind;
use crate::pipeline::batch::Value;
use crate::sources::SourceConfig;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fileloader_common::{LoadError, LoadResult};
use regex::Regex;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

#[derive(Debug, Clone)]
struct Table {
    columns: Vec<String>,
    rows: Vec<Vec<Value>>,
}

impl Table {
    fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    fn grain_key(&self, row: &[Value], grain: &[String]) -> String {
        grain
            .iter()
            .filter_map(|g| self.column_index(g))
            .map(|i| row[i].render())
            .collect::<Vec<_>>()
            .join("|")
    }
}

#[derive(Default)]
struct State {
    next_id: i64,
    load_log: HashMap<i64, LoadLogRow>,
    tables: HashMap<String, Table>,
    dlq: Vec<DlqRow>,
    /// op name -> queued injected failures (transient flag each).
    fail_plan: HashMap<String, VecDeque<bool>>,
}

#[derive(Default)]
pub struct MemoryDb {
    state: Mutex<State>,
}

fn lock(state: &Mutex<State>) -> std::sync::MutexGuard<'_, State> {
    state.lock().unwrap_or_else(|e| e.into_inner())
}

impl MemoryDb {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a failure for the named operation; consumed one per call.
    pub fn inject_failure(&self, op: &str, transient: bool) {
        lock(&self.state)
            .fail_plan
            .entry(op.to_string())
            .or_default()
            .push_back(transient);
    }

    fn take_failure(state: &mut State, op: &str) -> LoadResult<()> {
        if let Some(queue) = state.fail_plan.get_mut(op) {
            if let Some(transient) = queue.pop_front() {
                return Err(if transient {
                    LoadError::database_transient(op, "injected failure")
                } else {
                    LoadError::database(op, "injected failure")
                });
            }
        }
        Ok(())
    }

    /// Number of rows currently in a table; 0 if the table does not exist.
    pub fn table_len(&self, table: &str) -> usize {
        lock(&self.state)
            .tables
            .get(table)
            .map(|t| t.rows.len())
            .unwrap_or(0)
    }

    pub fn table_exists(&self, table: &str) -> bool {
        lock(&self.state).tables.contains_key(table)
    }

    /// Stage tables currently present (prefix `stg_`).
    pub fn stage_tables(&self) -> Vec<String> {
        lock(&self.state)
            .tables
            .keys()
            .filter(|k| k.starts_with("stg_"))
            .cloned()
            .collect()
    }

    pub fn dlq_rows(&self) -> Vec<DlqRow> {
        lock(&self.state).dlq.clone()
    }

    pub fn load_log_rows(&self) -> Vec<LoadLogRow> {
        let state = lock(&self.state);
        let mut rows: Vec<LoadLogRow> = state.load_log.values().cloned().collect();
        rows.sort_by_key(|r| r.file_load_id);
        rows
    }

    /// Column values of a target table, for assertions.
    pub fn column_values(&self, table: &str, column: &str) -> Vec<Value> {
        let state = lock(&self.state);
        let Some(t) = state.tables.get(table) else {
            return Vec::new();
        };
        let Some(idx) = t.column_index(column) else {
            return Vec::new();
        };
        t.rows.iter().map(|r| r[idx].clone()).collect()
    }

    fn aggregate(table: &Table, func: &str, column: Option<&str>) -> LoadResult<ScalarValue> {
        if func.eq_ignore_ascii_case("count") {
            return Ok(ScalarValue::Int(table.rows.len() as i64));
        }
        let column = column
            .ok_or_else(|| LoadError::database("execute_scalar", "aggregate needs a column"))?;
        let idx = table.column_index(column).ok_or_else(|| {
            LoadError::database("execute_scalar", format!("unknown column '{column}'"))
        })?;
        let numbers: Vec<f64> = table
            .rows
            .iter()
            .filter_map(|r| match &r[idx] {
                Value::Integer(i) => Some(*i as f64),
                Value::Float(f) => Some(*f),
                _ => None,
            })
            .collect();
        if numbers.is_empty() {
            return Ok(ScalarValue::Null);
        }
        let result = match func.to_ascii_lowercase().as_str() {
            "sum" => numbers.iter().sum(),
            "min" => numbers.iter().cloned().fold(f64::INFINITY, f64::min),
            "max" => numbers.iter().cloned().fold(f64::NEG_INFINITY, f64::max),
            "avg" => numbers.iter().sum::<f64>() / numbers.len() as f64,
            other => {
                return Err(LoadError::database(
                    "execute_scalar",
                    format!("unsupported aggregate '{other}'"),
                ));
            },
        };
        Ok(ScalarValue::Float(result))
    }
}

#[async_trait]
impl DbAdapter for MemoryDb {
    fn kind(&self) -> DbKind {
        DbKind::Memory
    }

    async fn ensure_system_tables(&self) -> LoadResult<()> {
        Ok(())
    }

    async fn start_load_log(
        &self,
        source_name: &str,
        filename: &str,
        started_at: DateTime<Utc>,
    ) -> LoadResult<i64> {
        let mut state = lock(&self.state);
        Self::take_failure(&mut state, "start_load_log")?;
        state.next_id += 1;
        let id = state.next_id;
        state.load_log.insert(
            id,
            LoadLogRow {
                file_load_id: id,
                source_name: source_name.to_string(),
                filename: filename.to_string(),
                content_hash: None,
                started_at,
                ended_at: None,
                state: LoadState::Running,
                rows_read: 0,
                rows_valid: 0,
                rows_invalid: 0,
                rows_published: 0,
                error_kind: None,
                error_detail: None,
                stage_timings: serde_json::Value::Null,
            },
        );
        Ok(id)
    }

    async fn update_load_log(&self, file_load_id: i64, patch: &LoadLogPatch) -> LoadResult<()> {
        let mut state = lock(&self.state);
        Self::take_failure(&mut state, "update_load_log")?;
        let row = state.load_log.get_mut(&file_load_id).ok_or_else(|| {
            LoadError::database("update_load_log", format!("no log row {file_load_id}"))
        })?;
        if let Some(ref hash) = patch.content_hash {
            row.content_hash = Some(hash.clone());
        }
        if let Some(s) = patch.state {
            row.state = s;
        }
        if let Some(n) = patch.rows_read {
            row.rows_read = n;
        }
        if let Some(n) = patch.rows_valid {
            row.rows_valid = n;
        }
        if let Some(n) = patch.rows_invalid {
            row.rows_invalid = n;
        }
        if let Some(n) = patch.rows_published {
            row.rows_published = n;
        }
        if let Some(ref kind) = patch.error_kind {
            row.error_kind = Some(kind.clone());
        }
        if let Some(ref detail) = patch.error_detail {
            row.error_detail = Some(detail.clone());
        }
        if let Some(ended) = patch.ended_at {
            row.ended_at = Some(ended);
        }
        if let Some(ref timings) = patch.stage_timings {
            row.stage_timings = timings.clone();
        }
        Ok(())
    }

    async fn get_load_log(&self, file_load_id: i64) -> LoadResult<Option<LoadLogRow>> {
        Ok(lock(&self.state).load_log.get(&file_load_id).cloned())
    }

    async fn find_succeeded_load(
        &self,
        filename: &str,
        content_hash: &str,
    ) -> LoadResult<Option<i64>> {
        let state = lock(&self.state);
        Ok(state
            .load_log
            .values()
            .filter(|r| {
                r.state == LoadState::Succeeded
                    && r.filename == filename
                    && r.content_hash.as_deref() == Some(content_hash)
            })
            .map(|r| r.file_load_id)
            .max())
    }

    async fn create_stage_table(&self, stage: &str, source: &SourceConfig) -> LoadResult<()> {
        let mut state = lock(&self.state);
        // transient faults keep their classification so callers can retry;
        // anything else is a stage-create failure
        Self::take_failure(&mut state, "create_stage_table").map_err(|e| {
            if e.is_transient() {
                e
            } else {
                LoadError::StageCreateFailed {
                    table: stage.to_string(),
                    reason: e.to_string(),
                }
            }
        })?;
        if state.tables.contains_key(stage) {
            return Err(LoadError::StageCreateFailed {
                table: stage.to_string(),
                reason: "table already exists".to_string(),
            });
        }
        state.tables.insert(
            stage.to_string(),
            Table {
                columns: source.stage_columns(),
                rows: Vec::new(),
            },
        );
        Ok(())
    }

    async fn drop_stage_table(&self, stage: &str) -> LoadResult<()> {
        let mut state = lock(&self.state);
        Self::take_failure(&mut state, "drop_stage_table")?;
        state.tables.remove(stage);
        Ok(())
    }

    async fn insert_stage_rows(
        &self,
        stage: &str,
        _source: &SourceConfig,
        rows: &[StageRow],
    ) -> LoadResult<()> {
        let mut state = lock(&self.state);
        Self::take_failure(&mut state, "insert_stage_rows").map_err(|e| {
            LoadError::BulkInsertFailed {
                table: stage.to_string(),
                reason: e.to_string(),
                transient: e.is_transient(),
            }
        })?;
        let table = state.tables.get_mut(stage).ok_or_else(|| {
            LoadError::database("insert_stage_rows", format!("no such table '{stage}'"))
        })?;
        for row in rows {
            if row.values.len() != table.columns.len() {
                return Err(LoadError::database(
                    "insert_stage_rows",
                    format!(
                        "arity mismatch: {} values for {} columns",
                        row.values.len(),
                        table.columns.len()
                    ),
                ));
            }
            table.rows.push(row.values.clone());
        }
        Ok(())
    }

    async fn insert_dlq_rows(&self, rows: &[DlqRow]) -> LoadResult<()> {
        let mut state = lock(&self.state);
        Self::take_failure(&mut state, "insert_dlq_rows")?;
        // idempotency on (file_load_id, source_row_number)
        for row in rows {
            if !state.dlq.iter().any(|r| {
                r.file_load_id == row.file_load_id
                    && r.source_row_number == row.source_row_number
            }) {
                state.dlq.push(row.clone());
            }
        }
        Ok(())
    }

    async fn grain_duplicates(
        &self,
        stage: &str,
        source: &SourceConfig,
        limit: u32,
    ) -> LoadResult<Vec<String>> {
        let state = lock(&self.state);
        let table = state.tables.get(stage).ok_or_else(|| {
            LoadError::database("grain_duplicates", format!("no such table '{stage}'"))
        })?;
        let mut counts: HashMap<String, u32> = HashMap::new();
        for row in &table.rows {
            *counts
                .entry(table.grain_key(row, &source.grain))
                .or_default() += 1;
        }
        let mut duplicates: Vec<String> = counts
            .into_iter()
            .filter(|(_, count)| *count > 1)
            .map(|(key, _)| key)
            .collect();
        duplicates.sort();
        duplicates.truncate(limit as usize);
        Ok(duplicates)
    }

    async fn execute_scalar(&self, sql: &str) -> LoadResult<ScalarValue> {
        let mut state = lock(&self.state);
        Self::take_failure(&mut state, "execute_scalar")?;
        let pattern = Regex::new(
            r"(?i)^\s*SELECT\s+(COUNT\(\*\)|(SUM|MIN|MAX|AVG)\((\w+)\))\s+FROM\s+([\w.]+)\s*$",
        )
        .map_err(|e| LoadError::database("execute_scalar", e.to_string()))?;
        let captures = pattern.captures(sql).ok_or_else(|| {
            LoadError::database(
                "execute_scalar",
                format!("unsupported scalar SQL for memory adapter: {sql}"),
            )
        })?;
        let table_name = captures.get(4).map(|m| m.as_str()).unwrap_or_default();
        let table = state.tables.get(table_name).ok_or_else(|| {
            LoadError::database("execute_scalar", format!("no such table '{table_name}'"))
        })?;
        if captures.get(1).map(|m| m.as_str().to_ascii_lowercase()) == Some("count(*)".into()) {
            Self::aggregate(table, "count", None)
        } else {
            let func = captures.get(2).map(|m| m.as_str()).unwrap_or("sum");
            let column = captures.get(3).map(|m| m.as_str());
            Self::aggregate(table, func, column)
        }
    }

    async fn merge_stage_to_target(
        &self,
        stage: &str,
        source: &SourceConfig,
    ) -> LoadResult<MergeCounts> {
        let mut state = lock(&self.state);
        Self::take_failure(&mut state, "merge_stage_to_target").map_err(|e| {
            LoadError::PublishFailed {
                stage: stage.to_string(),
                target: source.target_table.clone(),
                reason: e.to_string(),
            }
        })?;

        let stage_table = state
            .tables
            .get(stage)
            .cloned()
            .ok_or_else(|| LoadError::PublishFailed {
                stage: stage.to_string(),
                target: source.target_table.clone(),
                reason: "stage table does not exist".to_string(),
            })?;

        // targets materialize with the stage schema on first publish
        let target = state
            .tables
            .entry(source.target_table.clone())
            .or_insert_with(|| Table {
                columns: stage_table.columns.clone(),
                rows: Vec::new(),
            });

        let hash_idx = stage_table.column_index("etl_row_hash").ok_or_else(|| {
            LoadError::PublishFailed {
                stage: stage.to_string(),
                target: source.target_table.clone(),
                reason: "stage table has no etl_row_hash column".to_string(),
            }
        })?;
        let mut counts = MergeCounts::default();

        for stage_row in &stage_table.rows {
            let key = stage_table.grain_key(stage_row, &source.grain);
            let existing = target
                .rows
                .iter_mut()
                .find(|row| stage_table.grain_key(row, &source.grain) == key);
            match existing {
                None => {
                    target.rows.push(stage_row.clone());
                    counts.inserted += 1;
                },
                Some(row) => {
                    if row[hash_idx] != stage_row[hash_idx] {
                        *row = stage_row.clone();
                        counts.updated += 1;
                    }
                },
            }
        }
        Ok(counts)
    }

    async fn clear_resolved_dlq(&self, source: &SourceConfig) -> LoadResult<u64> {
        let mut state = lock(&self.state);
        Self::take_failure(&mut state, "clear_resolved_dlq")?;
        let target_keys: Vec<String> = match state.tables.get(&source.target_table) {
            None => return Ok(0),
            Some(target) => target
                .rows
                .iter()
                .map(|row| target.grain_key(row, &source.grain))
                .collect(),
        };
        let before = state.dlq.len();
        state
            .dlq
            .retain(|r| r.source_name != source.name || !target_keys.contains(&r.grain_key));
        Ok((before - state.dlq.len()) as u64)
    }
}
