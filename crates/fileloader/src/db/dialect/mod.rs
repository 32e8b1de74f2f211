//! Per-database SQL generation
//!
//! One dialect per supported engine, each returning parameterised SQL
//! strings. The orchestration code never sees dialect differences; adapters
//! pick a dialect and execute its statements. Identifiers (table and column
//! names) come from registered source configurations, never from file
//! content.

pub mod bigquery;
pub mod mssql;
pub mod mysql;
pub mod postgres;

use crate::db::{DLQ_TABLE, LOAD_LOG_TABLE};
use crate::sources::{SemanticType, SourceConfig};

pub use bigquery::BigQueryDialect;
pub use mssql::MsSqlDialect;
pub use mysql::MySqlDialect;
pub use postgres::PostgresDialect;

/// How a dialect allocates the next `file_load_id` while inserting the
/// `running` log row. Bind order for the insert statements is
/// (source_name, filename, started_at, state).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdStrategy {
    /// Single insert that returns the generated id (sequences/identity).
    InsertReturning { sql: String },
    /// Insert, then read the generated id back in the same session.
    InsertThenQuery { insert: String, query: String },
    /// No sequences: bump a single-row allocator table inside a
    /// transaction, read the id, then insert the log row with it bound
    /// first: (file_load_id, source_name, filename, started_at, state).
    Allocator {
        update: String,
        select: String,
        insert_log: String,
    },
}

pub trait SqlDialect: Send + Sync {
    fn name(&self) -> &'static str;

    /// Positional placeholder for the 1-based parameter `index`.
    fn placeholder(&self, index: usize) -> String;

    fn column_type(&self, ty: SemanticType) -> &'static str;

    /// Render an expression casting `expr` to the dialect's text type.
    fn cast_to_text(&self, expr: &str) -> String {
        format!("CAST({expr} AS TEXT)")
    }

    /// Concatenate already-text expressions with a `|` separator, matching
    /// the engine-side grain key rendering.
    fn concat_with_pipe(&self, parts: &[String]) -> String {
        parts.join(" || '|' || ")
    }

    /// Statements creating the system tables if absent.
    fn create_system_tables_sql(&self) -> Vec<String>;

    fn start_load_log_sql(&self) -> IdStrategy;

    fn drop_table_sql(&self, table: &str) -> String {
        format!("DROP TABLE IF EXISTS {table}")
    }

    /// Stage DDL: the table plus an index over the grain fields.
    fn create_stage_table_sql(&self, stage: &str, source: &SourceConfig) -> Vec<String> {
        let mut columns: Vec<String> = source
            .fields
            .iter()
            .map(|f| {
                let null = if f.nullable { "NULL" } else { "NOT NULL" };
                format!("{} {} {}", f.name, self.column_type(f.semantic_type), null)
            })
            .collect();
        columns.push(format!("source_filename {} NOT NULL", self.column_type(SemanticType::Text)));
        columns.push("file_load_id BIGINT NOT NULL".to_string());
        columns.push(format!("etl_row_hash {} NOT NULL", self.column_type(SemanticType::Text)));

        let table = format!("CREATE TABLE {stage} ({})", columns.join(", "));
        let index = format!(
            "CREATE INDEX idx_{stage}_grain ON {stage} ({})",
            source.grain.join(", ")
        );
        vec![table, index]
    }

    /// Multi-row parameterised insert for `row_count` rows.
    fn insert_rows_sql(&self, table: &str, columns: &[String], row_count: usize) -> String {
        let mut index = 0;
        let rows: Vec<String> = (0..row_count)
            .map(|_| {
                let placeholders: Vec<String> = columns
                    .iter()
                    .map(|_| {
                        index += 1;
                        self.placeholder(index)
                    })
                    .collect();
                format!("({})", placeholders.join(", "))
            })
            .collect();
        format!(
            "INSERT INTO {table} ({}) VALUES {}",
            columns.join(", "),
            rows.join(", ")
        )
    }

    /// Grain tuples appearing more than once in the stage table.
    fn grain_duplicates_sql(&self, stage: &str, source: &SourceConfig, limit: u32) -> String {
        let grain = source.grain.join(", ");
        let key = self.concat_with_pipe(
            &source
                .grain
                .iter()
                .map(|g| self.cast_to_text(g))
                .collect::<Vec<_>>(),
        );
        format!(
            "SELECT {key} AS grain_key FROM {stage} \
             GROUP BY {grain} HAVING COUNT(*) > 1 LIMIT {limit}"
        )
    }

    /// Rows in stage whose grain already exists in the target. Subtracted
    /// from the stage row count to get the insert count (EXISTS is cheaper
    /// than NOT EXISTS here).
    fn matched_count_sql(&self, stage: &str, target: &str, source: &SourceConfig) -> String {
        let join = grain_join_condition(source);
        format!(
            "SELECT COUNT(*) FROM {stage} AS stage WHERE EXISTS \
             (SELECT 1 FROM {target} AS target WHERE {join})"
        )
    }

    /// Rows in stage that match the target but carry a different row hash.
    fn changed_count_sql(&self, stage: &str, target: &str, source: &SourceConfig) -> String {
        let join = grain_join_condition(source);
        format!(
            "SELECT COUNT(*) FROM {stage} AS stage WHERE EXISTS \
             (SELECT 1 FROM {target} AS target WHERE {join} \
             AND stage.etl_row_hash <> target.etl_row_hash)"
        )
    }

    /// The merge itself. `now_iso` stamps etl_created_at/etl_updated_at.
    /// More than one statement means "run inside one transaction".
    fn merge_sql(
        &self,
        stage: &str,
        target: &str,
        source: &SourceConfig,
        now_iso: &str,
    ) -> Vec<String>;

    /// Delete DLQ rows for this source whose grain is now present in the
    /// target (binds: source_name).
    fn clear_resolved_dlq_sql(&self, source: &SourceConfig) -> String {
        let key = self.concat_with_pipe(
            &source
                .grain
                .iter()
                .map(|g| self.cast_to_text(&format!("t.{g}")))
                .collect::<Vec<_>>(),
        );
        format!(
            "DELETE FROM {DLQ_TABLE} WHERE source_name = {} AND EXISTS \
             (SELECT 1 FROM {} AS t WHERE {key} = {DLQ_TABLE}.grain_key)",
            self.placeholder(1),
            source.target_table,
        )
    }

    /// Lookup for the duplicate-file check (binds: filename, content_hash).
    fn find_succeeded_load_sql(&self) -> String {
        format!(
            "SELECT file_load_id FROM {LOAD_LOG_TABLE} \
             WHERE filename = {} AND content_hash = {} AND state = 'succeeded' \
             ORDER BY file_load_id DESC",
            self.placeholder(1),
            self.placeholder(2),
        )
    }
}

/// `target.g = stage.g AND ...` over the grain fields.
pub fn grain_join_condition(source: &SourceConfig) -> String {
    source
        .grain
        .iter()
        .map(|g| format!("target.{g} = stage.{g}"))
        .collect::<Vec<_>>()
        .join(" AND ")
}

/// Non-grain columns updated on merge, bookkeeping columns included.
pub fn update_columns(source: &SourceConfig) -> Vec<String> {
    source
        .stage_columns()
        .into_iter()
        .filter(|c| !source.grain.contains(c))
        .collect()
}

/// Dialect for a database kind name (`postgresql`, `mysql`, `mssql`,
/// `bigquery`). Registered statically; a keyed lookup, not reflection.
pub fn dialect_for(kind: &str) -> Option<Box<dyn SqlDialect>> {
    match kind {
        "postgresql" | "postgres" => Some(Box::new(PostgresDialect)),
        "mysql" => Some(Box::new(MySqlDialect)),
        "mssql" => Some(Box::new(MsSqlDialect)),
        "bigquery" => Some(Box::new(BigQueryDialect)),
        _ => None,
    }
}
