//! BigQuery dialect
//!
//! BigQuery has no sequences, so `file_load_id` comes from a single-row
//! allocator table bumped inside a transaction. Stage tables carry no
//! indexes (the engine has none).

use super::{grain_join_condition, update_columns, IdStrategy, SqlDialect};
use crate::db::{DLQ_TABLE, LOAD_LOG_TABLE};
use crate::sources::{SemanticType, SourceConfig};

/// Single-row table holding the next free file_load_id.
pub const ID_ALLOC_TABLE: &str = "file_load_id_alloc";

pub struct BigQueryDialect;

impl SqlDialect for BigQueryDialect {
    fn name(&self) -> &'static str {
        "bigquery"
    }

    fn placeholder(&self, _index: usize) -> String {
        "?".to_string()
    }

    fn column_type(&self, ty: SemanticType) -> &'static str {
        match ty {
            SemanticType::Integer => "INT64",
            SemanticType::Float => "FLOAT64",
            SemanticType::Boolean => "BOOL",
            SemanticType::Text => "STRING",
            SemanticType::Date => "DATE",
            SemanticType::Timestamp => "TIMESTAMP",
            SemanticType::Json => "JSON",
        }
    }

    fn cast_to_text(&self, expr: &str) -> String {
        format!("CAST({expr} AS STRING)")
    }

    fn concat_with_pipe(&self, parts: &[String]) -> String {
        let mut interleaved = Vec::with_capacity(parts.len() * 2);
        for (i, part) in parts.iter().enumerate() {
            if i > 0 {
                interleaved.push("'|'".to_string());
            }
            interleaved.push(part.clone());
        }
        format!("CONCAT({})", interleaved.join(", "))
    }

    fn create_stage_table_sql(&self, stage: &str, source: &SourceConfig) -> Vec<String> {
        let mut columns: Vec<String> = source
            .fields
            .iter()
            .map(|f| {
                // BigQuery DDL: NOT NULL only; nullable is the default mode
                let constraint = if f.nullable { "" } else { " NOT NULL" };
                format!("{} {}{constraint}", f.name, self.column_type(f.semantic_type))
            })
            .collect();
        columns.push("source_filename STRING NOT NULL".to_string());
        columns.push("file_load_id INT64 NOT NULL".to_string());
        columns.push("etl_row_hash STRING NOT NULL".to_string());

        vec![format!("CREATE TABLE {stage} ({})", columns.join(", "))]
    }

    fn create_system_tables_sql(&self) -> Vec<String> {
        vec![
            format!(
                "CREATE TABLE IF NOT EXISTS {LOAD_LOG_TABLE} (\
                 file_load_id INT64 NOT NULL, \
                 source_name STRING NOT NULL, \
                 filename STRING NOT NULL, \
                 content_hash STRING, \
                 started_at TIMESTAMP NOT NULL, \
                 ended_at TIMESTAMP, \
                 state STRING NOT NULL, \
                 rows_read INT64 NOT NULL, \
                 rows_valid INT64 NOT NULL, \
                 rows_invalid INT64 NOT NULL, \
                 rows_published INT64 NOT NULL, \
                 error_kind STRING, \
                 error_detail STRING, \
                 stage_timings JSON)"
            ),
            format!(
                "CREATE TABLE IF NOT EXISTS {DLQ_TABLE} (\
                 file_load_id INT64 NOT NULL, \
                 source_name STRING NOT NULL, \
                 source_row_number INT64 NOT NULL, \
                 grain_key STRING NOT NULL, \
                 failed_fields STRING NOT NULL, \
                 reasons STRING NOT NULL, \
                 original_row_json JSON NOT NULL, \
                 created_at TIMESTAMP NOT NULL)"
            ),
            format!(
                "CREATE TABLE IF NOT EXISTS {ID_ALLOC_TABLE} (next_id INT64 NOT NULL)"
            ),
            format!(
                "INSERT INTO {ID_ALLOC_TABLE} (next_id) \
                 SELECT 1 FROM (SELECT 1) WHERE NOT EXISTS (SELECT 1 FROM {ID_ALLOC_TABLE})"
            ),
        ]
    }

    fn start_load_log_sql(&self) -> IdStrategy {
        IdStrategy::Allocator {
            update: format!("UPDATE {ID_ALLOC_TABLE} SET next_id = next_id + 1 WHERE TRUE"),
            select: format!("SELECT next_id - 1 FROM {ID_ALLOC_TABLE}"),
            insert_log: format!(
                "INSERT INTO {LOAD_LOG_TABLE} \
                 (file_load_id, source_name, filename, started_at, state, \
                 rows_read, rows_valid, rows_invalid, rows_published) \
                 VALUES (?, ?, ?, ?, ?, 0, 0, 0, 0)"
            ),
        }
    }

    fn merge_sql(
        &self,
        stage: &str,
        target: &str,
        source: &SourceConfig,
        now_iso: &str,
    ) -> Vec<String> {
        let columns = source.stage_columns();
        let insert_columns = format!("{}, etl_created_at", columns.join(", "));
        let insert_values = columns
            .iter()
            .map(|c| format!("stage.{c}"))
            .collect::<Vec<_>>()
            .join(", ");
        let update_set = update_columns(source)
            .iter()
            .map(|c| format!("{c} = stage.{c}"))
            .collect::<Vec<_>>()
            .join(", ");
        let join = grain_join_condition(source);

        vec![format!(
            "MERGE {target} AS target \
             USING {stage} AS stage \
             ON {join} \
             WHEN MATCHED AND stage.etl_row_hash != target.etl_row_hash THEN \
             UPDATE SET {update_set}, etl_updated_at = TIMESTAMP '{now_iso}' \
             WHEN NOT MATCHED THEN \
             INSERT ({insert_columns}) VALUES ({insert_values}, TIMESTAMP '{now_iso}')"
        )]
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_fixtures::orders_source;
    use super::*;

    #[test]
    fn id_allocation_goes_through_the_allocator_table() {
        match BigQueryDialect.start_load_log_sql() {
            IdStrategy::Allocator {
                update,
                select,
                insert_log,
            } => {
                assert!(update.contains(ID_ALLOC_TABLE));
                assert!(select.contains("next_id - 1"));
                assert!(insert_log.contains("file_load_id"));
            },
            other => panic!("unexpected strategy: {other:?}"),
        }
    }

    #[test]
    fn stage_ddl_has_no_index() {
        let source = orders_source();
        let statements = BigQueryDialect.create_stage_table_sql("stg_orders_7", &source);
        assert_eq!(statements.len(), 1);
        assert!(statements[0].contains("INT64"));
    }

    #[test]
    fn merge_stamps_timestamps() {
        let source = orders_source();
        let statements =
            BigQueryDialect.merge_sql("stg_orders_7", "orders", &source, "2026-08-02T00:00:00Z");
        assert!(statements[0].contains("TIMESTAMP '2026-08-02T00:00:00Z'"));
    }
}
