//! PostgreSQL dialect

use super::{grain_join_condition, update_columns, IdStrategy, SqlDialect};
use crate::db::{DLQ_TABLE, LOAD_LOG_TABLE};
use crate::sources::{SemanticType, SourceConfig};

pub struct PostgresDialect;

impl SqlDialect for PostgresDialect {
    fn name(&self) -> &'static str {
        "postgresql"
    }

    fn placeholder(&self, index: usize) -> String {
        format!("${index}")
    }

    fn column_type(&self, ty: SemanticType) -> &'static str {
        match ty {
            SemanticType::Integer => "BIGINT",
            SemanticType::Float => "DOUBLE PRECISION",
            SemanticType::Boolean => "BOOLEAN",
            SemanticType::Text => "TEXT",
            SemanticType::Date => "DATE",
            SemanticType::Timestamp => "TIMESTAMPTZ",
            SemanticType::Json => "JSONB",
        }
    }

    fn create_system_tables_sql(&self) -> Vec<String> {
        vec![
            format!(
                "CREATE TABLE IF NOT EXISTS {LOAD_LOG_TABLE} (\
                 file_load_id BIGSERIAL PRIMARY KEY, \
                 source_name TEXT NOT NULL, \
                 filename TEXT NOT NULL, \
                 content_hash TEXT NULL, \
                 started_at TIMESTAMPTZ NOT NULL, \
                 ended_at TIMESTAMPTZ NULL, \
                 state TEXT NOT NULL, \
                 rows_read BIGINT NOT NULL DEFAULT 0, \
                 rows_valid BIGINT NOT NULL DEFAULT 0, \
                 rows_invalid BIGINT NOT NULL DEFAULT 0, \
                 rows_published BIGINT NOT NULL DEFAULT 0, \
                 error_kind TEXT NULL, \
                 error_detail TEXT NULL, \
                 stage_timings JSONB NULL)"
            ),
            format!(
                "CREATE INDEX IF NOT EXISTS idx_{LOAD_LOG_TABLE}_dedup \
                 ON {LOAD_LOG_TABLE} (filename, content_hash, state)"
            ),
            format!(
                "CREATE TABLE IF NOT EXISTS {DLQ_TABLE} (\
                 file_load_id BIGINT NOT NULL, \
                 source_name TEXT NOT NULL, \
                 source_row_number BIGINT NOT NULL, \
                 grain_key TEXT NOT NULL, \
                 failed_fields TEXT NOT NULL, \
                 reasons TEXT NOT NULL, \
                 original_row_json JSONB NOT NULL, \
                 created_at TIMESTAMPTZ NOT NULL, \
                 PRIMARY KEY (file_load_id, source_row_number))"
            ),
            format!(
                "CREATE INDEX IF NOT EXISTS idx_{DLQ_TABLE}_grain \
                 ON {DLQ_TABLE} (source_name, grain_key)"
            ),
        ]
    }

    fn start_load_log_sql(&self) -> IdStrategy {
        IdStrategy::InsertReturning {
            sql: format!(
                "INSERT INTO {LOAD_LOG_TABLE} (source_name, filename, started_at, state) \
                 VALUES ($1, $2, $3, $4) RETURNING file_load_id"
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
            "MERGE INTO {target} AS target \
             USING {stage} AS stage \
             ON {join} \
             WHEN MATCHED AND stage.etl_row_hash <> target.etl_row_hash THEN \
             UPDATE SET {update_set}, etl_updated_at = '{now_iso}' \
             WHEN NOT MATCHED THEN \
             INSERT ({insert_columns}) VALUES ({insert_values}, '{now_iso}')"
        )]
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_fixtures::orders_source;
    use super::*;

    #[test]
    fn merge_is_a_single_statement() {
        let source = orders_source();
        let statements = PostgresDialect.merge_sql("stg_orders_7", "orders", &source, "2026-08-02T00:00:00Z");
        assert_eq!(statements.len(), 1);
        let sql = &statements[0];
        assert!(sql.starts_with("MERGE INTO orders AS target"));
        assert!(sql.contains("ON target.order_id = stage.order_id"));
        assert!(sql.contains("stage.etl_row_hash <> target.etl_row_hash"));
        assert!(sql.contains("WHEN NOT MATCHED THEN"));
        // grain columns are never updated
        assert!(!sql.contains("order_id = stage.order_id,"));
    }

    #[test]
    fn id_allocation_uses_returning() {
        match PostgresDialect.start_load_log_sql() {
            IdStrategy::InsertReturning { sql } => {
                assert!(sql.contains("RETURNING file_load_id"));
            },
            other => panic!("unexpected strategy: {other:?}"),
        }
    }
}
