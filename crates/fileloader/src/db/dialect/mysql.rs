//! MySQL dialect
//!
//! The merge relies on the target carrying a unique key over the grain
//! fields; `INSERT ... ON DUPLICATE KEY UPDATE` is the engine's single
//! statement upsert.

use super::{IdStrategy, SqlDialect};
use crate::db::{DLQ_TABLE, LOAD_LOG_TABLE};
use crate::sources::{SemanticType, SourceConfig};

pub struct MySqlDialect;

impl SqlDialect for MySqlDialect {
    fn name(&self) -> &'static str {
        "mysql"
    }

    fn placeholder(&self, _index: usize) -> String {
        "?".to_string()
    }

    fn column_type(&self, ty: SemanticType) -> &'static str {
        match ty {
            SemanticType::Integer => "BIGINT",
            SemanticType::Float => "DOUBLE",
            SemanticType::Boolean => "BOOLEAN",
            SemanticType::Text => "TEXT",
            SemanticType::Date => "DATE",
            SemanticType::Timestamp => "DATETIME(6)",
            SemanticType::Json => "JSON",
        }
    }

    fn cast_to_text(&self, expr: &str) -> String {
        format!("CAST({expr} AS CHAR)")
    }

    fn concat_with_pipe(&self, parts: &[String]) -> String {
        format!("CONCAT_WS('|', {})", parts.join(", "))
    }

    fn create_system_tables_sql(&self) -> Vec<String> {
        vec![
            format!(
                "CREATE TABLE IF NOT EXISTS {LOAD_LOG_TABLE} (\
                 file_load_id BIGINT AUTO_INCREMENT PRIMARY KEY, \
                 source_name VARCHAR(255) NOT NULL, \
                 filename VARCHAR(1024) NOT NULL, \
                 content_hash VARCHAR(64) NULL, \
                 started_at DATETIME(6) NOT NULL, \
                 ended_at DATETIME(6) NULL, \
                 state VARCHAR(32) NOT NULL, \
                 rows_read BIGINT NOT NULL DEFAULT 0, \
                 rows_valid BIGINT NOT NULL DEFAULT 0, \
                 rows_invalid BIGINT NOT NULL DEFAULT 0, \
                 rows_published BIGINT NOT NULL DEFAULT 0, \
                 error_kind VARCHAR(64) NULL, \
                 error_detail TEXT NULL, \
                 stage_timings JSON NULL)"
            ),
            format!(
                "CREATE TABLE IF NOT EXISTS {DLQ_TABLE} (\
                 file_load_id BIGINT NOT NULL, \
                 source_name VARCHAR(255) NOT NULL, \
                 source_row_number BIGINT NOT NULL, \
                 grain_key VARCHAR(1024) NOT NULL, \
                 failed_fields TEXT NOT NULL, \
                 reasons TEXT NOT NULL, \
                 original_row_json JSON NOT NULL, \
                 created_at DATETIME(6) NOT NULL, \
                 PRIMARY KEY (file_load_id, source_row_number))"
            ),
        ]
    }

    fn start_load_log_sql(&self) -> IdStrategy {
        IdStrategy::InsertThenQuery {
            insert: format!(
                "INSERT INTO {LOAD_LOG_TABLE} (source_name, filename, started_at, state) \
                 VALUES (?, ?, ?, ?)"
            ),
            query: "SELECT LAST_INSERT_ID()".to_string(),
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
        let column_list = columns.join(", ");
        let update_set = super::update_columns(source)
            .iter()
            .map(|c| format!("{c} = stage.{c}"))
            .collect::<Vec<_>>()
            .join(", ");

        vec![format!(
            "INSERT INTO {target} ({column_list}, etl_created_at) \
             SELECT {column_list}, '{now_iso}' FROM {stage} AS stage \
             ON DUPLICATE KEY UPDATE {update_set}, etl_updated_at = '{now_iso}'"
        )]
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_fixtures::orders_source;
    use super::*;

    #[test]
    fn merge_uses_on_duplicate_key() {
        let source = orders_source();
        let statements = MySqlDialect.merge_sql("stg_orders_7", "orders", &source, "2026-08-02T00:00:00Z");
        assert_eq!(statements.len(), 1);
        assert!(statements[0].contains("ON DUPLICATE KEY UPDATE"));
        assert!(!statements[0].contains("order_id = stage.order_id"));
    }

    #[test]
    fn grain_key_uses_concat_ws() {
        let source = orders_source();
        let sql = MySqlDialect.clear_resolved_dlq_sql(&source);
        assert!(sql.contains("CONCAT_WS('|'"));
        assert!(sql.contains("AS CHAR"));
    }
}
