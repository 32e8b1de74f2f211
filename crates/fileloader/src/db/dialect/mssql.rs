//! SQL Server dialect

use super::{grain_join_condition, update_columns, IdStrategy, SqlDialect};
use crate::db::{DLQ_TABLE, LOAD_LOG_TABLE};
use crate::sources::{SemanticType, SourceConfig};

pub struct MsSqlDialect;

impl SqlDialect for MsSqlDialect {
    fn name(&self) -> &'static str {
        "mssql"
    }

    fn placeholder(&self, index: usize) -> String {
        format!("@p{index}")
    }

    fn column_type(&self, ty: SemanticType) -> &'static str {
        match ty {
            SemanticType::Integer => "BIGINT",
            SemanticType::Float => "FLOAT",
            SemanticType::Boolean => "BIT",
            SemanticType::Text => "NVARCHAR(MAX)",
            SemanticType::Date => "DATE",
            SemanticType::Timestamp => "DATETIMEOFFSET",
            SemanticType::Json => "NVARCHAR(MAX)",
        }
    }

    fn cast_to_text(&self, expr: &str) -> String {
        format!("CAST({expr} AS NVARCHAR(MAX))")
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

    fn grain_duplicates_sql(&self, stage: &str, source: &SourceConfig, limit: u32) -> String {
        let grain = source.grain.join(", ");
        let key = self.concat_with_pipe(
            &source
                .grain
                .iter()
                .map(|g| self.cast_to_text(g))
                .collect::<Vec<_>>(),
        );
        // T-SQL has no LIMIT
        format!(
            "SELECT TOP {limit} {key} AS grain_key FROM {stage} \
             GROUP BY {grain} HAVING COUNT(*) > 1"
        )
    }

    fn create_system_tables_sql(&self) -> Vec<String> {
        vec![
            format!(
                "IF OBJECT_ID('{LOAD_LOG_TABLE}', 'U') IS NULL \
                 CREATE TABLE {LOAD_LOG_TABLE} (\
                 file_load_id BIGINT IDENTITY(1,1) PRIMARY KEY, \
                 source_name NVARCHAR(255) NOT NULL, \
                 filename NVARCHAR(1024) NOT NULL, \
                 content_hash NVARCHAR(64) NULL, \
                 started_at DATETIMEOFFSET NOT NULL, \
                 ended_at DATETIMEOFFSET NULL, \
                 state NVARCHAR(32) NOT NULL, \
                 rows_read BIGINT NOT NULL DEFAULT 0, \
                 rows_valid BIGINT NOT NULL DEFAULT 0, \
                 rows_invalid BIGINT NOT NULL DEFAULT 0, \
                 rows_published BIGINT NOT NULL DEFAULT 0, \
                 error_kind NVARCHAR(64) NULL, \
                 error_detail NVARCHAR(MAX) NULL, \
                 stage_timings NVARCHAR(MAX) NULL)"
            ),
            format!(
                "IF OBJECT_ID('{DLQ_TABLE}', 'U') IS NULL \
                 CREATE TABLE {DLQ_TABLE} (\
                 file_load_id BIGINT NOT NULL, \
                 source_name NVARCHAR(255) NOT NULL, \
                 source_row_number BIGINT NOT NULL, \
                 grain_key NVARCHAR(1024) NOT NULL, \
                 failed_fields NVARCHAR(MAX) NOT NULL, \
                 reasons NVARCHAR(MAX) NOT NULL, \
                 original_row_json NVARCHAR(MAX) NOT NULL, \
                 created_at DATETIMEOFFSET NOT NULL, \
                 PRIMARY KEY (file_load_id, source_row_number))"
            ),
        ]
    }

    fn start_load_log_sql(&self) -> IdStrategy {
        IdStrategy::InsertReturning {
            sql: format!(
                "INSERT INTO {LOAD_LOG_TABLE} (source_name, filename, started_at, state) \
                 OUTPUT INSERTED.file_load_id \
                 VALUES (@p1, @p2, @p3, @p4)"
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

        // the trailing semicolon is mandatory for T-SQL MERGE
        vec![format!(
            "MERGE INTO {target} AS target \
             USING {stage} AS stage \
             ON {join} \
             WHEN MATCHED AND stage.etl_row_hash <> target.etl_row_hash THEN \
             UPDATE SET {update_set}, etl_updated_at = '{now_iso}' \
             WHEN NOT MATCHED THEN \
             INSERT ({insert_columns}) VALUES ({insert_values}, '{now_iso}');"
        )]
    }
}
