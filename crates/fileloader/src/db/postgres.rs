//! PostgreSQL DbAdapter over sqlx
//!
//! All queries are runtime strings: stage table names are derived per file,
//! so there is nothing for compile-time checking to hold on to. Identifiers
//! come from registered source configurations only.

use super::dialect::{IdStrategy, PostgresDialect, SqlDialect};
use super::{
    DbAdapter, DlqRow, LoadLogPatch, LoadLogRow, LoadState, MergeCounts, ScalarValue, StageRow,
    DLQ_TABLE, LOAD_LOG_TABLE,
};
use crate::config::{DbKind, Settings};
use crate::pipeline::batch::Value;
use crate::sources::{SemanticType, SourceConfig};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fileloader_common::{LoadError, LoadResult};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Postgres, Row};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Postgres SQLSTATEs worth retrying: serialization failure, deadlock,
/// query cancelled (statement timeout).
const TRANSIENT_SQLSTATES: &[&str] = &["40001", "40P01", "57014"];

pub struct PostgresAdapter {
    pool: PgPool,
    dialect: PostgresDialect,
}

fn classify(operation: &str, error: sqlx::Error) -> LoadError {
    let transient = match &error {
        sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut => true,
        sqlx::Error::Database(db) => db
            .code()
            .map(|code| TRANSIENT_SQLSTATES.contains(&code.as_ref()))
            .unwrap_or(false),
        _ => false,
    };
    if transient {
        LoadError::database_transient(operation, error.to_string())
    } else {
        LoadError::database(operation, error.to_string())
    }
}

/// Column semantic types in `stage_columns()` order.
fn stage_column_types(source: &SourceConfig) -> Vec<SemanticType> {
    let mut types: Vec<SemanticType> = source.fields.iter().map(|f| f.semantic_type).collect();
    types.push(SemanticType::Text); // source_filename
    types.push(SemanticType::Integer); // file_load_id
    types.push(SemanticType::Text); // etl_row_hash
    types
}

impl PostgresAdapter {
    pub async fn connect(settings: &Settings) -> LoadResult<Self> {
        let max_connections = settings.min_pool_size().max(10);
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .min_connections(2)
            .acquire_timeout(Duration::from_secs(settings.operation_timeout_secs.min(30)))
            .connect(&settings.database_url)
            .await
            .map_err(|e| classify("connect", e))?;
        info!(max_connections, "Connected to PostgreSQL");
        Ok(Self {
            pool,
            dialect: PostgresDialect,
        })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self {
            pool,
            dialect: PostgresDialect,
        }
    }

    async fn scalar_i64(&self, operation: &str, sql: &str) -> LoadResult<i64> {
        let row: PgRow = sqlx::query(sql)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| classify(operation, e))?;
        row.try_get::<i64, _>(0)
            .map_err(|e| LoadError::database(operation, e.to_string()))
    }
}

#[async_trait]
impl DbAdapter for PostgresAdapter {
    fn kind(&self) -> DbKind {
        DbKind::Postgresql
    }

    async fn ensure_system_tables(&self) -> LoadResult<()> {
        for statement in self.dialect.create_system_tables_sql() {
            sqlx::query(&statement)
                .execute(&self.pool)
                .await
                .map_err(|e| classify("ensure_system_tables", e))?;
        }
        Ok(())
    }

    async fn start_load_log(
        &self,
        source_name: &str,
        filename: &str,
        started_at: DateTime<Utc>,
    ) -> LoadResult<i64> {
        match self.dialect.start_load_log_sql() {
            IdStrategy::InsertReturning { sql } => {
                let row = sqlx::query(&sql)
                    .bind(source_name)
                    .bind(filename)
                    .bind(started_at)
                    .bind(LoadState::Running.as_str())
                    .fetch_one(&self.pool)
                    .await
                    .map_err(|e| classify("start_load_log", e))?;
                row.try_get::<i64, _>(0)
                    .map_err(|e| LoadError::database("start_load_log", e.to_string()))
            },
            // PostgresDialect always uses RETURNING
            _ => Err(LoadError::database(
                "start_load_log",
                "unexpected id strategy for postgres",
            )),
        }
    }

    async fn update_load_log(&self, file_load_id: i64, patch: &LoadLogPatch) -> LoadResult<()> {
        let mut sets: Vec<String> = Vec::new();
        let mut index = 1usize;
        let mut push = |sets: &mut Vec<String>, column: &str| {
            index += 1;
            sets.push(format!("{column} = ${index}"));
        };

        // $1 is the id; value binds follow declaration order below
        if patch.content_hash.is_some() {
            push(&mut sets, "content_hash");
        }
        if patch.state.is_some() {
            push(&mut sets, "state");
        }
        if patch.rows_read.is_some() {
            push(&mut sets, "rows_read");
        }
        if patch.rows_valid.is_some() {
            push(&mut sets, "rows_valid");
        }
        if patch.rows_invalid.is_some() {
            push(&mut sets, "rows_invalid");
        }
        if patch.rows_published.is_some() {
            push(&mut sets, "rows_published");
        }
        if patch.error_kind.is_some() {
            push(&mut sets, "error_kind");
        }
        if patch.error_detail.is_some() {
            push(&mut sets, "error_detail");
        }
        if patch.ended_at.is_some() {
            push(&mut sets, "ended_at");
        }
        if patch.stage_timings.is_some() {
            push(&mut sets, "stage_timings");
        }
        if sets.is_empty() {
            return Ok(());
        }

        let sql = format!(
            "UPDATE {LOAD_LOG_TABLE} SET {} WHERE file_load_id = $1",
            sets.join(", ")
        );
        let mut query = sqlx::query(&sql).bind(file_load_id);
        if let Some(ref v) = patch.content_hash {
            query = query.bind(v);
        }
        if let Some(s) = patch.state {
            query = query.bind(s.as_str());
        }
        if let Some(n) = patch.rows_read {
            query = query.bind(n as i64);
        }
        if let Some(n) = patch.rows_valid {
            query = query.bind(n as i64);
        }
        if let Some(n) = patch.rows_invalid {
            query = query.bind(n as i64);
        }
        if let Some(n) = patch.rows_published {
            query = query.bind(n as i64);
        }
        if let Some(ref v) = patch.error_kind {
            query = query.bind(v);
        }
        if let Some(ref v) = patch.error_detail {
            query = query.bind(v);
        }
        if let Some(v) = patch.ended_at {
            query = query.bind(v);
        }
        if let Some(ref v) = patch.stage_timings {
            query = query.bind(v);
        }

        query
            .execute(&self.pool)
            .await
            .map_err(|e| classify("update_load_log", e))?;
        Ok(())
    }

    async fn get_load_log(&self, file_load_id: i64) -> LoadResult<Option<LoadLogRow>> {
        let row = sqlx::query(&format!(
            "SELECT file_load_id, source_name, filename, content_hash, started_at, ended_at, \
             state, rows_read, rows_valid, rows_invalid, rows_published, error_kind, \
             error_detail, stage_timings FROM {LOAD_LOG_TABLE} WHERE file_load_id = $1"
        ))
        .bind(file_load_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| classify("get_load_log", e))?;

        let Some(row) = row else {
            return Ok(None);
        };
        let state = match row.try_get::<String, _>("state").as_deref() {
            Ok("running") => LoadState::Running,
            Ok("succeeded") => LoadState::Succeeded,
            Ok("duplicate") => LoadState::Duplicate,
            Ok("cancelled") => LoadState::Cancelled,
            _ => LoadState::Failed,
        };
        let get_count = |name: &str| -> u64 {
            row.try_get::<i64, _>(name).unwrap_or(0).max(0) as u64
        };
        Ok(Some(LoadLogRow {
            file_load_id,
            source_name: row.try_get("source_name").unwrap_or_default(),
            filename: row.try_get("filename").unwrap_or_default(),
            content_hash: row.try_get("content_hash").ok(),
            started_at: row
                .try_get("started_at")
                .map_err(|e| LoadError::database("get_load_log", e.to_string()))?,
            ended_at: row.try_get("ended_at").ok(),
            state,
            rows_read: get_count("rows_read"),
            rows_valid: get_count("rows_valid"),
            rows_invalid: get_count("rows_invalid"),
            rows_published: get_count("rows_published"),
            error_kind: row.try_get("error_kind").ok(),
            error_detail: row.try_get("error_detail").ok(),
            stage_timings: row
                .try_get("stage_timings")
                .unwrap_or(serde_json::Value::Null),
        }))
    }

    async fn find_succeeded_load(
        &self,
        filename: &str,
        content_hash: &str,
    ) -> LoadResult<Option<i64>> {
        let sql = self.dialect.find_succeeded_load_sql();
        let row = sqlx::query(&sql)
            .bind(filename)
            .bind(content_hash)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| classify("find_succeeded_load", e))?;
        Ok(row.and_then(|r| r.try_get::<i64, _>(0).ok()))
    }

    async fn create_stage_table(&self, stage: &str, source: &SourceConfig) -> LoadResult<()> {
        for statement in self.dialect.create_stage_table_sql(stage, source) {
            if let Err(e) = sqlx::query(&statement).execute(&self.pool).await {
                // a partially created stage must not survive
                let _ = sqlx::query(&self.dialect.drop_table_sql(stage))
                    .execute(&self.pool)
                    .await;
                let classified = classify("create_stage_table", e);
                if classified.is_transient() {
                    return Err(classified);
                }
                return Err(LoadError::StageCreateFailed {
                    table: stage.to_string(),
                    reason: classified.to_string(),
                });
            }
        }
        debug!(stage, "Created stage table");
        Ok(())
    }

    async fn drop_stage_table(&self, stage: &str) -> LoadResult<()> {
        sqlx::query(&self.dialect.drop_table_sql(stage))
            .execute(&self.pool)
            .await
            .map_err(|e| classify("drop_stage_table", e))?;
        Ok(())
    }

    async fn insert_stage_rows(
        &self,
        stage: &str,
        source: &SourceConfig,
        rows: &[StageRow],
    ) -> LoadResult<()> {
        if rows.is_empty() {
            return Ok(());
        }
        let columns = source.stage_columns();
        let types = stage_column_types(source);

        // chunk to stay under the 65535 bind-parameter limit
        let max_rows_per_insert = (u16::MAX as usize) / columns.len().max(1);
        for chunk in rows.chunks(max_rows_per_insert) {
            let mut builder = sqlx::QueryBuilder::<Postgres>::new(format!(
                "INSERT INTO {stage} ({}) ",
                columns.join(", ")
            ));
            builder.push_values(chunk, |mut b, row| {
                for (value, ty) in row.values.iter().zip(&types) {
                    match value {
                        Value::Null => match ty {
                            SemanticType::Integer => b.push_bind(Option::<i64>::None),
                            SemanticType::Float => b.push_bind(Option::<f64>::None),
                            SemanticType::Boolean => b.push_bind(Option::<bool>::None),
                            SemanticType::Date => {
                                b.push_bind(Option::<chrono::NaiveDate>::None)
                            },
                            SemanticType::Timestamp => {
                                b.push_bind(Option::<DateTime<Utc>>::None)
                            },
                            SemanticType::Json => {
                                b.push_bind(Option::<serde_json::Value>::None)
                            },
                            SemanticType::Text => b.push_bind(Option::<String>::None),
                        },
                        Value::Text(s) => b.push_bind(s.clone()),
                        Value::Integer(i) => b.push_bind(*i),
                        Value::Float(f) => b.push_bind(*f),
                        Value::Boolean(v) => b.push_bind(*v),
                        Value::Date(d) => b.push_bind(*d),
                        Value::Timestamp(ts) => b.push_bind(*ts),
                        Value::Json(v) => b.push_bind(v.clone()),
                    };
                }
            });
            builder.build().execute(&self.pool).await.map_err(|e| {
                let classified = classify("insert_stage_rows", e);
                LoadError::BulkInsertFailed {
                    table: stage.to_string(),
                    reason: classified.to_string(),
                    transient: classified.is_transient(),
                }
            })?;
        }
        Ok(())
    }

    async fn insert_dlq_rows(&self, rows: &[DlqRow]) -> LoadResult<()> {
        if rows.is_empty() {
            return Ok(());
        }
        let mut builder = sqlx::QueryBuilder::<Postgres>::new(format!(
            "INSERT INTO {DLQ_TABLE} (file_load_id, source_name, source_row_number, grain_key, \
             failed_fields, reasons, original_row_json, created_at) "
        ));
        builder.push_values(rows, |mut b, row| {
            b.push_bind(row.file_load_id)
                .push_bind(&row.source_name)
                .push_bind(row.source_row_number as i64)
                .push_bind(&row.grain_key)
                .push_bind(row.failed_fields.join(", "))
                .push_bind(row.reasons.join("; "))
                .push_bind(&row.original_row_json)
                .push_bind(row.created_at);
        });
        // retried buffers must not raise duplicate-key errors
        builder.push(" ON CONFLICT (file_load_id, source_row_number) DO NOTHING");
        builder.build().execute(&self.pool).await.map_err(|e| {
            let classified = classify("insert_dlq_rows", e);
            LoadError::BulkInsertFailed {
                table: DLQ_TABLE.to_string(),
                reason: classified.to_string(),
                transient: classified.is_transient(),
            }
        })?;
        Ok(())
    }

    async fn grain_duplicates(
        &self,
        stage: &str,
        source: &SourceConfig,
        limit: u32,
    ) -> LoadResult<Vec<String>> {
        let sql = self.dialect.grain_duplicates_sql(stage, source, limit);
        let rows = sqlx::query(&sql)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| classify("grain_duplicates", e))?;
        Ok(rows
            .iter()
            .filter_map(|r| r.try_get::<String, _>(0).ok())
            .collect())
    }

    async fn execute_scalar(&self, sql: &str) -> LoadResult<ScalarValue> {
        // normalize the scalar to float8 so NUMERIC aggregates decode
        let wrapped = format!("SELECT CAST(({}) AS DOUBLE PRECISION)", sql.trim_end_matches(';'));

        // audits must not mutate the stage table
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| classify("execute_scalar", e))?;
        sqlx::query("SET TRANSACTION READ ONLY")
            .execute(&mut *tx)
            .await
            .map_err(|e| classify("execute_scalar", e))?;
        let row = sqlx::query(&wrapped)
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| classify("execute_scalar", e))?;
        tx.rollback()
            .await
            .map_err(|e| classify("execute_scalar", e))?;

        match row
            .try_get::<Option<f64>, _>(0)
            .map_err(|e| LoadError::database("execute_scalar", e.to_string()))?
        {
            Some(v) => Ok(ScalarValue::Float(v)),
            None => Ok(ScalarValue::Null),
        }
    }

    async fn merge_stage_to_target(
        &self,
        stage: &str,
        source: &SourceConfig,
    ) -> LoadResult<MergeCounts> {
        let target = &source.target_table;

        let staged = self
            .scalar_i64("merge_counts", &format!("SELECT COUNT(*) FROM {stage}"))
            .await?;
        let matched = self
            .scalar_i64(
                "merge_counts",
                &self.dialect.matched_count_sql(stage, target, source),
            )
            .await?;
        let changed = self
            .scalar_i64(
                "merge_counts",
                &self.dialect.changed_count_sql(stage, target, source),
            )
            .await?;

        let now_iso = Utc::now().to_rfc3339();
        let statements = self.dialect.merge_sql(stage, target, source, &now_iso);

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| classify("merge_stage_to_target", e))?;
        for statement in &statements {
            if let Err(e) = sqlx::query(statement).execute(&mut *tx).await {
                let _ = tx.rollback().await;
                warn!(stage, target = %target, "Merge failed, rolled back");
                return Err(LoadError::PublishFailed {
                    stage: stage.to_string(),
                    target: target.clone(),
                    reason: e.to_string(),
                });
            }
        }
        tx.commit()
            .await
            .map_err(|e| classify("merge_stage_to_target", e))?;

        Ok(MergeCounts {
            inserted: (staged - matched).max(0) as u64,
            updated: changed.max(0) as u64,
        })
    }

    async fn clear_resolved_dlq(&self, source: &SourceConfig) -> LoadResult<u64> {
        let sql = self.dialect.clear_resolved_dlq_sql(source);
        let result = sqlx::query(&sql)
            .bind(&source.name)
            .execute(&self.pool)
            .await
            .map_err(|e| classify("clear_resolved_dlq", e))?;
        Ok(result.rows_affected())
    }
}
