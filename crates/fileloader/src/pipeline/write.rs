//! Writer: the consuming end of the per-file pipeline
//!
//! Accumulates valid rows and DLQ rows in separate buffers and bulk-inserts
//! each when it reaches the batch size; `flush` drains both at end of
//! stream. A retried buffer is re-attempted whole; adapters keep the DLQ
//! insert idempotent on its (file_load_id, source_row_number) key.

use super::retry::{with_retry, RetryPolicy};
use super::validate::ValidatedBatch;
use crate::db::{DbAdapter, DlqRow, StageRow};
use crate::pipeline::batch::Value;
use crate::sources::SourceConfig;
use async_trait::async_trait;
use fileloader_common::LoadResult;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Consuming side of the pipeline: accept refined batches, then flush.
#[async_trait]
pub trait BatchSink: Send {
    async fn push_batch(&mut self, batch: ValidatedBatch) -> LoadResult<()>;
    async fn flush(&mut self) -> LoadResult<()>;
}

pub struct StageWriter {
    adapter: Arc<dyn DbAdapter>,
    source: Arc<SourceConfig>,
    stage: String,
    filename: String,
    file_load_id: i64,
    batch_size: usize,
    retry: RetryPolicy,
    cancel: CancellationToken,
    valid_buffer: Vec<StageRow>,
    dlq_buffer: Vec<DlqRow>,
    rows_to_stage: u64,
    rows_to_dlq: u64,
}

impl StageWriter {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        adapter: Arc<dyn DbAdapter>,
        source: Arc<SourceConfig>,
        stage: String,
        filename: String,
        file_load_id: i64,
        batch_size: usize,
        retry: RetryPolicy,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            adapter,
            source,
            stage,
            filename,
            file_load_id,
            batch_size,
            retry,
            cancel,
            valid_buffer: Vec::new(),
            dlq_buffer: Vec::new(),
            rows_to_stage: 0,
            rows_to_dlq: 0,
        }
    }

    pub fn rows_to_stage(&self) -> u64 {
        self.rows_to_stage
    }

    pub fn rows_to_dlq(&self) -> u64 {
        self.rows_to_dlq
    }

    /// Stage row in `stage_columns()` order, run through the adapter's
    /// conversion hook.
    fn to_stage_row(&self, record: &super::validate::TypedRecord) -> StageRow {
        let mut values: Vec<Value> = self
            .source
            .fields
            .iter()
            .map(|f| record.values.get(&f.name).cloned().unwrap_or(Value::Null))
            .collect();
        values.push(Value::Text(self.filename.clone()));
        values.push(Value::Integer(self.file_load_id));
        values.push(Value::Text(record.row_hash.clone()));
        let mut row = StageRow { values };
        self.adapter.convert_record(&mut row);
        row
    }

    async fn flush_valid(&mut self) -> LoadResult<()> {
        if self.valid_buffer.is_empty() {
            return Ok(());
        }
        let rows = Arc::new(std::mem::take(&mut self.valid_buffer));
        debug!(
            stage = %self.stage,
            rows = rows.len(),
            "Writing batch to stage table"
        );
        let adapter = self.adapter.clone();
        let source = self.source.clone();
        let stage = self.stage.clone();
        with_retry(&self.retry, &self.cancel, "insert_stage_rows", || {
            let adapter = adapter.clone();
            let source = source.clone();
            let stage = stage.clone();
            let rows = rows.clone();
            async move { adapter.insert_stage_rows(&stage, &source, &rows).await }
        })
        .await?;
        self.rows_to_stage += rows.len() as u64;
        Ok(())
    }

    async fn flush_dlq(&mut self) -> LoadResult<()> {
        if self.dlq_buffer.is_empty() {
            return Ok(());
        }
        let rows = Arc::new(std::mem::take(&mut self.dlq_buffer));
        debug!(rows = rows.len(), "Writing batch to DLQ");
        let adapter = self.adapter.clone();
        with_retry(&self.retry, &self.cancel, "insert_dlq_rows", || {
            let adapter = adapter.clone();
            let rows = rows.clone();
            async move { adapter.insert_dlq_rows(&rows).await }
        })
        .await?;
        self.rows_to_dlq += rows.len() as u64;
        Ok(())
    }
}

#[async_trait]
impl BatchSink for StageWriter {
    async fn push_batch(&mut self, batch: ValidatedBatch) -> LoadResult<()> {
        for record in &batch.valid {
            self.valid_buffer.push(self.to_stage_row(record));
            if self.valid_buffer.len() >= self.batch_size {
                self.flush_valid().await?;
            }
        }
        for row in batch.invalid {
            self.dlq_buffer.push(row);
            if self.dlq_buffer.len() >= self.batch_size {
                self.flush_dlq().await?;
            }
        }
        Ok(())
    }

    async fn flush(&mut self) -> LoadResult<()> {
        self.flush_valid().await?;
        self.flush_dlq().await?;
        info!(
            stage = %self.stage,
            rows_to_stage = self.rows_to_stage,
            rows_to_dlq = self.rows_to_dlq,
            "Writer flushed"
        );
        Ok(())
    }
}
