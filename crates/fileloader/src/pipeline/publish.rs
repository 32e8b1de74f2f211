//! Publisher: merge stage into target, then heal the DLQ
//!
//! The merge upserts by grain: new grains insert, matched grains update
//! their non-grain columns when the row hash differs, target rows absent
//! from the stage are untouched. The merge is not retried past its first
//! attempt; a retried half-applied merge is worse than a quarantined file.
//! DLQ rows whose grain now exists in the target are deleted afterwards.

use super::retry::{with_retry, RetryPolicy};
use crate::db::{DbAdapter, MergeCounts};
use crate::sources::SourceConfig;
use fileloader_common::LoadResult;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

pub struct Publisher {
    adapter: Arc<dyn DbAdapter>,
    source: Arc<SourceConfig>,
    stage: String,
    retry: RetryPolicy,
    cancel: CancellationToken,
}

impl Publisher {
    pub fn new(
        adapter: Arc<dyn DbAdapter>,
        source: Arc<SourceConfig>,
        stage: String,
        retry: RetryPolicy,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            adapter,
            source,
            stage,
            retry,
            cancel,
        }
    }

    /// Merge stage into the target. Single attempt.
    pub async fn publish(&self) -> LoadResult<MergeCounts> {
        let counts = self
            .adapter
            .merge_stage_to_target(&self.stage, &self.source)
            .await?;
        info!(
            stage = %self.stage,
            target = %self.source.target_table,
            inserted = counts.inserted,
            updated = counts.updated,
            "Published stage to target"
        );
        Ok(counts)
    }

    /// Delete DLQ rows superseded by this publish.
    pub async fn clear_resolved_dlq(&self) -> LoadResult<u64> {
        let adapter = self.adapter.clone();
        let source = self.source.clone();
        let cleared = with_retry(&self.retry, &self.cancel, "clear_resolved_dlq", || {
            let adapter = adapter.clone();
            let source = source.clone();
            async move { adapter.clear_resolved_dlq(&source).await }
        })
        .await?;
        if cleared > 0 {
            info!(source = %self.source.name, cleared, "Cleared resolved DLQ rows");
        }
        Ok(cleared)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::memory::MemoryDb;
    use crate::db::{stage_table_name, DlqRow, StageRow};
    use crate::pipeline::batch::Value;
    use crate::sources::{FieldSpec, SemanticType};

    fn source() -> Arc<SourceConfig> {
        Arc::new(
            SourceConfig::builder("orders")
                .pattern(r".*")
                .target_table("orders")
                .field(FieldSpec::new("order_id", SemanticType::Integer))
                .field(FieldSpec::new("amount", SemanticType::Float))
                .grain(&["order_id"])
                .build()
                .unwrap(),
        )
    }

    fn row(id: i64, amount: f64, hash: &str) -> StageRow {
        StageRow {
            values: vec![
                Value::Integer(id),
                Value::Float(amount),
                Value::Text("orders.csv".into()),
                Value::Integer(1),
                Value::Text(hash.into()),
            ],
        }
    }

    #[tokio::test]
    async fn publish_then_heal_dlq() {
        let db = Arc::new(MemoryDb::new());
        let source = source();
        let stage = stage_table_name("orders", 1);
        db.create_stage_table(&stage, &source).await.unwrap();
        db.insert_stage_rows(&stage, &source, &[row(1, 10.0, "a"), row(2, 20.0, "b")])
            .await
            .unwrap();
        // a failure from an earlier load for grain 2
        db.insert_dlq_rows(&[DlqRow {
            file_load_id: 0,
            source_name: "orders".into(),
            source_row_number: 9,
            grain_key: "2".into(),
            failed_fields: vec![],
            reasons: vec![],
            original_row_json: serde_json::Value::Null,
            created_at: chrono::Utc::now(),
        }])
        .await
        .unwrap();

        let publisher = Publisher::new(
            db.clone(),
            source,
            stage,
            RetryPolicy::new(1, 1),
            CancellationToken::new(),
        );
        let counts = publisher.publish().await.unwrap();
        assert_eq!(counts.inserted, 2);
        assert_eq!(counts.updated, 0);

        let cleared = publisher.clear_resolved_dlq().await.unwrap();
        assert_eq!(cleared, 1);
        assert!(db.dlq_rows().is_empty());
    }
}
