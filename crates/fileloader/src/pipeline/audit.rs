//! Auditor: post-write checks against the stage table
//!
//! Two ordered checks, both read-only: grain uniqueness, then every
//! user-declared audit (an SQL template producing a single scalar that must
//! satisfy its predicate).

use super::retry::{with_retry, RetryPolicy};
use crate::db::DbAdapter;
use crate::sources::SourceConfig;
use fileloader_common::{LoadError, LoadResult};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Example duplicate grain tuples included in failure context.
const DUPLICATE_EXAMPLES: u32 = 5;

pub struct Auditor {
    adapter: Arc<dyn DbAdapter>,
    source: Arc<SourceConfig>,
    stage: String,
    filename: String,
    retry: RetryPolicy,
    cancel: CancellationToken,
}

impl Auditor {
    pub fn new(
        adapter: Arc<dyn DbAdapter>,
        source: Arc<SourceConfig>,
        stage: String,
        filename: String,
        retry: RetryPolicy,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            adapter,
            source,
            stage,
            filename,
            retry,
            cancel,
        }
    }

    async fn audit_grain(&self) -> LoadResult<()> {
        let adapter = self.adapter.clone();
        let source = self.source.clone();
        let stage = self.stage.clone();
        let duplicates = with_retry(&self.retry, &self.cancel, "grain_duplicates", || {
            let adapter = adapter.clone();
            let source = source.clone();
            let stage = stage.clone();
            async move {
                adapter
                    .grain_duplicates(&stage, &source, DUPLICATE_EXAMPLES)
                    .await
            }
        })
        .await?;

        if !duplicates.is_empty() {
            warn!(
                file = %self.filename,
                grain = ?self.source.grain,
                examples = ?duplicates,
                "Grain is not unique in stage"
            );
            return Err(LoadError::GrainValidation {
                file: self.filename.clone(),
                examples: duplicates,
            });
        }
        Ok(())
    }

    async fn audit_user_checks(&self) -> LoadResult<()> {
        for audit in &self.source.audits {
            let sql = audit.sql.replace("{table}", &self.stage);
            let adapter = self.adapter.clone();
            let observed = with_retry(&self.retry, &self.cancel, "execute_scalar", || {
                let adapter = adapter.clone();
                let sql = sql.clone();
                async move { adapter.execute_scalar(&sql).await }
            })
            .await?;

            let holds = observed
                .as_f64()
                .map(|v| audit.predicate.holds(v))
                .unwrap_or(false);
            if !holds {
                warn!(
                    file = %self.filename,
                    audit = %audit.name,
                    observed = %observed,
                    expected = %audit.predicate,
                    "Audit failed"
                );
                return Err(LoadError::AuditFailed {
                    file: self.filename.clone(),
                    name: audit.name.clone(),
                    observed: observed.to_string(),
                    expected: audit.predicate.to_string(),
                });
            }
            info!(file = %self.filename, audit = %audit.name, observed = %observed, "Audit passed");
        }
        Ok(())
    }

    /// Grain uniqueness first, then user audits.
    pub async fn run(&self) -> LoadResult<()> {
        self.audit_grain().await?;
        self.audit_user_checks().await
    }
}
