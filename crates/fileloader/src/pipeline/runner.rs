//! Per-file orchestration
//!
//! Ordered steps: archive copy → allocate file_load_id → dedup check →
//! create stage table → streamed read/validate/write → audit → publish →
//! cleanup. Any failure takes the same cleanup path: the stage table is
//! dropped, the source file is moved to the quarantine directory, the log
//! row is closed with the failure kind, and the error's audience is
//! notified. Cleanup problems are logged and webhooked but never mask the
//! pipeline's terminal state.

use super::audit::Auditor;
use super::publish::Publisher;
use super::read::ReaderRegistry;
use super::retry::{with_retry, RetryPolicy};
use super::validate::Validator;
use super::write::{BatchSink, StageWriter};
use super::LoadCounts;
use crate::db::{stage_table_name, DbAdapter, LoadLogPatch, LoadState};
use crate::notify::email::MAX_DLQ_REASONS;
use crate::notify::NotifyHub;
use crate::sources::SourceConfig;
use crate::store::{base_name, is_gzip_path, FileStore};
use chrono::Utc;
use fileloader_common::{ErrorKind, LoadError, LoadResult};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Directories a pipeline moves files between.
#[derive(Debug, Clone)]
pub struct RunPaths {
    pub archive_dir: String,
    /// Also serves as the quarantine directory for failed files.
    pub duplicates_dir: String,
}

/// Terminal result of one file's pipeline.
#[derive(Debug, Clone)]
pub struct FileOutcome {
    pub filename: String,
    pub source_name: String,
    pub file_load_id: Option<i64>,
    pub counts: LoadCounts,
    pub error: Option<(ErrorKind, String)>,
}

impl FileOutcome {
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }

    /// Whether this outcome counts against the process exit code.
    pub fn is_internal_failure(&self) -> bool {
        self.error
            .as_ref()
            .map(|(kind, _)| {
                *kind != ErrorKind::Cancelled
                    && kind.audience() == fileloader_common::Audience::Internal
            })
            .unwrap_or(false)
    }
}

#[derive(Default)]
struct RunContext {
    file_load_id: Option<i64>,
    stage: Option<String>,
    counts: LoadCounts,
    dlq_sample: Vec<String>,
    timings: serde_json::Map<String, serde_json::Value>,
}

impl RunContext {
    fn stamp(&mut self, stage: &str, started: chrono::DateTime<Utc>) {
        self.timings.insert(
            stage.to_string(),
            serde_json::json!({
                "started": started.to_rfc3339(),
                "ended": Utc::now().to_rfc3339(),
            }),
        );
    }
}

pub struct PipelineRunner {
    pub source: Arc<SourceConfig>,
    pub store: Arc<dyn FileStore>,
    pub adapter: Arc<dyn DbAdapter>,
    pub readers: Arc<ReaderRegistry>,
    pub notify: Arc<NotifyHub>,
    pub paths: RunPaths,
    pub batch_size: usize,
    pub retry: RetryPolicy,
    pub cancel: CancellationToken,
}

impl PipelineRunner {
    fn checkpoint(&self) -> LoadResult<()> {
        if self.cancel.is_cancelled() {
            return Err(LoadError::Cancelled);
        }
        Ok(())
    }

    /// Run the pipeline for one file to its terminal state.
    pub async fn run(&self, path: &str) -> FileOutcome {
        let filename = base_name(path).to_string();
        info!(file = %filename, source = %self.source.name, "Processing file");
        let mut ctx = RunContext::default();
        let result = self.execute(path, &filename, &mut ctx).await;
        self.finalize(path, &filename, ctx, result).await
    }

    async fn execute(
        &self,
        path: &str,
        filename: &str,
        ctx: &mut RunContext,
    ) -> LoadResult<()> {
        self.checkpoint()?;

        // archive a copy before touching the database
        let started = Utc::now();
        with_retry(&self.retry, &self.cancel, "archive", || async {
            self.store.copy_to_dir(path, &self.paths.archive_dir).await
        })
        .await
        .map_err(|e| match e {
            LoadError::Cancelled => LoadError::Cancelled,
            other => LoadError::ArchiveFailed {
                file: filename.to_string(),
                reason: other.to_string(),
                transient: other.is_transient(),
            },
        })?;
        ctx.stamp("archive", started);

        // allocate the file_load_id and open the log row
        let file_load_id = with_retry(&self.retry, &self.cancel, "start_load_log", || async {
            self.adapter
                .start_load_log(&self.source.name, filename, Utc::now())
                .await
        })
        .await?;
        ctx.file_load_id = Some(file_load_id);
        tracing::Span::current().record("file_load_id", file_load_id);

        // dedup on (filename, content hash)
        let started = Utc::now();
        let gzipped = self.source.gzip || is_gzip_path(filename);
        let content_hash = with_retry(&self.retry, &self.cancel, "hash", || async {
            self.store.hash(path, gzipped).await
        })
        .await?;
        self.adapter
            .update_load_log(
                file_load_id,
                &LoadLogPatch {
                    content_hash: Some(content_hash.clone()),
                    ..Default::default()
                },
            )
            .await?;
        let prior = with_retry(&self.retry, &self.cancel, "find_succeeded_load", || async {
            self.adapter
                .find_succeeded_load(filename, &content_hash)
                .await
        })
        .await?;
        if let Some(prior_load_id) = prior {
            return Err(LoadError::DuplicateFile {
                file: filename.to_string(),
                prior_load_id,
            });
        }
        ctx.stamp("dedup", started);

        // per-file stage table
        let started = Utc::now();
        let stage = stage_table_name(&self.source.name, file_load_id);
        with_retry(&self.retry, &self.cancel, "create_stage_table", || async {
            self.adapter.create_stage_table(&stage, &self.source).await
        })
        .await?;
        ctx.stage = Some(stage.clone());
        ctx.stamp("stage_create", started);

        // streamed read -> validate -> write, one batch in flight
        let started = Utc::now();
        let raw = self.store.open(path).await?;
        let mut reader =
            self.readers
                .open_reader(self.source.clone(), raw, filename, self.batch_size)?;
        let mut validator = Validator::new(self.source.clone(), filename, file_load_id);
        let mut writer = StageWriter::new(
            self.adapter.clone(),
            self.source.clone(),
            stage.clone(),
            filename.to_string(),
            file_load_id,
            self.batch_size,
            self.retry,
            self.cancel.clone(),
        );

        let stream_result: LoadResult<()> = async {
            loop {
                self.checkpoint()?;
                let Some(batch) = reader.next_batch()? else {
                    break;
                };
                let refined = validator.process(batch);
                for dlq_row in &refined.invalid {
                    if ctx.dlq_sample.len() < MAX_DLQ_REASONS {
                        ctx.dlq_sample.push(format!(
                            "row {}: {}",
                            dlq_row.source_row_number,
                            dlq_row.reasons.join("; ")
                        ));
                    }
                }
                writer.push_batch(refined).await?;
            }
            writer.flush().await
        }
        .await;
        reader.close();

        ctx.counts = LoadCounts {
            read: reader.rows_read(),
            valid: writer.rows_to_stage(),
            invalid: writer.rows_to_dlq(),
            published: 0,
        };
        stream_result?;
        ctx.stamp("read_validate_write", started);

        self.adapter
            .update_load_log(
                file_load_id,
                &LoadLogPatch {
                    rows_read: Some(ctx.counts.read),
                    rows_valid: Some(ctx.counts.valid),
                    rows_invalid: Some(ctx.counts.invalid),
                    ..Default::default()
                },
            )
            .await?;

        // the whole file has been read and the DLQ is complete; only now
        // do the grain and threshold verdicts land
        validator.check_grain()?;
        validator.check_threshold()?;

        // audit
        self.checkpoint()?;
        let started = Utc::now();
        Auditor::new(
            self.adapter.clone(),
            self.source.clone(),
            stage.clone(),
            filename.to_string(),
            self.retry,
            self.cancel.clone(),
        )
        .run()
        .await?;
        ctx.stamp("audit", started);

        // publish; the merge itself gets exactly one attempt
        self.checkpoint()?;
        let started = Utc::now();
        let publisher = Publisher::new(
            self.adapter.clone(),
            self.source.clone(),
            stage,
            self.retry,
            self.cancel.clone(),
        );
        let merge_counts = publisher.publish().await?;
        ctx.counts.published = merge_counts.inserted + merge_counts.updated;
        publisher.clear_resolved_dlq().await?;
        ctx.stamp("publish", started);

        Ok(())
    }

    async fn finalize(
        &self,
        path: &str,
        filename: &str,
        mut ctx: RunContext,
        result: LoadResult<()>,
    ) -> FileOutcome {
        // the stage table never survives a terminated pipeline
        if let Some(ref stage) = ctx.stage {
            if let Err(e) = self.adapter.drop_stage_table(stage).await {
                error!(stage = %stage, error = %e, "Failed to drop stage table during cleanup");
                self.notify
                    .internal("cleanup_error", Some(filename), &e.to_string())
                    .await;
            }
        }

        let error = match result {
            Ok(()) => {
                // archived copy exists; remove the original from the drop dir
                if let Err(e) = self.store.delete(path).await {
                    error!(file = %filename, error = %e, "Failed to delete source file after publish");
                    self.notify
                        .internal("cleanup_error", Some(filename), &e.to_string())
                        .await;
                }
                None
            },
            Err(err) => {
                // quarantine the file (duplicates share the directory)
                if let Err(move_err) = self
                    .store
                    .move_to_dir(path, &self.paths.duplicates_dir)
                    .await
                {
                    error!(file = %filename, error = %move_err, "Failed to quarantine file");
                    self.notify
                        .internal("cleanup_error", Some(filename), &move_err.to_string())
                        .await;
                }
                Some(err)
            },
        };

        let state = match &error {
            None => LoadState::Succeeded,
            Some(LoadError::Cancelled) => LoadState::Cancelled,
            Some(LoadError::DuplicateFile { .. }) => LoadState::Duplicate,
            Some(_) => LoadState::Failed,
        };

        if let Some(file_load_id) = ctx.file_load_id {
            let patch = LoadLogPatch {
                state: Some(state),
                rows_read: Some(ctx.counts.read),
                rows_valid: Some(ctx.counts.valid),
                rows_invalid: Some(ctx.counts.invalid),
                rows_published: Some(ctx.counts.published),
                error_kind: error.as_ref().map(|e| e.kind().as_str().to_string()),
                error_detail: error.as_ref().map(|e| e.to_string()),
                ended_at: Some(Utc::now()),
                stage_timings: Some(serde_json::Value::Object(std::mem::take(
                    &mut ctx.timings,
                ))),
                ..Default::default()
            };
            if let Err(e) = self.adapter.update_load_log(file_load_id, &patch).await {
                error!(file_load_id, error = %e, "Failed to close load log row");
                self.notify
                    .internal("cleanup_error", Some(filename), &e.to_string())
                    .await;
            }
        }

        match &error {
            None => {
                info!(
                    file = %filename,
                    file_load_id = ctx.file_load_id,
                    rows_read = ctx.counts.read,
                    rows_published = ctx.counts.published,
                    "Pipeline completed successfully"
                );
            },
            Some(err) => {
                warn!(
                    file = %filename,
                    file_load_id = ctx.file_load_id,
                    kind = %err.kind(),
                    error = %err,
                    "Pipeline terminated"
                );
                self.notify
                    .file_failure(
                        &self.source,
                        filename,
                        ctx.file_load_id,
                        err,
                        ctx.counts,
                        &ctx.dlq_sample,
                    )
                    .await;
            },
        }

        FileOutcome {
            filename: filename.to_string(),
            source_name: self.source.name.clone(),
            file_load_id: ctx.file_load_id,
            counts: ctx.counts,
            error: error.map(|e| (e.kind(), e.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::memory::MemoryDb;
    use crate::sources::{FieldRule, FieldSpec, SemanticType};
    use crate::store::local::LocalFileStore;
    use std::path::Path;

    fn customers_source(threshold: u64) -> Arc<SourceConfig> {
        Arc::new(
            SourceConfig::builder("customers")
                .pattern(r"^customers.*\.csv(\.gz)?$")
                .target_table("customers")
                .field(FieldSpec::new("id", SemanticType::Integer))
                .field(FieldSpec::new("name", SemanticType::Text))
                .field(
                    FieldSpec::new("age", SemanticType::Integer)
                        .nullable()
                        .rule(FieldRule::MinInt(0)),
                )
                .grain(&["id"])
                .error_threshold(threshold)
                .build()
                .unwrap(),
        )
    }

    struct Harness {
        db: Arc<MemoryDb>,
        runner: PipelineRunner,
        drop_dir: std::path::PathBuf,
        _root: tempfile::TempDir,
    }

    fn harness(source: Arc<SourceConfig>) -> Harness {
        let root = tempfile::tempdir().unwrap();
        let drop_dir = root.path().join("drop");
        let archive = root.path().join("archive");
        let duplicates = root.path().join("duplicates");
        std::fs::create_dir_all(&drop_dir).unwrap();
        let db = Arc::new(MemoryDb::new());
        let runner = PipelineRunner {
            source,
            store: Arc::new(LocalFileStore::new()),
            adapter: db.clone(),
            readers: Arc::new(ReaderRegistry::builtin()),
            notify: Arc::new(NotifyHub::disabled()),
            paths: RunPaths {
                archive_dir: archive.to_string_lossy().into_owned(),
                duplicates_dir: duplicates.to_string_lossy().into_owned(),
            },
            batch_size: 2,
            retry: RetryPolicy::new(2, 1),
            cancel: CancellationToken::new(),
        };
        Harness {
            db,
            runner,
            drop_dir,
            _root: root,
        }
    }

    fn write_file(dir: &Path, name: &str, content: &str) -> String {
        let path = dir.join(name);
        std::fs::write(&path, content).unwrap();
        path.to_string_lossy().into_owned()
    }

    #[tokio::test]
    async fn happy_path_publishes_and_cleans_up() {
        let h = harness(customers_source(0));
        let path = write_file(&h.drop_dir, "customers.csv", "id,name,age\n1,a,30\n2,b,\n3,c,41\n");

        let outcome = h.runner.run(&path).await;
        assert!(outcome.succeeded(), "outcome: {:?}", outcome.error);
        assert_eq!(outcome.counts.read, 3);
        assert_eq!(outcome.counts.valid, 3);
        assert_eq!(outcome.counts.published, 3);

        // target has the rows, stage is gone, drop file deleted, archive kept
        assert_eq!(h.db.table_len("customers"), 3);
        assert!(h.db.stage_tables().is_empty());
        assert!(!h.drop_dir.join("customers.csv").exists());
        let log = &h.db.load_log_rows()[0];
        assert_eq!(log.state, LoadState::Succeeded);
        assert_eq!(log.rows_read, 3);
        assert!(log.content_hash.is_some());
        assert!(log.ended_at.is_some());
    }

    #[tokio::test]
    async fn threshold_zero_fails_but_collects_full_dlq() {
        let h = harness(customers_source(0));
        let path = write_file(
            &h.drop_dir,
            "customers.csv",
            "id,name,age\n1,a,-1\n2,b,20\n3,c,-5\n",
        );

        let outcome = h.runner.run(&path).await;
        let (kind, _) = outcome.error.clone().unwrap();
        assert_eq!(kind, ErrorKind::ValidationThresholdExceeded);

        // the whole file was read; every bad row is in the DLQ
        assert_eq!(outcome.counts.read, 3);
        assert_eq!(h.db.dlq_rows().len(), 2);
        // no publish happened and the stage is gone
        assert_eq!(h.db.table_len("customers"), 0);
        assert!(h.db.stage_tables().is_empty());
        let log = &h.db.load_log_rows()[0];
        assert_eq!(log.state, LoadState::Failed);
        assert_eq!(log.error_kind.as_deref(), Some("ValidationThresholdExceeded"));
    }

    #[tokio::test]
    async fn threshold_tolerates_invalid_rows_below_limit() {
        let h = harness(customers_source(1));
        let path = write_file(&h.drop_dir, "customers.csv", "id,name,age\n1,a,-1\n2,b,20\n");

        let outcome = h.runner.run(&path).await;
        assert!(outcome.succeeded(), "outcome: {:?}", outcome.error);
        assert_eq!(outcome.counts.valid, 1);
        assert_eq!(outcome.counts.invalid, 1);
        assert_eq!(h.db.table_len("customers"), 1);
        assert_eq!(h.db.dlq_rows().len(), 1);
    }

    #[tokio::test]
    async fn second_identical_file_is_a_duplicate() {
        let h = harness(customers_source(0));
        let content = "id,name,age\n1,a,30\n";
        let path = write_file(&h.drop_dir, "customers.csv", content);
        assert!(h.runner.run(&path).await.succeeded());

        // same name, same content, re-dropped
        let path = write_file(&h.drop_dir, "customers.csv", content);
        let outcome = h.runner.run(&path).await;
        let (kind, _) = outcome.error.clone().unwrap();
        assert_eq!(kind, ErrorKind::DuplicateFile);

        // exactly one succeeded log row; file moved to the duplicates dir
        let logs = h.db.load_log_rows();
        assert_eq!(
            logs.iter().filter(|l| l.state == LoadState::Succeeded).count(),
            1
        );
        assert_eq!(
            logs.iter().filter(|l| l.state == LoadState::Duplicate).count(),
            1
        );
        assert!(!h.drop_dir.join("customers.csv").exists());
        assert_eq!(h.db.table_len("customers"), 1);
    }

    #[tokio::test]
    async fn missing_columns_quarantines_the_file() {
        let h = harness(customers_source(0));
        let path = write_file(&h.drop_dir, "customers.csv", "id,other\n1,x\n");

        let outcome = h.runner.run(&path).await;
        let (kind, detail) = outcome.error.clone().unwrap();
        assert_eq!(kind, ErrorKind::MissingColumns);
        assert!(detail.contains("name"));
        assert!(!h.drop_dir.join("customers.csv").exists());
        assert!(h.db.stage_tables().is_empty());
    }

    #[tokio::test]
    async fn transient_stage_create_failures_are_retried() {
        let h = harness(customers_source(0));
        h.db.inject_failure("create_stage_table", true);
        let path = write_file(&h.drop_dir, "customers.csv", "id,name,age\n1,a,30\n");

        let outcome = h.runner.run(&path).await;
        assert!(outcome.succeeded(), "outcome: {:?}", outcome.error);
    }

    #[tokio::test]
    async fn cancellation_takes_the_cleanup_path() {
        let h = harness(customers_source(0));
        h.runner.cancel.cancel();
        let path = write_file(&h.drop_dir, "customers.csv", "id,name,age\n1,a,30\n");

        let outcome = h.runner.run(&path).await;
        let (kind, _) = outcome.error.clone().unwrap();
        assert_eq!(kind, ErrorKind::Cancelled);
        assert!(!outcome.is_internal_failure());
        // quarantined, nothing published
        assert!(!h.drop_dir.join("customers.csv").exists());
        assert_eq!(h.db.table_len("customers"), 0);
    }

    #[tokio::test]
    async fn reprocessing_a_fixed_grain_heals_the_dlq() {
        let h = harness(customers_source(5));
        // first file: id 2 invalid (negative age), lands in DLQ
        let path = write_file(&h.drop_dir, "customers_a.csv", "id,name,age\n1,a,30\n2,b,-1\n");
        assert!(h.runner.run(&path).await.succeeded());
        assert_eq!(h.db.dlq_rows().len(), 1);

        // corrected resubmission with a different filename and content
        let path = write_file(&h.drop_dir, "customers_b.csv", "id,name,age\n2,b,22\n");
        assert!(h.runner.run(&path).await.succeeded());
        assert!(h.db.dlq_rows().is_empty());
        assert_eq!(h.db.table_len("customers"), 2);
    }
}
