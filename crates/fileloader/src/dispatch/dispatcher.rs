//! Dispatcher: source matching and the worker pool
//!
//! Matches each discovered file to the first source whose pattern matches
//! its base filename, then feeds matched jobs through a bounded channel to
//! W long-lived workers. Each worker runs exactly one pipeline at a time to
//! completion. Pipelines run in their own task so a panic is contained:
//! the dispatcher records a `WorkerPanic`, tries to put the file back in
//! the drop directory, and carries on.

use super::discovery::FileJob;
use crate::db::DbAdapter;
use crate::notify::NotifyHub;
use crate::pipeline::read::ReaderRegistry;
use crate::pipeline::retry::RetryPolicy;
use crate::pipeline::runner::{FileOutcome, PipelineRunner, RunPaths};
use crate::pipeline::LoadCounts;
use crate::sources::registry::SourceRegistry;
use crate::sources::SourceConfig;
use crate::store::{base_name, FileStore};
use fileloader_common::ErrorKind;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn, Instrument};
use uuid::Uuid;

/// Aggregate result of one `run` invocation.
#[derive(Debug, Default)]
pub struct RunSummary {
    pub succeeded: usize,
    /// (filename, reason) per terminally failed file.
    pub failed: Vec<(String, String)>,
    /// Files with no matching source; moved aside with no DB state.
    pub unmatched: Vec<String>,
    pub cancelled: usize,
    /// Worker panics and other harness faults; these drive the exit code.
    pub fatal_internal: usize,
}

impl RunSummary {
    /// Per-file failures are not process failures; only harness faults are.
    pub fn exit_code(&self) -> i32 {
        if self.fatal_internal > 0 {
            1
        } else {
            0
        }
    }

    fn absorb(&mut self, outcome: &FileOutcome) {
        match &outcome.error {
            None => self.succeeded += 1,
            Some((ErrorKind::Cancelled, _)) => self.cancelled += 1,
            Some((ErrorKind::WorkerPanic, reason)) => {
                self.fatal_internal += 1;
                self.failed.push((outcome.filename.clone(), reason.clone()));
            },
            Some((_, reason)) => {
                self.failed.push((outcome.filename.clone(), reason.clone()));
            },
        }
    }
}

pub struct Dispatcher {
    pub registry: SourceRegistry,
    pub store: Arc<dyn FileStore>,
    pub adapter: Arc<dyn DbAdapter>,
    pub readers: Arc<ReaderRegistry>,
    pub notify: Arc<NotifyHub>,
    pub drop_dir: String,
    pub paths: RunPaths,
    pub batch_size: usize,
    pub retry: RetryPolicy,
    pub workers: usize,
    pub cancel: CancellationToken,
}

impl Dispatcher {
    /// Process a snapshot of jobs to completion and summarize.
    pub async fn run(&self, jobs: Vec<FileJob>) -> RunSummary {
        let mut summary = RunSummary::default();
        let mut matched: Vec<(FileJob, Arc<SourceConfig>)> = Vec::new();

        for job in jobs {
            let filename = base_name(&job.path).to_string();
            match self.registry.find_for_file(&filename) {
                Some(source) => matched.push((job, source)),
                None => {
                    warn!(file = %filename, "No source configuration matches; moving aside");
                    if let Err(e) = self
                        .store
                        .move_to_dir(&job.path, &self.paths.duplicates_dir)
                        .await
                    {
                        error!(file = %filename, error = %e, "Failed to move unmatched file");
                    }
                    summary.unmatched.push(filename);
                },
            }
        }

        let workers = self.workers.max(1);
        info!(
            files = matched.len(),
            workers,
            "Dispatching files to worker pool"
        );

        let (tx, rx) = mpsc::channel::<(FileJob, Arc<SourceConfig>)>(workers * 2);
        let rx = Arc::new(Mutex::new(rx));
        let outcomes: Arc<Mutex<Vec<FileOutcome>>> = Arc::new(Mutex::new(Vec::new()));

        let mut worker_handles = Vec::with_capacity(workers);
        for _ in 0..workers {
            let rx = rx.clone();
            let outcomes = outcomes.clone();
            let dispatcher_cancel = self.cancel.clone();
            let store = self.store.clone();
            let notify = self.notify.clone();
            let drop_dir = self.drop_dir.clone();
            let duplicates_dir = self.paths.duplicates_dir.clone();
            // captured per worker to build runners inside the task
            let make_runner = {
                let this = self.clone_parts();
                move |source: Arc<SourceConfig>| this.runner_for_parts(source)
            };

            let worker_id = Uuid::new_v4();
            worker_handles.push(tokio::spawn(async move {
                loop {
                    let next = { rx.lock().await.recv().await };
                    let Some((job, source)) = next else {
                        break;
                    };
                    let filename = base_name(&job.path).to_string();

                    if dispatcher_cancel.is_cancelled() {
                        // not started: leave the file in the drop directory
                        outcomes.lock().await.push(FileOutcome {
                            filename,
                            source_name: source.name.clone(),
                            file_load_id: None,
                            counts: LoadCounts::default(),
                            error: Some((
                                ErrorKind::Cancelled,
                                "run cancelled before the file was started".to_string(),
                            )),
                        });
                        continue;
                    }

                    let runner = make_runner(source.clone());
                    let path = job.path.clone();
                    let span = tracing::info_span!(
                        "pipeline",
                        file = %filename,
                        source = %source.name,
                        worker = %worker_id,
                        file_load_id = tracing::field::Empty
                    );
                    let pipeline = tokio::spawn(async move { runner.run(&path).await }.instrument(span));

                    let outcome = match pipeline.await {
                        Ok(outcome) => outcome,
                        Err(join_error) => {
                            let detail = if join_error.is_panic() {
                                format!("pipeline task panicked: {join_error}")
                            } else {
                                format!("pipeline task aborted: {join_error}")
                            };
                            error!(file = %filename, detail, "Worker pipeline died");
                            notify
                                .internal("worker_panic", Some(&filename), &detail)
                                .await;
                            restore_to_drop(&store, &job.path, &drop_dir, &duplicates_dir).await;
                            FileOutcome {
                                filename: filename.clone(),
                                source_name: source.name.clone(),
                                file_load_id: None,
                                counts: LoadCounts::default(),
                                error: Some((ErrorKind::WorkerPanic, detail)),
                            }
                        },
                    };
                    outcomes.lock().await.push(outcome);
                }
            }));
        }

        for item in matched {
            if tx.send(item).await.is_err() {
                break;
            }
        }
        drop(tx);
        for handle in worker_handles {
            if let Err(e) = handle.await {
                error!(error = %e, "Worker task failed to join");
                summary.fatal_internal += 1;
            }
        }

        let outcomes = outcomes.lock().await;
        for outcome in outcomes.iter() {
            summary.absorb(outcome);
        }

        let mut details: Vec<String> = summary
            .failed
            .iter()
            .map(|(file, reason)| format!("{file}: {reason}"))
            .collect();
        details.extend(
            summary
                .unmatched
                .iter()
                .map(|file| format!("{file}: no source configuration matched")),
        );
        self.notify
            .run_summary(
                summary.succeeded,
                summary.failed.len(),
                summary.unmatched.len(),
                &details,
            )
            .await;

        summary
    }

    // Cheap bundle of Arc'd parts so worker tasks can construct runners.
    fn clone_parts(&self) -> RunnerParts {
        RunnerParts {
            store: self.store.clone(),
            adapter: self.adapter.clone(),
            readers: self.readers.clone(),
            notify: self.notify.clone(),
            paths: self.paths.clone(),
            batch_size: self.batch_size,
            retry: self.retry,
            cancel: self.cancel.clone(),
        }
    }
}

#[derive(Clone)]
struct RunnerParts {
    store: Arc<dyn FileStore>,
    adapter: Arc<dyn DbAdapter>,
    readers: Arc<ReaderRegistry>,
    notify: Arc<NotifyHub>,
    paths: RunPaths,
    batch_size: usize,
    retry: RetryPolicy,
    cancel: CancellationToken,
}

impl RunnerParts {
    fn runner_for_parts(&self, source: Arc<SourceConfig>) -> PipelineRunner {
        PipelineRunner {
            source,
            store: self.store.clone(),
            adapter: self.adapter.clone(),
            readers: self.readers.clone(),
            notify: self.notify.clone(),
            paths: self.paths.clone(),
            batch_size: self.batch_size,
            retry: self.retry,
            cancel: self.cancel.clone(),
        }
    }
}

/// After a panic the file may have been moved part-way; put it back in the
/// drop directory so the next run retries it. Best effort.
async fn restore_to_drop(
    store: &Arc<dyn FileStore>,
    original_path: &str,
    drop_dir: &str,
    duplicates_dir: &str,
) {
    match store.exists(original_path).await {
        Ok(true) => {},
        _ => {
            let quarantined = format!(
                "{}/{}",
                duplicates_dir.trim_end_matches('/'),
                base_name(original_path)
            );
            if matches!(store.exists(&quarantined).await, Ok(true)) {
                if let Err(e) = store.move_to_dir(&quarantined, drop_dir).await {
                    warn!(file = %quarantined, error = %e, "Could not restore file to drop directory");
                }
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::memory::MemoryDb;
    use crate::dispatch::discovery::discover;
    use crate::sources::{FieldSpec, SemanticType, SourceConfig};
    use crate::store::local::LocalFileStore;

    fn sources() -> SourceRegistry {
        SourceRegistry::new(vec![
            SourceConfig::builder("customers")
                .pattern(r"^customers.*\.csv$")
                .target_table("customers")
                .field(FieldSpec::new("id", SemanticType::Integer))
                .field(FieldSpec::new("name", SemanticType::Text))
                .grain(&["id"])
                .build()
                .unwrap(),
            SourceConfig::builder("orders")
                .pattern(r"^orders.*\.csv$")
                .target_table("orders")
                .field(FieldSpec::new("order_id", SemanticType::Integer))
                .grain(&["order_id"])
                .build()
                .unwrap(),
        ])
        .unwrap()
    }

    struct Fixture {
        db: Arc<MemoryDb>,
        dispatcher: Dispatcher,
        drop_dir: std::path::PathBuf,
        dup_dir: std::path::PathBuf,
        store: Arc<dyn FileStore>,
        _root: tempfile::TempDir,
    }

    fn fixture(workers: usize) -> Fixture {
        let root = tempfile::tempdir().unwrap();
        let drop_dir = root.path().join("drop");
        let dup_dir = root.path().join("duplicates");
        std::fs::create_dir_all(&drop_dir).unwrap();
        let db = Arc::new(MemoryDb::new());
        let store: Arc<dyn FileStore> = Arc::new(LocalFileStore::new());
        let dispatcher = Dispatcher {
            registry: sources(),
            store: store.clone(),
            adapter: db.clone(),
            readers: Arc::new(ReaderRegistry::builtin()),
            notify: Arc::new(NotifyHub::disabled()),
            drop_dir: drop_dir.to_string_lossy().into_owned(),
            paths: RunPaths {
                archive_dir: root.path().join("archive").to_string_lossy().into_owned(),
                duplicates_dir: dup_dir.to_string_lossy().into_owned(),
            },
            batch_size: 100,
            retry: RetryPolicy::new(1, 1),
            workers,
            cancel: CancellationToken::new(),
        };
        Fixture {
            db,
            dispatcher,
            drop_dir,
            dup_dir,
            store,
            _root: root,
        }
    }

    #[tokio::test]
    async fn parallel_files_do_not_interleave_and_all_terminate() {
        let f = fixture(2);
        std::fs::write(f.drop_dir.join("customers_1.csv"), "id,name\n1,a\n2,b\n").unwrap();
        std::fs::write(f.drop_dir.join("orders_1.csv"), "order_id\n10\n11\n12\n").unwrap();

        let jobs = discover(&f.store, f.drop_dir.to_str().unwrap()).await.unwrap();
        let summary = f.dispatcher.run(jobs).await;

        assert_eq!(summary.succeeded, 2);
        assert!(summary.failed.is_empty());
        assert_eq!(summary.exit_code(), 0);
        // each target only holds its own rows
        assert_eq!(f.db.table_len("customers"), 2);
        assert_eq!(f.db.table_len("orders"), 3);
        // unique, monotone load ids, all rows terminal
        let logs = f.db.load_log_rows();
        assert_eq!(logs.len(), 2);
        assert!(logs.iter().all(|l| l.ended_at.is_some()));
        assert!(logs[0].file_load_id < logs[1].file_load_id);
    }

    #[tokio::test]
    async fn unmatched_files_move_aside_without_db_state() {
        let f = fixture(1);
        std::fs::write(f.drop_dir.join("mystery.txt"), "whatever").unwrap();

        let jobs = discover(&f.store, f.drop_dir.to_str().unwrap()).await.unwrap();
        let summary = f.dispatcher.run(jobs).await;

        assert_eq!(summary.unmatched, vec!["mystery.txt".to_string()]);
        assert!(f.dup_dir.join("mystery.txt").exists());
        assert!(!f.drop_dir.join("mystery.txt").exists());
        assert!(f.db.load_log_rows().is_empty());
        assert_eq!(summary.exit_code(), 0);
    }

    #[tokio::test]
    async fn per_file_failures_do_not_fail_the_process() {
        let f = fixture(2);
        std::fs::write(f.drop_dir.join("customers_1.csv"), "id,name\n1,a\n").unwrap();
        // missing required column `name`
        std::fs::write(f.drop_dir.join("customers_2.csv"), "id\n9\n").unwrap();

        let jobs = discover(&f.store, f.drop_dir.to_str().unwrap()).await.unwrap();
        let summary = f.dispatcher.run(jobs).await;

        assert_eq!(summary.succeeded, 1);
        assert_eq!(summary.failed.len(), 1);
        assert_eq!(summary.exit_code(), 0);
        assert!(f.dup_dir.join("customers_2.csv").exists());
    }

    #[tokio::test]
    async fn cancelled_run_leaves_unstarted_files_in_the_drop_dir() {
        let f = fixture(1);
        f.dispatcher.cancel.cancel();
        std::fs::write(f.drop_dir.join("customers_1.csv"), "id,name\n1,a\n").unwrap();

        let jobs = discover(&f.store, f.drop_dir.to_str().unwrap()).await.unwrap();
        let summary = f.dispatcher.run(jobs).await;

        assert_eq!(summary.cancelled, 1);
        assert!(f.drop_dir.join("customers_1.csv").exists());
        assert_eq!(summary.exit_code(), 0);
    }
}
