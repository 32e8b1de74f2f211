//! End-to-end pipeline scenarios
//!
//! Each test drives the full engine (discovery → dispatch → per-file
//! pipeline) over real files in temp directories, with the in-memory
//! database adapter and a recording mailer standing in for the external
//! collaborators.

use fileloader::db::memory::MemoryDb;
use fileloader::db::LoadState;
use fileloader::dispatch::{discover, Dispatcher};
use fileloader::notify::{NotifyContext, NotifyHub, RecordingMailer};
use fileloader::pipeline::read::ReaderRegistry;
use fileloader::pipeline::retry::RetryPolicy;
use fileloader::pipeline::runner::RunPaths;
use fileloader::sources::registry::SourceRegistry;
use fileloader::sources::{
    AuditPredicate, FieldRule, FieldSpec, FileType, NotificationPolicy, SemanticType, SourceConfig,
};
use fileloader::store::local::LocalFileStore;
use fileloader::store::FileStore;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

struct World {
    db: Arc<MemoryDb>,
    mailer: Arc<RecordingMailer>,
    store: Arc<dyn FileStore>,
    drop_dir: PathBuf,
    archive_dir: PathBuf,
    duplicates_dir: PathBuf,
    _root: tempfile::TempDir,
}

impl World {
    fn new() -> Self {
        let root = tempfile::tempdir().unwrap();
        let drop_dir = root.path().join("drop");
        std::fs::create_dir_all(&drop_dir).unwrap();
        World {
            db: Arc::new(MemoryDb::new()),
            mailer: Arc::new(RecordingMailer::new()),
            store: Arc::new(LocalFileStore::new()),
            archive_dir: root.path().join("archive"),
            duplicates_dir: root.path().join("duplicates"),
            drop_dir,
            _root: root,
        }
    }

    fn dispatcher(&self, sources: Vec<SourceConfig>, workers: usize) -> Dispatcher {
        Dispatcher {
            registry: SourceRegistry::new(sources).unwrap(),
            store: self.store.clone(),
            adapter: self.db.clone(),
            readers: Arc::new(ReaderRegistry::builtin()),
            notify: Arc::new(NotifyHub::new(
                Some(self.mailer.clone() as Arc<dyn fileloader::notify::Mailer>),
                None,
                NotifyContext {
                    archive_path: self.archive_dir.to_string_lossy().into_owned(),
                    duplicate_files_path: self.duplicates_dir.to_string_lossy().into_owned(),
                    data_team_email: Some("data-team@example.com".into()),
                },
            )),
            drop_dir: self.drop_dir.to_string_lossy().into_owned(),
            paths: RunPaths {
                archive_dir: self.archive_dir.to_string_lossy().into_owned(),
                duplicates_dir: self.duplicates_dir.to_string_lossy().into_owned(),
            },
            batch_size: 100,
            retry: RetryPolicy::new(1, 1),
            workers,
            cancel: CancellationToken::new(),
        }
    }

    async fn run(&self, sources: Vec<SourceConfig>) -> fileloader::dispatch::RunSummary {
        self.run_with_workers(sources, 1).await
    }

    async fn run_with_workers(
        &self,
        sources: Vec<SourceConfig>,
        workers: usize,
    ) -> fileloader::dispatch::RunSummary {
        let jobs = discover(&self.store, self.drop_dir.to_str().unwrap())
            .await
            .unwrap();
        self.dispatcher(sources, workers).run(jobs).await
    }

    fn write(&self, name: &str, content: &[u8]) {
        std::fs::write(self.drop_dir.join(name), content).unwrap();
    }
}

fn customers_source(threshold: u64) -> SourceConfig {
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
        .notify(NotificationPolicy {
            recipients: vec!["crm-ops@example.com".into()],
            cc: vec![],
            kinds: vec![],
        })
        .build()
        .unwrap()
}

fn orders_json_source() -> SourceConfig {
    SourceConfig::builder("orders")
        .pattern(r"^orders.*\.json$")
        .file_type(FileType::Json {
            record_path: Some("data.orders".into()),
        })
        .target_table("orders")
        .field(FieldSpec::new("order_id", SemanticType::Integer))
        .field(FieldSpec::new("amount", SemanticType::Float))
        .grain(&["order_id"])
        .notify(NotificationPolicy {
            recipients: vec!["sales-ops@example.com".into()],
            cc: vec![],
            kinds: vec![],
        })
        .build()
        .unwrap()
}

fn sales_parquet_source(predicate: AuditPredicate) -> SourceConfig {
    SourceConfig::builder("sales")
        .pattern(r"^sales.*\.parquet(\.gz)?$")
        .file_type(FileType::Parquet)
        .target_table("sales")
        .field(FieldSpec::new("sale_id", SemanticType::Integer))
        .field(FieldSpec::new("amount", SemanticType::Float))
        .field(FieldSpec::new("region", SemanticType::Text).nullable())
        .grain(&["sale_id"])
        .audit("amount_total", "SELECT SUM(amount) FROM {table}", predicate)
        .notify(NotificationPolicy {
            recipients: vec!["finance@example.com".into()],
            cc: vec![],
            kinds: vec![],
        })
        .build()
        .unwrap()
}

fn parquet_bytes(ids: &[i64], amounts: &[f64]) -> Vec<u8> {
    use arrow::array::{Float64Array, Int64Array, StringArray};
    use arrow::datatypes::{DataType, Field, Schema};
    use arrow::record_batch::RecordBatch;
    use parquet::arrow::ArrowWriter;

    let schema = Arc::new(Schema::new(vec![
        Field::new("sale_id", DataType::Int64, false),
        Field::new("amount", DataType::Float64, false),
        Field::new("region", DataType::Utf8, true),
    ]));
    let regions: Vec<Option<&str>> = ids.iter().map(|_| Some("emea")).collect();
    let batch = RecordBatch::try_new(
        schema.clone(),
        vec![
            Arc::new(Int64Array::from(ids.to_vec())),
            Arc::new(Float64Array::from(amounts.to_vec())),
            Arc::new(StringArray::from(regions)),
        ],
    )
    .unwrap();
    let mut out = Vec::new();
    let mut writer = ArrowWriter::try_new(&mut out, schema, None).unwrap();
    writer.write(&batch).unwrap();
    writer.close().unwrap();
    out
}

fn gzipped(bytes: &[u8]) -> Vec<u8> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(bytes).unwrap();
    encoder.finish().unwrap()
}

fn in_dir(dir: &Path, name: &str) -> bool {
    dir.join(name).exists()
}

// Scenario 1: all rows valid, threshold 0.
#[tokio::test]
async fn clean_csv_publishes_every_row() {
    let world = World::new();
    world.write(
        "customers.csv",
        b"id,name,age\n1,alice,30\n2,bob,\n3,carol,41\n4,dave,22\n5,erin,35\n",
    );

    let summary = world.run(vec![customers_source(0)]).await;
    assert_eq!(summary.succeeded, 1);

    assert_eq!(world.db.table_len("customers"), 5);
    assert!(world.db.dlq_rows().is_empty());
    let log = &world.db.load_log_rows()[0];
    assert_eq!(log.state, LoadState::Succeeded);
    // row conservation
    assert_eq!(log.rows_read, log.rows_valid + log.rows_invalid);
    assert!(log.rows_published <= log.rows_valid);
    // archived copy kept, drop file gone
    assert!(in_dir(&world.archive_dir, "customers.csv"));
    assert!(!in_dir(&world.drop_dir, "customers.csv"));
}

// Scenario 2: a rule violation with threshold 0.
#[tokio::test]
async fn rule_violation_fails_the_file_and_fills_the_dlq() {
    let world = World::new();
    world.write(
        "customers.csv",
        b"id,name,age\n1,alice,30\n2,bob,20\n3,carol,-1\n4,dave,22\n5,erin,35\n",
    );

    let summary = world.run(vec![customers_source(0)]).await;
    assert_eq!(summary.failed.len(), 1);
    assert!(summary.failed[0].1.contains("Validation threshold"));

    // target untouched, one DLQ row naming the failing field
    assert_eq!(world.db.table_len("customers"), 0);
    let dlq = world.db.dlq_rows();
    assert_eq!(dlq.len(), 1);
    assert_eq!(dlq[0].source_row_number, 4);
    assert_eq!(dlq[0].failed_fields, vec!["age".to_string()]);
    assert!(dlq[0].reasons[0].contains("age"));
    // quarantined
    assert!(in_dir(&world.duplicates_dir, "customers.csv"));
    // stakeholders were told
    let mail = world.mailer.messages();
    assert_eq!(mail.len(), 1);
    assert!(mail[0].subject.contains("ValidationThresholdExceeded"));
    assert!(mail[0].cc.contains(&"data-team@example.com".to_string()));
}

// Scenario 3: duplicated grain inside one JSON file.
#[tokio::test]
async fn duplicate_grain_in_json_fails_with_first_occurrence_winning() {
    let world = World::new();
    let mut orders: Vec<String> = Vec::new();
    for row in 1..=10u32 {
        // rows 4 and 9 share order_id 77
        let order_id = match row {
            4 | 9 => 77,
            other => other as i64,
        };
        orders.push(format!(
            r#"{{"order_id": {order_id}, "amount": {}}}"#,
            row * 10
        ));
    }
    let body = format!(r#"{{"data": {{"orders": [{}]}}}}"#, orders.join(","));
    world.write("orders.json", body.as_bytes());

    let summary = world.run(vec![orders_json_source()]).await;
    assert_eq!(summary.failed.len(), 1);
    assert!(summary.failed[0].1.contains("Duplicate grain"));

    // target unchanged, stage dropped
    assert_eq!(world.db.table_len("orders"), 0);
    assert!(world.db.stage_tables().is_empty());
    // exactly one DLQ row: the second occurrence (row 9)
    let dlq = world.db.dlq_rows();
    assert_eq!(dlq.len(), 1);
    assert_eq!(dlq[0].source_row_number, 9);
    assert!(dlq[0].reasons[0].contains("DuplicateGrain"));
}

// Scenario 4: gzip parquet processed, then re-uploaded unchanged.
#[tokio::test]
async fn reuploaded_identical_file_is_a_duplicate() {
    let world = World::new();
    let bytes = gzipped(&parquet_bytes(&[1, 2, 3], &[10.0, 20.0, 30.0]));
    world.write("sales.parquet.gz", &bytes);

    let summary = world
        .run(vec![sales_parquet_source(AuditPredicate::Gt(0.0))])
        .await;
    assert_eq!(summary.succeeded, 1);
    assert_eq!(world.db.table_len("sales"), 3);

    // unchanged re-upload
    world.write("sales.parquet.gz", &bytes);
    let summary = world
        .run(vec![sales_parquet_source(AuditPredicate::Gt(0.0))])
        .await;
    assert_eq!(summary.succeeded, 0);
    assert_eq!(summary.failed.len(), 1);
    assert!(summary.failed[0].1.contains("already processed"));

    let logs = world.db.load_log_rows();
    assert_eq!(
        logs.iter().filter(|l| l.state == LoadState::Succeeded).count(),
        1
    );
    assert_eq!(
        logs.iter().filter(|l| l.state == LoadState::Duplicate).count(),
        1
    );
    assert!(in_dir(&world.duplicates_dir, "sales.parquet.gz"));
    let mail = world.mailer.messages();
    assert_eq!(mail.len(), 1);
    assert!(mail[0].body.contains("already been processed"));
}

// Scenario 5: audit predicate fails on the observed scalar.
#[tokio::test]
async fn failed_audit_blocks_publish() {
    let world = World::new();
    world.write("sales.parquet", &parquet_bytes(&[1, 2], &[5.0, -5.0]));

    let summary = world
        .run(vec![sales_parquet_source(AuditPredicate::Gt(0.0))])
        .await;
    assert_eq!(summary.failed.len(), 1);
    assert!(summary.failed[0].1.contains("amount_total"));
    assert!(summary.failed[0].1.contains("observed 0"));

    assert_eq!(world.db.table_len("sales"), 0);
    assert!(world.db.stage_tables().is_empty());
    let log = &world.db.load_log_rows()[0];
    assert_eq!(log.state, LoadState::Failed);
    assert_eq!(log.error_kind.as_deref(), Some("AuditFailedError"));
}

// Scenario 6: two files with two workers.
#[tokio::test]
async fn parallel_files_have_unique_monotone_load_ids() {
    let world = World::new();
    world.write("customers_a.csv", b"id,name,age\n1,a,10\n2,b,20\n");
    world.write(
        "customers_b.csv",
        b"id,name,age\n3,c,30\n4,d,40\n5,e,50\n",
    );

    let summary = world.run_with_workers(vec![customers_source(0)], 2).await;
    assert_eq!(summary.succeeded, 2);

    assert_eq!(world.db.table_len("customers"), 5);
    assert!(world.db.stage_tables().is_empty());
    let logs = world.db.load_log_rows();
    assert_eq!(logs.len(), 2);
    assert!(logs.iter().all(|l| l.state == LoadState::Succeeded));
    assert!(logs[0].file_load_id < logs[1].file_load_id);
}

// Gzip transparency for CSV: same contract as the plain file.
#[tokio::test]
async fn gzipped_csv_loads_like_plain_csv() {
    let world = World::new();
    world.write(
        "customers.csv.gz",
        &gzipped(b"id,name,age\n1,alice,30\n2,bob,25\n"),
    );

    let summary = world.run(vec![customers_source(0)]).await;
    assert_eq!(summary.succeeded, 1, "failures: {:?}", summary.failed);
    assert_eq!(world.db.table_len("customers"), 2);
}

// DLQ self-healing across files.
#[tokio::test]
async fn dlq_rows_clear_when_a_later_file_publishes_the_grain() {
    let world = World::new();
    world.write("customers_a.csv", b"id,name,age\n1,a,30\n2,b,-1\n");
    let summary = world.run(vec![customers_source(5)]).await;
    assert_eq!(summary.succeeded, 1);
    assert_eq!(world.db.dlq_rows().len(), 1);

    world.write("customers_b.csv", b"id,name,age\n2,b,21\n");
    let summary = world.run(vec![customers_source(5)]).await;
    assert_eq!(summary.succeeded, 1);
    assert!(world.db.dlq_rows().is_empty());
    assert_eq!(world.db.table_len("customers"), 2);
}

// Empty-file contract.
#[tokio::test]
async fn header_only_csv_is_no_data() {
    let world = World::new();
    world.write("customers.csv", b"id,name,age\n");

    let summary = world.run(vec![customers_source(0)]).await;
    assert_eq!(summary.failed.len(), 1);
    assert!(summary.failed[0].1.contains("No data rows"));
    assert!(in_dir(&world.duplicates_dir, "customers.csv"));
    let log = &world.db.load_log_rows()[0];
    assert_eq!(log.error_kind.as_deref(), Some("NoDataInFile"));
}
