//! FileLoader entry point

use clap::Parser;
use fileloader::cli::{Cli, Commands};
use fileloader::config::Settings;
use fileloader::db::build_adapter;
use fileloader::dispatch::{discover, Dispatcher, FileJob};
use fileloader::notify::{NotifyContext, NotifyHub, WebhookClient};
use fileloader::pipeline::read::ReaderRegistry;
use fileloader::pipeline::retry::RetryPolicy;
use fileloader::pipeline::runner::RunPaths;
use fileloader::sources::{catalog, registry::SourceRegistry};
use fileloader::store::build_store;
use fileloader::{LoadError, LoadResult};
use fileloader_common::logging::{init_logging, LogConfig, LogLevel};
use std::process;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let log_config = LogConfig::from_env().unwrap_or_default();
    let log_config = if cli.verbose {
        log_config.with_level(LogLevel::Debug)
    } else {
        log_config
    };
    let _ = init_logging(&log_config);

    match execute(cli).await {
        Ok(code) => process::exit(code),
        Err(err @ LoadError::Config { .. }) => {
            error!(error = %err, "Startup aborted");
            eprintln!("{err}");
            process::exit(2);
        },
        Err(err) => {
            error!(error = %err, "Run failed");
            eprintln!("Error: {err}");
            process::exit(1);
        },
    }
}

async fn execute(cli: Cli) -> LoadResult<i32> {
    let Commands::Run {
        file,
        directory,
        source,
    } = cli.command;

    let mut settings = Settings::from_env()?;
    if let Some(dir) = directory {
        settings.directory_path = dir;
        settings.validate()?;
    }

    let registry = SourceRegistry::new(catalog::registered_sources()?)?;
    let registry = match source {
        Some(ref name) => registry.restricted_to(name)?,
        None => registry,
    };

    let store = build_store(&settings).await?;
    let adapter = build_adapter(&settings).await?;
    adapter.ensure_system_tables().await?;

    let webhook = match settings.webhook_url {
        Some(ref url) => Some(
            WebhookClient::new(url.clone(), settings.operation_timeout_secs)
                .map_err(|e| LoadError::config(e.to_string()))?,
        ),
        None => None,
    };
    if settings.smtp.host.is_some() {
        // message construction is in-process; delivery is deployment wiring
        warn!("SMTP settings present but no mail transport is wired into this binary; stakeholder notifications fall back to the webhook");
    }
    let notify = Arc::new(NotifyHub::new(
        None,
        webhook,
        NotifyContext {
            archive_path: settings.archive_path.clone(),
            duplicate_files_path: settings.duplicate_files_path.clone(),
            data_team_email: settings.smtp.data_team_email.clone(),
        },
    ));

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupt received; cancelling at the next stage boundary");
                cancel.cancel();
            }
        });
    }

    let jobs: Vec<FileJob> = match file {
        Some(path) => vec![FileJob {
            extension: fileloader::store::logical_extension(&path),
            path,
            size: 0,
            discovered_at: chrono::Utc::now(),
        }],
        None => discover(&store, &settings.directory_path).await?,
    };

    if jobs.is_empty() {
        info!(directory = %settings.directory_path, "Nothing to process");
        return Ok(0);
    }

    let dispatcher = Dispatcher {
        registry,
        store,
        adapter,
        readers: Arc::new(ReaderRegistry::builtin()),
        notify,
        drop_dir: settings.directory_path.clone(),
        paths: RunPaths {
            archive_dir: settings.archive_path.clone(),
            duplicates_dir: settings.duplicate_files_path.clone(),
        },
        batch_size: settings.batch_size,
        retry: RetryPolicy::new(settings.retry_attempts, settings.retry_base_delay_ms)
            .with_op_timeout(settings.operation_timeout_secs),
        workers: settings.workers,
        cancel,
    };

    let summary = dispatcher.run(jobs).await;
    info!(
        succeeded = summary.succeeded,
        failed = summary.failed.len(),
        unmatched = summary.unmatched.len(),
        cancelled = summary.cancelled,
        "Run finished"
    );
    Ok(summary.exit_code())
}
