//! Drop-directory discovery
//!
//! Snapshots the drop directory into an immutable work queue. Files
//! appearing after the snapshot are picked up by the next invocation; a
//! listing failure is fatal for the whole run.

use crate::store::{logical_extension, FileEntry, FileStore};
use chrono::{DateTime, Utc};
use fileloader_common::LoadResult;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::info;

/// One discovered file, consumed exactly once by the dispatcher.
#[derive(Debug, Clone)]
pub struct FileJob {
    pub path: String,
    pub size: u64,
    /// Lowercased logical extension (`.gz` looked through).
    pub extension: String,
    pub discovered_at: DateTime<Utc>,
}

impl FileJob {
    fn from_entry(entry: FileEntry, discovered_at: DateTime<Utc>) -> Self {
        Self {
            extension: logical_extension(&entry.path),
            path: entry.path,
            size: entry.size,
            discovered_at,
        }
    }
}

/// Snapshot the drop directory. Listing order is discovery order; ties and
/// reruns are made deterministic by a path sort, and no path is enumerated
/// twice.
pub async fn discover(store: &Arc<dyn FileStore>, directory: &str) -> LoadResult<Vec<FileJob>> {
    let discovered_at = Utc::now();
    let mut entries = store.list(directory).await?;
    entries.sort_by(|a, b| a.path.cmp(&b.path));

    let mut seen = HashSet::new();
    let jobs: Vec<FileJob> = entries
        .into_iter()
        .filter(|e| seen.insert(e.path.clone()))
        .map(|e| FileJob::from_entry(e, discovered_at))
        .collect();

    info!(directory, files = jobs.len(), "Discovered drop directory snapshot");
    Ok(jobs)
}
