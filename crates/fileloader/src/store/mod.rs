//! FileStore capability
//!
//! Uniform list/open/copy/move/delete/hash over the drop, archive and
//! duplicate directories, whether they live on a local filesystem or in an
//! object store. `open` returns a blocking byte stream; large-object
//! streaming behaviour is adapter-specific (the local adapter streams, the
//! S3 adapter buffers the object).

pub mod local;
pub mod s3;

use crate::config::{Settings, StorePlatform};
use async_trait::async_trait;
use fileloader_common::{LoadError, LoadResult};
use std::io::Read;
use std::sync::Arc;

/// One file found by a listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    /// Canonical path within the store (local path or object key URI).
    pub path: String,
    pub size: u64,
}

/// Base filename (final path segment) of a store path.
pub fn base_name(path: &str) -> &str {
    path.rsplit(['/', '\\']).next().unwrap_or(path)
}

/// Lowercased final extension, with `.gz` looked through: `a.csv.gz` -> `csv`.
pub fn logical_extension(path: &str) -> String {
    let name = base_name(path).to_lowercase();
    let name = name.strip_suffix(".gz").unwrap_or(&name);
    name.rsplit_once('.')
        .map(|(_, ext)| ext.to_string())
        .unwrap_or_default()
}

/// Whether the path names a gzip-compressed file.
pub fn is_gzip_path(path: &str) -> bool {
    base_name(path).to_lowercase().ends_with(".gz")
}

#[async_trait]
pub trait FileStore: Send + Sync {
    /// Snapshot the files under `dir` (recursive).
    async fn list(&self, dir: &str) -> LoadResult<Vec<FileEntry>>;

    /// Open a file for reading.
    async fn open(&self, path: &str) -> LoadResult<Box<dyn Read + Send>>;

    /// Copy a file into another directory, keeping its base name.
    async fn copy_to_dir(&self, src: &str, dst_dir: &str) -> LoadResult<()>;

    /// Move a file into another directory, keeping its base name.
    async fn move_to_dir(&self, src: &str, dst_dir: &str) -> LoadResult<()>;

    async fn delete(&self, path: &str) -> LoadResult<()>;

    async fn exists(&self, path: &str) -> LoadResult<bool>;

    /// SHA-256 of the file's logical content (gzip-decoded when `gzipped`).
    async fn hash(&self, path: &str, gzipped: bool) -> LoadResult<String>;
}

/// Build the configured FileStore.
pub async fn build_store(settings: &Settings) -> LoadResult<Arc<dyn FileStore>> {
    match settings.platform {
        StorePlatform::Local => Ok(Arc::new(local::LocalFileStore::new())),
        StorePlatform::Aws => Ok(Arc::new(
            s3::S3FileStore::from_env(settings.aws_region.clone()).await?,
        )),
        StorePlatform::Azure | StorePlatform::Gcp => Err(LoadError::config(
            "azure and gcp file stores are not integrated in this build",
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_name_handles_separators() {
        assert_eq!(base_name("/drop/in/orders.csv"), "orders.csv");
        assert_eq!(base_name("orders.csv"), "orders.csv");
        assert_eq!(base_name("s3://bucket/drop/orders.csv"), "orders.csv");
    }

    #[test]
    fn logical_extension_looks_through_gzip() {
        assert_eq!(logical_extension("a/orders.csv"), "csv");
        assert_eq!(logical_extension("a/orders.CSV.GZ"), "csv");
        assert_eq!(logical_extension("a/sales.parquet.gz"), "parquet");
        assert_eq!(logical_extension("README"), "");
    }

    #[test]
    fn gzip_detection() {
        assert!(is_gzip_path("x/sales.parquet.gz"));
        assert!(!is_gzip_path("x/sales.parquet"));
    }
}
