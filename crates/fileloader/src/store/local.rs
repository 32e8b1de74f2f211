//! Local filesystem FileStore

use super::{base_name, FileEntry, FileStore};
use async_trait::async_trait;
use fileloader_common::{checksum, LoadError, LoadResult};
use std::io::Read;
use std::path::{Path, PathBuf};
use tracing::debug;

#[derive(Debug, Default, Clone)]
pub struct LocalFileStore;

impl LocalFileStore {
    pub fn new() -> Self {
        Self
    }

    fn to_path(path: &str) -> PathBuf {
        PathBuf::from(path.strip_prefix("file://").unwrap_or(path))
    }

    fn collect_entries(dir: &Path, out: &mut Vec<FileEntry>) -> std::io::Result<()> {
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            let meta = entry.metadata()?;
            if meta.is_dir() {
                Self::collect_entries(&entry.path(), out)?;
            } else {
                out.push(FileEntry {
                    path: entry.path().to_string_lossy().into_owned(),
                    size: meta.len(),
                });
            }
        }
        Ok(())
    }
}

#[async_trait]
impl FileStore for LocalFileStore {
    async fn list(&self, dir: &str) -> LoadResult<Vec<FileEntry>> {
        let root = Self::to_path(dir);
        let mut entries = Vec::new();
        Self::collect_entries(&root, &mut entries).map_err(|e| LoadError::ListingFailed {
            directory: dir.to_string(),
            reason: e.to_string(),
        })?;
        debug!(directory = dir, files = entries.len(), "Listed drop directory");
        Ok(entries)
    }

    async fn open(&self, path: &str) -> LoadResult<Box<dyn Read + Send>> {
        let file = std::fs::File::open(Self::to_path(path))?;
        Ok(Box::new(file))
    }

    async fn copy_to_dir(&self, src: &str, dst_dir: &str) -> LoadResult<()> {
        let src_path = Self::to_path(src);
        let dst_root = Self::to_path(dst_dir);
        std::fs::create_dir_all(&dst_root)?;
        let dst_path = dst_root.join(base_name(src));
        std::fs::copy(&src_path, &dst_path)?;
        debug!(src, dst = %dst_path.display(), "Copied file");
        Ok(())
    }

    async fn move_to_dir(&self, src: &str, dst_dir: &str) -> LoadResult<()> {
        let src_path = Self::to_path(src);
        let dst_root = Self::to_path(dst_dir);
        std::fs::create_dir_all(&dst_root)?;
        let dst_path = dst_root.join(base_name(src));
        // rename fails across filesystems; fall back to copy + delete
        if std::fs::rename(&src_path, &dst_path).is_err() {
            std::fs::copy(&src_path, &dst_path)?;
            std::fs::remove_file(&src_path)?;
        }
        debug!(src, dst = %dst_path.display(), "Moved file");
        Ok(())
    }

    async fn delete(&self, path: &str) -> LoadResult<()> {
        std::fs::remove_file(Self::to_path(path))?;
        Ok(())
    }

    async fn exists(&self, path: &str) -> LoadResult<bool> {
        Ok(Self::to_path(path).exists())
    }

    async fn hash(&self, path: &str, gzipped: bool) -> LoadResult<String> {
        checksum::file_content_hash(Self::to_path(path), gzipped)
    }
}
