//! S3 FileStore adapter
//!
//! Paths are `s3://bucket/key` URIs. Objects are buffered on open; the
//! drop-directory files this service ingests are bounded by the reader's
//! batch protocol, not by object size, so buffering is acceptable here.

use super::{base_name, FileEntry, FileStore};
use async_trait::async_trait;
use aws_sdk_s3::Client;
use fileloader_common::{checksum, LoadError, LoadResult};
use std::io::{Cursor, Read};
use tracing::{debug, info};

pub struct S3FileStore {
    client: Client,
}

/// Split `s3://bucket/key` into (bucket, key).
fn parse_uri(path: &str) -> LoadResult<(String, String)> {
    let rest = path
        .strip_prefix("s3://")
        .ok_or_else(|| LoadError::store("parse", format!("not an s3:// URI: {path}")))?;
    let (bucket, key) = rest.split_once('/').unwrap_or((rest, ""));
    if bucket.is_empty() {
        return Err(LoadError::store("parse", format!("missing bucket in {path}")));
    }
    Ok((bucket.to_string(), key.trim_start_matches('/').to_string()))
}

fn store_err(operation: &str, e: impl std::fmt::Display) -> LoadError {
    LoadError::StoreUnavailable {
        operation: operation.to_string(),
        reason: e.to_string(),
        transient: true,
    }
}

impl S3FileStore {
    /// Build a client from the default AWS credential chain.
    pub async fn from_env(region: Option<String>) -> LoadResult<Self> {
        let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest());
        if let Some(region) = region {
            loader = loader.region(aws_sdk_s3::config::Region::new(region));
        }
        let config = loader.load().await;
        let client = Client::new(&config);
        info!("S3 file store initialized");
        Ok(Self { client })
    }

    pub fn from_client(client: Client) -> Self {
        Self { client }
    }

    async fn get_bytes(&self, path: &str) -> LoadResult<Vec<u8>> {
        let (bucket, key) = parse_uri(path)?;
        let response = self
            .client
            .get_object()
            .bucket(&bucket)
            .key(&key)
            .send()
            .await
            .map_err(|e| store_err("get_object", e))?;
        let data = response
            .body
            .collect()
            .await
            .map_err(|e| store_err("get_object", e))?
            .into_bytes()
            .to_vec();
        debug!(path, bytes = data.len(), "Downloaded object");
        Ok(data)
    }
}

#[async_trait]
impl FileStore for S3FileStore {
    async fn list(&self, dir: &str) -> LoadResult<Vec<FileEntry>> {
        let (bucket, prefix) = parse_uri(dir)?;
        let mut entries = Vec::new();
        let mut continuation: Option<String> = None;

        loop {
            let mut request = self.client.list_objects_v2().bucket(&bucket);
            if !prefix.is_empty() {
                request = request.prefix(format!("{}/", prefix.trim_end_matches('/')));
            }
            if let Some(token) = continuation.take() {
                request = request.continuation_token(token);
            }
            let response = request.send().await.map_err(|e| LoadError::ListingFailed {
                directory: dir.to_string(),
                reason: e.to_string(),
            })?;

            for object in response.contents() {
                let key = object.key().unwrap_or_default();
                if key.ends_with('/') {
                    continue;
                }
                entries.push(FileEntry {
                    path: format!("s3://{bucket}/{key}"),
                    size: object.size().unwrap_or(0) as u64,
                });
            }

            match response.next_continuation_token() {
                Some(token) => continuation = Some(token.to_string()),
                None => break,
            }
        }

        debug!(directory = dir, files = entries.len(), "Listed object prefix");
        Ok(entries)
    }

    async fn open(&self, path: &str) -> LoadResult<Box<dyn Read + Send>> {
        let data = self.get_bytes(path).await?;
        Ok(Box::new(Cursor::new(data)))
    }

    async fn copy_to_dir(&self, src: &str, dst_dir: &str) -> LoadResult<()> {
        let (src_bucket, src_key) = parse_uri(src)?;
        let (dst_bucket, dst_prefix) = parse_uri(dst_dir)?;
        let dst_key = format!("{}/{}", dst_prefix.trim_end_matches('/'), base_name(src));
        self.client
            .copy_object()
            .bucket(&dst_bucket)
            .key(&dst_key)
            .copy_source(format!("{src_bucket}/{src_key}"))
            .send()
            .await
            .map_err(|e| store_err("copy_object", e))?;
        Ok(())
    }

    async fn move_to_dir(&self, src: &str, dst_dir: &str) -> LoadResult<()> {
        self.copy_to_dir(src, dst_dir).await?;
        self.delete(src).await
    }

    async fn delete(&self, path: &str) -> LoadResult<()> {
        let (bucket, key) = parse_uri(path)?;
        self.client
            .delete_object()
            .bucket(&bucket)
            .key(&key)
            .send()
            .await
            .map_err(|e| store_err("delete_object", e))?;
        Ok(())
    }

    async fn exists(&self, path: &str) -> LoadResult<bool> {
        let (bucket, key) = parse_uri(path)?;
        match self
            .client
            .head_object()
            .bucket(&bucket)
            .key(&key)
            .send()
            .await
        {
            Ok(_) => Ok(true),
            Err(e) => {
                let service_err = e.into_service_error();
                if service_err.is_not_found() {
                    Ok(false)
                } else {
                    Err(store_err("head_object", service_err))
                }
            },
        }
    }

    async fn hash(&self, path: &str, gzipped: bool) -> LoadResult<String> {
        let data = self.get_bytes(path).await?;
        checksum::content_hash(Cursor::new(data), gzipped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_uri_splits_bucket_and_key() {
        let (bucket, key) = parse_uri("s3://drop-bucket/incoming/orders.csv").unwrap();
        assert_eq!(bucket, "drop-bucket");
        assert_eq!(key, "incoming/orders.csv");
    }

    #[test]
    fn parse_uri_rejects_non_s3() {
        assert!(parse_uri("/local/path").is_err());
        assert!(parse_uri("s3://").is_err());
    }
}
