//! Content hashing for file deduplication
//!
//! Hashes are SHA-256 over the logical file content: for gzip-compressed
//! files the hash is computed on the decoded bytes, so `x.csv` and
//! `x.csv.gz` with identical content hash the same.

use crate::error::LoadResult;
use flate2::read::GzDecoder;
use sha2::{Digest, Sha256};
use std::io::Read;
use std::path::Path;

const BUF_SIZE: usize = 64 * 1024;

/// Compute the SHA-256 hex digest of a readable byte stream.
pub fn compute_checksum<R: Read>(reader: &mut R) -> LoadResult<String> {
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; BUF_SIZE];

    loop {
        let bytes_read = reader.read(&mut buffer)?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }

    Ok(hex::encode(hasher.finalize()))
}

/// Compute the content hash of a stream, transparently decoding gzip.
pub fn content_hash<R: Read>(reader: R, gzipped: bool) -> LoadResult<String> {
    if gzipped {
        let mut decoder = GzDecoder::new(reader);
        compute_checksum(&mut decoder)
    } else {
        let mut reader = reader;
        compute_checksum(&mut reader)
    }
}

/// Compute the content hash of a local file.
pub fn file_content_hash(path: impl AsRef<Path>, gzipped: bool) -> LoadResult<String> {
    let file = std::fs::File::open(path)?;
    content_hash(file, gzipped)
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::{Cursor, Write};

    #[test]
    fn test_compute_checksum_sha256() {
        let data = b"hello world";
        let mut cursor = Cursor::new(data);
        let checksum = compute_checksum(&mut cursor).unwrap();
        assert_eq!(
            checksum,
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[test]
    fn test_gzip_content_hashes_like_plain_content() {
        let data = b"id,name\n1,alpha\n2,beta\n";
        let plain = content_hash(Cursor::new(&data[..]), false).unwrap();

        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(data).unwrap();
        let compressed = encoder.finish().unwrap();
        let decoded = content_hash(Cursor::new(compressed), true).unwrap();

        assert_eq!(plain, decoded);
    }

    #[test]
    fn test_empty_stream() {
        let checksum = compute_checksum(&mut Cursor::new(b"")).unwrap();
        assert_eq!(
            checksum,
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }
}
