//! Checksum computation (§4.7), run off the async executor via
//! `spawn_blocking` so CPU-bound hashing never blocks the scheduler task.

use std::io::Read;
use std::path::PathBuf;

use md5::Md5;
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};
use crate::ChecksumType;

const READ_BUFFER_SIZE: usize = 64 * 1024;

/// Stream `path` through the selected digest and return its lowercase hex
/// form. Returns `None` for [`ChecksumType::None`] without touching the
/// file.
pub(crate) async fn compute(path: PathBuf, checksum_type: ChecksumType) -> Result<Option<String>> {
    if checksum_type == ChecksumType::None {
        return Ok(None);
    }
    tokio::task::spawn_blocking(move || compute_blocking(&path, checksum_type))
        .await
        .map_err(|e| Error::FileError(format!("digest task panicked: {e}")))?
}

fn compute_blocking(path: &std::path::Path, checksum_type: ChecksumType) -> Result<Option<String>> {
    let mut file = std::fs::File::open(path)?;
    let mut buffer = [0u8; READ_BUFFER_SIZE];

    let hex = match checksum_type {
        ChecksumType::Sha256 => {
            let mut hasher = Sha256::new();
            loop {
                let n = file.read(&mut buffer)?;
                if n == 0 {
                    break;
                }
                hasher.update(&buffer[..n]);
            }
            hex::encode(hasher.finalize())
        }
        ChecksumType::Md5 => {
            let mut hasher = Md5::new();
            loop {
                let n = file.read(&mut buffer)?;
                if n == 0 {
                    break;
                }
                hasher.update(&buffer[..n]);
            }
            hex::encode(hasher.finalize())
        }
        ChecksumType::None => return Ok(None),
    };
    Ok(Some(hex))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[tokio::test]
    async fn sha256_matches_known_digest() {
        let dir = temp_dir::TempDir::new().unwrap();
        let path = dir.path().join("sample.bin");
        std::fs::File::create(&path).unwrap().write_all(b"hello world").unwrap();

        let digest = compute(path, ChecksumType::Sha256).await.unwrap().unwrap();
        assert_eq!(
            digest,
            "b94d27b9934d3e08a52e52d7da7dacefbc4dfab2c9a5e41bb07d87f82d3b8e06"
                .to_string()
                .to_lowercase()
        );
    }

    #[tokio::test]
    async fn md5_matches_known_digest() {
        let dir = temp_dir::TempDir::new().unwrap();
        let path = dir.path().join("sample.bin");
        std::fs::File::create(&path).unwrap().write_all(b"hello world").unwrap();

        let digest = compute(path, ChecksumType::Md5).await.unwrap().unwrap();
        assert_eq!(digest, "5eb63bbbe01eeed093cb22bb8f5acdc3");
    }

    #[tokio::test]
    async fn none_skips_computation_entirely() {
        let dir = temp_dir::TempDir::new().unwrap();
        let path = dir.path().join("missing.bin");
        let digest = compute(path, ChecksumType::None).await.unwrap();
        assert_eq!(digest, None);
    }
}
