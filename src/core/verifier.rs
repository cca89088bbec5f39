use anyhow::{Result, bail};
use std::io::Read;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Result of a successful verification
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifyResult {
    pub bytes_verified: u64,
    /// BLAKE3 hex digest of the verified file
    pub checksum: String,
}

/// Check a downloaded archive against the size the device reported and
/// compute its checksum.
///
/// When `expected_checksum` is given the digest must match it as well.
pub async fn verify_download(
    path: &Path,
    expected_size: u64,
    expected_checksum: Option<&str>,
) -> Result<VerifyResult> {
    let path: PathBuf = path.to_path_buf();
    let expected_checksum = expected_checksum.map(str::to_string);

    info!(file = %path.display(), expected_size, "Starting download verification");

    // Hashing reads the whole archive; keep it off the runtime thread
    tokio::task::spawn_blocking(move || {
        let metadata = std::fs::metadata(&path)
            .map_err(|e| anyhow::anyhow!("Failed to stat {}: {}", path.display(), e))?;

        if metadata.len() != expected_size {
            bail!(format_mismatch_error(
                &path,
                &format!("size {} bytes, expected {}", metadata.len(), expected_size)
            ));
        }

        let hash = hash_file_sync(&path)?;
        let checksum = hash.to_hex().to_string();
        debug!(file = %path.display(), checksum = %checksum, "Hashed file");

        if let Some(expected) = expected_checksum {
            if !expected.eq_ignore_ascii_case(&checksum) {
                bail!(format_mismatch_error(
                    &path,
                    &format!("checksum {}, expected {}", checksum, expected)
                ));
            }
        }

        info!(file = %path.display(), bytes_verified = expected_size, "Verification complete");

        Ok(VerifyResult {
            bytes_verified: expected_size,
            checksum,
        })
    })
    .await?
}

/// Hash a file using BLAKE3, streaming in chunks to handle large files (sync version)
fn hash_file_sync(path: &Path) -> Result<blake3::Hash> {
    let file = std::fs::File::open(path)
        .map_err(|e| anyhow::anyhow!("Failed to open {}: {}", path.display(), e))?;

    let mut reader = std::io::BufReader::with_capacity(128 * 1024, file);
    let mut hasher = blake3::Hasher::new();

    let mut buffer = [0u8; 128 * 1024];
    loop {
        let bytes_read = reader.read(&mut buffer)?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }

    Ok(hasher.finalize())
}

fn format_mismatch_error(path: &Path, detail: &str) -> String {
    format!("Verification failed for {}: {}", path.display(), detail)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_verify_matching_file() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("backup.tar.gz");
        std::fs::write(&path, b"archive").unwrap();

        let result = verify_download(&path, 7, None).await.unwrap();
        assert_eq!(result.bytes_verified, 7);
        assert_eq!(result.checksum, blake3::hash(b"archive").to_hex().to_string());

        let again = verify_download(&path, 7, Some(&result.checksum)).await.unwrap();
        assert_eq!(again, result);
    }

    #[tokio::test]
    async fn test_verify_size_mismatch() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("backup.tar.gz");
        std::fs::write(&path, b"short").unwrap();

        let err = verify_download(&path, 100, None).await.unwrap_err();
        assert!(err.to_string().contains("expected 100"));
    }

    #[tokio::test]
    async fn test_verify_checksum_mismatch() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("backup.tar.gz");
        std::fs::write(&path, b"data").unwrap();

        let err = verify_download(&path, 4, Some("00")).await.unwrap_err();
        assert!(err.to_string().contains("checksum"));
    }

    #[tokio::test]
    async fn test_verify_missing_file() {
        let temp = tempdir().unwrap();
        assert!(
            verify_download(&temp.path().join("nope"), 0, None)
                .await
                .is_err()
        );
    }
}
