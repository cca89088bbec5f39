use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::core::bridge::remote_join;
use crate::core::error::OrchestratorError;
use crate::core::models::FileTransfer;

/// Expand a local file or directory into the explicit push list.
///
/// A plain file lands at `remote_root/<file name>`. A directory has its
/// contents copied under `remote_root`, keeping their relative layout.
/// Entries are sorted, a directory's own files come before its
/// subdirectories, and symlinks are skipped.
pub async fn plan_upload(
    local_root: &Path,
    remote_root: &str,
) -> Result<Vec<FileTransfer>, OrchestratorError> {
    let local_root = local_root.to_path_buf();
    let remote_root = remote_root.to_string();

    tokio::task::spawn_blocking(move || {
        let metadata = fs::symlink_metadata(&local_root).map_err(|e| {
            OrchestratorError::invalid(format!("cannot read {}: {}", local_root.display(), e))
        })?;

        if metadata.is_file() {
            let name = local_root
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .ok_or_else(|| {
                    OrchestratorError::invalid(format!("{} has no file name", local_root.display()))
                })?;
            return Ok(vec![FileTransfer {
                remote_path: remote_join(&remote_root, &name),
                local_path: local_root,
            }]);
        }

        if !metadata.is_dir() {
            return Err(OrchestratorError::invalid(format!(
                "{} is neither a file nor a directory",
                local_root.display()
            )));
        }

        let mut files = Vec::new();
        scan_directory_recursive(&local_root, &local_root, &remote_root, &mut files)?;
        debug!(root = %local_root.display(), files = files.len(), "Planned upload");
        Ok(files)
    })
    .await
    .map_err(|e| OrchestratorError::internal(format!("planning task failed: {}", e)))?
}

/// Map device paths to files of the same name under `local_root`.
pub fn plan_download(remote_paths: &[String], local_root: &Path) -> Vec<FileTransfer> {
    remote_paths
        .iter()
        .map(|remote| {
            let name = remote.trim_end_matches('/').rsplit('/').next().unwrap_or(remote);
            FileTransfer {
                local_path: local_root.join(name),
                remote_path: remote.clone(),
            }
        })
        .collect()
}

fn scan_directory_recursive(
    base: &Path,
    current: &Path,
    remote_root: &str,
    files: &mut Vec<FileTransfer>,
) -> Result<(), OrchestratorError> {
    let entries = fs::read_dir(current).map_err(|e| OrchestratorError::Io {
        message: format!("failed to read directory {}: {}", current.display(), e),
    })?;

    let mut paths: Vec<PathBuf> = entries
        .filter_map(|entry| match entry {
            Ok(entry) => Some(entry.path()),
            Err(e) => {
                warn!(dir = %current.display(), error = %e, "Skipping unreadable entry");
                None
            }
        })
        .collect();
    paths.sort();

    let mut subdirs = Vec::new();
    for path in paths {
        // symlink_metadata so links are not followed
        let metadata = match path.symlink_metadata() {
            Ok(m) => m,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Skipping unreadable entry");
                continue;
            }
        };

        if metadata.is_dir() {
            subdirs.push(path);
        } else if metadata.is_file() {
            let relative = path
                .strip_prefix(base)
                .map_err(|e| OrchestratorError::internal(e.to_string()))?;
            let relative = relative
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            files.push(FileTransfer {
                remote_path: remote_join(remote_root, &relative),
                local_path: path,
            });
        }
    }

    for dir in subdirs {
        scan_directory_recursive(base, &dir, remote_root, files)?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_plan_single_file() {
        let temp = tempdir().unwrap();
        let file = temp.path().join("alps.map");
        std::fs::write(&file, b"map").unwrap();

        let plan = plan_upload(&file, "/sdcard/maps").await.unwrap();
        assert_eq!(plan.len(), 1);
        assert_eq!(plan[0].remote_path, "/sdcard/maps/alps.map");
        assert_eq!(plan[0].local_path, file);
    }

    #[tokio::test]
    async fn test_plan_directory_orders_files_before_subdirs() {
        let temp = tempdir().unwrap();
        std::fs::create_dir_all(temp.path().join("a_tiles")).unwrap();
        std::fs::write(temp.path().join("a_tiles/1.map"), b"1").unwrap();
        std::fs::write(temp.path().join("z.map"), b"z").unwrap();
        std::fs::write(temp.path().join("b.map"), b"b").unwrap();

        let plan = plan_upload(temp.path(), "/sdcard/maps/").await.unwrap();
        let remotes: Vec<_> = plan.iter().map(|f| f.remote_path.as_str()).collect();
        assert_eq!(
            remotes,
            vec![
                "/sdcard/maps/b.map",
                "/sdcard/maps/z.map",
                "/sdcard/maps/a_tiles/1.map"
            ]
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_plan_skips_symlinks() {
        let temp = tempdir().unwrap();
        std::fs::write(temp.path().join("real.map"), b"r").unwrap();
        std::os::unix::fs::symlink(temp.path().join("real.map"), temp.path().join("link.map"))
            .unwrap();

        let plan = plan_upload(temp.path(), "/sdcard/maps").await.unwrap();
        assert_eq!(plan.len(), 1);
        assert_eq!(plan[0].remote_path, "/sdcard/maps/real.map");
    }

    #[tokio::test]
    async fn test_plan_missing_source_is_invalid() {
        let temp = tempdir().unwrap();
        let err = plan_upload(&temp.path().join("nope"), "/sdcard/maps")
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "invalid_request");
    }

    #[test]
    fn test_plan_download_uses_remote_names() {
        let plan = plan_download(
            &["/sdcard/maps/a.map".to_string(), "/sdcard/b.map".to_string()],
            Path::new("/tmp/out"),
        );
        assert_eq!(plan[0].local_path, PathBuf::from("/tmp/out/a.map"));
        assert_eq!(plan[1].remote_path, "/sdcard/b.map");
    }
}
