use std::path::{Path, PathBuf};

use async_compression::tokio::write::GzipEncoder;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;

use crate::prelude::*;

/// Suffix of the plain-text log files produced by each run.
pub const LOG_SUFFIX: &str = ".log";
/// Suffix appended to a log file once archived.
pub const GZ_SUFFIX: &str = ".gz";

/// Archives every plain log in `dir` that has no compressed
/// counterpart yet, removing the original once the archive is fully
/// on disk.
///
/// Runs once at startup, before the current run's log file exists. An
/// unreadable directory skips the whole pass; a single file failing to
/// compress is left in place and the remaining files are still
/// processed. Never fatal.
pub async fn compress_old_logs(dir: &Path) {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(err) => {
            warn!(
                "Skipping log compression, cannot read {}: {}",
                dir.display(),
                err
            );
            return;
        }
    };

    loop {
        let entry = match entries.next_entry().await {
            Ok(Some(entry)) => entry,
            Ok(None) => break,
            Err(err) => {
                warn!(
                    "Skipping log compression, cannot read {}: {}",
                    dir.display(),
                    err
                );
                return;
            }
        };

        let path = entry.path();
        let is_file = entry
            .file_type()
            .await
            .map(|file_type| file_type.is_file())
            .unwrap_or(false);
        if !is_file || !path.to_string_lossy().ends_with(LOG_SUFFIX) {
            continue;
        }

        let archive_path = archive_path_for(&path);
        if tokio::fs::try_exists(&archive_path).await.unwrap_or(false) {
            continue;
        }

        match compress_file(&path, &archive_path).await {
            Ok(()) => {
                if let Err(err) = tokio::fs::remove_file(&path).await {
                    warn!(
                        "Archived {} but failed to remove the original: {}",
                        path.display(),
                        err
                    );
                } else {
                    debug!("Archived {}", archive_path.display());
                }
            }
            Err(err) => {
                error!("Failed to compress {}: {}", path.display(), err);
                // Drop the partial archive so the next startup retries.
                let _ = tokio::fs::remove_file(&archive_path).await;
            }
        }
    }
}

fn archive_path_for(path: &Path) -> PathBuf {
    let mut archive = path.to_path_buf().into_os_string();
    archive.push(GZ_SUFFIX);
    PathBuf::from(archive)
}

async fn compress_file(src: &Path, dst: &Path) -> Result<()> {
    let mut src_file = File::open(src)
        .await
        .with_context(|| format!("Failed to open {}", src.display()))?;
    let dst_file = File::create(dst)
        .await
        .with_context(|| format!("Failed to create {}", dst.display()))?;

    let mut gzip_encoder = GzipEncoder::new(dst_file);
    tokio::io::copy(&mut src_file, &mut gzip_encoder)
        .await
        .with_context(|| format!("Failed to compress {}", src.display()))?;
    gzip_encoder.shutdown().await?;
    gzip_encoder.into_inner().sync_all().await?;

    Ok(())
}
