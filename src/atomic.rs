//! Write-to-temp-then-rename for uploads and saved documents.

use std::io;
use std::path::{Path, PathBuf};
use tokio::fs::{self, File};
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

use crate::storage::StorageError;

const TEMP_MARKER: &str = ".tmp.";

/// Whether `name` is an in-flight temp file created by [`AtomicFile`].
pub fn is_temp_name(name: &str) -> bool {
    name.starts_with('.') && name.contains(TEMP_MARKER)
}

/// A sibling temp file that replaces its target only on [`AtomicFile::finalize`].
pub struct AtomicFile {
    target: PathBuf,
    temp_path: PathBuf,
    file: File,
}

impl AtomicFile {
    pub async fn new(target: &Path) -> Result<Self, StorageError> {
        let parent = target.parent().ok_or(StorageError::InvalidPath)?;
        let base = target
            .file_name()
            .map(|name| name.to_string_lossy())
            .ok_or(StorageError::InvalidPath)?;
        let temp_path = parent.join(format!(".{base}{TEMP_MARKER}{}", Uuid::new_v4()));
        let file = File::create(&temp_path).await?;
        Ok(Self {
            target: target.to_path_buf(),
            temp_path,
            file,
        })
    }

    pub async fn write_all(&mut self, bytes: &[u8]) -> Result<(), StorageError> {
        self.file.write_all(bytes).await?;
        Ok(())
    }

    /// Drops the temp file, leaving the target untouched.
    pub async fn cleanup(self) {
        drop(self.file);
        let _ = fs::remove_file(&self.temp_path).await;
    }

    pub async fn finalize(self) -> Result<(), StorageError> {
        self.file.sync_all().await?;
        drop(self.file);

        if let Err(err) = fs::rename(&self.temp_path, &self.target).await {
            #[cfg(windows)]
            {
                if fs::remove_file(&self.target).await.is_ok()
                    && fs::rename(&self.temp_path, &self.target).await.is_ok()
                {
                    return sync_parent(&self.target).await;
                }
            }
            let _ = fs::remove_file(&self.temp_path).await;
            return Err(StorageError::Io(err));
        }

        sync_parent(&self.target).await
    }
}

async fn sync_parent(target: &Path) -> Result<(), StorageError> {
    let Some(parent) = target.parent() else {
        return Ok(());
    };
    let parent = parent.to_path_buf();
    let synced = tokio::task::spawn_blocking(move || -> io::Result<()> {
        std::fs::File::open(parent)?.sync_all()
    })
    .await
    .map_err(|err| io::Error::other(err.to_string()))?;
    // Directory fsync is unsupported on some platforms; the rename already happened.
    if let Err(err) = synced {
        tracing::debug!(error = %err, "directory sync skipped");
    }
    Ok(())
}
