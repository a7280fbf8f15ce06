// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Local Filesystem Blob Store
//!
//! Content-addressed object store for version bytes, kept next to the
//! source tree in `<source>/.eidetic/objects`.
//!
//! **Layout:** `objects/<first two hex chars>/<remaining 62 hex chars>`,
//! keyed by SHA-256 of the stored bytes (ciphertext for vaulted versions).
//!
//! **Crash safety:** objects are written to `objects/tmp/` first, synced,
//! then renamed into place. A crash leaves at most an orphaned temp file,
//! never a partial object under its final name.
//!
//! **Limitations:**
//! - No garbage collection (purge is an administrative operation)
//! - Objects are read whole; there are no ranged reads

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::domain::file::ContentRef;
use crate::domain::storage::{BlobStore, StorageError};

const TMP_DIR: &str = "tmp";

pub struct LocalBlobStore {
    /// Base directory for all objects (e.g., "/home/me/docs/.eidetic/objects")
    root: PathBuf,
}

impl LocalBlobStore {
    /// Create the store, creating and probing `root`.
    ///
    /// # Returns
    /// * `Result<Self, StorageError>` - store instance, or an error when the
    ///   directory cannot be created or is not writable
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let root = root.into();

        std::fs::create_dir_all(root.join(TMP_DIR)).map_err(|e| {
            StorageError::IoError(format!(
                "Failed to create object directory {}: {}",
                root.display(),
                e
            ))
        })?;

        let probe = root.join(TMP_DIR).join(".eidetic-storage-test");
        std::fs::write(&probe, b"test").map_err(|e| {
            StorageError::PermissionDenied(format!(
                "Object directory {} is not writable: {}",
                root.display(),
                e
            ))
        })?;
        std::fs::remove_file(&probe)
            .map_err(|e| StorageError::IoError(format!("Failed to cleanup test file: {}", e)))?;

        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// On-disk location of an object.
    pub fn object_path(&self, content: &ContentRef) -> Result<PathBuf, StorageError> {
        let key = content.0.as_str();
        if key.len() != 64 || !key.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(StorageError::InvalidPath(format!("malformed object key: {}", key)));
        }
        Ok(self.root.join(&key[..2]).join(&key[2..]))
    }

    fn key_for(bytes: &[u8]) -> ContentRef {
        ContentRef(hex::encode(Sha256::digest(bytes)))
    }

    /// Stage `bytes` in the temp directory and rename them to `dest`.
    /// The temp file is removed whenever any step fails.
    async fn write_object(&self, bytes: &[u8], dest: &Path) -> Result<(), StorageError> {
        let tmp = self.root.join(TMP_DIR).join(uuid::Uuid::new_v4().to_string());
        let Err(e) = Self::stage_and_rename(&tmp, bytes, dest).await else {
            return Ok(());
        };
        match tokio::fs::remove_file(&tmp).await {
            Ok(()) => {}
            Err(cleanup) if cleanup.kind() == std::io::ErrorKind::NotFound => {}
            Err(cleanup) => warn!(tmp = %tmp.display(), error = %cleanup, "Failed to remove temp object"),
        }
        Err(e.into())
    }

    async fn stage_and_rename(tmp: &Path, bytes: &[u8], dest: &Path) -> std::io::Result<()> {
        let mut file = tokio::fs::File::create(tmp).await?;
        file.write_all(bytes).await?;
        file.sync_all().await?;
        drop(file);
        tokio::fs::rename(tmp, dest).await
    }

    fn calculate_size(root: &Path) -> u64 {
        walkdir::WalkDir::new(root)
            .into_iter()
            .filter_map(Result::ok)
            .filter(|entry| entry.file_type().is_file())
            .filter_map(|entry| entry.metadata().ok())
            .map(|metadata| metadata.len())
            .sum()
    }
}

#[async_trait]
impl BlobStore for LocalBlobStore {
    async fn put(&self, bytes: &[u8]) -> Result<ContentRef, StorageError> {
        let content = Self::key_for(bytes);
        let path = self.object_path(&content)?;

        if tokio::fs::try_exists(&path).await? {
            debug!(object = %content, "Object already stored");
            return Ok(content);
        }

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        self.write_object(bytes, &path).await?;

        debug!(object = %content, size = bytes.len(), "Stored object");
        Ok(content)
    }

    async fn get(&self, content: &ContentRef) -> Result<Vec<u8>, StorageError> {
        let path = self.object_path(content)?;
        tokio::fs::read(&path).await.map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => StorageError::NotFound(content.0.clone()),
            _ => e.into(),
        })
    }

    async fn contains(&self, content: &ContentRef) -> Result<bool, StorageError> {
        let path = self.object_path(content)?;
        Ok(tokio::fs::try_exists(&path).await?)
    }

    async fn usage(&self) -> Result<u64, StorageError> {
        let root = self.root.clone();
        tokio::task::spawn_blocking(move || Self::calculate_size(&root))
            .await
            .map_err(|e| StorageError::IoError(format!("usage scan failed: {}", e)))
    }

    async fn health_check(&self) -> Result<(), StorageError> {
        let metadata = tokio::fs::metadata(&self.root).await.map_err(|e| {
            StorageError::Unavailable(format!("{}: {}", self.root.display(), e))
        })?;
        if !metadata.is_dir() {
            return Err(StorageError::Unavailable(format!(
                "{} is not a directory",
                self.root.display()
            )));
        }
        Ok(())
    }
}
