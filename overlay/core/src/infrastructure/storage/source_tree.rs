// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Source tree access: discovery of pre-existing files and the optional
//! write-through mirror that keeps the source a usable plain directory.
//!
//! The index stays the source of truth. Mirror operations are best effort
//! and callers log their failures instead of failing the filesystem call.

use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::domain::path_sanitizer::STORE_DIR_NAME;
use crate::domain::storage::StorageError;

/// A file or directory found in the source tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceEntry {
    /// Mount path (`/a/b.txt`).
    pub path: String,
    pub is_dir: bool,
}

#[derive(Debug, Clone)]
pub struct SourceTree {
    root: PathBuf,
}

impl SourceTree {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Host location backing a mount path.
    pub fn host_path(&self, mount_path: &str) -> PathBuf {
        let relative = mount_path.trim_start_matches('/');
        if relative.is_empty() {
            self.root.clone()
        } else {
            self.root.join(relative)
        }
    }

    /// Walk the source tree, parents before children, skipping the store
    /// directory and symlinks.
    pub fn scan(&self) -> Result<Vec<SourceEntry>, StorageError> {
        let mut entries = Vec::new();
        let walker = WalkDir::new(&self.root)
            .min_depth(1)
            .follow_links(false)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|entry| !(entry.depth() == 1 && entry.file_name() == STORE_DIR_NAME));

        for entry in walker {
            let entry = entry.map_err(|e| StorageError::IoError(e.to_string()))?;
            let file_type = entry.file_type();
            if file_type.is_symlink() {
                debug!(path = %entry.path().display(), "Skipping symlink in source tree");
                continue;
            }
            let Ok(relative) = entry.path().strip_prefix(&self.root) else {
                continue;
            };
            let Some(relative) = relative.to_str() else {
                warn!(path = %entry.path().display(), "Skipping non UTF-8 path in source tree");
                continue;
            };
            entries.push(SourceEntry {
                path: format!("/{}", relative.replace(std::path::MAIN_SEPARATOR, "/")),
                is_dir: file_type.is_dir(),
            });
        }
        Ok(entries)
    }

    pub async fn read(&self, mount_path: &str) -> Result<Vec<u8>, StorageError> {
        Ok(tokio::fs::read(self.host_path(mount_path)).await?)
    }

    /// Replace the mirrored file with `bytes` via temp file + rename.
    pub async fn mirror_write(&self, mount_path: &str, bytes: &[u8]) -> Result<(), StorageError> {
        let target = self.host_path(mount_path);
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let file_name = target
            .file_name()
            .and_then(|name| name.to_str())
            .ok_or_else(|| StorageError::InvalidPath(mount_path.to_string()))?;
        let tmp = target.with_file_name(format!(".{}.eidetic-tmp", file_name));
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, &target).await?;
        Ok(())
    }

    pub async fn mirror_mkdir(&self, mount_path: &str) -> Result<(), StorageError> {
        Ok(tokio::fs::create_dir_all(self.host_path(mount_path)).await?)
    }

    pub async fn mirror_remove(&self, mount_path: &str, is_dir: bool) -> Result<(), StorageError> {
        let target = self.host_path(mount_path);
        let result = if is_dir {
            tokio::fs::remove_dir_all(&target).await
        } else {
            tokio::fs::remove_file(&target).await
        };
        match result {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn mirror_rename(&self, from: &str, to: &str) -> Result<(), StorageError> {
        let source = self.host_path(from);
        if !tokio::fs::try_exists(&source).await? {
            return Ok(());
        }
        let target = self.host_path(to);
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        Ok(tokio::fs::rename(&source, &target).await?)
    }
}
