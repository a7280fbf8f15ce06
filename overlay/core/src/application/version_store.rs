// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Version Store
//!
//! Copy-on-write snapshot manager. Every write becomes a new immutable
//! `Version`: bytes go to the content-addressed blob store (encrypted first
//! when the path is vaulted), then the index appends the version and moves
//! the record pointer in one transaction.
//!
//! Reads verify the plaintext hash recorded at write time. A mismatch is a
//! `Corruption` error, a failed vault authentication an `Integrity` error;
//! both are logged and published, neither is repaired.
//!
//! The store does no locking of its own. `OverlayEngine` serialises the
//! mutations of one path.

use chrono::Utc;
use std::borrow::Cow;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::application::context::MountContext;
use crate::domain::events::OverlayEvent;
use crate::domain::file::{ContentHash, FileKind, FileRecord, Version, VersionId};
use crate::domain::index::IndexError;
use crate::domain::path_sanitizer::{is_within, parent_of};
use crate::domain::storage::StorageError;
use crate::infrastructure::vault_codec::{VaultCodec, VaultError};

#[derive(Debug, Error)]
pub enum VersionStoreError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Not a directory: {0}")]
    NotADirectory(String),

    #[error("Is a directory: {0}")]
    IsADirectory(String),

    #[error("Directory not empty: {0}")]
    DirectoryNotEmpty(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Invalid operation: {0}")]
    InvalidPath(String),

    #[error("Stored bytes of {path} {version} do not match their hash")]
    Corruption { path: String, version: VersionId },

    #[error("Vault authentication failed for {path} {version}")]
    Integrity { path: String, version: VersionId },

    #[error("Metadata index error: {0}")]
    Index(IndexError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Vault error: {0}")]
    Vault(VaultError),
}

impl From<IndexError> for VersionStoreError {
    fn from(err: IndexError) -> Self {
        match err {
            IndexError::NotFound(path) => VersionStoreError::NotFound(path),
            IndexError::AlreadyExists(path) => VersionStoreError::AlreadyExists(path),
            other => VersionStoreError::Index(other),
        }
    }
}

impl From<VaultError> for VersionStoreError {
    fn from(err: VaultError) -> Self {
        match err {
            VaultError::Locked => VersionStoreError::PermissionDenied("vault is locked".to_string()),
            VaultError::Integrity { path, version } => VersionStoreError::Integrity { path, version },
            other => VersionStoreError::Vault(other),
        }
    }
}

pub type Result<T> = std::result::Result<T, VersionStoreError>;

/// A committed write.
#[derive(Debug, Clone)]
pub struct CommitOutcome {
    pub record: FileRecord,
    pub version: Version,
}

#[derive(Debug, Clone)]
pub struct RenameOutcome {
    pub record: FileRecord,
    /// Set when the move crossed the vault boundary and the content was
    /// re-encoded as a new version with the same plaintext hash.
    pub re_encoded: Option<Version>,
}

/// Result of importing the pre-existing source tree.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ImportSummary {
    pub directories: usize,
    pub files: usize,
    pub skipped: usize,
    /// Versions committed by the import; analysis is queued for these.
    pub committed: Vec<(String, Version)>,
}

pub struct VersionStore {
    ctx: Arc<MountContext>,
}

impl VersionStore {
    pub fn new(ctx: Arc<MountContext>) -> Self {
        Self { ctx }
    }

    pub fn context(&self) -> &Arc<MountContext> {
        &self.ctx
    }

    pub fn is_vaulted(&self, path: &str) -> bool {
        self.ctx.vault_policy().contains(path)
    }

    /// Codec for a vaulted path, `None` for plain paths, `PermissionDenied`
    /// while the vault is locked.
    fn vault_for(&self, path: &str) -> Result<Option<&VaultCodec>> {
        if !self.is_vaulted(path) {
            return Ok(None);
        }
        match self.ctx.vault() {
            Some(codec) => Ok(Some(codec.as_ref())),
            None => Err(VersionStoreError::PermissionDenied(format!("{}: vault is locked", path))),
        }
    }

    fn mirrors(&self, path: &str) -> bool {
        self.ctx.spec().mirror_writes && !self.is_vaulted(path)
    }

    /// Live record at `path`.
    pub async fn record(&self, path: &str) -> Result<FileRecord> {
        match self.ctx.index().get_record(path).await? {
            Some(record) if record.is_live() => Ok(record),
            _ => Err(VersionStoreError::NotFound(path.to_string())),
        }
    }

    async fn parent_dir(&self, path: &str) -> Result<FileRecord> {
        let parent = parent_of(path);
        let record = self.record(parent).await?;
        if !record.is_dir() {
            return Err(VersionStoreError::NotADirectory(parent.to_string()));
        }
        Ok(record)
    }

    async fn ensure_vacant(&self, path: &str) -> Result<()> {
        if path == "/" {
            return Err(VersionStoreError::AlreadyExists(path.to_string()));
        }
        match self.ctx.index().get_record(path).await? {
            Some(existing) if existing.is_live() => Err(VersionStoreError::AlreadyExists(path.to_string())),
            _ => Ok(()),
        }
    }

    /// Create an empty regular file.
    pub async fn create_file(&self, path: &str) -> Result<FileRecord> {
        self.vault_for(path)?;
        self.parent_dir(path).await?;
        self.ensure_vacant(path).await?;

        let file_id = self.ctx.index().allocate_file_id().await?;
        let record = FileRecord::new_file(path, file_id, self.is_vaulted(path));
        self.ctx.index().upsert_record(&record).await?;

        if self.mirrors(path) {
            if let Err(e) = self.ctx.source().mirror_write(path, b"").await {
                warn!(path = %path, error = %e, "Failed to mirror created file");
            }
        }

        self.ctx.events().publish(OverlayEvent::FileCreated {
            path: path.to_string(),
            kind: FileKind::Regular,
            created_at: record.created_at,
        });
        debug!(path = %path, file_id = %file_id, "Created file");
        Ok(record)
    }

    pub async fn mkdir(&self, path: &str) -> Result<FileRecord> {
        self.vault_for(path)?;
        self.parent_dir(path).await?;
        self.ensure_vacant(path).await?;
        self.insert_directory(path, true).await
    }

    async fn insert_directory(&self, path: &str, mirror: bool) -> Result<FileRecord> {
        let file_id = self.ctx.index().allocate_file_id().await?;
        let record = FileRecord::new_directory(path, file_id, self.is_vaulted(path));
        self.ctx.index().upsert_record(&record).await?;

        if mirror && self.mirrors(path) {
            if let Err(e) = self.ctx.source().mirror_mkdir(path).await {
                warn!(path = %path, error = %e, "Failed to mirror directory");
            }
        }

        self.ctx.events().publish(OverlayEvent::FileCreated {
            path: path.to_string(),
            kind: FileKind::Directory,
            created_at: record.created_at,
        });
        Ok(record)
    }

    /// Commit `bytes` as the new current version of `path`.
    pub async fn write(&self, path: &str, bytes: &[u8]) -> Result<CommitOutcome> {
        self.commit(path, bytes, true).await
    }

    async fn commit(&self, path: &str, bytes: &[u8], mirror: bool) -> Result<CommitOutcome> {
        let record = self.record(path).await?;
        if record.is_dir() {
            return Err(VersionStoreError::IsADirectory(path.to_string()));
        }
        let codec = self.vault_for(path)?;

        let parent = record.current_version;
        let id = parent.map_or(VersionId::FIRST, VersionId::next);
        let (stored, vault): (Cow<'_, [u8]>, _) = match codec {
            Some(codec) => {
                let (ciphertext, entry) = codec.encrypt_for_store(path, record.file_id, id, bytes)?;
                (Cow::Owned(ciphertext), Some(entry))
            }
            None => (Cow::Borrowed(bytes), None),
        };

        let content = self.ctx.blobs().put(&stored).await?;
        let version = Version {
            file_id: record.file_id,
            id,
            parent,
            content,
            length: bytes.len() as u64,
            hash: ContentHash::of(bytes),
            stored_length: stored.len() as u64,
            vault,
            created_at: Utc::now(),
        };

        let record = self.ctx.index().append_version(path, &version).await?;
        metrics::counter!("eidetic_versions_committed_total", "vaulted" => if version.is_vaulted() { "true" } else { "false" })
            .increment(1);

        if mirror && self.mirrors(path) {
            if let Err(e) = self.ctx.source().mirror_write(path, bytes).await {
                warn!(path = %path, error = %e, "Failed to mirror committed version");
            }
        }

        self.ctx.events().publish(OverlayEvent::VersionCommitted {
            path: path.to_string(),
            file_id: record.file_id,
            version: version.id,
            length: version.length,
            committed_at: version.created_at,
        });
        debug!(path = %path, version = %version.id, length = version.length, "Committed version");

        Ok(CommitOutcome { record, version })
    }

    /// The version a read of `path` would see: the current one, or `version`
    /// when given. Historical reads also work on deleted paths.
    pub async fn resolve(&self, path: &str, version: Option<VersionId>) -> Result<(FileRecord, Option<Version>)> {
        let record = match version {
            None => self.record(path).await?,
            Some(_) => self
                .ctx
                .index()
                .get_record(path)
                .await?
                .ok_or_else(|| VersionStoreError::NotFound(path.to_string()))?,
        };
        if record.is_dir() {
            return Err(VersionStoreError::IsADirectory(path.to_string()));
        }

        let Some(id) = version.or(record.current_version) else {
            return Ok((record, None));
        };
        let found = self.ctx.index().get_version(record.file_id, id).await?;
        match found {
            Some(found) => Ok((record, Some(found))),
            None => Err(VersionStoreError::NotFound(format!("{}@{}", path, id))),
        }
    }

    /// Plaintext of `path`, current version unless `version` is given.
    pub async fn read(&self, path: &str, version: Option<VersionId>) -> Result<Vec<u8>> {
        match self.resolve(path, version).await? {
            (_, Some(found)) => self.load(path, &found).await,
            (_, None) => Ok(Vec::new()),
        }
    }

    /// Fetch, decrypt and verify one version.
    pub async fn load(&self, path: &str, version: &Version) -> Result<Vec<u8>> {
        let stored = match self.ctx.blobs().get(&version.content).await {
            Ok(stored) => stored,
            Err(StorageError::NotFound(_)) => {
                error!(path = %path, version = %version.id, object = %version.content, "Stored object is missing");
                return Err(self.corruption(path, version.id));
            }
            Err(e) => return Err(e.into()),
        };

        let plaintext = match &version.vault {
            Some(entry) => {
                let codec = self
                    .ctx
                    .vault()
                    .ok_or_else(|| VersionStoreError::PermissionDenied(format!("{}: vault is locked", path)))?;
                match codec.decrypt_for_read(path, version.file_id, version.id, &stored, entry) {
                    Ok(plaintext) => plaintext,
                    Err(e) => {
                        error!(path = %path, version = %version.id, error = %e, "Vault integrity failure");
                        self.ctx.events().publish(OverlayEvent::IntegrityFailure {
                            path: path.to_string(),
                            version: version.id,
                            detected_at: Utc::now(),
                        });
                        return Err(e.into());
                    }
                }
            }
            None => stored,
        };

        if ContentHash::of(&plaintext) != version.hash {
            error!(
                path = %path,
                version = %version.id,
                expected = %version.hash,
                "Content hash mismatch"
            );
            return Err(self.corruption(path, version.id));
        }
        Ok(plaintext)
    }

    fn corruption(&self, path: &str, version: VersionId) -> VersionStoreError {
        self.ctx.events().publish(OverlayEvent::CorruptionDetected {
            path: path.to_string(),
            version,
            detected_at: Utc::now(),
        });
        VersionStoreError::Corruption {
            path: path.to_string(),
            version,
        }
    }

    /// Every version of `path`, oldest first. Works for deleted paths too.
    pub async fn history(&self, path: &str) -> Result<Vec<Version>> {
        let record = self
            .ctx
            .index()
            .get_record(path)
            .await?
            .ok_or_else(|| VersionStoreError::NotFound(path.to_string()))?;
        Ok(self.ctx.index().list_versions(record.file_id).await?)
    }

    /// Tombstone `path`. Directories must be empty.
    pub async fn delete(&self, path: &str) -> Result<FileRecord> {
        if path == "/" {
            return Err(VersionStoreError::PermissionDenied("cannot remove the mount root".to_string()));
        }
        self.vault_for(path)?;
        let record = self.record(path).await?;
        if record.is_dir() && !self.ctx.index().list_children(path).await?.is_empty() {
            return Err(VersionStoreError::DirectoryNotEmpty(path.to_string()));
        }

        let record = self.ctx.index().tombstone_record(path).await?;

        if self.mirrors(path) {
            if let Err(e) = self.ctx.source().mirror_remove(path, record.is_dir()).await {
                warn!(path = %path, error = %e, "Failed to mirror delete");
            }
        }

        self.ctx.events().publish(OverlayEvent::FileDeleted {
            path: path.to_string(),
            file_id: record.file_id,
            deleted_at: Utc::now(),
        });
        debug!(path = %path, "Deleted");
        Ok(record)
    }

    /// Move `from` to `to`, keeping the file id and history. No bytes are
    /// copied unless the move crosses the vault boundary.
    pub async fn rename(&self, from: &str, to: &str) -> Result<RenameOutcome> {
        if from == "/" || to == "/" {
            return Err(VersionStoreError::PermissionDenied("cannot rename the mount root".to_string()));
        }
        let source = self.record(from).await?;
        if from == to {
            return Ok(RenameOutcome {
                record: source,
                re_encoded: None,
            });
        }
        if source.is_dir() && is_within(to, from) {
            return Err(VersionStoreError::InvalidPath(format!(
                "cannot move {} into itself",
                from
            )));
        }

        self.parent_dir(to).await?;
        if let Some(existing) = self.ctx.index().get_record(to).await?.filter(FileRecord::is_live) {
            match (source.is_dir(), existing.is_dir()) {
                (_, true) => return Err(VersionStoreError::AlreadyExists(to.to_string())),
                (true, false) => return Err(VersionStoreError::NotADirectory(to.to_string())),
                (false, false) => {}
            }
        }

        let from_vault = self.is_vaulted(from);
        let to_vault = self.is_vaulted(to);
        self.vault_for(from)?;
        let target_codec = self.vault_for(to)?;

        let mut plaintext_for_mirror = None;
        let re_encoded = if from_vault != to_vault {
            if source.is_dir() {
                return Err(VersionStoreError::PermissionDenied(format!(
                    "directories cannot cross the vault boundary: {} -> {}",
                    from, to
                )));
            }
            match source.current_version {
                Some(current) => {
                    let current = self
                        .ctx
                        .index()
                        .get_version(source.file_id, current)
                        .await?
                        .ok_or_else(|| VersionStoreError::NotFound(format!("{}@{}", from, current)))?;
                    let plaintext = self.load(from, &current).await?;
                    let version = self.re_encode(to, &current, &plaintext, target_codec).await?;
                    if !to_vault {
                        plaintext_for_mirror = Some(plaintext);
                    }
                    Some(version)
                }
                None => None,
            }
        } else {
            None
        };

        let record = self
            .ctx
            .index()
            .rename_record(from, to, to_vault, re_encoded.as_ref())
            .await?;

        if self.ctx.spec().mirror_writes {
            let mirrored = match (from_vault, to_vault) {
                (false, false) => self.ctx.source().mirror_rename(from, to).await,
                (false, true) => self.ctx.source().mirror_remove(from, source.is_dir()).await,
                (true, false) => {
                    let bytes = plaintext_for_mirror.as_deref().unwrap_or_default();
                    self.ctx.source().mirror_write(to, bytes).await
                }
                (true, true) => Ok(()),
            };
            if let Err(e) = mirrored {
                warn!(from = %from, to = %to, error = %e, "Failed to mirror rename");
            }
        }

        self.ctx.events().publish(OverlayEvent::FileRenamed {
            from: from.to_string(),
            to: to.to_string(),
            file_id: record.file_id,
            renamed_at: Utc::now(),
        });
        debug!(from = %from, to = %to, re_encoded = re_encoded.is_some(), "Renamed");

        Ok(RenameOutcome { record, re_encoded })
    }

    /// Store `plaintext` as the successor of `current` for the destination
    /// side of a vault crossing.
    async fn re_encode(
        &self,
        to: &str,
        current: &Version,
        plaintext: &[u8],
        codec: Option<&VaultCodec>,
    ) -> Result<Version> {
        let id = current.id.next();
        let (stored, vault): (Cow<'_, [u8]>, _) = match codec {
            Some(codec) => {
                let (ciphertext, entry) = codec.encrypt_for_store(to, current.file_id, id, plaintext)?;
                (Cow::Owned(ciphertext), Some(entry))
            }
            None => (Cow::Borrowed(plaintext), None),
        };
        let content = self.ctx.blobs().put(&stored).await?;
        Ok(Version {
            file_id: current.file_id,
            id,
            parent: Some(current.id),
            content,
            length: current.length,
            hash: current.hash,
            stored_length: stored.len() as u64,
            vault,
            created_at: Utc::now(),
        })
    }

    /// Index every file and directory of the source tree that has no record
    /// yet. Files under the vault are sealed: once their encrypted version is
    /// committed the plaintext copy is removed from the source tree.
    pub async fn import_source_tree(&self) -> Result<ImportSummary> {
        let source = self.ctx.source().clone();
        let entries = tokio::task::spawn_blocking(move || source.scan())
            .await
            .map_err(|e| VersionStoreError::Storage(StorageError::IoError(e.to_string())))??;

        let mut summary = ImportSummary::default();
        for entry in entries {
            let path = match self.ctx.sanitizer().normalize(&entry.path) {
                Ok(path) => path,
                Err(e) => {
                    warn!(path = %entry.path, error = %e, "Skipping unsupported source path");
                    summary.skipped += 1;
                    continue;
                }
            };
            // A file record without a version is what a crash between the
            // record insert and the first commit leaves behind.
            let resumed = match self.ctx.index().get_record(&path).await? {
                Some(record) if !entry.is_dir && !record.is_dir() && record.current_version.is_none() => true,
                Some(_) => continue,
                None => false,
            };
            if self.is_vaulted(&path) && self.ctx.vault().is_none() {
                warn!(path = %path, "Vault is locked, leaving source file unindexed");
                summary.skipped += 1;
                continue;
            }
            if self.record(parent_of(&path)).await.is_err() {
                summary.skipped += 1;
                continue;
            }

            if entry.is_dir {
                self.insert_directory(&path, false).await?;
                summary.directories += 1;
                continue;
            }

            let bytes = self.ctx.source().read(&path).await?;
            if resumed {
                // created and never written
                if bytes.is_empty() {
                    continue;
                }
                info!(path = %path, "Resuming interrupted import");
            } else {
                let file_id = self.ctx.index().allocate_file_id().await?;
                let record = FileRecord::new_file(path.as_str(), file_id, self.is_vaulted(&path));
                self.ctx.index().upsert_record(&record).await?;
            }
            let outcome = self.commit(&path, &bytes, false).await?;

            if self.is_vaulted(&path) {
                match self.ctx.source().mirror_remove(&path, false).await {
                    Ok(()) => info!(path = %path, "Sealed plaintext source file into the vault"),
                    Err(e) => warn!(path = %path, error = %e, "Failed to remove plaintext copy of vaulted file"),
                }
            }

            summary.files += 1;
            summary.committed.push((path, outcome.version));
        }

        info!(
            files = summary.files,
            directories = summary.directories,
            skipped = summary.skipped,
            "Imported source tree"
        );
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::license::LicenseStatus;
    use crate::domain::events::NullEventPublisher;
    use crate::domain::mount_config::MountSpec;
    use tempfile::TempDir;

    async fn store(dir: &TempDir, secret: Option<&[u8]>) -> VersionStore {
        let ctx = MountContext::open(
            MountSpec::for_source(dir.path()),
            secret,
            LicenseStatus::free("test"),
            Arc::new(NullEventPublisher),
        )
        .await
        .unwrap();
        VersionStore::new(Arc::new(ctx))
    }

    #[tokio::test]
    async fn test_write_read_and_history() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir, None).await;

        store.create_file("/notes.txt").await.unwrap();
        let v1 = store.write("/notes.txt", b"first").await.unwrap().version;
        let v2 = store.write("/notes.txt", b"second").await.unwrap().version;

        assert_eq!(v1.id, VersionId(1));
        assert_eq!(v2.id, VersionId(2));
        assert_eq!(v2.parent, Some(v1.id));
        assert_eq!(store.read("/notes.txt", None).await.unwrap(), b"second");
        assert_eq!(store.read("/notes.txt", Some(v1.id)).await.unwrap(), b"first");
        assert_eq!(store.history("/notes.txt").await.unwrap().len(), 2);

        // mirrored into the source tree
        assert_eq!(std::fs::read(dir.path().join("notes.txt")).unwrap(), b"second");
    }

    #[tokio::test]
    async fn test_vault_write_requires_secret() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir, None).await;

        assert!(matches!(
            store.mkdir("/vault").await,
            Err(VersionStoreError::PermissionDenied(_))
        ));
    }

    #[tokio::test]
    async fn test_vault_never_mirrors_plaintext() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir, Some(b"s3cret")).await;

        store.mkdir("/vault").await.unwrap();
        store.create_file("/vault/secret.txt").await.unwrap();
        let outcome = store.write("/vault/secret.txt", b"hunter2").await.unwrap();

        assert!(outcome.version.is_vaulted());
        assert!(!dir.path().join("vault/secret.txt").exists());
        let raw = store.context().blobs().get(&outcome.version.content).await.unwrap();
        assert!(!raw.windows(7).any(|w| w == b"hunter2"));
        assert_eq!(store.read("/vault/secret.txt", None).await.unwrap(), b"hunter2");
    }

    #[tokio::test]
    async fn test_rename_into_vault_re_encodes() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir, Some(b"s3cret")).await;

        store.mkdir("/vault").await.unwrap();
        store.create_file("/plain.txt").await.unwrap();
        let v1 = store.write("/plain.txt", b"move me").await.unwrap().version;

        let outcome = store.rename("/plain.txt", "/vault/plain.txt").await.unwrap();
        let re_encoded = outcome.re_encoded.unwrap();
        assert_eq!(re_encoded.hash, v1.hash);
        assert!(re_encoded.is_vaulted());
        assert!(!dir.path().join("plain.txt").exists());
        assert_eq!(store.read("/vault/plain.txt", None).await.unwrap(), b"move me");
        assert!(matches!(
            store.read("/plain.txt", None).await,
            Err(VersionStoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_delete_keeps_history() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir, None).await;

        store.create_file("/gone.txt").await.unwrap();
        let v1 = store.write("/gone.txt", b"bye").await.unwrap().version;
        store.delete("/gone.txt").await.unwrap();

        assert!(matches!(store.read("/gone.txt", None).await, Err(VersionStoreError::NotFound(_))));
        assert_eq!(store.read("/gone.txt", Some(v1.id)).await.unwrap(), b"bye");
        assert!(!dir.path().join("gone.txt").exists());
    }

    #[tokio::test]
    async fn test_rmdir_requires_empty_directory() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir, None).await;

        store.mkdir("/docs").await.unwrap();
        store.create_file("/docs/a.md").await.unwrap();
        assert!(matches!(
            store.delete("/docs").await,
            Err(VersionStoreError::DirectoryNotEmpty(_))
        ));
        assert!(matches!(
            store.rename("/docs", "/docs/inner").await,
            Err(VersionStoreError::InvalidPath(_))
        ));
    }

    #[tokio::test]
    async fn test_import_source_tree() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("src")).unwrap();
        std::fs::write(dir.path().join("src/lib.rs"), b"// TODO: docs").unwrap();
        std::fs::create_dir_all(dir.path().join("vault")).unwrap();
        std::fs::write(dir.path().join("vault/key.pem"), b"PRIVATE").unwrap();

        let store = store(&dir, Some(b"s3cret")).await;
        let summary = store.import_source_tree().await.unwrap();

        assert_eq!(summary.files, 2);
        assert_eq!(summary.directories, 2);
        assert_eq!(store.read("/src/lib.rs", None).await.unwrap(), b"// TODO: docs");
        assert_eq!(store.read("/vault/key.pem", None).await.unwrap(), b"PRIVATE");
        assert!(!dir.path().join("vault/key.pem").exists());

        // second pass finds nothing new
        assert_eq!(store.import_source_tree().await.unwrap().files, 0);
    }

    #[tokio::test]
    async fn test_import_resumes_record_without_version() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("draft.txt"), b"half imported").unwrap();
        let store = store(&dir, None).await;

        // record inserted, first version never committed
        let file_id = store.ctx.index().allocate_file_id().await.unwrap();
        let record = FileRecord::new_file("/draft.txt", file_id, false);
        store.ctx.index().upsert_record(&record).await.unwrap();
        store.create_file("/empty.txt").await.unwrap();

        let summary = store.import_source_tree().await.unwrap();
        assert_eq!(summary.files, 1);
        assert_eq!(store.read("/draft.txt", None).await.unwrap(), b"half imported");
        assert_eq!(store.record("/draft.txt").await.unwrap().file_id, file_id);
        assert_eq!(store.history("/draft.txt").await.unwrap().len(), 1);

        // an empty file that was never written stays versionless
        assert!(store.history("/empty.txt").await.unwrap().is_empty());
    }
}
