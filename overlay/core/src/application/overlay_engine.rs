// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Overlay Engine
//!
//! The only component the filesystem transport talks to. Each inbound call
//! is normalised, checked against the synthetic view namespace and then
//! translated into version store, view resolver and analysis pipeline calls.
//!
//! # Per-file state
//!
//! ```text
//! Clean ──write──▶ Writing ──commit──▶ Committed ──jobs queued──▶ Clean
//! ```
//!
//! The per-path lock is held only across `Writing → Committed`. Readers
//! never take it: they see the last committed version until the index
//! moves the pointer.
//!
//! # Write coalescing
//!
//! NFS clients send a file as many offset WRITE calls. Those land in an
//! in-memory draft for the path and are committed as one version once the
//! file has been idle for `write_settle`. `getattr` and `read` of the path
//! see the draft; history, analysis and views see only committed versions.
//! Any other mutation of the path, and shutdown, commits the draft first.
//!
//! # Shutdown
//!
//! Every call holds a permit of the in-flight gate. `shutdown` refuses new
//! calls, waits for all permits, stops the analysis workers and flushes the
//! index.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{Mutex, OwnedMutexGuard, OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::application::analysis_pipeline::{AnalysisPipeline, FileMover, PipelineError};
use crate::application::context::MountContext;
use crate::application::version_store::{CommitOutcome, VersionStore, VersionStoreError};
use crate::application::view_resolver::{is_reserved_view_path, DirEntry, ViewAttr, ViewError, ViewResolver};
use crate::domain::analysis::AnalyzerSet;
use crate::domain::events::OverlayEvent;
use crate::domain::file::{FileId, TagSet, TodoItem, Version, VersionId};
use crate::domain::index::IndexError;
use crate::domain::path_sanitizer::{file_name, join, parent_of, PathSanitizerError};
use crate::domain::storage::StorageError;
use crate::domain::views::{FormatConverter, LinkFetcher};

/// Upper bound on concurrently executing filesystem calls.
const MAX_IN_FLIGHT: u32 = 1024;

#[derive(Debug, Error)]
pub enum OverlayError {
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

    #[error("Invalid path: {0}")]
    InvalidPath(String),

    #[error("Corruption detected: {0}")]
    Corruption(String),

    #[error("Vault integrity failure: {0}")]
    IntegrityFailure(String),

    #[error("Unavailable: {0}")]
    Unavailable(String),

    #[error("Metadata transaction failed: {0}")]
    StoreTransactionFailure(String),

    #[error("Mount is shutting down")]
    ShuttingDown,

    #[error("I/O error: {0}")]
    Io(String),
}

impl From<VersionStoreError> for OverlayError {
    fn from(err: VersionStoreError) -> Self {
        match err {
            VersionStoreError::NotFound(p) => OverlayError::NotFound(p),
            VersionStoreError::AlreadyExists(p) => OverlayError::AlreadyExists(p),
            VersionStoreError::NotADirectory(p) => OverlayError::NotADirectory(p),
            VersionStoreError::IsADirectory(p) => OverlayError::IsADirectory(p),
            VersionStoreError::DirectoryNotEmpty(p) => OverlayError::DirectoryNotEmpty(p),
            VersionStoreError::PermissionDenied(p) => OverlayError::PermissionDenied(p),
            VersionStoreError::InvalidPath(p) => OverlayError::InvalidPath(p),
            e @ VersionStoreError::Corruption { .. } => OverlayError::Corruption(e.to_string()),
            e @ VersionStoreError::Integrity { .. } => OverlayError::IntegrityFailure(e.to_string()),
            VersionStoreError::Index(e) => OverlayError::StoreTransactionFailure(e.to_string()),
            VersionStoreError::Storage(StorageError::PermissionDenied(p)) => OverlayError::PermissionDenied(p),
            VersionStoreError::Storage(e) => OverlayError::Io(e.to_string()),
            VersionStoreError::Vault(e) => OverlayError::Io(e.to_string()),
        }
    }
}

impl From<ViewError> for OverlayError {
    fn from(err: ViewError) -> Self {
        match err {
            ViewError::NotFound(p) => OverlayError::NotFound(p),
            ViewError::NotADirectory(p) => OverlayError::NotADirectory(p),
            ViewError::IsADirectory(p) => OverlayError::IsADirectory(p),
            e @ ViewError::Unavailable { .. } => OverlayError::Unavailable(e.to_string()),
            ViewError::Store(e) => e.into(),
            ViewError::Index(e) => OverlayError::StoreTransactionFailure(e.to_string()),
        }
    }
}

impl From<IndexError> for OverlayError {
    fn from(err: IndexError) -> Self {
        VersionStoreError::from(err).into()
    }
}

pub type Result<T> = std::result::Result<T, OverlayError>;

/// Write-path state of one logical file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileState {
    Clean,
    Writing,
    Committed(VersionId),
}

/// Result of a WRITE call.
#[derive(Debug, Clone)]
pub struct WriteOutcome {
    /// Set when the write was committed right away; `None` while it sits in
    /// the draft.
    pub version: Option<VersionId>,
    /// Length of the file after the write.
    pub length: u64,
}

/// Uncommitted content of a file receiving offset writes.
struct Draft {
    content: Vec<u8>,
    touched: Instant,
    modified_at: DateTime<Utc>,
}

pub struct OverlayEngine {
    ctx: Arc<MountContext>,
    store: Arc<VersionStore>,
    views: ViewResolver,
    pipeline: AnalysisPipeline,
    locks: DashMap<String, Arc<Mutex<()>>>,
    states: DashMap<String, FileState>,
    drafts: DashMap<String, Draft>,
    gate: Arc<Semaphore>,
    shutting_down: AtomicBool,
}

/// Per-path lock guard that drops its map entry once nobody else wants it.
struct PathLock<'a> {
    engine: &'a OverlayEngine,
    path: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for PathLock<'_> {
    fn drop(&mut self) {
        self.guard.take();
        self.engine.locks.remove_if(&self.path, |_, lock| Arc::strong_count(lock) == 1);
    }
}

impl OverlayEngine {
    /// Build the engine over an opened context, import the source tree and
    /// recover unfinished analysis jobs.
    pub async fn start(
        ctx: Arc<MountContext>,
        analyzers: AnalyzerSet,
        fetcher: Arc<dyn LinkFetcher>,
        converter: Arc<dyn FormatConverter>,
    ) -> anyhow::Result<Arc<Self>> {
        let store = Arc::new(VersionStore::new(ctx.clone()));

        let engine = Arc::new_cyclic(|weak: &Weak<OverlayEngine>| {
            let mover: Weak<dyn FileMover> = weak.clone();
            let pipeline = AnalysisPipeline::start(ctx.clone(), store.clone(), analyzers, Some(mover));
            let views = ViewResolver::new(ctx.clone(), store.clone(), fetcher, converter);
            OverlayEngine {
                ctx: ctx.clone(),
                store: store.clone(),
                views,
                pipeline,
                locks: DashMap::new(),
                states: DashMap::new(),
                drafts: DashMap::new(),
                gate: Arc::new(Semaphore::new(MAX_IN_FLIGHT as usize)),
                shutting_down: AtomicBool::new(false),
            }
        });

        let imported = store.import_source_tree().await?;
        for (path, version) in &imported.committed {
            engine.pipeline.submit_version(path, version).await;
        }
        engine.pipeline.recover().await?;

        let settle = ctx.spec().write_settle;
        if !settle.is_zero() {
            tokio::spawn(commit_idle_drafts(Arc::downgrade(&engine), settle));
        }

        info!(
            source = %ctx.source().root().display(),
            imported = imported.files,
            "Overlay engine started"
        );
        Ok(engine)
    }

    pub fn context(&self) -> &Arc<MountContext> {
        &self.ctx
    }

    // ========================================================================
    // Call plumbing
    // ========================================================================

    async fn enter(&self) -> Result<OwnedSemaphorePermit> {
        if self.shutting_down.load(Ordering::Acquire) {
            return Err(OverlayError::ShuttingDown);
        }
        self.gate
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| OverlayError::ShuttingDown)
    }

    /// Canonical form of a path that is only read.
    fn read_path(&self, path: &str) -> Result<String> {
        self.ctx.sanitizer().normalize(path).map_err(|e| match e {
            PathSanitizerError::Reserved(p) => OverlayError::NotFound(p),
            other => OverlayError::InvalidPath(other.to_string()),
        })
    }

    /// Canonical form of a path that is about to be mutated.
    fn write_path(&self, path: &str) -> Result<String> {
        let path = self.ctx.sanitizer().normalize(path).map_err(|e| match e {
            PathSanitizerError::Reserved(p) => OverlayError::PermissionDenied(p),
            other => OverlayError::InvalidPath(other.to_string()),
        })?;
        if is_reserved_view_path(&path) {
            return Err(OverlayError::PermissionDenied(format!("{} is a read-only view", path)));
        }
        if let Err(e) = self.ctx.sanitizer().validate_name(file_name(&path)) {
            if path != "/" {
                return Err(OverlayError::InvalidPath(e.to_string()));
            }
        }
        Ok(path)
    }

    async fn lock(&self, path: &str) -> PathLock<'_> {
        let lock = self
            .locks
            .entry(path.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let guard = lock.lock_owned().await;
        PathLock {
            engine: self,
            path: path.to_string(),
            guard: Some(guard),
        }
    }

    /// Both locks of a rename, in a global order.
    async fn lock_pair(&self, a: &str, b: &str) -> (PathLock<'_>, Option<PathLock<'_>>) {
        if a == b {
            return (self.lock(a).await, None);
        }
        let (first, second) = if a < b { (a, b) } else { (b, a) };
        let first = self.lock(first).await;
        let second = self.lock(second).await;
        (first, Some(second))
    }

    /// Commit `bytes` and queue analysis. Caller holds the path lock.
    async fn commit_locked(&self, path: &str, bytes: &[u8]) -> Result<CommitOutcome> {
        self.states.insert(path.to_string(), FileState::Writing);
        let outcome = match self.store.write(path, bytes).await {
            Ok(outcome) => outcome,
            Err(e) => {
                self.states.remove(path);
                return Err(e.into());
            }
        };
        self.states.insert(path.to_string(), FileState::Committed(outcome.version.id));

        // never fails the write; drops are logged by the pipeline
        let report = self.pipeline.submit_version(path, &outcome.version).await;
        if report.dropped > 0 {
            debug!(path = %path, dropped = report.dropped, "Analysis jobs dropped under backpressure");
        }

        self.states.remove(path);
        Ok(outcome)
    }

    /// Commit the draft of `path`, if any. Caller holds the path lock.
    async fn flush_locked(&self, path: &str) -> Result<Option<CommitOutcome>> {
        let Some((_, draft)) = self.drafts.remove(path) else {
            return Ok(None);
        };
        match self.commit_locked(path, &draft.content).await {
            Ok(outcome) => Ok(Some(outcome)),
            Err(e) => {
                error!(path = %path, error = %e, bytes = draft.content.len(), "Failed to commit buffered writes");
                Err(e)
            }
        }
    }

    async fn flush_path(&self, path: &str) -> Result<()> {
        if !self.drafts.contains_key(path) {
            return Ok(());
        }
        let _lock = self.lock(path).await;
        self.flush_locked(path).await?;
        Ok(())
    }

    /// Commit drafts of `path` and everything below it.
    async fn flush_tree(&self, path: &str) -> Result<()> {
        let prefix = if path == "/" { "/".to_string() } else { format!("{}/", path) };
        let pending: Vec<String> = self
            .drafts
            .iter()
            .map(|draft| draft.key().clone())
            .filter(|draft| draft == path || draft.starts_with(&prefix))
            .collect();
        for draft in pending {
            self.flush_path(&draft).await?;
        }
        Ok(())
    }

    // ========================================================================
    // Filesystem operations
    // ========================================================================

    /// Attributes of `name` inside the directory `parent`.
    pub async fn lookup(&self, parent: &str, name: &str) -> Result<ViewAttr> {
        self.ctx
            .sanitizer()
            .validate_name(name)
            .map_err(|e| OverlayError::InvalidPath(e.to_string()))?;
        let parent = self.read_path(parent)?;
        self.getattr(&join(&parent, name)).await
    }

    pub async fn getattr(&self, path: &str) -> Result<ViewAttr> {
        let _permit = self.enter().await?;
        let path = self.read_path(path)?;
        let mut attr = self.views.attr(&path).await?;
        if let Some(draft) = self.drafts.get(&path) {
            attr.size = draft.content.len() as u64;
            attr.modified_at = draft.modified_at;
        }
        Ok(attr)
    }

    /// Up to `length` bytes from `offset`, plus whether the end was reached.
    pub async fn read(&self, path: &str, offset: u64, length: u32) -> Result<(Vec<u8>, bool)> {
        let _permit = self.enter().await?;
        let path = self.read_path(path)?;
        let drafted = self.drafts.get(&path).map(|draft| draft.content.clone());
        let bytes = match drafted {
            Some(content) => Arc::new(content),
            None => self.views.read(&path).await?,
        };

        let start = usize::try_from(offset).unwrap_or(usize::MAX).min(bytes.len());
        let end = start.saturating_add(length as usize).min(bytes.len());
        Ok((bytes[start..end].to_vec(), end >= bytes.len()))
    }

    /// Whole current content of `path`.
    pub async fn read_all(&self, path: &str) -> Result<Vec<u8>> {
        let _permit = self.enter().await?;
        let path = self.read_path(path)?;
        if let Some(draft) = self.drafts.get(&path) {
            return Ok(draft.content.clone());
        }
        Ok(self.views.read(&path).await?.to_vec())
    }

    /// Splice `data` into the content at `offset`. Gaps past the end are
    /// zero-filled. The result is buffered until the file settles, or
    /// committed right away when `write_settle` is zero.
    pub async fn write(&self, path: &str, offset: u64, data: &[u8]) -> Result<WriteOutcome> {
        let _permit = self.enter().await?;
        let path = self.write_path(path)?;
        let _lock = self.lock(&path).await;

        let mut content = match self.drafts.remove(&path) {
            Some((_, draft)) => draft.content,
            None => self.store.read(&path, None).await?,
        };
        let offset = usize::try_from(offset).map_err(|_| OverlayError::InvalidPath(format!("offset {} too large", offset)))?;
        let end = offset
            .checked_add(data.len())
            .ok_or_else(|| OverlayError::InvalidPath(format!("write past end of {}", path)))?;
        if content.len() < end {
            content.resize(end, 0);
        }
        content[offset..end].copy_from_slice(data);

        if self.ctx.spec().write_settle.is_zero() {
            let outcome = self.commit_locked(&path, &content).await?;
            return Ok(WriteOutcome {
                version: Some(outcome.version.id),
                length: outcome.version.length,
            });
        }

        let length = content.len() as u64;
        self.states.insert(path.clone(), FileState::Writing);
        self.drafts.insert(
            path,
            Draft {
                content,
                touched: Instant::now(),
                modified_at: Utc::now(),
            },
        );
        Ok(WriteOutcome { version: None, length })
    }

    /// Replace the whole content of `path`, creating the file when missing.
    pub async fn write_all(&self, path: &str, bytes: &[u8]) -> Result<Version> {
        let _permit = self.enter().await?;
        let path = self.write_path(path)?;
        let _lock = self.lock(&path).await;

        match self.store.record(&path).await {
            Ok(record) if record.is_dir() => return Err(OverlayError::IsADirectory(path)),
            Ok(_) => {}
            Err(VersionStoreError::NotFound(_)) => {
                self.store.create_file(&path).await?;
            }
            Err(e) => return Err(e.into()),
        }
        // replaced wholesale
        self.drafts.remove(&path);
        Ok(self.commit_locked(&path, bytes).await?.version)
    }

    /// Resize `path` to `size` bytes as a new version.
    pub async fn truncate(&self, path: &str, size: u64) -> Result<ViewAttr> {
        let _permit = self.enter().await?;
        let path = self.write_path(path)?;
        {
            let _lock = self.lock(&path).await;
            let size = usize::try_from(size).map_err(|_| OverlayError::InvalidPath(format!("size {} too large", size)))?;
            let (mut content, drafted) = match self.drafts.remove(&path) {
                Some((_, draft)) => (draft.content, true),
                None => (self.store.read(&path, None).await?, false),
            };
            if drafted || content.len() != size {
                content.resize(size, 0);
                self.commit_locked(&path, &content).await?;
            }
        }
        Ok(self.views.attr(&path).await?)
    }

    pub async fn create(&self, path: &str) -> Result<ViewAttr> {
        let _permit = self.enter().await?;
        let path = self.write_path(path)?;
        {
            let _lock = self.lock(&path).await;
            self.store.create_file(&path).await?;
        }
        Ok(self.views.attr(&path).await?)
    }

    pub async fn mkdir(&self, path: &str) -> Result<ViewAttr> {
        let _permit = self.enter().await?;
        let path = self.write_path(path)?;
        {
            let _lock = self.lock(&path).await;
            self.store.mkdir(&path).await?;
        }
        Ok(self.views.attr(&path).await?)
    }

    /// Remove a regular file. Its history stays readable.
    pub async fn unlink(&self, path: &str) -> Result<()> {
        let _permit = self.enter().await?;
        let path = self.write_path(path)?;
        let _lock = self.lock(&path).await;
        if self.store.record(&path).await?.is_dir() {
            return Err(OverlayError::IsADirectory(path));
        }
        // what was written before the delete stays in history
        self.flush_locked(&path).await?;
        self.store.delete(&path).await?;
        Ok(())
    }

    pub async fn rmdir(&self, path: &str) -> Result<()> {
        let _permit = self.enter().await?;
        let path = self.write_path(path)?;
        let _lock = self.lock(&path).await;
        if !self.store.record(&path).await?.is_dir() {
            return Err(OverlayError::NotADirectory(path));
        }
        self.store.delete(&path).await?;
        Ok(())
    }

    /// Move `from` to `to`. History follows the file. Analysis is queued
    /// only when the move takes a file out of the vault.
    pub async fn rename(&self, from: &str, to: &str) -> Result<ViewAttr> {
        let _permit = self.enter().await?;
        self.rename_entered(from, to).await
    }

    async fn rename_entered(&self, from: &str, to: &str) -> Result<ViewAttr> {
        let from = self.write_path(from)?;
        let to = self.write_path(to)?;
        // files inside a renamed directory commit under their old names
        self.flush_tree(&from).await?;
        {
            let _locks = self.lock_pair(&from, &to).await;
            self.flush_locked(&from).await?;
            self.flush_locked(&to).await?;
            let outcome = self.store.rename(&from, &to).await?;
            // leaving the vault yields the first plaintext version of the file
            if let Some(version) = &outcome.re_encoded {
                self.pipeline.submit_version(&to, version).await;
            }
        }
        Ok(self.views.attr(&to).await?)
    }

    pub async fn readdir(&self, path: &str) -> Result<Vec<DirEntry>> {
        let _permit = self.enter().await?;
        let path = self.read_path(path)?;
        Ok(self.views.list(&path).await?)
    }

    // ========================================================================
    // History and derived metadata
    // ========================================================================

    pub async fn history(&self, path: &str) -> Result<Vec<Version>> {
        let _permit = self.enter().await?;
        let path = self.read_path(path)?;
        self.flush_path(&path).await?;
        Ok(self.store.history(&path).await?)
    }

    pub async fn read_version(&self, path: &str, version: VersionId) -> Result<Vec<u8>> {
        let _permit = self.enter().await?;
        let path = self.read_path(path)?;
        self.flush_path(&path).await?;
        Ok(self.store.read(&path, Some(version)).await?)
    }

    /// TODO items of one version (current when `None`). `None` until the
    /// extraction job for that version has finished.
    pub async fn todos(&self, path: &str, version: Option<VersionId>) -> Result<Option<Vec<TodoItem>>> {
        let _permit = self.enter().await?;
        let path = self.read_path(path)?;
        self.flush_path(&path).await?;
        let (record, found) = self.store.resolve(&path, version).await?;
        match found {
            Some(found) => Ok(self.ctx.index().todos(record.file_id, found.id).await?),
            None => Ok(None),
        }
    }

    pub async fn summary(&self, path: &str, version: Option<VersionId>) -> Result<Option<String>> {
        let _permit = self.enter().await?;
        let path = self.read_path(path)?;
        self.flush_path(&path).await?;
        let (record, found) = self.store.resolve(&path, version).await?;
        match found {
            Some(found) => Ok(self.ctx.index().summary(record.file_id, found.id).await?),
            None => Ok(None),
        }
    }

    pub async fn tags(&self, path: &str) -> Result<TagSet> {
        let _permit = self.enter().await?;
        let path = self.read_path(path)?;
        Ok(self.store.record(&path).await?.tags)
    }

    pub fn file_state(&self, path: &str) -> FileState {
        let Ok(path) = self.read_path(path) else {
            return FileState::Clean;
        };
        self.states.get(&path).map_or(FileState::Clean, |state| *state)
    }

    pub fn is_running(&self) -> bool {
        !self.shutting_down.load(Ordering::Acquire)
    }

    /// Refuse new calls, let in-flight ones finish, stop the analysis
    /// workers and flush the index.
    pub async fn shutdown(&self) -> Result<()> {
        if self.shutting_down.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        info!("Overlay engine shutting down");

        match self.gate.acquire_many(MAX_IN_FLIGHT).await {
            Ok(permits) => permits.forget(),
            Err(_) => warn!("In-flight gate already closed"),
        }
        self.gate.close();

        let pending: Vec<String> = self.drafts.iter().map(|draft| draft.key().clone()).collect();
        for path in pending {
            if let Err(e) = self.flush_path(&path).await {
                warn!(path = %path, error = %e, "Buffered writes lost at shutdown");
            }
        }

        self.pipeline.shutdown().await;
        self.ctx.index().flush().await?;
        info!("Overlay engine stopped");
        Ok(())
    }
}

/// Commit drafts that have not been written to for `settle`.
async fn commit_idle_drafts(engine: Weak<OverlayEngine>, settle: Duration) {
    let mut ticker = tokio::time::interval((settle / 2).max(Duration::from_millis(10)));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let Some(engine) = engine.upgrade() else {
            return;
        };
        let idle: Vec<String> = engine
            .drafts
            .iter()
            .filter(|draft| draft.touched.elapsed() >= settle)
            .map(|draft| draft.key().clone())
            .collect();
        for path in idle {
            let Ok(_permit) = engine.enter().await else {
                return;
            };
            let _lock = engine.lock(&path).await;
            // written to again while waiting for the lock
            if engine.drafts.get(&path).is_some_and(|draft| draft.touched.elapsed() < settle) {
                continue;
            }
            if let Ok(Some(outcome)) = engine.flush_locked(&path).await {
                debug!(path = %path, version = %outcome.version.id, "Committed settled writes");
            }
        }
    }
}

#[async_trait]
impl FileMover for OverlayEngine {
    async fn organize(&self, file_id: FileId, folder: &str) -> std::result::Result<Option<String>, PipelineError> {
        let _permit = match self.enter().await {
            Ok(permit) => permit,
            Err(_) => return Ok(None),
        };
        let Some(record) = self.ctx.index().record_for_file(file_id).await? else {
            return Ok(None);
        };

        let folder_path = join(parent_of(&record.path), folder);
        let target = join(&folder_path, record.name());
        if self.ctx.index().get_record(&target).await?.is_some_and(|r| r.is_live()) {
            debug!(from = %record.path, to = %target, "Organize target taken, leaving file in place");
            return Ok(None);
        }

        {
            let _lock = self.lock(&folder_path).await;
            match self.store.mkdir(&folder_path).await {
                Ok(_) | Err(VersionStoreError::AlreadyExists(_)) => {}
                Err(e) => return Err(PipelineError::Organize(e.to_string())),
            }
        }

        self.rename_entered(&record.path, &target)
            .await
            .map_err(|e| PipelineError::Organize(e.to_string()))?;

        self.ctx.events().publish(OverlayEvent::FileOrganized {
            from: record.path.clone(),
            to: target.clone(),
            folder: folder.to_string(),
            organized_at: Utc::now(),
        });
        Ok(Some(target))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::license::LicenseStatus;
    use crate::domain::events::NullEventPublisher;
    use crate::domain::file::FileKind;
    use crate::domain::mount_config::MountSpec;
    use crate::infrastructure::analyzers::builtin_analyzers;
    use crate::infrastructure::image_convert::ImageFormatConverter;
    use crate::infrastructure::web_fetch::HttpLinkFetcher;
    use std::time::Duration;
    use tempfile::TempDir;

    async fn engine(dir: &TempDir) -> Arc<OverlayEngine> {
        engine_with(MountSpec::for_source(dir.path())).await
    }

    async fn engine_with(spec: MountSpec) -> Arc<OverlayEngine> {
        let ctx = MountContext::open(
            spec,
            None,
            LicenseStatus::free("test"),
            Arc::new(NullEventPublisher),
        )
        .await
        .unwrap();
        OverlayEngine::start(
            Arc::new(ctx),
            builtin_analyzers(),
            Arc::new(HttpLinkFetcher::new(Duration::from_secs(1)).unwrap()),
            Arc::new(ImageFormatConverter::new()),
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_offset_writes_splice_and_version() {
        let dir = TempDir::new().unwrap();
        let mut spec = MountSpec::for_source(dir.path());
        spec.write_settle = Duration::from_secs(60);
        let engine = engine_with(spec).await;

        engine.create("/a.txt").await.unwrap();
        engine.write("/a.txt", 0, b"hello world").await.unwrap();
        let outcome = engine.write("/a.txt", 6, b"there").await.unwrap();
        assert_eq!(outcome.version, None);
        assert_eq!(engine.file_state("/a.txt"), FileState::Writing);
        assert_eq!(engine.read_all("/a.txt").await.unwrap(), b"hello there");
        assert_eq!(engine.getattr("/a.txt").await.unwrap().size, 11);

        let gap = engine.write("/a.txt", 13, b"!").await.unwrap();
        assert_eq!(gap.length, 14);
        assert_eq!(engine.read_all("/a.txt").await.unwrap(), b"hello there\0\0!");

        let (chunk, eof) = engine.read("/a.txt", 6, 5).await.unwrap();
        assert_eq!(chunk, b"there");
        assert!(!eof);
        let (tail, eof) = engine.read("/a.txt", 12, 100).await.unwrap();
        assert_eq!(tail, b"\0!");
        assert!(eof);

        // asking for history commits what was buffered as one version
        let history = engine.history("/a.txt").await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].length, 14);
        assert_eq!(engine.file_state("/a.txt"), FileState::Clean);

        engine.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_chunked_writes_commit_once_when_idle() {
        let dir = TempDir::new().unwrap();
        let mut spec = MountSpec::for_source(dir.path());
        spec.write_settle = Duration::from_millis(50);
        let engine = engine_with(spec).await;

        engine.create("/big.bin").await.unwrap();
        let chunk = vec![b'x'; 4096];
        for i in 0..8u64 {
            engine.write("/big.bin", i * 4096, &chunk).await.unwrap();
        }
        assert!(engine.store.history("/big.bin").await.unwrap().is_empty());

        let mut history = Vec::new();
        for _ in 0..100 {
            history = engine.store.history("/big.bin").await.unwrap();
            if !history.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].length, 8 * 4096);
        assert_eq!(engine.store.read("/big.bin", None).await.unwrap(), vec![b'x'; 8 * 4096]);
        assert_eq!(engine.file_state("/big.bin"), FileState::Clean);
        engine.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_zero_settle_commits_every_write() {
        let dir = TempDir::new().unwrap();
        let mut spec = MountSpec::for_source(dir.path());
        spec.write_settle = Duration::ZERO;
        let engine = engine_with(spec).await;

        engine.create("/a.txt").await.unwrap();
        engine.write("/a.txt", 0, b"hello").await.unwrap();
        let outcome = engine.write("/a.txt", 5, b"!").await.unwrap();
        assert_eq!(outcome.version, Some(VersionId(2)));
        assert_eq!(engine.file_state("/a.txt"), FileState::Clean);
        engine.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_buffered_writes_survive_rename_and_shutdown() {
        let dir = TempDir::new().unwrap();
        let engine = engine(&dir).await;

        engine.mkdir("/drafts").await.unwrap();
        engine.create("/drafts/a.txt").await.unwrap();
        engine.write("/drafts/a.txt", 0, b"moved").await.unwrap();
        engine.rename("/drafts", "/final").await.unwrap();
        assert_eq!(engine.store.read("/final/a.txt", None).await.unwrap(), b"moved");

        engine.create("/late.txt").await.unwrap();
        engine.write("/late.txt", 0, b"last words").await.unwrap();
        engine.shutdown().await.unwrap();
        assert_eq!(engine.store.read("/late.txt", None).await.unwrap(), b"last words");
    }

    #[tokio::test]
    async fn test_views_are_read_only() {
        let dir = TempDir::new().unwrap();
        let engine = engine(&dir).await;

        assert!(matches!(
            engine.create("/.magic/stats.md").await,
            Err(OverlayError::PermissionDenied(_))
        ));
        assert!(matches!(
            engine.write_all("/docs/.context", b"x").await,
            Err(OverlayError::PermissionDenied(_))
        ));
        assert!(matches!(
            engine.getattr("/.eidetic/index").await,
            Err(OverlayError::NotFound(_))
        ));
        assert!(matches!(
            engine.getattr("/../etc/passwd").await,
            Err(OverlayError::InvalidPath(_))
        ));

        let magic = engine.lookup("/", ".magic").await.unwrap();
        assert_eq!(magic.kind, FileKind::Directory);
        engine.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_unlink_and_rmdir_check_kind() {
        let dir = TempDir::new().unwrap();
        let engine = engine(&dir).await;

        engine.mkdir("/d").await.unwrap();
        engine.write_all("/d/f.txt", b"x").await.unwrap();
        assert!(matches!(engine.unlink("/d").await, Err(OverlayError::IsADirectory(_))));
        assert!(matches!(engine.rmdir("/d/f.txt").await, Err(OverlayError::NotADirectory(_))));
        assert!(matches!(engine.rmdir("/d").await, Err(OverlayError::DirectoryNotEmpty(_))));

        engine.unlink("/d/f.txt").await.unwrap();
        engine.rmdir("/d").await.unwrap();
        assert!(matches!(engine.getattr("/d").await, Err(OverlayError::NotFound(_))));
        engine.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_calls_after_shutdown_are_refused() {
        let dir = TempDir::new().unwrap();
        let engine = engine(&dir).await;
        engine.write_all("/kept.txt", b"kept").await.unwrap();

        engine.shutdown().await.unwrap();
        assert!(!engine.is_running());
        assert!(matches!(engine.read_all("/kept.txt").await, Err(OverlayError::ShuttingDown)));
        // idempotent
        engine.shutdown().await.unwrap();
    }
}
