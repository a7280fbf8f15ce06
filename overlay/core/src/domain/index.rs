// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Metadata Index Repository Interface
//!
//! Persistent, crash-durable home of file records, version history, tags,
//! TODO items, summaries and analysis job state. Every mutation is a single
//! transaction: a version append and its record-pointer update commit
//! together, so a reader never sees a record pointing at a version that
//! does not exist.
//!
//! All writers go through this one commit path, which gives the mount a
//! single ordering of mutations.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

use crate::domain::file::{FileId, FileRecord, TagSet, TodoItem, Version, VersionId};
use crate::domain::job::{AnalysisJob, JobKey, JobOutcome, JobStatus};

#[derive(Debug, Error)]
pub enum IndexError {
    #[error("Transaction aborted: {0}")]
    Transaction(String),

    #[error("Concurrent modification of {path}: expected parent {expected:?}, found {found:?}")]
    Conflict {
        path: String,
        expected: Option<VersionId>,
        found: Option<VersionId>,
    },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Storage error: {0}")]
    Storage(String),
}

/// Aggregate counts computed from the index at read time.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexStats {
    pub files: u64,
    pub directories: u64,
    pub tombstoned: u64,
    pub versions: u64,
    pub stored_bytes: u64,
    pub vaulted_files: u64,
    pub vault_bytes: u64,
    pub jobs_pending: u64,
    pub jobs_running: u64,
    pub jobs_done: u64,
    pub jobs_failed: u64,
    /// Tag -> number of live records carrying it.
    pub tags: BTreeMap<String, u64>,
}

#[async_trait]
pub trait MetadataIndex: Send + Sync {
    /// Allocate a new, never reused file id.
    async fn allocate_file_id(&self) -> Result<FileId, IndexError>;

    /// Insert or replace the record stored at `record.path`.
    async fn upsert_record(&self, record: &FileRecord) -> Result<(), IndexError>;

    /// Record at `path`, live or tombstoned.
    async fn get_record(&self, path: &str) -> Result<Option<FileRecord>, IndexError>;

    /// Live record currently holding `file_id`.
    async fn record_for_file(&self, file_id: FileId) -> Result<Option<FileRecord>, IndexError>;

    /// Append `version` to the live record at `path` and move its current
    /// pointer, atomically. Fails with `Conflict` when `version.parent` is
    /// not the record's current version.
    async fn append_version(&self, path: &str, version: &Version) -> Result<FileRecord, IndexError>;

    /// Current version of the live record at `path`.
    async fn current_version(&self, path: &str) -> Result<Option<Version>, IndexError>;

    async fn get_version(&self, file_id: FileId, version: VersionId) -> Result<Option<Version>, IndexError>;

    /// Every version of a file, oldest first.
    async fn list_versions(&self, file_id: FileId) -> Result<Vec<Version>, IndexError>;

    /// Tombstone `from` and create `to` holding the same file id and current
    /// version. Directory renames carry their live subtree along. When
    /// `replacement` is given it is appended as the new current version of
    /// the destination in the same transaction. A live regular file at `to`
    /// is tombstoned; a live directory at `to` is `AlreadyExists`.
    async fn rename_record(
        &self,
        from: &str,
        to: &str,
        vaulted: bool,
        replacement: Option<&Version>,
    ) -> Result<FileRecord, IndexError>;

    /// Mark the record at `path` deleted. Versions stay queryable.
    async fn tombstone_record(&self, path: &str) -> Result<FileRecord, IndexError>;

    /// Live direct children of `dir`.
    async fn list_children(&self, dir: &str) -> Result<Vec<FileRecord>, IndexError>;

    async fn list_live_records(&self) -> Result<Vec<FileRecord>, IndexError>;

    /// Replace the tag set of a file, but only while `version` is still its
    /// current version. Returns false when the classification is stale.
    async fn record_tags(&self, file_id: FileId, version: VersionId, tags: &TagSet) -> Result<bool, IndexError>;

    /// Store the TODO list of one version, superseding any earlier list for it.
    async fn record_todos(&self, file_id: FileId, version: VersionId, todos: &[TodoItem]) -> Result<(), IndexError>;

    /// `None` until the version has been analysed.
    async fn todos(&self, file_id: FileId, version: VersionId) -> Result<Option<Vec<TodoItem>>, IndexError>;

    async fn record_summary(&self, file_id: FileId, version: VersionId, summary: &str) -> Result<(), IndexError>;

    async fn summary(&self, file_id: FileId, version: VersionId) -> Result<Option<String>, IndexError>;

    /// Persist a pending job. Returns false when a job with the same key
    /// already exists in any state.
    async fn enqueue_job(&self, job: &AnalysisJob) -> Result<bool, IndexError>;

    async fn get_job(&self, key: &JobKey) -> Result<Option<AnalysisJob>, IndexError>;

    /// Move a pending job to running. `None` when the job is not pending.
    async fn claim_job(&self, key: &JobKey) -> Result<Option<AnalysisJob>, IndexError>;

    /// Count one more failed attempt on a running job.
    async fn record_retry(&self, key: &JobKey, error: &str) -> Result<AnalysisJob, IndexError>;

    async fn complete_job(&self, key: &JobKey, outcome: JobOutcome) -> Result<(), IndexError>;

    /// Forget a job that was never handed to a worker.
    async fn discard_job(&self, key: &JobKey) -> Result<(), IndexError>;

    async fn jobs_with_status(&self, status: JobStatus) -> Result<Vec<AnalysisJob>, IndexError>;

    /// Reset running jobs started before `cutoff` to pending and return every
    /// pending job.
    async fn requeue_stale_jobs(&self, cutoff: DateTime<Utc>) -> Result<Vec<AnalysisJob>, IndexError>;

    async fn stats(&self) -> Result<IndexStats, IndexError>;

    async fn get_meta(&self, key: &str) -> Result<Option<Vec<u8>>, IndexError>;

    async fn put_meta(&self, key: &str, value: &[u8]) -> Result<(), IndexError>;

    /// Force committed state to disk.
    async fn flush(&self) -> Result<(), IndexError>;
}
