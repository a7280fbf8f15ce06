// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Sled Metadata Index
//!
//! Embedded, crash-safe implementation of `MetadataIndex`. sled only
//! exposes committed transactions after a restart, which is exactly the
//! recovery contract the overlay needs.
//!
//! ## Trees
//!
//! | tree         | key                               | value               |
//! |--------------|-----------------------------------|---------------------|
//! | `records`    | mount path                        | `FileRecord`        |
//! | `file_paths` | file id (BE)                      | live path           |
//! | `versions`   | file id (BE) ++ version (BE)      | `Version`           |
//! | `todos`      | file id (BE) ++ version (BE)      | `Vec<TodoItem>`     |
//! | `summaries`  | file id (BE) ++ version (BE)      | `String`            |
//! | `jobs`       | file id ++ version ++ kind code   | `AnalysisJob`       |
//! | `meta`       | utf-8 key                         | raw bytes           |
//!
//! Values are bincode-encoded. Big-endian numeric keys keep per-file
//! versions contiguous and ordered, so history is a prefix scan.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use sled::transaction::{
    ConflictableTransactionError, ConflictableTransactionResult, TransactionError, TransactionResult,
    TransactionalTree,
};
use sled::Transactional;
use std::path::Path;
use tracing::{debug, info};

use crate::domain::file::{FileId, FileRecord, FileStatus, TagSet, TodoItem, Version, VersionId};
use crate::domain::index::{IndexError, IndexStats, MetadataIndex};
use crate::domain::job::{AnalysisJob, JobKey, JobOutcome, JobStatus};

const ROOT: &str = "/";

impl From<sled::Error> for IndexError {
    fn from(err: sled::Error) -> Self {
        IndexError::Storage(err.to_string())
    }
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, IndexError> {
    bincode::serialize(value).map_err(|e| IndexError::Serialization(e.to_string()))
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, IndexError> {
    bincode::deserialize(bytes).map_err(|e| IndexError::Serialization(e.to_string()))
}

fn tx_encode<T: Serialize>(value: &T) -> Result<Vec<u8>, ConflictableTransactionError<IndexError>> {
    encode(value).map_err(ConflictableTransactionError::Abort)
}

fn tx_decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, ConflictableTransactionError<IndexError>> {
    decode(bytes).map_err(ConflictableTransactionError::Abort)
}

fn abort<T>(err: IndexError) -> ConflictableTransactionResult<T, IndexError> {
    Err(ConflictableTransactionError::Abort(err))
}

fn map_tx<T>(result: TransactionResult<T, IndexError>) -> Result<T, IndexError> {
    result.map_err(|e| match e {
        TransactionError::Abort(e) => e,
        TransactionError::Storage(e) => IndexError::Transaction(e.to_string()),
    })
}

/// Re-key a displaced record as `<path>\0<file id>` so its history stays
/// reachable after another record takes the path.
fn bury(records: &TransactionalTree, mut record: FileRecord) -> ConflictableTransactionResult<(), IndexError> {
    let grave = format!("{}\u{0}{}", record.path, record.file_id);
    record.path = grave.clone();
    records.insert(grave.as_bytes(), tx_encode(&record)?)?;
    Ok(())
}

fn version_key(file_id: FileId, version: VersionId) -> [u8; 16] {
    let mut key = [0u8; 16];
    key[..8].copy_from_slice(&file_id.to_be_bytes());
    key[8..].copy_from_slice(&version.to_be_bytes());
    key
}

fn children_prefix(dir: &str) -> String {
    if dir == ROOT {
        ROOT.to_string()
    } else {
        format!("{}/", dir)
    }
}

pub struct SledMetadataIndex {
    db: sled::Db,
    records: sled::Tree,
    file_paths: sled::Tree,
    versions: sled::Tree,
    todos: sled::Tree,
    summaries: sled::Tree,
    jobs: sled::Tree,
    meta: sled::Tree,
    durable: bool,
}

impl SledMetadataIndex {
    /// Open (or create) the index stored under `path`.
    ///
    /// With `durable` set every committed mutation is flushed before the
    /// call returns.
    pub fn open(path: impl AsRef<Path>, durable: bool) -> Result<Self, IndexError> {
        let path = path.as_ref();
        info!(path = %path.display(), durable, "Opening metadata index");
        let db = sled::open(path)?;
        Self::from_db(db, durable)
    }

    /// In-memory index that vanishes on drop.
    pub fn temporary() -> Result<Self, IndexError> {
        let db = sled::Config::new().temporary(true).open()?;
        Self::from_db(db, false)
    }

    fn from_db(db: sled::Db, durable: bool) -> Result<Self, IndexError> {
        let index = Self {
            records: db.open_tree("records")?,
            file_paths: db.open_tree("file_paths")?,
            versions: db.open_tree("versions")?,
            todos: db.open_tree("todos")?,
            summaries: db.open_tree("summaries")?,
            jobs: db.open_tree("jobs")?,
            meta: db.open_tree("meta")?,
            db,
            durable,
        };
        index.ensure_root()?;
        Ok(index)
    }

    fn ensure_root(&self) -> Result<(), IndexError> {
        if self.records.contains_key(ROOT)? {
            return Ok(());
        }
        let root = FileRecord::new_directory(ROOT, FileId(self.db.generate_id()? + 1), false);
        self.records.insert(ROOT, encode(&root)?)?;
        self.file_paths.insert(&root.file_id.to_be_bytes()[..], ROOT)?;
        debug!(file_id = %root.file_id, "Created root record");
        Ok(())
    }

    async fn commit(&self) -> Result<(), IndexError> {
        if self.durable {
            self.db.flush_async().await?;
        }
        Ok(())
    }

    fn load_job(&self, key: &JobKey) -> Result<Option<AnalysisJob>, IndexError> {
        self.jobs
            .get(key.to_bytes())?
            .map(|raw| decode(&raw))
            .transpose()
    }

    /// Apply `update` to a stored job inside a single-tree transaction.
    fn update_job<T, F>(&self, key: &JobKey, update: F) -> Result<T, IndexError>
    where
        F: Fn(&mut AnalysisJob) -> Result<T, IndexError>,
    {
        let raw_key = key.to_bytes();
        let result = self.jobs.transaction(|jobs| {
            let mut job: AnalysisJob = match jobs.get(raw_key)? {
                Some(raw) => tx_decode(&raw)?,
                None => return abort(IndexError::NotFound(format!("job {}", key))),
            };
            let value = update(&mut job).map_err(ConflictableTransactionError::Abort)?;
            jobs.insert(&raw_key[..], tx_encode(&job)?)?;
            Ok(value)
        });
        map_tx(result)
    }
}

#[async_trait]
impl MetadataIndex for SledMetadataIndex {
    async fn allocate_file_id(&self) -> Result<FileId, IndexError> {
        Ok(FileId(self.db.generate_id()? + 1))
    }

    async fn upsert_record(&self, record: &FileRecord) -> Result<(), IndexError> {
        let bytes = encode(record)?;
        let result: TransactionResult<(), IndexError> = (&self.records, &self.file_paths).transaction(|(records, file_paths)| {
            if let Some(raw) = records.get(record.path.as_bytes())? {
                let previous: FileRecord = tx_decode(&raw)?;
                if !previous.is_live() && previous.file_id != record.file_id {
                    bury(records, previous)?;
                }
            }
            records.insert(record.path.as_bytes(), bytes.clone())?;
            if record.is_live() {
                file_paths.insert(&record.file_id.to_be_bytes()[..], record.path.as_bytes())?;
            }
            Ok(())
        });
        map_tx(result)?;
        self.commit().await
    }

    async fn get_record(&self, path: &str) -> Result<Option<FileRecord>, IndexError> {
        self.records.get(path)?.map(|raw| decode(&raw)).transpose()
    }

    async fn record_for_file(&self, file_id: FileId) -> Result<Option<FileRecord>, IndexError> {
        let Some(path) = self.file_paths.get(file_id.to_be_bytes())? else {
            return Ok(None);
        };
        let Some(raw) = self.records.get(&path)? else {
            return Ok(None);
        };
        let record: FileRecord = decode(&raw)?;
        Ok((record.is_live() && record.file_id == file_id).then_some(record))
    }

    async fn append_version(&self, path: &str, version: &Version) -> Result<FileRecord, IndexError> {
        let version_bytes = encode(version)?;
        let key = version_key(version.file_id, version.id);

        let result = (&self.records, &self.versions).transaction(|(records, versions)| {
            let mut record: FileRecord = match records.get(path.as_bytes())? {
                Some(raw) => tx_decode(&raw)?,
                None => return abort(IndexError::NotFound(path.to_string())),
            };
            if !record.is_live() || record.is_dir() {
                return abort(IndexError::NotFound(path.to_string()));
            }
            if record.file_id != version.file_id || record.current_version != version.parent {
                return abort(IndexError::Conflict {
                    path: path.to_string(),
                    expected: version.parent,
                    found: record.current_version,
                });
            }
            if versions.get(key)?.is_some() {
                return abort(IndexError::AlreadyExists(format!("{} {}", path, version.id)));
            }

            versions.insert(&key[..], version_bytes.clone())?;
            record.current_version = Some(version.id);
            record.modified_at = version.created_at;
            records.insert(path.as_bytes(), tx_encode(&record)?)?;
            Ok(record)
        });

        let record = map_tx(result)?;
        self.commit().await?;
        debug!(path = %path, version = %version.id, "Appended version");
        Ok(record)
    }

    async fn current_version(&self, path: &str) -> Result<Option<Version>, IndexError> {
        let Some(record) = self.get_record(path).await? else {
            return Ok(None);
        };
        if !record.is_live() {
            return Ok(None);
        }
        match record.current_version {
            Some(version) => self.get_version(record.file_id, version).await,
            None => Ok(None),
        }
    }

    async fn get_version(&self, file_id: FileId, version: VersionId) -> Result<Option<Version>, IndexError> {
        self.versions
            .get(version_key(file_id, version))?
            .map(|raw| decode(&raw))
            .transpose()
    }

    async fn list_versions(&self, file_id: FileId) -> Result<Vec<Version>, IndexError> {
        self.versions
            .scan_prefix(file_id.to_be_bytes())
            .values()
            .map(|raw| decode(&raw?))
            .collect()
    }

    async fn rename_record(
        &self,
        from: &str,
        to: &str,
        vaulted: bool,
        replacement: Option<&Version>,
    ) -> Result<FileRecord, IndexError> {
        let source = match self.get_record(from).await? {
            Some(record) if record.is_live() => record,
            _ => return Err(IndexError::NotFound(from.to_string())),
        };

        // Subtree moves are collected up front; transactional trees cannot scan.
        let mut moves = vec![(from.to_string(), to.to_string())];
        if source.is_dir() {
            let prefix = children_prefix(from);
            for entry in self.records.scan_prefix(prefix.as_bytes()) {
                let (raw_key, raw_value) = entry?;
                let child: FileRecord = decode(&raw_value)?;
                if !child.is_live() {
                    continue;
                }
                let child_path = String::from_utf8_lossy(&raw_key).into_owned();
                let suffix = &child_path[from.len()..];
                moves.push((child_path.clone(), format!("{}{}", to, suffix)));
            }
        }

        let replacement_bytes = replacement.map(encode).transpose()?;
        let now = Utc::now();

        let result = (&self.records, &self.file_paths, &self.versions).transaction(
            |(records, file_paths, versions)| {
                let mut moved_root = None;
                for (idx, (old_path, new_path)) in moves.iter().enumerate() {
                    let mut old: FileRecord = match records.get(old_path.as_bytes())? {
                        Some(raw) => tx_decode(&raw)?,
                        None => return abort(IndexError::NotFound(old_path.clone())),
                    };
                    if !old.is_live() {
                        return abort(IndexError::NotFound(old_path.clone()));
                    }

                    if let Some(raw) = records.get(new_path.as_bytes())? {
                        let mut existing: FileRecord = tx_decode(&raw)?;
                        if existing.is_live() {
                            if idx > 0 || existing.is_dir() {
                                return abort(IndexError::AlreadyExists(new_path.clone()));
                            }
                            existing.status = FileStatus::Tombstoned { at: now };
                            file_paths.remove(&existing.file_id.to_be_bytes()[..])?;
                        }
                        if existing.file_id != old.file_id {
                            bury(records, existing)?;
                        }
                    }

                    let mut moved = old.clone();
                    moved.path = new_path.clone();
                    moved.status = FileStatus::Active;
                    moved.vaulted = vaulted;
                    moved.modified_at = now;

                    if idx == 0 {
                        if let (Some(version), Some(bytes)) = (replacement, replacement_bytes.as_ref()) {
                            if version.file_id != moved.file_id || version.parent != moved.current_version {
                                return abort(IndexError::Conflict {
                                    path: old_path.clone(),
                                    expected: version.parent,
                                    found: moved.current_version,
                                });
                            }
                            versions.insert(&version_key(version.file_id, version.id)[..], bytes.clone())?;
                            moved.current_version = Some(version.id);
                        }
                    }

                    old.status = FileStatus::Tombstoned { at: now };
                    records.insert(old_path.as_bytes(), tx_encode(&old)?)?;
                    records.insert(new_path.as_bytes(), tx_encode(&moved)?)?;
                    file_paths.insert(&moved.file_id.to_be_bytes()[..], new_path.as_bytes())?;

                    if idx == 0 {
                        moved_root = Some(moved);
                    }
                }
                match moved_root {
                    Some(record) => Ok(record),
                    None => abort(IndexError::NotFound(from.to_string())),
                }
            },
        );

        let record = map_tx(result)?;
        self.commit().await?;
        debug!(from = %from, to = %to, entries = moves.len(), "Renamed record");
        Ok(record)
    }

    async fn tombstone_record(&self, path: &str) -> Result<FileRecord, IndexError> {
        let now = Utc::now();
        let result = (&self.records, &self.file_paths).transaction(|(records, file_paths)| {
            let mut record: FileRecord = match records.get(path.as_bytes())? {
                Some(raw) => tx_decode(&raw)?,
                None => return abort(IndexError::NotFound(path.to_string())),
            };
            if !record.is_live() {
                return abort(IndexError::NotFound(path.to_string()));
            }
            record.status = FileStatus::Tombstoned { at: now };
            records.insert(path.as_bytes(), tx_encode(&record)?)?;
            file_paths.remove(&record.file_id.to_be_bytes()[..])?;
            Ok(record)
        });
        let record = map_tx(result)?;
        self.commit().await?;
        Ok(record)
    }

    async fn list_children(&self, dir: &str) -> Result<Vec<FileRecord>, IndexError> {
        let prefix = children_prefix(dir);
        let mut children = Vec::new();
        for entry in self.records.scan_prefix(prefix.as_bytes()) {
            let (raw_key, raw_value) = entry?;
            let rest = &raw_key[prefix.len()..];
            if rest.is_empty() || rest.contains(&b'/') || rest.contains(&0) {
                continue;
            }
            let record: FileRecord = decode(&raw_value)?;
            if record.is_live() {
                children.push(record);
            }
        }
        Ok(children)
    }

    async fn list_live_records(&self) -> Result<Vec<FileRecord>, IndexError> {
        let mut live = Vec::new();
        for raw in self.records.iter().values() {
            let record: FileRecord = decode(&raw?)?;
            if record.is_live() {
                live.push(record);
            }
        }
        Ok(live)
    }

    async fn record_tags(&self, file_id: FileId, version: VersionId, tags: &TagSet) -> Result<bool, IndexError> {
        let result = (&self.records, &self.file_paths).transaction(|(records, file_paths)| {
            let Some(path) = file_paths.get(&file_id.to_be_bytes()[..])? else {
                return Ok(false);
            };
            let mut record: FileRecord = match records.get(&path)? {
                Some(raw) => tx_decode(&raw)?,
                None => return Ok(false),
            };
            if !record.is_live() || record.current_version != Some(version) {
                return Ok(false);
            }
            record.tags = tags.clone();
            records.insert(path, tx_encode(&record)?)?;
            Ok(true)
        });
        let applied = map_tx(result)?;
        if applied {
            self.commit().await?;
        }
        Ok(applied)
    }

    async fn record_todos(&self, file_id: FileId, version: VersionId, todos: &[TodoItem]) -> Result<(), IndexError> {
        self.todos
            .insert(&version_key(file_id, version)[..], encode(&todos.to_vec())?)?;
        self.commit().await
    }

    async fn todos(&self, file_id: FileId, version: VersionId) -> Result<Option<Vec<TodoItem>>, IndexError> {
        self.todos
            .get(version_key(file_id, version))?
            .map(|raw| decode(&raw))
            .transpose()
    }

    async fn record_summary(&self, file_id: FileId, version: VersionId, summary: &str) -> Result<(), IndexError> {
        self.summaries
            .insert(&version_key(file_id, version)[..], encode(&summary.to_string())?)?;
        self.commit().await
    }

    async fn summary(&self, file_id: FileId, version: VersionId) -> Result<Option<String>, IndexError> {
        self.summaries
            .get(version_key(file_id, version))?
            .map(|raw| decode(&raw))
            .transpose()
    }

    async fn enqueue_job(&self, job: &AnalysisJob) -> Result<bool, IndexError> {
        let swapped = self
            .jobs
            .compare_and_swap(job.key.to_bytes(), None::<&[u8]>, Some(encode(job)?))?;
        if swapped.is_err() {
            return Ok(false);
        }
        self.commit().await?;
        Ok(true)
    }

    async fn get_job(&self, key: &JobKey) -> Result<Option<AnalysisJob>, IndexError> {
        self.load_job(key)
    }

    async fn claim_job(&self, key: &JobKey) -> Result<Option<AnalysisJob>, IndexError> {
        let raw_key = key.to_bytes();
        let result = self.jobs.transaction(|jobs| {
            let mut job: AnalysisJob = match jobs.get(raw_key)? {
                Some(raw) => tx_decode(&raw)?,
                None => return Ok(None),
            };
            if job.status != JobStatus::Pending {
                return Ok(None);
            }
            job.status = JobStatus::Running;
            job.started_at = Some(Utc::now());
            jobs.insert(&raw_key[..], tx_encode(&job)?)?;
            Ok(Some(job))
        });
        let claimed = map_tx(result)?;
        if claimed.is_some() {
            self.commit().await?;
        }
        Ok(claimed)
    }

    async fn record_retry(&self, key: &JobKey, error: &str) -> Result<AnalysisJob, IndexError> {
        let job = self.update_job(key, |job| {
            job.retry_count += 1;
            job.last_error = Some(error.to_string());
            Ok(job.clone())
        })?;
        self.commit().await?;
        Ok(job)
    }

    async fn complete_job(&self, key: &JobKey, outcome: JobOutcome) -> Result<(), IndexError> {
        self.update_job(key, |job| {
            job.finished_at = Some(Utc::now());
            match &outcome {
                JobOutcome::Done => job.status = JobStatus::Done,
                JobOutcome::Failed(error) => {
                    job.status = JobStatus::Failed;
                    job.last_error = Some(error.clone());
                }
            }
            Ok(())
        })?;
        self.commit().await
    }

    async fn discard_job(&self, key: &JobKey) -> Result<(), IndexError> {
        self.jobs.remove(key.to_bytes())?;
        self.commit().await
    }

    async fn jobs_with_status(&self, status: JobStatus) -> Result<Vec<AnalysisJob>, IndexError> {
        let mut jobs = Vec::new();
        for raw in self.jobs.iter().values() {
            let job: AnalysisJob = decode(&raw?)?;
            if job.status == status {
                jobs.push(job);
            }
        }
        Ok(jobs)
    }

    async fn requeue_stale_jobs(&self, cutoff: DateTime<Utc>) -> Result<Vec<AnalysisJob>, IndexError> {
        let mut pending = Vec::new();
        let mut requeued = 0usize;
        for entry in self.jobs.iter() {
            let (raw_key, raw_value) = entry?;
            let mut job: AnalysisJob = decode(&raw_value)?;
            match job.status {
                JobStatus::Running if job.started_at.map_or(true, |at| at < cutoff) => {
                    job.status = JobStatus::Pending;
                    job.started_at = None;
                    self.jobs.insert(raw_key, encode(&job)?)?;
                    requeued += 1;
                    pending.push(job);
                }
                JobStatus::Pending => pending.push(job),
                _ => {}
            }
        }
        if requeued > 0 {
            info!(requeued, "Requeued stale analysis jobs");
            self.commit().await?;
        }
        pending.sort_by_key(|job| job.enqueued_at);
        Ok(pending)
    }

    async fn stats(&self) -> Result<IndexStats, IndexError> {
        let mut stats = IndexStats::default();

        for raw in self.records.iter().values() {
            let record: FileRecord = decode(&raw?)?;
            if !record.is_live() {
                stats.tombstoned += 1;
                continue;
            }
            if record.is_dir() {
                if record.path != ROOT {
                    stats.directories += 1;
                }
                continue;
            }
            stats.files += 1;
            if record.vaulted {
                stats.vaulted_files += 1;
            }
            for tag in &record.tags {
                *stats.tags.entry(tag.clone()).or_insert(0) += 1;
            }
        }

        for raw in self.versions.iter().values() {
            let version: Version = decode(&raw?)?;
            stats.versions += 1;
            stats.stored_bytes += version.stored_length;
            if version.is_vaulted() {
                stats.vault_bytes += version.stored_length;
            }
        }

        for raw in self.jobs.iter().values() {
            let job: AnalysisJob = decode(&raw?)?;
            match job.status {
                JobStatus::Pending => stats.jobs_pending += 1,
                JobStatus::Running => stats.jobs_running += 1,
                JobStatus::Done => stats.jobs_done += 1,
                JobStatus::Failed => stats.jobs_failed += 1,
            }
        }

        Ok(stats)
    }

    async fn get_meta(&self, key: &str) -> Result<Option<Vec<u8>>, IndexError> {
        Ok(self.meta.get(key)?.map(|raw| raw.to_vec()))
    }

    async fn put_meta(&self, key: &str, value: &[u8]) -> Result<(), IndexError> {
        self.meta.insert(key, value)?;
        self.commit().await
    }

    async fn flush(&self) -> Result<(), IndexError> {
        self.db.flush_async().await?;
        Ok(())
    }
}
