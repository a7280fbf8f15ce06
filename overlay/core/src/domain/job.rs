// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Analysis Job Value Types
//!
//! A job is identified by `(file id, version, kind)`. That key is the
//! idempotency guard: a job for a given key runs to completion at most once,
//! which stops auto-organization renames from re-analysing the same bytes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::domain::file::{FileId, VersionId};

/// Closed set of analyzers. Adding one means adding a variant here and an
/// arm in `AnalyzerSet::analyzer_for`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    Summarize,
    ExtractTodos,
    Classify,
}

impl JobKind {
    pub const ALL: [JobKind; 3] = [JobKind::Summarize, JobKind::ExtractTodos, JobKind::Classify];

    pub fn label(self) -> &'static str {
        match self {
            JobKind::Summarize => "summarize",
            JobKind::ExtractTodos => "extract_todos",
            JobKind::Classify => "classify",
        }
    }

    pub(crate) fn code(self) -> u8 {
        match self {
            JobKind::Summarize => 0,
            JobKind::ExtractTodos => 1,
            JobKind::Classify => 2,
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobStatus {
    Pending,
    Running,
    Done,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobKey {
    pub file_id: FileId,
    pub version: VersionId,
    pub kind: JobKind,
}

impl JobKey {
    pub fn new(file_id: FileId, version: VersionId, kind: JobKind) -> Self {
        Self { file_id, version, kind }
    }

    pub fn to_bytes(&self) -> [u8; 17] {
        let mut key = [0u8; 17];
        key[..8].copy_from_slice(&self.file_id.to_be_bytes());
        key[8..16].copy_from_slice(&self.version.to_be_bytes());
        key[16] = self.kind.code();
        key
    }
}

impl fmt::Display for JobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}/{}", self.file_id, self.version, self.kind)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnalysisJob {
    pub key: JobKey,
    /// Path at enqueue time. Informational only; workers resolve content by file id.
    pub path: String,
    pub status: JobStatus,
    pub retry_count: u32,
    pub enqueued_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl AnalysisJob {
    pub fn new(key: JobKey, path: impl Into<String>) -> Self {
        Self {
            key,
            path: path.into(),
            status: JobStatus::Pending,
            retry_count: 0,
            enqueued_at: Utc::now(),
            started_at: None,
            finished_at: None,
            last_error: None,
        }
    }
}

/// Terminal state reported by a worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Done,
    Failed(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_key_bytes_are_ordered_by_file_then_version() {
        let a = JobKey::new(FileId(1), VersionId(2), JobKind::Classify).to_bytes();
        let b = JobKey::new(FileId(1), VersionId(3), JobKind::Summarize).to_bytes();
        let c = JobKey::new(FileId(2), VersionId(1), JobKind::Summarize).to_bytes();
        assert!(a < b);
        assert!(b < c);
    }

    #[test]
    fn test_kind_labels_are_distinct() {
        let labels: std::collections::HashSet<_> = JobKind::ALL.iter().map(|k| k.label()).collect();
        assert_eq!(labels.len(), JobKind::ALL.len());
    }
}
