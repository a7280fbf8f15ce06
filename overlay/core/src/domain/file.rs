// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! File Aggregate
//!
//! Value types describing one logical path in the mount and its immutable
//! content history. `FileRecord` is owned by the metadata index; `Version`
//! snapshots are owned by the version store and only referenced here.
//!
//! A record keeps its `FileId` across renames so the version chain follows
//! the file, not the path.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::fmt;

use crate::domain::vault::VaultEntry;

/// Classification labels attached to a record (e.g. "code", "finance").
pub type TagSet = BTreeSet<String>;

/// Stable identifier of a logical file, allocated once and kept across renames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FileId(pub u64);

impl FileId {
    pub fn to_be_bytes(self) -> [u8; 8] {
        self.0.to_be_bytes()
    }
}

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Version number, monotonic per file and starting at 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct VersionId(pub u64);

impl VersionId {
    pub const FIRST: VersionId = VersionId(1);

    pub fn next(self) -> VersionId {
        VersionId(self.0 + 1)
    }

    pub fn to_be_bytes(self) -> [u8; 8] {
        self.0.to_be_bytes()
    }
}

impl fmt::Display for VersionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileKind {
    Regular,
    Directory,
    /// Generated on read; never persisted as a record.
    Synthetic,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileStatus {
    Active,
    Tombstoned { at: DateTime<Utc> },
}

/// SHA-256 of a version's plaintext.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContentHash(pub [u8; 32]);

impl ContentHash {
    pub fn of(bytes: &[u8]) -> Self {
        let digest = Sha256::digest(bytes);
        let mut out = [0u8; 32];
        out.copy_from_slice(&digest);
        Self(out)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// Key of an immutable object in the blob store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContentRef(pub String);

impl fmt::Display for ContentRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One logical path in the mount.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    pub path: String,
    pub file_id: FileId,
    pub kind: FileKind,
    pub vaulted: bool,
    /// `None` for directories and for files created but never written.
    pub current_version: Option<VersionId>,
    pub status: FileStatus,
    pub tags: TagSet,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
}

impl FileRecord {
    pub fn new_file(path: impl Into<String>, file_id: FileId, vaulted: bool) -> Self {
        Self::new(path.into(), file_id, FileKind::Regular, vaulted)
    }

    pub fn new_directory(path: impl Into<String>, file_id: FileId, vaulted: bool) -> Self {
        Self::new(path.into(), file_id, FileKind::Directory, vaulted)
    }

    fn new(path: String, file_id: FileId, kind: FileKind, vaulted: bool) -> Self {
        let now = Utc::now();
        Self {
            path,
            file_id,
            kind,
            vaulted,
            current_version: None,
            status: FileStatus::Active,
            tags: TagSet::new(),
            created_at: now,
            modified_at: now,
        }
    }

    pub fn is_live(&self) -> bool {
        matches!(self.status, FileStatus::Active)
    }

    pub fn is_dir(&self) -> bool {
        self.kind == FileKind::Directory
    }

    /// Last path component; empty for the root.
    pub fn name(&self) -> &str {
        self.path.rsplit('/').next().unwrap_or("")
    }
}

/// Immutable snapshot of a record's content.
///
/// `hash` and `length` always describe the plaintext, even when the stored
/// object is ciphertext; `stored_length` is the size of the stored object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Version {
    pub file_id: FileId,
    pub id: VersionId,
    pub parent: Option<VersionId>,
    pub content: ContentRef,
    pub length: u64,
    pub hash: ContentHash,
    pub stored_length: u64,
    pub vault: Option<VaultEntry>,
    pub created_at: DateTime<Utc>,
}

impl Version {
    pub fn is_vaulted(&self) -> bool {
        self.vault.is_some()
    }
}

/// A TODO/FIXME marker found in one version of a file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TodoItem {
    pub path: String,
    /// 1-based line number.
    pub line: u32,
    pub text: String,
    pub discovered_at: DateTime<Utc>,
}
