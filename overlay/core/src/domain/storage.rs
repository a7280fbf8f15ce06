// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Blob Store Trait - Anti-Corruption Layer for version bytes
//!
//! Version content lives in immutable, content-addressed objects. The store
//! never rewrites an object once written; a new version always produces a
//! new object (or reuses an identical one).
//!
//! Keeping this behind a trait lets tests inject slow or failing stores
//! without touching the version logic.

use async_trait::async_trait;
use thiserror::Error;

use crate::domain::file::ContentRef;

#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Store `bytes` and return their content reference.
    ///
    /// # Returns
    /// * `Ok(ContentRef)` - key of the (possibly pre-existing) object
    /// * `Err(StorageError)` if the object could not be written durably
    async fn put(&self, bytes: &[u8]) -> Result<ContentRef, StorageError>;

    /// Fetch the stored bytes of an object.
    ///
    /// # Returns
    /// * `Ok(Vec<u8>)` - exactly the bytes on disk, unverified
    /// * `Err(StorageError::NotFound)` if the object is missing
    async fn get(&self, content: &ContentRef) -> Result<Vec<u8>, StorageError>;

    async fn contains(&self, content: &ContentRef) -> Result<bool, StorageError>;

    /// Total bytes held by the store.
    async fn usage(&self) -> Result<u64, StorageError>;

    async fn health_check(&self) -> Result<(), StorageError>;
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Object not found: {0}")]
    NotFound(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Invalid path: {0}")]
    InvalidPath(String),

    #[error("Backend unavailable: {0}")]
    Unavailable(String),

    #[error("IO error: {0}")]
    IoError(String),
}

impl From<std::io::Error> for StorageError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => StorageError::NotFound(err.to_string()),
            std::io::ErrorKind::PermissionDenied => StorageError::PermissionDenied(err.to_string()),
            _ => StorageError::IoError(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_error_mapping() {
        let err: StorageError = std::io::Error::new(std::io::ErrorKind::NotFound, "gone").into();
        assert!(matches!(err, StorageError::NotFound(_)));

        let err: StorageError = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "no").into();
        assert!(matches!(err, StorageError::PermissionDenied(_)));

        let err: StorageError = std::io::Error::other("disk on fire").into();
        assert!(matches!(err, StorageError::IoError(_)));
    }
}
