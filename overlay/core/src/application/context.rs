// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Mount Context
//!
//! Everything one mount needs, built once at startup and shared read-only
//! by every component: the configuration, the source tree, the metadata
//! index, the blob store, the vault codec (when unlocked), the event sink
//! and the license state.
//!
//! Nothing here is global. Two contexts over two directories can live in
//! the same process, which is how the integration tests run.

use anyhow::{Context as _, Result};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

use crate::application::license::LicenseStatus;
use crate::domain::events::EventPublisher;
use crate::domain::index::MetadataIndex;
use crate::domain::mount_config::MountSpec;
use crate::domain::path_sanitizer::{PathSanitizer, STORE_DIR_NAME};
use crate::domain::storage::BlobStore;
use crate::domain::vault::VaultPolicy;
use crate::infrastructure::sled_index::SledMetadataIndex;
use crate::infrastructure::storage::{LocalBlobStore, SourceTree};
use crate::infrastructure::vault_codec::VaultCodec;

const VAULT_SALT_KEY: &str = "vault.salt";
const VAULT_CHECK_KEY: &str = "vault.check";

pub struct MountContext {
    spec: MountSpec,
    source: SourceTree,
    index: Arc<dyn MetadataIndex>,
    blobs: Arc<dyn BlobStore>,
    vault: Option<Arc<VaultCodec>>,
    vault_policy: VaultPolicy,
    events: Arc<dyn EventPublisher>,
    license: LicenseStatus,
    sanitizer: PathSanitizer,
}

impl MountContext {
    /// Open (or initialise) the store under `<source>/.eidetic`.
    ///
    /// Any problem with the metadata store, the object directory or the
    /// vault secret aborts startup; the mount never runs on partial state.
    pub async fn open(
        spec: MountSpec,
        secret: Option<&[u8]>,
        license: LicenseStatus,
        events: Arc<dyn EventPublisher>,
    ) -> Result<Self> {
        spec.validate()?;

        let source_root = std::fs::canonicalize(&spec.source)
            .with_context(|| format!("Source directory {} is not accessible", spec.source.display()))?;
        if !source_root.is_dir() {
            anyhow::bail!("Source {} is not a directory", source_root.display());
        }

        let store_dir: PathBuf = source_root.join(STORE_DIR_NAME);
        std::fs::create_dir_all(&store_dir)
            .with_context(|| format!("Failed to create store directory {}", store_dir.display()))?;

        let index = SledMetadataIndex::open(store_dir.join("index"), spec.durable_commits)
            .context("Failed to open metadata index")?;
        let index: Arc<dyn MetadataIndex> = Arc::new(index);

        let blobs = LocalBlobStore::new(store_dir.join("objects")).context("Failed to open object store")?;
        blobs.health_check().await.context("Object store health check failed")?;
        let blobs: Arc<dyn BlobStore> = Arc::new(blobs);

        let vault_policy = VaultPolicy::new(spec.vault.root.clone());
        let vault = match secret.filter(|s| !s.is_empty()) {
            Some(secret) => Some(Arc::new(unlock_vault(index.as_ref(), secret, vault_policy.clone()).await?)),
            None => {
                warn!(
                    root = %vault_policy.root(),
                    env = %spec.vault.secret_env,
                    "No vault secret configured, vault is locked"
                );
                None
            }
        };

        info!(
            source = %source_root.display(),
            store = %store_dir.display(),
            vault = vault.is_some(),
            licensed = license.is_licensed(),
            "Mount context ready"
        );

        let mut spec = spec;
        spec.source = source_root.clone();

        Ok(Self::from_parts(
            spec,
            SourceTree::new(source_root),
            index,
            blobs,
            vault,
            events,
            license,
        ))
    }

    /// Assemble a context from already-built collaborators.
    pub fn from_parts(
        spec: MountSpec,
        source: SourceTree,
        index: Arc<dyn MetadataIndex>,
        blobs: Arc<dyn BlobStore>,
        vault: Option<Arc<VaultCodec>>,
        events: Arc<dyn EventPublisher>,
        license: LicenseStatus,
    ) -> Self {
        let vault_policy = vault
            .as_ref()
            .map(|codec| codec.policy().clone())
            .unwrap_or_else(|| VaultPolicy::new(spec.vault.root.clone()));
        Self {
            spec,
            source,
            index,
            blobs,
            vault,
            vault_policy,
            events,
            license,
            sanitizer: PathSanitizer::new(),
        }
    }

    pub fn spec(&self) -> &MountSpec {
        &self.spec
    }

    pub fn source(&self) -> &SourceTree {
        &self.source
    }

    pub fn index(&self) -> &Arc<dyn MetadataIndex> {
        &self.index
    }

    pub fn blobs(&self) -> &Arc<dyn BlobStore> {
        &self.blobs
    }

    pub fn vault(&self) -> Option<&Arc<VaultCodec>> {
        self.vault.as_ref()
    }

    pub fn vault_policy(&self) -> &VaultPolicy {
        &self.vault_policy
    }

    pub fn events(&self) -> &Arc<dyn EventPublisher> {
        &self.events
    }

    pub fn license(&self) -> &LicenseStatus {
        &self.license
    }

    pub fn sanitizer(&self) -> &PathSanitizer {
        &self.sanitizer
    }
}

/// Derive the vault key, creating the salt and key check on first use and
/// rejecting a secret that does not match an existing store.
async fn unlock_vault(index: &dyn MetadataIndex, secret: &[u8], policy: VaultPolicy) -> Result<VaultCodec> {
    let salt = match index.get_meta(VAULT_SALT_KEY).await? {
        Some(salt) => salt,
        None => {
            let salt = VaultCodec::generate_salt().to_vec();
            index.put_meta(VAULT_SALT_KEY, &salt).await?;
            info!("Initialised vault salt");
            salt
        }
    };

    let codec = VaultCodec::derive(secret, &salt, policy)?;

    match index.get_meta(VAULT_CHECK_KEY).await? {
        Some(stored) => codec
            .verify_key_check(&stored)
            .context("Vault secret does not match the one this store was created with")?,
        None => index.put_meta(VAULT_CHECK_KEY, codec.key_check()).await?,
    }

    Ok(codec)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::events::NullEventPublisher;
    use tempfile::TempDir;

    fn spec_for(dir: &TempDir) -> MountSpec {
        MountSpec::for_source(dir.path())
    }

    #[tokio::test]
    async fn test_open_creates_store() {
        let dir = TempDir::new().unwrap();
        let ctx = MountContext::open(
            spec_for(&dir),
            None,
            LicenseStatus::free("test"),
            Arc::new(NullEventPublisher),
        )
        .await
        .unwrap();

        assert!(dir.path().join(".eidetic/objects").is_dir());
        assert!(ctx.vault().is_none());
        assert!(ctx.index().get_record("/").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_wrong_vault_secret_aborts_startup() {
        let dir = TempDir::new().unwrap();
        {
            let ctx = MountContext::open(
                spec_for(&dir),
                Some(b"first secret"),
                LicenseStatus::free("test"),
                Arc::new(NullEventPublisher),
            )
            .await
            .unwrap();
            assert!(ctx.vault().is_some());
            ctx.index().flush().await.unwrap();
        }

        let reopened = MountContext::open(
            spec_for(&dir),
            Some(b"another secret"),
            LicenseStatus::free("test"),
            Arc::new(NullEventPublisher),
        )
        .await;
        assert!(reopened.is_err());
    }

    #[tokio::test]
    async fn test_missing_source_is_fatal() {
        let dir = TempDir::new().unwrap();
        let spec = MountSpec::for_source(dir.path().join("does-not-exist"));
        let result = MountContext::open(spec, None, LicenseStatus::free("test"), Arc::new(NullEventPublisher)).await;
        assert!(result.is_err());
    }
}
