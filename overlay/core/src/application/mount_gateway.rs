// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Mount Gateway Application Service
//!
//! Owns the lifecycle of one mount: license check, context, engine, event
//! logger and the NFS listener.
//!
//! ## Startup order
//! 1. Event bus and logger
//! 2. License check (never fails; falls back to free mode)
//! 3. `MountContext::open` (index, object store, vault unlock)
//! 4. `OverlayEngine::start` (import, job recovery)
//! 5. NFS listener
//!
//! Shutdown runs in reverse: the listener stops accepting calls first, then
//! the engine drains in-flight calls and flushes the index.

use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::application::context::MountContext;
use crate::application::event_logger::OverlayEventLogger;
use crate::application::license::{check_license, LicenseStatus, LicenseVerifier};
use crate::application::overlay_engine::{OverlayEngine, OverlayError};
use crate::domain::mount_config::MountSpec;
use crate::infrastructure::analyzers::builtin_analyzers;
use crate::infrastructure::event_bus::EventBus;
use crate::infrastructure::image_convert::ImageFormatConverter;
use crate::infrastructure::license_client::HttpLicenseVerifier;
use crate::infrastructure::nfs::{NfsServer, NfsServerError};
use crate::infrastructure::web_fetch::HttpLinkFetcher;

/// Mount gateway errors
#[derive(Debug, Error)]
pub enum MountGatewayError {
    #[error("Mount already running")]
    AlreadyRunning,

    #[error("Mount not running")]
    NotRunning,

    #[error("Mount startup failed: {0:#}")]
    Startup(anyhow::Error),

    #[error("NFS server error: {0}")]
    Server(#[from] NfsServerError),

    #[error("Overlay error: {0}")]
    Overlay(#[from] OverlayError),
}

struct RunningMount {
    engine: Arc<OverlayEngine>,
    nfs_server: NfsServer,
    logger: JoinHandle<()>,
}

/// Lifecycle service for a single mount.
pub struct MountGateway {
    spec: MountSpec,
    running: Mutex<Option<RunningMount>>,
    /// Serializes start and stop.
    lifecycle: tokio::sync::Mutex<()>,
}

impl MountGateway {
    pub fn new(spec: MountSpec) -> Self {
        Self {
            spec,
            running: Mutex::new(None),
            lifecycle: tokio::sync::Mutex::new(()),
        }
    }

    pub fn spec(&self) -> &MountSpec {
        &self.spec
    }

    /// Bring the mount up and start serving NFS.
    ///
    /// # Errors
    /// - `AlreadyRunning` if the mount is already up
    /// - `Startup` if the store, the vault or the engine could not be opened
    /// - `Server` if the listener could not bind
    pub async fn start(&self) -> Result<(), MountGatewayError> {
        let _lifecycle = self.lifecycle.lock().await;
        if self.running.lock().is_some() {
            return Err(MountGatewayError::AlreadyRunning);
        }

        info!(source = %self.spec.source.display(), "Starting mount");

        let event_bus = Arc::new(EventBus::with_default_capacity());
        let logger = OverlayEventLogger::new(event_bus.clone()).start();

        let license = self.license().await;
        let secret = read_env(&self.spec.vault.secret_env);

        let engine = match self.open_engine(event_bus, license, secret.as_deref()).await {
            Ok(engine) => engine,
            Err(e) => {
                logger.abort();
                return Err(MountGatewayError::Startup(e));
            }
        };

        let nfs_server = NfsServer::new(engine.clone(), self.spec.nfs.bind_address.clone(), self.spec.nfs.port);
        if let Err(e) = nfs_server.start().await {
            engine.shutdown().await?;
            logger.abort();
            return Err(e.into());
        }

        *self.running.lock() = Some(RunningMount {
            engine,
            nfs_server,
            logger,
        });

        info!("Mount started successfully");
        Ok(())
    }

    /// Stop serving and shut the engine down.
    ///
    /// # Errors
    /// - `NotRunning` if the mount is not up
    pub async fn stop(&self) -> Result<(), MountGatewayError> {
        let _lifecycle = self.lifecycle.lock().await;
        let running = self.running.lock().take().ok_or(MountGatewayError::NotRunning)?;

        info!("Stopping mount");
        running.nfs_server.stop().await?;
        running.engine.shutdown().await?;
        running.logger.abort();

        debug!("Mount stopped");
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.running
            .lock()
            .as_ref()
            .is_some_and(|r| r.nfs_server.is_running() && r.engine.is_running())
    }

    /// Engine of the running mount.
    pub fn engine(&self) -> Option<Arc<OverlayEngine>> {
        self.running.lock().as_ref().map(|r| r.engine.clone())
    }

    pub fn bind_port(&self) -> u16 {
        self.spec.nfs.port
    }

    async fn license(&self) -> LicenseStatus {
        let settings = &self.spec.license;
        let key = read_env(&settings.key_env);
        let verifier = match settings.endpoint.as_deref() {
            Some(endpoint) => match HttpLicenseVerifier::new(endpoint, settings.timeout) {
                Ok(verifier) => Some(verifier),
                Err(e) => {
                    warn!(error = %e, "Could not build license client");
                    None
                }
            },
            None => None,
        };
        check_license(
            verifier.as_ref().map(|v| v as &dyn LicenseVerifier),
            key.as_deref(),
            settings.timeout,
        )
        .await
    }

    async fn open_engine(
        &self,
        event_bus: Arc<EventBus>,
        license: LicenseStatus,
        secret: Option<&str>,
    ) -> anyhow::Result<Arc<OverlayEngine>> {
        let ctx = MountContext::open(self.spec.clone(), secret.map(str::as_bytes), license, event_bus).await?;
        let fetcher = HttpLinkFetcher::new(self.spec.views.web_fetch_timeout)?;
        OverlayEngine::start(
            Arc::new(ctx),
            builtin_analyzers(),
            Arc::new(fetcher),
            Arc::new(ImageFormatConverter::new()),
        )
        .await
    }
}

fn read_env(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn spec(dir: &TempDir) -> MountSpec {
        let mut spec = MountSpec::for_source(dir.path());
        spec.nfs.bind_address = "127.0.0.1".to_string();
        spec.nfs.port = 0;
        spec.vault.secret_env = "EIDETIC_TEST_UNSET_VAULT_SECRET".to_string();
        spec.license.key_env = "EIDETIC_TEST_UNSET_LICENSE_KEY".to_string();
        spec
    }

    #[tokio::test]
    async fn test_gateway_lifecycle() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("readme.txt"), b"hello").unwrap();
        let gateway = MountGateway::new(spec(&dir));

        assert!(matches!(gateway.stop().await, Err(MountGatewayError::NotRunning)));

        gateway.start().await.unwrap();
        assert!(gateway.is_running());
        assert!(matches!(gateway.start().await, Err(MountGatewayError::AlreadyRunning)));

        let engine = gateway.engine().unwrap();
        assert_eq!(engine.read_all("/readme.txt").await.unwrap(), b"hello");
        assert!(!engine.context().license().is_licensed());

        gateway.stop().await.unwrap();
        assert!(!gateway.is_running());
        assert!(gateway.engine().is_none());
        assert!(matches!(engine.getattr("/readme.txt").await, Err(OverlayError::ShuttingDown)));
    }

    #[tokio::test]
    async fn test_gateway_rejects_missing_source() {
        let dir = TempDir::new().unwrap();
        let mut spec = spec(&dir);
        spec.source = dir.path().join("does-not-exist");
        let gateway = MountGateway::new(spec);

        assert!(matches!(gateway.start().await, Err(MountGatewayError::Startup(_))));
        assert!(!gateway.is_running());
    }
}
