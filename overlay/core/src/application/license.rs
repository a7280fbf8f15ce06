// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Startup license check.
//!
//! The only contact the overlay has with the licensing service. The check
//! never blocks a mount: an unreachable, slow or confused service means
//! free mode, in which `/.magic/api` feeds are replaced by an upgrade note.

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum LicenseError {
    #[error("License service unreachable: {0}")]
    Unreachable(String),

    #[error("License service timed out")]
    Timeout,

    #[error("License service rejected the request: {0}")]
    Rejected(String),

    #[error("Malformed license response: {0}")]
    Malformed(String),
}

#[async_trait]
pub trait LicenseVerifier: Send + Sync {
    async fn verify(&self, key: &str) -> Result<bool, LicenseError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LicenseStatus {
    Licensed { key_hint: String },
    Free { reason: String },
}

impl LicenseStatus {
    pub fn is_licensed(&self) -> bool {
        matches!(self, LicenseStatus::Licensed { .. })
    }

    pub fn free(reason: impl Into<String>) -> Self {
        LicenseStatus::Free {
            reason: reason.into(),
        }
    }
}

fn key_hint(key: &str) -> String {
    let tail: String = key
        .chars()
        .rev()
        .take(4)
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect();
    format!("…{}", tail)
}

/// Resolve the license state for this mount. Never fails.
pub async fn check_license(
    verifier: Option<&dyn LicenseVerifier>,
    key: Option<&str>,
    timeout: Duration,
) -> LicenseStatus {
    let Some(key) = key.map(str::trim).filter(|k| !k.is_empty()) else {
        info!("No license key configured, running in free mode");
        return LicenseStatus::free("no license key");
    };
    let Some(verifier) = verifier else {
        info!("No license endpoint configured, running in free mode");
        return LicenseStatus::free("no license endpoint");
    };

    match tokio::time::timeout(timeout, verifier.verify(key)).await {
        Ok(Ok(true)) => {
            let key_hint = key_hint(key);
            info!(key = %key_hint, "License verified");
            LicenseStatus::Licensed { key_hint }
        }
        Ok(Ok(false)) => {
            warn!("License key is not valid, running in free mode");
            LicenseStatus::free("license key rejected")
        }
        Ok(Err(e)) => {
            warn!(error = %e, "License check failed, running in free mode");
            LicenseStatus::free(e.to_string())
        }
        Err(_) => {
            warn!(timeout = ?timeout, "License check timed out, running in free mode");
            LicenseStatus::free("license check timed out")
        }
    }
}
