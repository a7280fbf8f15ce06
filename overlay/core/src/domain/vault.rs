// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Vault subtree rules and per-version cipher bookkeeping.

use serde::{Deserialize, Serialize};

/// Nonce and key reference stored alongside every vaulted version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VaultEntry {
    /// Fingerprint of the derived key; never the key itself.
    pub key_ref: String,
    pub nonce: [u8; 12],
}

/// Decides which mount paths belong to the protected subtree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VaultPolicy {
    root: String,
}

impl VaultPolicy {
    pub fn new(root: impl Into<String>) -> Self {
        let root = root.into();
        let trimmed = root.trim_end_matches('/');
        let root = if trimmed.starts_with('/') {
            trimmed.to_string()
        } else {
            format!("/{}", trimmed)
        };
        Self { root }
    }

    pub fn root(&self) -> &str {
        &self.root
    }

    /// True for the vault root itself and everything beneath it.
    pub fn contains(&self, path: &str) -> bool {
        path == self.root
            || path
                .strip_prefix(self.root.as_str())
                .is_some_and(|rest| rest.starts_with('/'))
    }
}

impl Default for VaultPolicy {
    fn default() -> Self {
        Self::new("/vault")
    }
}
