// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Vault Codec
//!
//! Transparent encryption for the vault subtree, composed from AES-256-GCM.
//!
//! - The key is derived once per mount with HKDF-SHA256 from the process
//!   secret and a random per-store salt. Neither the secret nor the key is
//!   ever written to disk; only the salt and a key-check value are.
//! - Every version gets a fresh 96-bit nonce.
//! - The associated data binds a ciphertext to its `(file id, version)`, so
//!   swapping objects between versions fails authentication.
//!
//! Losing the secret makes vaulted content unrecoverable.

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use hkdf::Hkdf;
use rand_core::{OsRng, RngCore};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, warn};
use zeroize::Zeroizing;

use crate::domain::file::{FileId, VersionId};
use crate::domain::vault::{VaultEntry, VaultPolicy};

const KEY_INFO: &[u8] = b"eidetic vault v1";
const CHECK_INFO: &[u8] = b"eidetic vault check v1";
pub const SALT_LEN: usize = 16;

#[derive(Debug, Error)]
pub enum VaultError {
    #[error("Vault is locked: no secret configured")]
    Locked,

    #[error("Path is outside the vault: {0}")]
    NotVaulted(String),

    #[error("Authentication failed for {path} {version}")]
    Integrity { path: String, version: VersionId },

    #[error("Vault secret does not match this store")]
    KeyMismatch,

    #[error("Key derivation failed: {0}")]
    KeyDerivation(String),

    #[error("Encryption failed: {0}")]
    Encrypt(String),
}

pub struct VaultCodec {
    cipher: Aes256Gcm,
    key_check: [u8; 32],
    key_ref: String,
    policy: VaultPolicy,
}

impl VaultCodec {
    /// Derive the vault key from `secret` and the store's `salt`.
    pub fn derive(secret: &[u8], salt: &[u8], policy: VaultPolicy) -> Result<Self, VaultError> {
        if secret.is_empty() {
            return Err(VaultError::Locked);
        }
        let hk = Hkdf::<Sha256>::new(Some(salt), secret);

        let mut key = Zeroizing::new([0u8; 32]);
        hk.expand(KEY_INFO, &mut key[..])
            .map_err(|e| VaultError::KeyDerivation(e.to_string()))?;

        let mut key_check = [0u8; 32];
        hk.expand(CHECK_INFO, &mut key_check)
            .map_err(|e| VaultError::KeyDerivation(e.to_string()))?;

        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key[..]));
        let key_ref = hex::encode(&Sha256::digest(key_check)[..8]);
        debug!(key_ref = %key_ref, root = %policy.root(), "Derived vault key");

        Ok(Self {
            cipher,
            key_check,
            key_ref,
            policy,
        })
    }

    /// Fresh random salt for a new store.
    pub fn generate_salt() -> [u8; SALT_LEN] {
        let mut salt = [0u8; SALT_LEN];
        OsRng.fill_bytes(&mut salt);
        salt
    }

    /// Value persisted at first mount so a wrong secret is caught at startup.
    pub fn key_check(&self) -> &[u8; 32] {
        &self.key_check
    }

    pub fn verify_key_check(&self, stored: &[u8]) -> Result<(), VaultError> {
        if stored == self.key_check.as_slice() {
            Ok(())
        } else {
            warn!("Vault key check mismatch");
            Err(VaultError::KeyMismatch)
        }
    }

    pub fn key_ref(&self) -> &str {
        &self.key_ref
    }

    pub fn policy(&self) -> &VaultPolicy {
        &self.policy
    }

    pub fn is_vaulted(&self, path: &str) -> bool {
        self.policy.contains(path)
    }

    fn aad(file_id: FileId, version: VersionId) -> [u8; 16] {
        let mut aad = [0u8; 16];
        aad[..8].copy_from_slice(&file_id.to_be_bytes());
        aad[8..].copy_from_slice(&version.to_be_bytes());
        aad
    }

    /// Encrypt the plaintext of one version of a vaulted path.
    pub fn encrypt_for_store(
        &self,
        path: &str,
        file_id: FileId,
        version: VersionId,
        plaintext: &[u8],
    ) -> Result<(Vec<u8>, VaultEntry), VaultError> {
        if !self.is_vaulted(path) {
            return Err(VaultError::NotVaulted(path.to_string()));
        }

        let mut nonce = [0u8; 12];
        OsRng.fill_bytes(&mut nonce);
        let aad = Self::aad(file_id, version);

        let ciphertext = self
            .cipher
            .encrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: plaintext,
                    aad: &aad,
                },
            )
            .map_err(|e| VaultError::Encrypt(e.to_string()))?;

        Ok((
            ciphertext,
            VaultEntry {
                key_ref: self.key_ref.clone(),
                nonce,
            },
        ))
    }

    /// Decrypt and authenticate a stored version. Any tampering with the
    /// ciphertext, nonce or version binding is an `Integrity` error.
    pub fn decrypt_for_read(
        &self,
        path: &str,
        file_id: FileId,
        version: VersionId,
        ciphertext: &[u8],
        entry: &VaultEntry,
    ) -> Result<Vec<u8>, VaultError> {
        if entry.key_ref != self.key_ref {
            warn!(path = %path, stored = %entry.key_ref, current = %self.key_ref, "Vault entry was sealed with another key");
        }
        let aad = Self::aad(file_id, version);
        self.cipher
            .decrypt(
                Nonce::from_slice(&entry.nonce),
                Payload {
                    msg: ciphertext,
                    aad: &aad,
                },
            )
            .map_err(|_| VaultError::Integrity {
                path: path.to_string(),
                version,
            })
    }
}
