#![forbid(unsafe_code)]
//! Key management: password → user key → master key.
//!
//! The superblock stores a random 32-byte master key wrapped under a
//! PBKDF2-HMAC-SHA256 user key. Unlocking derives the user key from the
//! password, unwraps the master key and keeps the plaintext only in
//! memory; locking overwrites it with zeros.
//!
//! There is no key-check value on disk: unwrapping with a wrong password
//! mechanically succeeds and later block decryption yields garbled bytes.

use aes::cipher::{BlockDecrypt, BlockEncrypt, KeyInit};
use aes::Aes256;
use lolfs_error::{LolfsError, Result};
use lolfs_ondisk::Superblock;
use lolfs_types::{EncAlgo, KdfAlgo};
use pbkdf2::pbkdf2_hmac;
use rand::RngCore;
use serde::Serialize;
use sha2::Sha256;
use tracing::{debug, info};

// ── Key derivation and wrapping ─────────────────────────────────────────────

/// Derive the 32-byte user key from a password with PBKDF2-HMAC-SHA256.
#[must_use]
pub fn derive_user_key(password: &[u8], salt: &[u8; 32], iterations: u32) -> [u8; 32] {
    let mut key = [0_u8; 32];
    pbkdf2_hmac::<Sha256>(password, salt, iterations, &mut key);
    key
}

/// Generate a random KDF salt.
#[must_use]
pub fn generate_salt() -> [u8; 32] {
    let mut salt = [0_u8; 32];
    rand::thread_rng().fill_bytes(&mut salt);
    salt
}

/// Generate a random master key.
#[must_use]
pub fn generate_master_key() -> [u8; 32] {
    let mut key = [0_u8; 32];
    rand::thread_rng().fill_bytes(&mut key);
    key
}

/// Wrap the master key under the user key: AES-256-ECB over the two
/// 16-byte halves.
#[must_use]
pub fn wrap_master_key(master: &[u8; 32], user_key: &[u8; 32]) -> [u8; 32] {
    let cipher = Aes256::new(user_key.into());
    let mut wrapped = [0_u8; 32];
    for half in 0..2 {
        let mut block = aes::Block::clone_from_slice(&master[half * 16..(half + 1) * 16]);
        cipher.encrypt_block(&mut block);
        wrapped[half * 16..(half + 1) * 16].copy_from_slice(&block);
    }
    wrapped
}

/// Unwrap the superblock's master key with the user key.
#[must_use]
pub fn unwrap_master_key(wrapped: &[u8; 32], user_key: &[u8; 32]) -> [u8; 32] {
    let cipher = Aes256::new(user_key.into());
    let mut master = [0_u8; 32];
    for half in 0..2 {
        let mut block = aes::Block::clone_from_slice(&wrapped[half * 16..(half + 1) * 16]);
        cipher.decrypt_block(&mut block);
        master[half * 16..(half + 1) * 16].copy_from_slice(&block);
    }
    master
}

// ── Status ──────────────────────────────────────────────────────────────────

/// Answer to the encryption status query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct EncryptionStatus {
    pub enabled: bool,
    pub algorithm: EncAlgo,
    pub unlocked: bool,
}

// ── Key manager ─────────────────────────────────────────────────────────────

/// Per-handle encryption state: locked or unlocked, plus the in-memory
/// master key while unlocked.
pub struct KeyManager {
    enabled: bool,
    algorithm: EncAlgo,
    kdf: KdfAlgo,
    kdf_iterations: u32,
    salt: [u8; 32],
    wrapped: [u8; 32],
    unlocked: bool,
    master: [u8; 32],
}

impl KeyManager {
    /// Build the locked state for a freshly opened image.
    pub fn from_superblock(sb: &Superblock) -> Result<Self> {
        let algorithm = EncAlgo::from_raw(sb.enc_default_algo).ok_or_else(|| {
            LolfsError::Format(format!(
                "unknown encryption algorithm id {}",
                sb.enc_default_algo
            ))
        })?;
        let kdf = KdfAlgo::from_raw(sb.enc_kdf_algo).ok_or_else(|| {
            LolfsError::Format(format!("unknown KDF algorithm id {}", sb.enc_kdf_algo))
        })?;
        Ok(Self {
            enabled: sb.enc_enabled != 0,
            algorithm,
            kdf,
            kdf_iterations: sb.enc_kdf_iterations,
            salt: sb.enc_salt,
            wrapped: sb.enc_master_key,
            unlocked: false,
            master: [0; 32],
        })
    }

    /// State for a filesystem the caller just formatted: the creator
    /// holds the plaintext master key and starts unlocked.
    #[must_use]
    pub fn unlocked_creator(sb: &Superblock, master: [u8; 32]) -> Self {
        Self {
            enabled: sb.enc_enabled != 0,
            algorithm: EncAlgo::from_raw(sb.enc_default_algo).unwrap_or_default(),
            kdf: KdfAlgo::from_raw(sb.enc_kdf_algo).unwrap_or_default(),
            kdf_iterations: sb.enc_kdf_iterations,
            salt: sb.enc_salt,
            wrapped: sb.enc_master_key,
            unlocked: sb.enc_enabled != 0,
            master,
        }
    }

    #[must_use]
    pub fn status(&self) -> EncryptionStatus {
        EncryptionStatus {
            enabled: self.enabled,
            algorithm: self.algorithm,
            unlocked: self.unlocked,
        }
    }

    #[must_use]
    pub fn algorithm(&self) -> EncAlgo {
        self.algorithm
    }

    /// Derive the user key from `password`, unwrap the master key and
    /// transition to unlocked. Idempotent while already unlocked.
    pub fn unlock(&mut self, password: &str) -> Result<()> {
        if !self.enabled {
            return Err(LolfsError::Format(
                "filesystem is not encrypted".into(),
            ));
        }
        if self.unlocked {
            debug!(target: "lolfs::keys", "unlock on already-unlocked filesystem");
            return Ok(());
        }
        if self.kdf != KdfAlgo::Pbkdf2 {
            return Err(LolfsError::Unsupported(format!(
                "KDF {} is not supported for unlock",
                self.kdf
            )));
        }

        let user_key = derive_user_key(password.as_bytes(), &self.salt, self.kdf_iterations);
        self.master = unwrap_master_key(&self.wrapped, &user_key);
        self.unlocked = true;
        info!(target: "lolfs::keys", algorithm = %self.algorithm, "filesystem unlocked");
        Ok(())
    }

    /// Zero the in-memory master key and return to the locked state.
    pub fn lock(&mut self) {
        self.master.fill(0);
        self.unlocked = false;
        info!(target: "lolfs::keys", "filesystem locked");
    }

    /// The plaintext master key; `PermissionDenied` while locked.
    pub fn master_key(&self) -> Result<&[u8; 32]> {
        if !self.enabled {
            return Err(LolfsError::Format(
                "filesystem is not encrypted".into(),
            ));
        }
        if !self.unlocked {
            return Err(LolfsError::PermissionDenied);
        }
        Ok(&self.master)
    }
}

impl Drop for KeyManager {
    fn drop(&mut self) {
        self.master.fill(0);
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
