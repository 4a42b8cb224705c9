//! # Credential Vault
//!
//! Authenticated encryption of provider credentials at rest.
//!
//! ## Record Format
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      Encrypted Credential Record                        │
//! │                                                                         │
//! │   hex(nonce) : hex(tag) : hex(ciphertext)                              │
//! │   ──────────   ────────   ───────────────                              │
//! │   24 chars     32 chars   any even length (empty allowed)              │
//! │   (12 bytes)   (16 bytes)                                              │
//! │                                                                         │
//! │   Legacy records carry a 16-byte nonce (32 hex chars). They still      │
//! │   decrypt; new records always use 12 bytes.                            │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Key Lifecycle
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  open(path)                                                            │
//! │     │                                                                   │
//! │     ├── file exists ────────► length == 32 ? use it : InvalidKeyLength │
//! │     │                                                                   │
//! │     └── missing ──► create_new (0600) ──┬── ok ──► write 32 random bytes│
//! │                                         └── AlreadyExists (lost race)  │
//! │                                                  └──► read winner's key │
//! │                                                                         │
//! │  A key is NEVER regenerated over an existing file.                     │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use aes_gcm::aead::consts::{U12, U16};
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::aes::Aes256;
use aes_gcm::{Aes256Gcm, AesGcm, Nonce};
use thiserror::Error;
use tracing::{debug, info, warn};

use tally_core::Credentials;

/// Length of the AES-256 key in bytes.
pub const KEY_LENGTH: usize = 32;

/// Nonce length of records written today.
const NONCE_LENGTH: usize = 12;

/// Nonce length of records written by older releases.
const LEGACY_NONCE_LENGTH: usize = 16;

/// Length of the GCM authentication tag in bytes.
const TAG_LENGTH: usize = 16;

/// How often a loser of the key-creation race re-reads a short key file.
const RACE_READ_ATTEMPTS: u32 = 10;
const RACE_READ_DELAY: Duration = Duration::from_millis(20);

/// AES-256-GCM with the 128-bit nonce older records used.
type LegacyAes256Gcm = AesGcm<Aes256, U16>;

// =============================================================================
// Vault Error
// =============================================================================

/// Credential vault errors.
#[derive(Debug, Error)]
pub enum VaultError {
    /// The record is malformed or its tag does not verify.
    ///
    /// ## When This Occurs
    /// - The ciphertext or tag was modified
    /// - The record was written with a different key
    /// - The record is not three hex parts of the expected sizes
    #[error("Credential record failed integrity check: {0}")]
    Integrity(String),

    /// The key file exists but does not hold exactly 32 bytes.
    ///
    /// This is fatal: regenerating would orphan every stored record.
    #[error("Credential key must be {KEY_LENGTH} bytes, found {actual}")]
    InvalidKeyLength { actual: usize },

    /// The key file could not be read or created.
    #[error("Credential key file {path}: {source}")]
    KeyFile {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Decrypted (or legacy plaintext) credentials are not a JSON object.
    #[error("Stored credentials are not a JSON object: {0}")]
    MalformedCredentials(String),

    /// The cipher refused to encrypt.
    #[error("Encryption failed")]
    EncryptionFailed,
}

impl VaultError {
    fn key_file(path: &Path, source: io::Error) -> Self {
        VaultError::KeyFile {
            path: path.to_path_buf(),
            source,
        }
    }
}

// =============================================================================
// Credential Vault
// =============================================================================

/// Encrypts and decrypts credential records with one process-wide key.
#[derive(Clone)]
pub struct CredentialVault {
    cipher: Aes256Gcm,
    legacy: LegacyAes256Gcm,
}

impl CredentialVault {
    /// Builds a vault from raw key bytes.
    pub fn from_key(key: &[u8]) -> Result<Self, VaultError> {
        if key.len() != KEY_LENGTH {
            return Err(VaultError::InvalidKeyLength { actual: key.len() });
        }

        let cipher = Aes256Gcm::new_from_slice(key)
            .map_err(|_| VaultError::InvalidKeyLength { actual: key.len() })?;
        let legacy = LegacyAes256Gcm::new_from_slice(key)
            .map_err(|_| VaultError::InvalidKeyLength { actual: key.len() })?;

        Ok(CredentialVault { cipher, legacy })
    }

    /// Opens the vault backed by the key file at `path`, creating the key on
    /// first use.
    ///
    /// Blocking: file I/O, plus short sleeps when another process is writing
    /// the key at the same moment. Inside a Tokio runtime use
    /// [`CredentialVault::open_async`].
    pub fn open(path: impl AsRef<Path>) -> Result<Self, VaultError> {
        let key = load_or_create_key(path.as_ref())?;
        Self::from_key(&key)
    }

    /// [`CredentialVault::open`] on the blocking thread pool.
    pub async fn open_async(path: impl Into<PathBuf>) -> Result<Self, VaultError> {
        let path = path.into();
        let task_path = path.clone();

        tokio::task::spawn_blocking(move || Self::open(task_path))
            .await
            .map_err(|e| VaultError::key_file(&path, io::Error::new(io::ErrorKind::Other, e)))?
    }

    /// Encrypts `plaintext` under a fresh random nonce.
    pub fn encrypt(&self, plaintext: &str) -> Result<String, VaultError> {
        let nonce_bytes = rand::random::<[u8; NONCE_LENGTH]>();
        let nonce = Nonce::<U12>::from_slice(&nonce_bytes);

        let sealed = self
            .cipher
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|_| VaultError::EncryptionFailed)?;

        // aes-gcm appends the tag to the ciphertext.
        let (ciphertext, tag) = sealed.split_at(sealed.len() - TAG_LENGTH);

        Ok(format!(
            "{}:{}:{}",
            hex::encode(nonce_bytes),
            hex::encode(tag),
            hex::encode(ciphertext)
        ))
    }

    /// Decrypts a `nonce:tag:ciphertext` record.
    pub fn decrypt(&self, record: &str) -> Result<String, VaultError> {
        let parts: Vec<&str> = record.trim().split(':').collect();
        if parts.len() != 3 {
            return Err(VaultError::Integrity(format!(
                "expected 3 parts, found {}",
                parts.len()
            )));
        }

        let nonce = decode_part("nonce", parts[0])?;
        let tag = decode_part("tag", parts[1])?;
        let ciphertext = decode_part("ciphertext", parts[2])?;

        if tag.len() != TAG_LENGTH {
            return Err(VaultError::Integrity(format!(
                "tag must be {} bytes, found {}",
                TAG_LENGTH,
                tag.len()
            )));
        }

        let mut sealed = ciphertext;
        sealed.extend_from_slice(&tag);

        let opened = match nonce.len() {
            NONCE_LENGTH => self
                .cipher
                .decrypt(Nonce::<U12>::from_slice(&nonce), sealed.as_slice()),
            LEGACY_NONCE_LENGTH => self
                .legacy
                .decrypt(Nonce::<U16>::from_slice(&nonce), sealed.as_slice()),
            other => {
                return Err(VaultError::Integrity(format!(
                    "nonce must be {} or {} bytes, found {}",
                    NONCE_LENGTH, LEGACY_NONCE_LENGTH, other
                )))
            }
        }
        .map_err(|_| VaultError::Integrity("authentication tag mismatch".into()))?;

        String::from_utf8(opened)
            .map_err(|_| VaultError::Integrity("plaintext is not valid UTF-8".into()))
    }

    /// Serializes and encrypts a credential map.
    pub fn encrypt_credentials(&self, credentials: &Credentials) -> Result<String, VaultError> {
        let json = serde_json::to_string(credentials)
            .map_err(|e| VaultError::MalformedCredentials(e.to_string()))?;
        self.encrypt(&json)
    }

    /// Decrypts a stored credential blob.
    ///
    /// Blobs that are not encrypted records are read as plaintext JSON; rows
    /// written before encryption was introduced look like that until
    /// `AccountService::migrate_plaintext_credentials` rewrites them.
    pub fn decrypt_credentials(&self, stored: &str) -> Result<Credentials, VaultError> {
        if is_encrypted(stored) {
            let json = self.decrypt(stored)?;
            return serde_json::from_str(&json)
                .map_err(|e| VaultError::MalformedCredentials(e.to_string()));
        }

        match serde_json::from_str::<Credentials>(stored) {
            Ok(credentials) => {
                debug!("Read legacy plaintext credentials");
                Ok(credentials)
            }
            Err(_) => Err(VaultError::Integrity(
                "stored credentials are neither an encrypted record nor JSON".into(),
            )),
        }
    }
}

impl std::fmt::Debug for CredentialVault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialVault")
            .field("key", &"[REDACTED]")
            .finish()
    }
}

/// Returns true if `value` has the shape of an encrypted record.
pub fn is_encrypted(value: &str) -> bool {
    let parts: Vec<&str> = value.trim().split(':').collect();
    if parts.len() != 3 {
        return false;
    }

    let is_hex = |s: &str| s.bytes().all(|b| b.is_ascii_hexdigit());
    let (nonce, tag, ciphertext) = (parts[0], parts[1], parts[2]);

    (nonce.len() == NONCE_LENGTH * 2 || nonce.len() == LEGACY_NONCE_LENGTH * 2)
        && tag.len() == TAG_LENGTH * 2
        && ciphertext.len() % 2 == 0
        && is_hex(nonce)
        && is_hex(tag)
        && is_hex(ciphertext)
}

fn decode_part(name: &str, part: &str) -> Result<Vec<u8>, VaultError> {
    hex::decode(part).map_err(|_| VaultError::Integrity(format!("{} is not valid hex", name)))
}

// =============================================================================
// Key File
// =============================================================================

/// Reads the key at `path`, or creates it with exclusive-create semantics.
fn load_or_create_key(path: &Path) -> Result<[u8; KEY_LENGTH], VaultError> {
    match fs::read(path) {
        Ok(bytes) if bytes.len() < KEY_LENGTH => return read_winner_key(path),
        Ok(bytes) => return key_from_bytes(&bytes),
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => return Err(VaultError::key_file(path, err)),
    }

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|e| VaultError::key_file(path, e))?;
    }

    let key = rand::random::<[u8; KEY_LENGTH]>();
    match create_key_file(path, &key) {
        Ok(()) => {
            info!(path = %path.display(), "Generated new credential key");
            Ok(key)
        }
        Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
            debug!(path = %path.display(), "Key file created concurrently, reading it");
            read_winner_key(path)
        }
        Err(err) => Err(VaultError::key_file(path, err)),
    }
}

fn create_key_file(path: &Path, key: &[u8; KEY_LENGTH]) -> io::Result<()> {
    let mut options = OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }

    let mut file = options.open(path)?;
    let written = file.write_all(key).and_then(|()| file.sync_all());
    if let Err(err) = written {
        // A half-written key would be fatal on the next start.
        drop(file);
        let _ = fs::remove_file(path);
        return Err(err);
    }

    Ok(())
}

/// Reads a key another process or thread just created.
///
/// The winner may not have finished writing, so a short file is re-read a
/// few times before its length is judged.
fn read_winner_key(path: &Path) -> Result<[u8; KEY_LENGTH], VaultError> {
    let mut bytes = Vec::new();
    for _ in 0..RACE_READ_ATTEMPTS {
        bytes = fs::read(path).map_err(|e| VaultError::key_file(path, e))?;
        if bytes.len() >= KEY_LENGTH {
            break;
        }
        std::thread::sleep(RACE_READ_DELAY);
    }

    if bytes.len() != KEY_LENGTH {
        warn!(path = %path.display(), len = bytes.len(), "Key file has unexpected length");
    }
    key_from_bytes(&bytes)
}

fn key_from_bytes(bytes: &[u8]) -> Result<[u8; KEY_LENGTH], VaultError> {
    <[u8; KEY_LENGTH]>::try_from(bytes)
        .map_err(|_| VaultError::InvalidKeyLength { actual: bytes.len() })
}

// =============================================================================
// Unit Tests
// =============================================================================
