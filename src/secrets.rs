//! Encrypted pipeline credentials.
//!
//! Blobs at rest are `base64(nonce || ciphertext)` sealed with
//! XChaCha20-Poly1305. The symmetric key is derived with HKDF-SHA256 from the
//! run's key and salt, and the secret's reference name is bound as associated
//! data so a blob cannot be replayed under another name.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chacha20poly1305::aead::{Aead, AeadCore, KeyInit, OsRng, Payload};
use chacha20poly1305::{Key, XChaCha20Poly1305, XNonce};
use hkdf::Hkdf;
use secrecy::SecretString;
use sha2::Sha256;
use tracing::debug;
use zeroize::Zeroizing;

use crate::definition::SecretsSpec;
use crate::error::{PipelineError, PipelineResult};

const KEY_INFO: &[u8] = b"release-pipeline/secret-store/v1";
const NONCE_LEN: usize = 24;

/// Holds the decryption inputs and the locations of encrypted blobs.
/// Plaintext never outlives the closure it is lent to.
pub struct SecretStore {
    root: PathBuf,
    entries: BTreeMap<String, PathBuf>,
    key: Option<Zeroizing<Vec<u8>>>,
    salt: Option<Zeroizing<Vec<u8>>>,
    resolutions: AtomicUsize,
}

impl std::fmt::Debug for SecretStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretStore")
            .field("entries", &self.entries.keys().collect::<Vec<_>>())
            .field("key", &self.key.as_ref().map(|_| "<redacted>"))
            .field("salt", &self.salt.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl SecretStore {
    pub fn new(
        root: impl Into<PathBuf>,
        entries: BTreeMap<String, PathBuf>,
        key: Option<Zeroizing<Vec<u8>>>,
        salt: Option<Zeroizing<Vec<u8>>>,
    ) -> Self {
        Self {
            root: root.into(),
            entries,
            key,
            salt,
            resolutions: AtomicUsize::new(0),
        }
    }

    /// Build a store whose key and salt come from the environment variables
    /// named in `spec`. Missing variables only fail once a secret is resolved.
    pub fn from_env(spec: &SecretsSpec, root: &Path) -> Self {
        let read = |name: &str| {
            std::env::var(name)
                .ok()
                .filter(|value| !value.is_empty())
                .map(|value| Zeroizing::new(value.into_bytes()))
        };
        let entries = spec
            .entries
            .iter()
            .map(|(name, entry)| (name.clone(), entry.path.clone()))
            .collect();
        Self::new(root, entries, read(&spec.key_env), read(&spec.salt_env))
    }

    pub fn contains(&self, reference: &str) -> bool {
        self.entries.contains_key(reference)
    }

    /// Number of times any secret has been decrypted by this store.
    pub fn resolution_count(&self) -> usize {
        self.resolutions.load(Ordering::SeqCst)
    }

    pub fn resolve(&self, reference: &str) -> PipelineResult<SecretString> {
        let failure = |reason: String| PipelineError::DecryptionError {
            reference: reference.to_string(),
            reason,
        };
        let relative = self
            .entries
            .get(reference)
            .ok_or_else(|| failure("no such secret is declared".into()))?;
        let key = self
            .key
            .as_ref()
            .ok_or_else(|| failure("decryption key was not supplied".into()))?;
        let salt = self
            .salt
            .as_ref()
            .ok_or_else(|| failure("decryption salt was not supplied".into()))?;

        let path = if relative.is_absolute() {
            relative.clone()
        } else {
            self.root.join(relative)
        };
        let encoded = std::fs::read_to_string(&path)
            .map_err(|err| failure(format!("cannot read {}: {err}", path.display())))?;

        self.resolutions.fetch_add(1, Ordering::SeqCst);
        let plaintext = open(key, salt, reference, encoded.trim())?;
        let text = String::from_utf8(plaintext.to_vec())
            .map_err(|_| failure("plaintext is not valid UTF-8".into()))?;
        debug!(secret = reference, "Secret resolved");
        Ok(SecretString::from(text))
    }

    /// Lend the decrypted secret to `f` and drop it as soon as `f` returns.
    pub fn with_secret<T>(
        &self,
        reference: &str,
        f: impl FnOnce(&SecretString) -> PipelineResult<T>,
    ) -> PipelineResult<T> {
        let secret = self.resolve(reference)?;
        f(&secret)
    }
}

fn derive_key(key: &[u8], salt: &[u8]) -> PipelineResult<Zeroizing<[u8; 32]>> {
    let hk = Hkdf::<Sha256>::new(Some(salt), key);
    let mut out = Zeroizing::new([0u8; 32]);
    hk.expand(KEY_INFO, out.as_mut())
        .map_err(|err| PipelineError::DecryptionError {
            reference: String::new(),
            reason: format!("key derivation failed: {err}"),
        })?;
    Ok(out)
}

/// Encrypt `plaintext` for storage under `reference`.
pub fn seal(key: &[u8], salt: &[u8], reference: &str, plaintext: &[u8]) -> PipelineResult<String> {
    let derived = derive_key(key, salt)?;
    let cipher = XChaCha20Poly1305::new(Key::from_slice(derived.as_ref()));
    let nonce = XChaCha20Poly1305::generate_nonce(&mut OsRng);
    let ciphertext = cipher
        .encrypt(
            &nonce,
            Payload {
                msg: plaintext,
                aad: reference.as_bytes(),
            },
        )
        .map_err(|err| PipelineError::DecryptionError {
            reference: reference.to_string(),
            reason: format!("encryption failed: {err}"),
        })?;

    let mut blob = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    blob.extend_from_slice(&nonce);
    blob.extend_from_slice(&ciphertext);
    Ok(STANDARD.encode(blob))
}

/// Decrypt a blob produced by [`seal`].
pub fn open(
    key: &[u8],
    salt: &[u8],
    reference: &str,
    encoded: &str,
) -> PipelineResult<Zeroizing<Vec<u8>>> {
    let failure = |reason: &str| PipelineError::DecryptionError {
        reference: reference.to_string(),
        reason: reason.to_string(),
    };
    let blob = STANDARD
        .decode(encoded)
        .map_err(|_| failure("blob is not valid base64"))?;
    if blob.len() <= NONCE_LEN {
        return Err(failure("blob is too short"));
    }
    let (nonce, ciphertext) = blob.split_at(NONCE_LEN);
    let derived = derive_key(key, salt)?;
    let cipher = XChaCha20Poly1305::new(Key::from_slice(derived.as_ref()));
    let plaintext = cipher
        .decrypt(
            XNonce::from_slice(nonce),
            Payload {
                msg: ciphertext,
                aad: reference.as_bytes(),
            },
        )
        .map_err(|_| failure("authentication failed (wrong key, salt or blob)"))?;
    Ok(Zeroizing::new(plaintext))
}
