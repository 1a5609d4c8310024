//! Software-isolated keystore for the device's hardware-backed keypair.
//!
//! The store hands out signing and public-key export only. Private key
//! material stays inside the store: it is generated here, persisted under a
//! private directory that stands in for the platform secure element, and
//! never returned, logged, or serialized by any public method. Callers hold
//! an alias, not key bytes.
//!
//! A key created for an alias is reused on every subsequent call for the
//! lifetime of the installation; `load_or_create` with an existing alias
//! always returns the same public key.

use p256::ecdsa::signature::Signer as _;
use p256::ecdsa::{Signature, SigningKey};
use p256::pkcs8::{DecodePrivateKey, EncodePrivateKey, EncodePublicKey};
use rand::rngs::OsRng;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use thiserror::Error;
use zeroize::Zeroizing;

use crate::encoding;

/// Default key size for the device keypair, in bits.
pub const DEFAULT_KEY_SIZE: u32 = 256;

/// Elliptic curves a caller may request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EcCurve {
    /// NIST P-256 (secp256r1)
    Secp256r1,
    /// NIST P-384 (secp384r1) - not supported by this store
    Secp384r1,
}

/// Errors that can occur in keystore operations.
#[derive(Debug, Error)]
pub enum KeyStoreError {
    /// The isolated store cannot be opened or an entry is corrupted.
    #[error("keystore unavailable: {0}")]
    Unavailable(String),

    /// The requested algorithm/curve is not supported by this store.
    #[error("key generation failed: {0}")]
    GenerationFailed(String),

    /// No key exists under the requested alias.
    #[error("key not found: {alias}")]
    KeyNotFound { alias: String },

    /// The signing operation itself failed.
    #[error("signing failed: {0}")]
    SigningFailed(String),
}

/// Isolated keystore holding EC keypairs addressed by alias.
///
/// All operations serialize through an internal lock, so two bootstrap
/// attempts can never sign with the same alias concurrently.
#[derive(Debug)]
pub struct SecureKeyStore {
    dir: PathBuf,
    keys: Mutex<HashMap<String, SigningKey>>,
}

impl SecureKeyStore {
    /// Open the keystore rooted at `dir`, creating it on first use.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, KeyStoreError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|e| {
            KeyStoreError::Unavailable(format!(
                "cannot create keystore directory {}: {e}",
                dir.display()
            ))
        })?;
        restrict_permissions(&dir, 0o700)?;

        Ok(Self {
            dir,
            keys: Mutex::new(HashMap::new()),
        })
    }

    /// Return the public key for `alias`, generating the keypair first if
    /// none exists. Idempotent: repeated calls return the identical
    /// encoding and never create a second key for the same alias.
    ///
    /// The public key is returned as base64 of its SubjectPublicKeyInfo
    /// DER encoding, safe to transmit.
    pub fn load_or_create(
        &self,
        alias: &str,
        curve: EcCurve,
        key_size: u32,
    ) -> Result<String, KeyStoreError> {
        match curve {
            EcCurve::Secp256r1 => {}
            other => {
                return Err(KeyStoreError::GenerationFailed(format!(
                    "unsupported curve {other:?}"
                )))
            }
        }
        if key_size != DEFAULT_KEY_SIZE {
            return Err(KeyStoreError::GenerationFailed(format!(
                "unsupported key size {key_size} for secp256r1"
            )));
        }

        let mut keys = self.keys.lock().expect("keystore lock poisoned");
        if let Some(key) = keys.get(alias) {
            return encode_public(key);
        }

        if let Some(key) = self.load_from_disk(alias)? {
            let encoded = encode_public(&key)?;
            keys.insert(alias.to_string(), key);
            return Ok(encoded);
        }

        let key = SigningKey::random(&mut OsRng);
        self.persist(alias, &key)?;
        let encoded = encode_public(&key)?;
        keys.insert(alias.to_string(), key);
        tracing::info!(alias, "generated device keypair");
        Ok(encoded)
    }

    /// Sign `data` with the private key under `alias`.
    ///
    /// Returns the DER-encoded ECDSA signature. The private key is used in
    /// place; it is never exposed to the caller.
    pub fn sign(&self, alias: &str, data: &[u8]) -> Result<Vec<u8>, KeyStoreError> {
        let mut keys = self.keys.lock().expect("keystore lock poisoned");
        let key = match keys.entry(alias.to_string()) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(slot) => match self.load_from_disk(alias)? {
                Some(key) => slot.insert(key),
                None => {
                    return Err(KeyStoreError::KeyNotFound {
                        alias: alias.to_string(),
                    })
                }
            },
        };

        let signature: Signature = key
            .try_sign(data)
            .map_err(|e| KeyStoreError::SigningFailed(e.to_string()))?;
        Ok(signature.to_der().as_bytes().to_vec())
    }

    /// Return the public key for an existing alias without creating one.
    pub fn public_key(&self, alias: &str) -> Result<String, KeyStoreError> {
        let mut keys = self.keys.lock().expect("keystore lock poisoned");
        if let Some(key) = keys.get(alias) {
            return encode_public(key);
        }
        match self.load_from_disk(alias)? {
            Some(key) => {
                let encoded = encode_public(&key)?;
                keys.insert(alias.to_string(), key);
                Ok(encoded)
            }
            None => Err(KeyStoreError::KeyNotFound {
                alias: alias.to_string(),
            }),
        }
    }

    fn load_from_disk(&self, alias: &str) -> Result<Option<SigningKey>, KeyStoreError> {
        let path = self.key_path(alias);
        if !path.exists() {
            return Ok(None);
        }
        let der = Zeroizing::new(fs::read(&path).map_err(|e| {
            KeyStoreError::Unavailable(format!("cannot read key material for '{alias}': {e}"))
        })?);
        let key = SigningKey::from_pkcs8_der(&der).map_err(|e| {
            KeyStoreError::Unavailable(format!("corrupted key material for '{alias}': {e}"))
        })?;
        Ok(Some(key))
    }

    fn persist(&self, alias: &str, key: &SigningKey) -> Result<(), KeyStoreError> {
        let der = key
            .to_pkcs8_der()
            .map_err(|e| KeyStoreError::GenerationFailed(format!("key encoding failed: {e}")))?;

        let path = self.key_path(alias);
        let mut file = fs::File::create(&path).map_err(|e| {
            KeyStoreError::Unavailable(format!("cannot write key material for '{alias}': {e}"))
        })?;
        restrict_permissions(&path, 0o600)?;
        file.write_all(der.as_bytes()).map_err(|e| {
            KeyStoreError::Unavailable(format!("cannot write key material for '{alias}': {e}"))
        })?;
        // Losing the key after a crash means losing the device identity.
        file.sync_all().map_err(|e| {
            KeyStoreError::Unavailable(format!("cannot persist key material for '{alias}': {e}"))
        })?;
        Ok(())
    }

    fn key_path(&self, alias: &str) -> PathBuf {
        self.dir.join(format!("{alias}.p8"))
    }
}

fn encode_public(key: &SigningKey) -> Result<String, KeyStoreError> {
    let der = key
        .verifying_key()
        .to_public_key_der()
        .map_err(|e| KeyStoreError::GenerationFailed(format!("public key encoding failed: {e}")))?;
    Ok(encoding::to_base64(der.as_bytes()))
}

#[cfg(unix)]
fn restrict_permissions(path: &Path, mode: u32) -> Result<(), KeyStoreError> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode)).map_err(|e| {
        KeyStoreError::Unavailable(format!("cannot restrict {}: {e}", path.display()))
    })
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path, _mode: u32) -> Result<(), KeyStoreError> {
    Ok(())
}
