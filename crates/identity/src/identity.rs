//! Device identity: persisted UUID plus the hardware public key.
//!
//! The identity is rebuilt on every agent start by re-reading the settings
//! store and keystore; both halves are created lazily on first use and are
//! stable for the lifetime of the installation.

use petrel_core::SettingsStore;
use uuid::Uuid;

use crate::error::Result;
use crate::keystore::{EcCurve, SecureKeyStore, DEFAULT_KEY_SIZE};

/// Fixed alias of the device keypair inside the secure keystore.
pub const HW_KEY_ALIAS: &str = "hw_key_alias";

/// Settings key under which the device UUID is persisted.
pub const UUID_SETTING_KEY: &str = "device_uuid";

/// Externally-presented identity of this device.
///
/// Immutable snapshot owned by the agent instance that constructed it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceIdentity {
    uuid: String,
    public_key: String,
}

impl DeviceIdentity {
    /// Read or create both halves of the identity.
    ///
    /// The UUID is generated exactly once per installation and persisted
    /// before this returns; regenerating it would invalidate the device's
    /// registration on the backend. The keypair is created on first use
    /// under [`HW_KEY_ALIAS`] and reused afterwards.
    pub fn load_or_create(settings: &SettingsStore, keystore: &SecureKeyStore) -> Result<Self> {
        let uuid = match settings.get(UUID_SETTING_KEY)? {
            Some(existing) => existing,
            None => {
                let fresh = Uuid::new_v4().to_string();
                settings.set(UUID_SETTING_KEY, &fresh)?;
                tracing::info!(uuid = %fresh, "generated device UUID");
                fresh
            }
        };

        let public_key = keystore.load_or_create(HW_KEY_ALIAS, EcCurve::Secp256r1, DEFAULT_KEY_SIZE)?;

        Ok(Self { uuid, public_key })
    }

    /// The device UUID as a 36-character string.
    pub fn uuid(&self) -> &str {
        &self.uuid
    }

    /// The device public key, base64 of its SubjectPublicKeyInfo encoding.
    pub fn public_key(&self) -> &str {
        &self.public_key
    }

    /// Replace the UUID of this snapshot.
    ///
    /// DANGER: the new value is not written back to the settings store and
    /// desynchronizes this identity from the backend registration. Intended
    /// for tests and migration tooling only.
    pub fn override_uuid(&mut self, new_uuid: impl Into<String>) {
        self.uuid = new_uuid.into();
        tracing::warn!(uuid = %self.uuid, "device UUID overridden");
    }
}
