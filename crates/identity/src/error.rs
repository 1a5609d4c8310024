//! Error types for identity, registration, and bootstrap operations.

use thiserror::Error;

/// Errors that can occur in identity operations.
#[derive(Debug, Error)]
pub enum IdentityError {
    /// Keystore errors
    #[error("keystore error: {0}")]
    KeyStore(#[from] crate::keystore::KeyStoreError),

    /// Durable settings store errors
    #[error("settings error: {0}")]
    Settings(#[from] petrel_core::SettingsError),

    /// Transport-level errors
    #[error("transport error: {0}")]
    Transport(#[from] crate::transport::TransportError),

    /// Registration errors
    #[error("registration error: {0}")]
    Registration(#[from] crate::registration::RegistrationError),

    /// Bootstrap protocol failures
    #[error("bootstrap error: {0}")]
    Bootstrap(#[from] crate::bootstrap_state::BootstrapFailure),

    /// Trust store errors
    #[error("trust store error: {0}")]
    TrustStore(#[from] crate::trust_store::TrustStoreError),

    /// Serialization errors
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type for identity operations.
pub type Result<T> = std::result::Result<T, IdentityError>;
