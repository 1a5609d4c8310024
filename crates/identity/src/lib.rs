//! Device identity and secure bootstrap for the Petrel metrics agent.
//!
//! This crate establishes a durable, hardware-rooted identity for an agent
//! running on an untrusted endpoint device, registers that identity with
//! the backend, and proves key possession to the metrics controller to
//! obtain a certificate for subsequent mutual-TLS sessions.
//!
//! # Core Concepts
//!
//! - **Secure keystore**: an isolated EC keystore exposing only signing and
//!   public-key export; private key material never crosses the API surface
//! - **Device identity**: a persisted random UUID paired with the hardware
//!   public key, rebuilt cheaply on every agent start
//! - **Registration**: idempotent announcement of `{uuid, public_key}` to
//!   the backend
//! - **Bootstrap**: challenge/response proof of possession ending in a
//!   controller-issued certificate installed into the local trust store
//!
//! # Security Model
//!
//! - The private key is generated inside the keystore and never exported
//! - Nothing is installed into the trust store without local validation
//! - Keystore failures surface as typed errors and are never retried here
//! - A single-flight guard keeps concurrent bootstrap attempts from
//!   interleaving challenge state

pub mod bootstrap;
pub mod bootstrap_state;
pub mod encoding;
pub mod error;
pub mod identity;
pub mod keystore;
pub mod registration;
pub mod transport;
pub mod trust_store;

pub use bootstrap::{BootstrapProtocol, BOOTSTRAP_COMPLETED_AT_KEY, DEFAULT_BOOTSTRAP_TIMEOUT};
pub use bootstrap_state::{
    BootstrapFailure, BootstrapState, BootstrapStateMachine, StateError, StateTransition,
};
pub use error::{IdentityError, Result};
pub use identity::{DeviceIdentity, HW_KEY_ALIAS, UUID_SETTING_KEY};
pub use keystore::{EcCurve, KeyStoreError, SecureKeyStore, DEFAULT_KEY_SIZE};
pub use registration::{RegistrationClient, RegistrationError, LAST_REGISTERED_AT_KEY};
pub use transport::{HttpResponse, Transport, TransportError};
pub use trust_store::{InstalledCertificate, TrustStore, TrustStoreError};
