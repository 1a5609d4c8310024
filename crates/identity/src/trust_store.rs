//! Local trust store for the controller-issued client certificate.
//!
//! Certificates pass structural validation (well-formed X.509, no trailing
//! data, inside their validity window, expected issuer when configured)
//! before anything touches disk. The install itself is a temp-file-plus-
//! rename so a crash mid-install leaves either the previous certificate or
//! none, never a torn one.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use thiserror::Error;
use x509_parser::prelude::*;

use crate::encoding;

/// File name of the installed certificate inside the store directory.
pub const INSTALLED_CERT_FILE: &str = "controller_identity.der";

/// Errors that can occur in trust-store operations.
#[derive(Debug, Error)]
pub enum TrustStoreError {
    /// The store directory cannot be created, read, or written.
    #[error("trust store unavailable: {0}")]
    Unavailable(String),

    /// The certificate failed validation and was not installed.
    #[error("certificate validation failed: {0}")]
    InvalidCertificate(String),
}

/// Summary of a validated, installed certificate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstalledCertificate {
    /// Certificate serial number (hex)
    pub serial: String,
    /// Subject distinguished name
    pub subject: String,
    /// Issuer distinguished name
    pub issuer: String,
    /// Not valid before (Unix seconds)
    pub not_before: i64,
    /// Not valid after (Unix seconds)
    pub not_after: i64,
    /// Raw DER bytes as installed
    pub der: Vec<u8>,
}

/// Store holding the certificate used for subsequent mutual-TLS sessions.
#[derive(Debug)]
pub struct TrustStore {
    dir: PathBuf,
    expected_issuer: Option<String>,
}

impl TrustStore {
    /// Open the trust store rooted at `dir`, creating it on first use.
    ///
    /// When `expected_issuer` is set, only certificates whose issuer common
    /// name matches it can be installed.
    pub fn open(
        dir: impl Into<PathBuf>,
        expected_issuer: Option<String>,
    ) -> Result<Self, TrustStoreError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|e| {
            TrustStoreError::Unavailable(format!(
                "cannot create trust store at {}: {e}",
                dir.display()
            ))
        })?;
        Ok(Self {
            dir,
            expected_issuer,
        })
    }

    /// Validate a DER certificate without installing it.
    pub fn validate(&self, der: &[u8]) -> Result<InstalledCertificate, TrustStoreError> {
        let (rest, cert) = X509Certificate::from_der(der).map_err(|e| {
            TrustStoreError::InvalidCertificate(format!("X.509 parse failure: {e}"))
        })?;
        if !rest.is_empty() {
            return Err(TrustStoreError::InvalidCertificate(
                "trailing data after certificate".to_string(),
            ));
        }
        if !cert.validity().is_valid() {
            return Err(TrustStoreError::InvalidCertificate(
                "certificate is outside its validity window".to_string(),
            ));
        }
        if let Some(expected) = &self.expected_issuer {
            let issuer_cn = cert
                .issuer()
                .iter_common_name()
                .next()
                .and_then(|cn| cn.as_str().ok());
            match issuer_cn {
                Some(cn) if cn == expected => {}
                Some(cn) => {
                    return Err(TrustStoreError::InvalidCertificate(format!(
                        "issuer '{cn}' does not match expected issuer '{expected}'"
                    )))
                }
                None => {
                    return Err(TrustStoreError::InvalidCertificate(
                        "certificate issuer has no common name".to_string(),
                    ))
                }
            }
        }

        Ok(InstalledCertificate {
            serial: cert.raw_serial_as_string(),
            subject: cert.subject().to_string(),
            issuer: cert.issuer().to_string(),
            not_before: cert.validity().not_before.timestamp(),
            not_after: cert.validity().not_after.timestamp(),
            der: der.to_vec(),
        })
    }

    /// Validate `der` and install it as the client certificate.
    ///
    /// Nothing is written unless validation passed.
    pub fn install(&self, der: &[u8]) -> Result<InstalledCertificate, TrustStoreError> {
        let installed = self.validate(der)?;

        let path = self.cert_path();
        let tmp = path.with_extension("der.tmp");
        fs::write(&tmp, der).map_err(|e| {
            TrustStoreError::Unavailable(format!("cannot write certificate: {e}"))
        })?;
        fs::rename(&tmp, &path).map_err(|e| {
            TrustStoreError::Unavailable(format!("cannot install certificate: {e}"))
        })?;

        tracing::info!(
            serial = %installed.serial,
            fingerprint = %encoding::sha256_fingerprint(der),
            "certificate installed into trust store"
        );
        Ok(installed)
    }

    /// Load and re-validate the currently installed certificate, if any.
    pub fn installed(&self) -> Result<Option<InstalledCertificate>, TrustStoreError> {
        let path = self.cert_path();
        if !path.exists() {
            return Ok(None);
        }
        let der = fs::read(&path).map_err(|e| {
            TrustStoreError::Unavailable(format!("cannot read installed certificate: {e}"))
        })?;
        self.validate(&der).map(Some)
    }

    /// Path of the installed certificate, for wiring into a TLS client.
    pub fn installed_cert_path(&self) -> PathBuf {
        self.cert_path()
    }

    fn cert_path(&self) -> PathBuf {
        self.dir.join(INSTALLED_CERT_FILE)
    }
}
