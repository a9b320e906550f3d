//! TLS settings.
//!
//! [`TlsContext`] is the certificate material the listener offers over
//! STARTTLS. [`TlsConfig`] decides how the outbound connection to the provider
//! negotiates TLS when it is not already using implicit TLS.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;

/// Certificate and private key (PEM) presented to inbound clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TlsContext {
    pub certificate: PathBuf,
    pub key: PathBuf,
}

impl TlsContext {
    /// Checks the referenced files exist.
    ///
    /// # Errors
    ///
    /// Returns an error naming the first missing file.
    pub fn validate(&self) -> Result<(), ProtocolError> {
        for (field, path) in [("certificate", &self.certificate), ("key", &self.key)] {
            if !path.try_exists()? {
                return Err(ProtocolError::InvalidConfiguration {
                    field: format!("tls.{field}"),
                    reason: format!("Unable to find {}", path.display()),
                });
            }
        }

        Ok(())
    }
}

/// When to use STARTTLS towards the provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TlsPolicy {
    /// Upgrade when the provider advertises STARTTLS, stay in plaintext otherwise.
    #[default]
    Opportunistic,

    /// Refuse to authenticate unless the connection could be upgraded.
    Required,

    /// Never upgrade. Credentials travel in plaintext; testing only.
    Disabled,
}

/// Certificate validation for the outbound connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct TlsCertificatePolicy {
    /// Accept self-signed, expired or mismatched certificates.
    ///
    /// Default: `false`
    #[serde(default)]
    pub accept_invalid_certs: bool,
}

/// Outbound TLS policy plus certificate validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct TlsConfig {
    #[serde(default)]
    pub policy: TlsPolicy,

    #[serde(default)]
    pub certificate: TlsCertificatePolicy,
}

impl TlsConfig {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            policy: TlsPolicy::Opportunistic,
            certificate: TlsCertificatePolicy {
                accept_invalid_certs: false,
            },
        }
    }

    #[must_use]
    pub const fn required() -> Self {
        Self {
            policy: TlsPolicy::Required,
            ..Self::new()
        }
    }

    #[must_use]
    pub const fn disabled() -> Self {
        Self {
            policy: TlsPolicy::Disabled,
            ..Self::new()
        }
    }

    /// Opportunistic TLS that trusts any certificate. Test environments only.
    #[must_use]
    pub const fn insecure() -> Self {
        Self {
            policy: TlsPolicy::Opportunistic,
            certificate: TlsCertificatePolicy {
                accept_invalid_certs: true,
            },
        }
    }

    #[must_use]
    pub const fn is_required(&self) -> bool {
        matches!(self.policy, TlsPolicy::Required)
    }

    #[must_use]
    pub const fn is_disabled(&self) -> bool {
        matches!(self.policy, TlsPolicy::Disabled)
    }

    #[must_use]
    pub const fn accepts_invalid_certs(&self) -> bool {
        self.certificate.accept_invalid_certs
    }
}
