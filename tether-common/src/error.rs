//! Errors shared by the listener, its sessions, and the configuration checks
//! that run before either starts.

use std::io;

use thiserror::Error;

/// Raised while validating configuration, before anything binds or dials.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Missing required field: {0}")]
    MissingField(&'static str),

    #[error("Invalid configuration for {field}: {reason}")]
    InvalidConfiguration { field: String, reason: String },

    /// A referenced file could not be checked.
    #[error("I/O error during validation: {0}")]
    Io(#[from] io::Error),
}

/// Ends one inbound session. Never fatal to the listener.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Connection error: {0}")]
    Connection(#[from] io::Error),

    /// The client asked for STARTTLS and the handshake failed.
    #[error("TLS negotiation failed: {0}")]
    Tls(String),

    /// The client broke framing, e.g. an overlong line.
    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Shutdown requested")]
    Shutdown,

    #[error("Session timed out after {0} seconds")]
    Timeout(u64),
}

impl SessionError {
    #[must_use]
    pub const fn is_shutdown(&self) -> bool {
        matches!(self, Self::Shutdown)
    }

    /// Caused by the peer rather than by the relay.
    #[must_use]
    pub const fn is_client_error(&self) -> bool {
        matches!(self, Self::Timeout(_) | Self::Tls(_) | Self::Protocol(_))
    }
}

/// Stops a listener, and with it the event source built on top.
#[derive(Debug, Error)]
pub enum ListenerError {
    #[error("Failed to bind to {address}: {source}")]
    BindFailed {
        address: String,
        #[source]
        source: io::Error,
    },

    #[error("Failed to accept connection: {0}")]
    AcceptFailed(#[from] io::Error),

    /// Configuration was rejected before binding.
    #[error("Invalid listener configuration: {0}")]
    Config(#[from] ProtocolError),
}

#[cfg(test)]
mod tests {
    use std::error::Error as _;

    use super::*;

    #[test]
    fn test_configuration_errors_name_the_field() {
        assert_eq!(
            ProtocolError::MissingField("provider.host").to_string(),
            "Missing required field: provider.host"
        );

        let err = ProtocolError::InvalidConfiguration {
            field: "auth_methods".to_string(),
            reason: "require_auth is set but no mechanisms are enabled".to_string(),
        };
        assert!(err.to_string().starts_with("Invalid configuration for auth_methods"));
    }

    #[test]
    fn test_session_error_classification() {
        assert!(SessionError::Shutdown.is_shutdown());
        assert!(!SessionError::Shutdown.is_client_error());

        assert!(SessionError::Timeout(30).is_client_error());
        assert!(SessionError::Tls("handshake".to_string()).is_client_error());
        assert!(SessionError::Protocol("Line exceeds 12288 bytes".to_string()).is_client_error());

        let reset = SessionError::from(io::Error::from(io::ErrorKind::ConnectionReset));
        assert!(!reset.is_shutdown());
        assert!(!reset.is_client_error());
    }

    #[test]
    fn test_bind_failure_keeps_its_source() {
        let err = ListenerError::BindFailed {
            address: "0.0.0.0:587".to_string(),
            source: io::Error::new(io::ErrorKind::AddrInUse, "address in use"),
        };

        assert!(err.source().is_some());
        assert_eq!(err.to_string(), "Failed to bind to 0.0.0.0:587: address in use");
    }
}
