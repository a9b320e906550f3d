//! Error types for the inbound connection layer.

use std::io;

use thiserror::Error;

/// Errors that can occur while reading from or writing to a client.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Connection was closed by peer.
    #[error("Connection closed by peer")]
    Closed,

    /// A command line exceeded the configured limit before its CRLF.
    #[error("Line exceeds {0} bytes")]
    LineTooLong(usize),
}

/// Errors that can occur during a STARTTLS upgrade.
#[derive(Debug, Error)]
pub enum TlsError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Failed to load TLS certificate from {path}: {source}")]
    CertificateLoad {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("Failed to load TLS private key from {path}: {reason}")]
    KeyLoad { path: String, reason: String },

    /// Handshake completed without negotiated parameters, or the transport
    /// was already gone.
    #[error("TLS upgrade failed: {0}")]
    UpgradeFailed(String),

    #[error("TLS error: {0}")]
    Rustls(String),
}

impl From<tokio_rustls::rustls::Error> for TlsError {
    fn from(err: tokio_rustls::rustls::Error) -> Self {
        Self::Rustls(err.to_string())
    }
}

pub type ConnectionResult<T> = std::result::Result<T, ConnectionError>;

pub type TlsResult<T> = std::result::Result<T, TlsError>;
