//! Failures talking to an upstream provider.

use std::io;

use thiserror::Error;

/// Everything [`SmtpClient`](super::SmtpClient) can fail with. Codes the
/// provider sent are kept, so the relay can tell a deferral from a refusal.
#[derive(Error, Debug)]
pub enum ClientError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// The provider sent something that is not an SMTP reply.
    #[error("Failed to parse SMTP response: {0}")]
    ParseError(String),

    /// A well-formed reply the current step cannot continue from.
    #[error("Unexpected SMTP status code: {code} - {message}")]
    UnexpectedResponse { code: u16, message: String },

    /// A 4xx or 5xx reply.
    #[error("SMTP error: {code} - {message}")]
    SmtpError { code: u16, message: String },

    /// STARTTLS or implicit TLS could not be set up.
    #[error("TLS error: {0}")]
    TlsError(String),

    #[error("Connection closed unexpectedly")]
    ConnectionClosed,
}

pub type Result<T> = std::result::Result<T, ClientError>;
