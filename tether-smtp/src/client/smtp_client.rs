//! SMTP client implementation with support for implicit TLS and STARTTLS.

use std::sync::Arc;

use tether_common::{incoming, outgoing, tracing};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
};
use tokio_rustls::{
    TlsConnector,
    rustls::{
        ClientConfig, DigitallySignedStruct, Error as RustlsError, RootCertStore, SignatureScheme,
        client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier},
        pki_types::{CertificateDer, ServerName, UnixTime},
    },
};

use super::{
    error::{ClientError, Result},
    response::Response,
};
use crate::auth::{self, Mechanism};

/// Size of each read from the socket.
const BUFFER_SIZE: usize = 8192;

/// Upper bound on a single buffered reply.
const MAX_BUFFER_SIZE: usize = 1024 * 1024;

enum ClientConnection {
    Plain(TcpStream),
    Tls(Box<tokio_rustls::client::TlsStream<TcpStream>>),
}

impl ClientConnection {
    async fn send(&mut self, data: &[u8]) -> Result<()> {
        match self {
            Self::Plain(stream) => {
                stream.write_all(data).await?;
                stream.flush().await?;
            }
            Self::Tls(stream) => {
                stream.write_all(data).await?;
                stream.flush().await?;
            }
        }
        Ok(())
    }

    async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let n = match self {
            Self::Plain(stream) => stream.read(buf).await?,
            Self::Tls(stream) => stream.read(buf).await?,
        };
        if n == 0 {
            return Err(ClientError::ConnectionClosed);
        }
        Ok(n)
    }
}

fn connector(accept_invalid_certs: bool) -> Result<TlsConnector> {
    let mut root_store = RootCertStore::empty();

    let certs = rustls_native_certs::load_native_certs();
    for cert in certs.certs {
        root_store
            .add(cert)
            .map_err(|e| ClientError::TlsError(format!("Failed to add certificate: {e}")))?;
    }
    if !certs.errors.is_empty() {
        tracing::warn!(?certs.errors, "Some certificates could not be loaded");
    }

    let mut config = ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth();

    if accept_invalid_certs {
        config
            .dangerous()
            .set_certificate_verifier(Arc::new(NoVerifier));
    }

    Ok(TlsConnector::from(Arc::new(config)))
}

async fn handshake(
    stream: TcpStream,
    domain: &str,
    accept_invalid_certs: bool,
) -> Result<ClientConnection> {
    let server_name = ServerName::try_from(domain.to_string())
        .map_err(|e| ClientError::TlsError(format!("Invalid domain: {e}")))?;

    let stream = connector(accept_invalid_certs)?
        .connect(server_name, stream)
        .await
        .map_err(|e| ClientError::TlsError(e.to_string()))?;

    Ok(ClientConnection::Tls(Box::new(stream)))
}

/// Accepts every certificate. Only reachable through `accept_invalid_certs`.
#[derive(Debug)]
struct NoVerifier;

impl ServerCertVerifier for NoVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, RustlsError> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, RustlsError> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, RustlsError> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ED25519,
        ]
    }
}

/// A connection to an SMTP server.
pub struct SmtpClient {
    connection: Option<ClientConnection>,
    buffer: Vec<u8>,
    server_domain: String,
    accept_invalid_certs: bool,
}

impl SmtpClient {
    /// Connect over plain TCP.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection fails.
    pub async fn connect(addr: &str, server_domain: String) -> Result<Self> {
        let stream = TcpStream::connect(addr).await?;

        Ok(Self {
            connection: Some(ClientConnection::Plain(stream)),
            buffer: Vec::with_capacity(BUFFER_SIZE),
            server_domain,
            accept_invalid_certs: false,
        })
    }

    /// Connect and immediately negotiate TLS (SMTPS, port 465).
    ///
    /// # Errors
    ///
    /// Returns an error if the connection or the handshake fails.
    pub async fn connect_tls(
        addr: &str,
        server_domain: String,
        accept_invalid_certs: bool,
    ) -> Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        let connection = handshake(stream, &server_domain, accept_invalid_certs).await?;

        Ok(Self {
            connection: Some(connection),
            buffer: Vec::with_capacity(BUFFER_SIZE),
            server_domain,
            accept_invalid_certs,
        })
    }

    /// Default is `false`. Set to `true` for testing only.
    #[must_use]
    pub const fn accept_invalid_certs(mut self, accept: bool) -> Self {
        self.accept_invalid_certs = accept;
        self
    }

    #[must_use]
    pub const fn is_tls(&self) -> bool {
        matches!(self.connection, Some(ClientConnection::Tls(_)))
    }

    /// # Errors
    ///
    /// Returns an error if reading fails or the greeting is malformed.
    pub async fn read_greeting(&mut self) -> Result<Response> {
        self.read_response().await
    }

    /// Write bytes exactly as given.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection is gone or the write fails.
    pub async fn write_raw(&mut self, data: &[u8]) -> Result<()> {
        self.connection
            .as_mut()
            .ok_or(ClientError::ConnectionClosed)?
            .send(data)
            .await
    }

    /// # Errors
    ///
    /// Returns an error if sending fails.
    pub async fn send_command(&mut self, command: &str) -> Result<()> {
        self.write_raw(format!("{command}\r\n").as_bytes()).await
    }

    /// Send one command line and read its reply.
    ///
    /// # Errors
    ///
    /// Returns an error if sending or reading fails.
    pub async fn command(&mut self, command: &str) -> Result<Response> {
        outgoing!("{command}");
        self.send_command(command).await?;
        self.read_response().await
    }

    /// # Errors
    ///
    /// Returns an error if the command fails.
    pub async fn ehlo(&mut self, domain: &str) -> Result<Response> {
        self.command(&format!("EHLO {domain}")).await
    }

    /// Send STARTTLS and, on a 220, upgrade the connection.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection is already encrypted or the
    /// handshake fails.
    pub async fn starttls(&mut self) -> Result<Response> {
        if self.is_tls() {
            return Err(ClientError::TlsError(
                "Connection is already TLS".to_string(),
            ));
        }

        let response = self.command("STARTTLS").await?;

        if response.code == 220 {
            let Some(ClientConnection::Plain(stream)) = self.connection.take() else {
                return Err(ClientError::ConnectionClosed);
            };

            // Anything buffered was sent in plaintext and must not be trusted
            self.buffer.clear();
            self.connection =
                Some(handshake(stream, &self.server_domain, self.accept_invalid_certs).await?);
        }

        Ok(response)
    }

    /// Authenticate with the given mechanism, returning the final reply.
    ///
    /// Intermediate `334` challenges are answered here; the caller only sees
    /// the verdict, or the first non-`334` reply.
    ///
    /// # Errors
    ///
    /// Returns an error if the exchange cannot be completed on the wire.
    pub async fn authenticate(
        &mut self,
        mechanism: Mechanism,
        username: &str,
        secret: &str,
        authorization_id: Option<&str>,
    ) -> Result<Response> {
        // Never log the payloads
        match mechanism {
            Mechanism::Plain => {
                outgoing!("AUTH PLAIN <credentials>");
                self.send_command(&format!(
                    "AUTH PLAIN {}",
                    auth::encode_plain(authorization_id, username, secret)
                ))
                .await?;
                self.read_response().await
            }
            Mechanism::Login => {
                let response = self.command("AUTH LOGIN").await?;
                if response.code != 334 {
                    return Ok(response);
                }

                self.send_command(&auth::encode_text(username)).await?;
                let response = self.read_response().await?;
                if response.code != 334 {
                    return Ok(response);
                }

                self.send_command(&auth::encode_text(secret)).await?;
                self.read_response().await
            }
            Mechanism::XOAuth2 => {
                outgoing!("AUTH XOAUTH2 <credentials>");
                self.send_command(&format!(
                    "AUTH XOAUTH2 {}",
                    auth::encode_xoauth2(username, secret)
                ))
                .await?;

                let response = self.read_response().await?;
                if response.code == 334 {
                    // The challenge carries an error description; an empty
                    // line fetches the final status
                    tracing::debug!("XOAUTH2 challenge: {}", response.message());
                    return self.command("").await;
                }

                Ok(response)
            }
        }
    }

    /// `None` sends the null reverse-path.
    ///
    /// # Errors
    ///
    /// Returns an error if the command fails.
    pub async fn mail_from(&mut self, from: Option<&str>) -> Result<Response> {
        self.command(&format!("MAIL FROM:<{}>", from.unwrap_or_default()))
            .await
    }

    /// # Errors
    ///
    /// Returns an error if the command fails.
    pub async fn rcpt_to(&mut self, to: &str) -> Result<Response> {
        self.command(&format!("RCPT TO:<{to}>")).await
    }

    /// # Errors
    ///
    /// Returns an error if the command fails.
    pub async fn data(&mut self) -> Result<Response> {
        self.command("DATA").await
    }

    /// # Errors
    ///
    /// Returns an error if the command fails.
    pub async fn noop(&mut self) -> Result<Response> {
        self.command("NOOP").await
    }

    /// # Errors
    ///
    /// Returns an error if the command fails.
    pub async fn rset(&mut self) -> Result<Response> {
        self.command("RSET").await
    }

    /// # Errors
    ///
    /// Returns an error if the command fails.
    pub async fn quit(&mut self) -> Result<Response> {
        self.command("QUIT").await
    }

    /// Read one complete reply.
    ///
    /// # Errors
    ///
    /// Returns an error if reading fails or the response is malformed.
    pub async fn read_response(&mut self) -> Result<Response> {
        loop {
            if let Some((response, consumed)) = Response::parse_response(&self.buffer)? {
                self.buffer.drain(..consumed);
                incoming!("{} {}", response.code, response.message());
                return Ok(response);
            }

            if self.buffer.len() > MAX_BUFFER_SIZE {
                return Err(ClientError::ParseError(format!(
                    "Response too large (exceeds {MAX_BUFFER_SIZE} bytes)"
                )));
            }

            let mut chunk = [0; BUFFER_SIZE];
            let n = self
                .connection
                .as_mut()
                .ok_or(ClientError::ConnectionClosed)?
                .read(&mut chunk)
                .await?;
            self.buffer.extend_from_slice(&chunk[..n]);
        }
    }
}
