use std::{fmt::Display, fs::File, io::BufReader, path::Path, sync::Arc};

use tether_common::{config::TlsContext, tracing};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_rustls::{
    TlsAcceptor,
    rustls::{
        ServerConfig, ServerConnection,
        pki_types::{CertificateDer, PrivateKeyDer},
    },
    server::TlsStream,
};

use crate::error::{ConnectionError, ConnectionResult, TlsError, TlsResult};

const READ_SIZE: usize = 8192;

/// Negotiated parameters of an upgraded connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsInfo {
    pub protocol: String,
    pub cipher: String,
}

impl TlsInfo {
    fn of(conn: &ServerConnection) -> TlsResult<Self> {
        let protocol = conn
            .protocol_version()
            .ok_or_else(|| TlsError::UpgradeFailed("protocol version missing".to_string()))?;
        let cipher = conn
            .negotiated_cipher_suite()
            .ok_or_else(|| TlsError::UpgradeFailed("cipher suite missing".to_string()))?;

        Ok(Self {
            protocol: protocol.as_str().map_or_else(|| format!("{protocol:?}"), str::to_string),
            cipher: cipher
                .suite()
                .as_str()
                .map_or_else(|| format!("{:?}", cipher.suite()), str::to_string),
        })
    }
}

enum Transport<S> {
    Plain(S),
    Tls(Box<TlsStream<S>>),
    /// Only observable if a TLS handshake failed part way.
    Closed,
}

/// Tracks a partial match of `CRLF.CRLF` across reads.
///
/// Starts as if the preceding `DATA` line's CRLF was already seen, so a
/// message consisting of just `.` terminates immediately.
#[derive(Debug, Clone, Copy)]
pub struct DataTerminator {
    matched: usize,
}

impl Default for DataTerminator {
    fn default() -> Self {
        Self { matched: 2 }
    }
}

impl DataTerminator {
    const MARKER: &'static [u8] = b"\r\n.\r\n";

    /// Feed `bytes` through the matcher, returning the index just past the
    /// terminator if it completes inside them.
    pub fn scan(&mut self, bytes: &[u8]) -> Option<usize> {
        for (index, &byte) in bytes.iter().enumerate() {
            if byte == Self::MARKER[self.matched] {
                self.matched += 1;
                if self.matched == Self::MARKER.len() {
                    return Some(index + 1);
                }
            } else {
                self.matched = usize::from(byte == b'\r');
            }
        }

        None
    }
}

/// A buffered inbound connection that can be upgraded to TLS in place.
pub struct Connection<S> {
    transport: Transport<S>,
    buffer: Vec<u8>,
}

impl<S: AsyncRead + AsyncWrite + Unpin + Send> Connection<S> {
    pub const fn new(stream: S) -> Self {
        Self {
            transport: Transport::Plain(stream),
            buffer: Vec::new(),
        }
    }

    #[must_use]
    pub const fn is_tls(&self) -> bool {
        matches!(self.transport, Transport::Tls(_))
    }

    async fn fill(&mut self) -> ConnectionResult<usize> {
        let mut chunk = [0; READ_SIZE];
        let read = match &mut self.transport {
            Transport::Plain(stream) => stream.read(&mut chunk).await?,
            Transport::Tls(stream) => stream.read(&mut chunk).await?,
            Transport::Closed => return Err(ConnectionError::Closed),
        };

        self.buffer.extend_from_slice(&chunk[..read]);
        Ok(read)
    }

    /// Read one line, without its line ending.
    ///
    /// Returns `None` once the peer has closed the connection.
    ///
    /// # Errors
    ///
    /// Fails on I/O errors, or with [`ConnectionError::LineTooLong`] once
    /// more than `limit` bytes arrive without a line ending.
    pub async fn read_line(&mut self, limit: usize) -> ConnectionResult<Option<Vec<u8>>> {
        loop {
            if let Some(position) = self.buffer.iter().position(|&b| b == b'\n') {
                let mut line: Vec<u8> = self.buffer.drain(..=position).collect();
                line.pop();
                if line.last() == Some(&b'\r') {
                    line.pop();
                }

                if line.len() > limit {
                    return Err(ConnectionError::LineTooLong(limit));
                }

                return Ok(Some(line));
            }

            if self.buffer.len() > limit {
                self.buffer.clear();
                return Err(ConnectionError::LineTooLong(limit));
            }

            if self.fill().await? == 0 {
                return Ok(None);
            }
        }
    }

    /// Read the next slice of a message body.
    ///
    /// The returned flag is set once the slice ends with the terminator.
    /// Anything after the terminator stays buffered. Returns `None` if the
    /// peer closed the connection first.
    ///
    /// # Errors
    ///
    /// Fails on I/O errors.
    pub async fn read_data(
        &mut self,
        terminator: &mut DataTerminator,
    ) -> ConnectionResult<Option<(Vec<u8>, bool)>> {
        if self.buffer.is_empty() && self.fill().await? == 0 {
            return Ok(None);
        }

        let end = terminator.scan(&self.buffer);
        Ok(Some(match end {
            None => (std::mem::take(&mut self.buffer), false),
            Some(end) => (self.buffer.drain(..end).collect(), true),
        }))
    }

    /// Write one reply line, appending CRLF.
    ///
    /// # Errors
    ///
    /// Fails if the write does not complete.
    pub async fn send<D: Display + ?Sized>(&mut self, response: &D) -> ConnectionResult<usize> {
        let line = format!("{response}\r\n");

        match &mut self.transport {
            Transport::Plain(stream) => {
                stream.write_all(line.as_bytes()).await?;
                stream.flush().await?;
            }
            Transport::Tls(stream) => {
                stream.write_all(line.as_bytes()).await?;
                stream.flush().await?;
            }
            Transport::Closed => return Err(ConnectionError::Closed),
        }

        Ok(line.len())
    }

    fn load_certs(path: &Path) -> std::io::Result<Vec<CertificateDer<'static>>> {
        rustls_pemfile::certs(&mut BufReader::new(File::open(path)?)).collect()
    }

    fn load_key(path: &Path) -> TlsResult<PrivateKeyDer<'static>> {
        let key_error = |reason: String| TlsError::KeyLoad {
            path: path.display().to_string(),
            reason,
        };

        let mut reader = BufReader::new(File::open(path).map_err(|e| key_error(e.to_string()))?);

        match rustls_pemfile::read_one(&mut reader).map_err(|e| key_error(e.to_string()))? {
            Some(rustls_pemfile::Item::Pkcs1Key(key)) => Ok(PrivateKeyDer::Pkcs1(key)),
            Some(rustls_pemfile::Item::Pkcs8Key(key)) => Ok(PrivateKeyDer::Pkcs8(key)),
            Some(rustls_pemfile::Item::Sec1Key(key)) => Ok(PrivateKeyDer::Sec1(key)),
            _ => Err(key_error(
                "Unable to determine key file format (expected PKCS1, PKCS8, or SEC1)".to_string(),
            )),
        }
    }

    /// Perform the server side of a STARTTLS handshake.
    ///
    /// Buffered plaintext is discarded, as RFC 3207 requires.
    ///
    /// # Errors
    ///
    /// Fails if the certificate material cannot be loaded, the connection is
    /// already encrypted, or the handshake fails.
    #[tracing::instrument(level = "debug", skip_all)]
    pub async fn upgrade(&mut self, tls_context: &TlsContext) -> TlsResult<TlsInfo> {
        if !matches!(self.transport, Transport::Plain(_)) {
            return Err(TlsError::UpgradeFailed(
                "Connection is not plaintext".to_string(),
            ));
        }

        let certs =
            Self::load_certs(&tls_context.certificate).map_err(|e| TlsError::CertificateLoad {
                path: tls_context.certificate.display().to_string(),
                source: e,
            })?;
        let key = Self::load_key(&tls_context.key)?;

        let config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)?;
        let acceptor = TlsAcceptor::from(Arc::new(config));

        let Transport::Plain(stream) = std::mem::replace(&mut self.transport, Transport::Closed)
        else {
            return Err(TlsError::UpgradeFailed("Connection is not plaintext".to_string()));
        };

        self.buffer.clear();
        let stream = acceptor.accept(stream).await?;
        let info = TlsInfo::of(stream.get_ref().1)?;
        self.transport = Transport::Tls(Box::new(stream));

        Ok(info)
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use tokio::io::AsyncWriteExt;

    use super::*;

    #[test]
    fn test_terminator_across_reads() {
        let mut terminator = DataTerminator::default();
        assert_eq!(terminator.scan(b"Subject: hi\r\n\r\nbody\r"), None);
        assert_eq!(terminator.scan(b"\n."), None);
        assert_eq!(terminator.scan(b"\r\nQUIT\r\n"), Some(2));
    }

    #[test]
    fn test_terminator_requires_line_start() {
        let mut terminator = DataTerminator::default();
        assert_eq!(terminator.scan(b"a.\r\n"), None);
        assert_eq!(terminator.scan(b"..\r\n"), None);

        let mut empty = DataTerminator::default();
        assert_eq!(empty.scan(b".\r\n"), Some(3));
    }

    #[tokio::test]
    async fn test_read_line_and_data() {
        let (client, server) = tokio::io::duplex(64);
        let mut connection = Connection::new(server);
        let mut client = client;

        client
            .write_all(b"EHLO test\r\nHELLO\r\n.\r\nQUIT\r\n")
            .await
            .unwrap();
        drop(client);

        assert_eq!(
            connection.read_line(512).await.unwrap(),
            Some(b"EHLO test".to_vec())
        );

        let mut terminator = DataTerminator::default();
        let mut body = Vec::new();
        loop {
            let (chunk, finished) = connection.read_data(&mut terminator).await.unwrap().unwrap();
            body.extend(chunk);
            if finished {
                break;
            }
        }
        assert_eq!(body, b"HELLO\r\n.\r\n");

        assert_eq!(
            connection.read_line(512).await.unwrap(),
            Some(b"QUIT".to_vec())
        );
        assert_eq!(connection.read_line(512).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_line_too_long() {
        let (mut client, server) = tokio::io::duplex(64);
        let mut connection = Connection::new(server);

        client.write_all(&[b'a'; 40]).await.unwrap();
        client.write_all(b"\r\n").await.unwrap();

        assert!(matches!(
            connection.read_line(16).await,
            Err(ConnectionError::LineTooLong(16))
        ));
    }
}
