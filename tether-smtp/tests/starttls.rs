//! STARTTLS over an in-memory stream, with a certificate made per test.

use std::{
    net::SocketAddr,
    sync::{Arc, Mutex},
};

use pretty_assertions::assert_eq;
use tempfile::TempDir;
use tether_common::{Signal, config::TlsContext};
use tether_smtp::{
    Authentication, Callback, Hooks, ListenConfig, SessionInfo, SmtpServer, auth::encode_plain,
    hooks::AuthResponse,
};
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, DuplexStream},
    sync::broadcast,
};
use tokio_rustls::{
    TlsConnector,
    rustls::{ClientConfig, RootCertStore, pki_types::ServerName},
};

struct Recorder {
    confirm_reset: bool,
    log: Mutex<Vec<String>>,
}

impl Recorder {
    fn new(confirm_reset: bool) -> Arc<Self> {
        Arc::new(Self {
            confirm_reset,
            log: Mutex::default(),
        })
    }

    fn record(&self, entry: impl Into<String>) {
        self.log.lock().unwrap().push(entry.into());
    }

    fn log(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }
}

impl Hooks for Recorder {
    fn on_auth(
        &self,
        authentication: Authentication,
        session: Arc<SessionInfo>,
        callback: Callback<AuthResponse>,
    ) {
        let transport = if session.tls.is_some() { "tls" } else { "plain" };
        self.record(format!("auth {} {transport}", authentication.username));
        callback.accept();
    }

    fn on_reset(&self, session: Arc<SessionInfo>, callback: Callback) {
        let transport = if session.tls.is_some() { "tls" } else { "plain" };
        self.record(format!("reset {transport}"));
        if self.confirm_reset {
            callback.accept();
        }
    }

    fn on_close(&self, _session: Arc<SessionInfo>) {
        self.record("close");
    }
}

struct Certificate {
    _dir: TempDir,
    context: TlsContext,
    roots: RootCertStore,
}

fn certificate() -> Certificate {
    let rcgen::CertifiedKey { cert, key_pair } =
        rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();

    let dir = tempfile::tempdir().unwrap();
    let context = TlsContext {
        certificate: dir.path().join("cert.pem"),
        key: dir.path().join("key.pem"),
    };
    std::fs::write(&context.certificate, cert.pem()).unwrap();
    std::fs::write(&context.key, key_pair.serialize_pem()).unwrap();

    let mut roots = RootCertStore::empty();
    roots.add(cert.der().clone()).unwrap();

    Certificate {
        _dir: dir,
        context,
        roots,
    }
}

struct Client<S> {
    stream: BufReader<S>,
}

impl<S: AsyncRead + AsyncWrite + Unpin> Client<S> {
    async fn send(&mut self, line: &str) {
        let stream = self.stream.get_mut();
        stream.write_all(format!("{line}\r\n").as_bytes()).await.unwrap();
        stream.flush().await.unwrap();
    }

    async fn reply(&mut self) -> (u16, Vec<String>) {
        let mut lines = Vec::new();
        loop {
            let mut line = String::new();
            let read = self.stream.read_line(&mut line).await.unwrap();
            assert!(read > 0, "server closed the connection");

            let line = line.trim_end();
            let code = line[..3].parse().unwrap();
            lines.push(line.get(4..).unwrap_or_default().to_string());

            if line.as_bytes().get(3) != Some(&b'-') {
                return (code, lines);
            }
        }
    }

    async fn code(&mut self, line: &str) -> u16 {
        self.send(line).await;
        self.reply().await.0
    }

    async fn closed(&mut self) -> bool {
        let mut line = String::new();
        matches!(self.stream.read_line(&mut line).await, Ok(0) | Err(_))
    }
}

fn address(port: u16) -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], port))
}

fn start(
    certificate: &Certificate,
    hooks: Arc<dyn Hooks>,
) -> (Client<DuplexStream>, broadcast::Sender<Signal>) {
    let (client, server) = tokio::io::duplex(64 * 1024);
    let (shutdown, rx) = broadcast::channel(1);

    let config = ListenConfig::default()
        .with_name("mx.test")
        .with_tls(certificate.context.clone())
        .with_insecure_auth(true)
        .with_require_auth(true);
    let smtp = SmtpServer::new(config, hooks);
    tokio::spawn(smtp.handle(server, address(40_000), address(587), rx));

    (
        Client {
            stream: BufReader::new(client),
        },
        shutdown,
    )
}

/// Send STARTTLS and complete the handshake on the same stream.
async fn upgrade(
    mut client: Client<DuplexStream>,
    certificate: &Certificate,
) -> Client<tokio_rustls::client::TlsStream<DuplexStream>> {
    assert_eq!(client.code("STARTTLS").await, 220);

    let config = ClientConfig::builder()
        .with_root_certificates(certificate.roots.clone())
        .with_no_client_auth();
    let connector = TlsConnector::from(Arc::new(config));
    let server_name = ServerName::try_from("localhost").unwrap();

    let stream = connector
        .connect(server_name, client.stream.into_inner())
        .await
        .unwrap();

    Client {
        stream: BufReader::new(stream),
    }
}

#[tokio::test]
async fn test_starttls_discards_authentication() {
    let certificate = certificate();
    let hooks = Recorder::new(true);
    let (mut client, _shutdown) = start(&certificate, hooks.clone());

    assert_eq!(client.reply().await.0, 220);
    assert_eq!(client.code("EHLO client.test").await, 250);
    let plain = format!("AUTH PLAIN {}", encode_plain(None, "u", "p"));
    assert_eq!(client.code(&plain).await, 235);

    let mut client = upgrade(client, &certificate).await;

    client.send("EHLO client.test").await;
    let (code, lines) = client.reply().await;
    assert_eq!(code, 250);
    assert!(!lines.contains(&"STARTTLS".to_string()));

    // The plaintext login no longer counts
    assert_eq!(client.code("MAIL FROM:<a@example.com>").await, 530);
    assert_eq!(hooks.log(), vec!["auth u plain", "reset tls"]);

    assert_eq!(client.code(&plain).await, 235);
    assert_eq!(client.code("MAIL FROM:<a@example.com>").await, 250);
    assert_eq!(client.code("QUIT").await, 221);
    assert!(client.closed().await);

    assert_eq!(
        hooks.log(),
        vec!["auth u plain", "reset tls", "auth u tls", "close"]
    );
}

#[tokio::test]
async fn test_starttls_before_auth_has_nothing_to_reset() {
    let certificate = certificate();
    let hooks = Recorder::new(true);
    let (mut client, _shutdown) = start(&certificate, hooks.clone());

    assert_eq!(client.reply().await.0, 220);
    assert_eq!(client.code("EHLO client.test").await, 250);

    let mut client = upgrade(client, &certificate).await;
    assert_eq!(client.code("EHLO client.test").await, 250);
    assert_eq!(client.code("QUIT").await, 221);
    assert!(client.closed().await);

    assert_eq!(hooks.log(), vec!["close"]);
}

#[tokio::test]
async fn test_unconfirmed_reset_closes_the_session() {
    let certificate = certificate();
    let hooks = Recorder::new(false);
    let (mut client, _shutdown) = start(&certificate, hooks.clone());

    assert_eq!(client.reply().await.0, 220);
    assert_eq!(client.code("EHLO client.test").await, 250);
    let plain = format!("AUTH PLAIN {}", encode_plain(None, "u", "p"));
    assert_eq!(client.code(&plain).await, 235);

    let mut client = upgrade(client, &certificate).await;

    assert_eq!(client.reply().await.0, 421);
    assert!(client.closed().await);
    assert_eq!(hooks.log(), vec!["auth u plain", "reset tls", "close"]);
}
