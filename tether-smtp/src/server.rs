use std::{future::Future, net::SocketAddr, sync::Arc};

use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use tether_common::{
    Signal,
    config::{ServerTimeouts, TlsContext},
    error::{ListenerError, ProtocolError, SessionError},
    internal, tracing,
};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::TcpListener,
    sync::broadcast::{self, error::RecvError},
    task::JoinHandle,
};

use crate::{auth::Mechanism, extensions::Extension, hooks::Hooks, session::Session};

mod defaults {
    use crate::auth::Mechanism;

    pub fn auth_methods() -> Vec<Mechanism> {
        vec![Mechanism::Plain, Mechanism::Login]
    }

    pub const fn max_message_size() -> usize {
        10_000_000
    }
}

/// Inbound listener settings. The listening address is supplied separately.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListenConfig {
    /// Banner hostname. Falls back to `$HOSTNAME`, then `localhost`.
    #[serde(default)]
    pub name: Option<String>,

    #[serde(default = "defaults::auth_methods")]
    pub auth_methods: Vec<Mechanism>,

    /// Offer STARTTLS using this certificate.
    #[serde(default)]
    pub tls: Option<TlsContext>,

    /// Zero disables the limit.
    #[serde(default = "defaults::max_message_size")]
    pub max_message_size: usize,

    /// Refuse `MAIL FROM` until the session has authenticated.
    #[serde(default)]
    pub require_auth: bool,

    /// Allow AUTH over plaintext even when STARTTLS is available.
    #[serde(default)]
    pub allow_insecure_auth: bool,

    #[serde(default)]
    pub timeouts: ServerTimeouts,
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            name: None,
            auth_methods: defaults::auth_methods(),
            tls: None,
            max_message_size: defaults::max_message_size(),
            require_auth: false,
            allow_insecure_auth: false,
            timeouts: ServerTimeouts::default(),
        }
    }
}

impl ListenConfig {
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    #[must_use]
    pub fn with_auth_methods(mut self, methods: Vec<Mechanism>) -> Self {
        self.auth_methods = methods;
        self
    }

    #[must_use]
    pub fn with_tls(mut self, tls: TlsContext) -> Self {
        self.tls = Some(tls);
        self
    }

    #[must_use]
    pub const fn with_max_message_size(mut self, size: usize) -> Self {
        self.max_message_size = size;
        self
    }

    #[must_use]
    pub const fn with_require_auth(mut self, require: bool) -> Self {
        self.require_auth = require;
        self
    }

    #[must_use]
    pub const fn with_insecure_auth(mut self, allow: bool) -> Self {
        self.allow_insecure_auth = allow;
        self
    }

    #[must_use]
    pub fn with_timeouts(mut self, timeouts: ServerTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    #[must_use]
    pub fn banner(&self) -> String {
        self.name
            .clone()
            .filter(|name| !name.is_empty())
            .or_else(|| std::env::var("HOSTNAME").ok())
            .unwrap_or_else(|| "localhost".to_string())
    }

    /// Whether AUTH may be used on a connection in this state.
    #[must_use]
    pub const fn auth_permitted(&self, secure: bool) -> bool {
        secure || self.tls.is_none() || self.allow_insecure_auth
    }

    /// Extensions advertised in response to EHLO.
    #[must_use]
    pub fn extensions(&self, secure: bool) -> Vec<Extension> {
        let mut extensions = vec![Extension::Size(self.max_message_size)];

        if self.tls.is_some() && !secure {
            extensions.push(Extension::StartTls);
        }

        if !self.auth_methods.is_empty() && self.auth_permitted(secure) {
            extensions.push(Extension::Auth(self.auth_methods.clone()));
        }

        extensions.push(Extension::EightBitMime);
        extensions.push(Extension::Help);
        extensions
    }

    /// # Errors
    ///
    /// Fails if the TLS material is missing, or authentication is required
    /// without any mechanism to perform it.
    pub fn validate(&self) -> Result<(), ProtocolError> {
        if let Some(tls) = &self.tls {
            tls.validate()?;
        }

        if self.require_auth && self.auth_methods.is_empty() {
            return Err(ProtocolError::InvalidConfiguration {
                field: "auth_methods".to_string(),
                reason: "require_auth is set but no mechanisms are enabled".to_string(),
            });
        }

        Ok(())
    }
}

/// The inbound engine: configuration plus the hooks every session reports to.
#[derive(Clone)]
pub struct SmtpServer {
    config: Arc<ListenConfig>,
    hooks: Arc<dyn Hooks>,
}

impl SmtpServer {
    #[must_use]
    pub fn new(config: ListenConfig, hooks: Arc<dyn Hooks>) -> Self {
        Self {
            config: Arc::new(config),
            hooks,
        }
    }

    #[must_use]
    pub fn config(&self) -> &ListenConfig {
        &self.config
    }

    /// Validate the configuration and bind.
    ///
    /// # Errors
    ///
    /// Fails on invalid configuration or if the address cannot be bound.
    pub async fn listen(self, socket: SocketAddr) -> Result<Listening, ListenerError> {
        self.config.validate()?;

        let listener = TcpListener::bind(socket)
            .await
            .map_err(|source| ListenerError::BindFailed {
                address: socket.to_string(),
                source,
            })?;

        internal!(
            level = INFO,
            "SMTP listener bound to {}",
            listener.local_addr().unwrap_or(socket)
        );

        Ok(Listening {
            listener,
            server: self,
        })
    }

    /// Drive a single session over an already accepted stream.
    pub fn handle<S>(
        &self,
        stream: S,
        peer: SocketAddr,
        local: SocketAddr,
        shutdown: broadcast::Receiver<Signal>,
    ) -> impl Future<Output = Result<(), SessionError>> + Send + 'static
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        Session::new(
            stream,
            peer,
            local,
            Arc::clone(&self.config),
            Arc::clone(&self.hooks),
        )
        .run(shutdown)
    }
}

/// A bound listener that has not started accepting yet.
pub struct Listening {
    listener: TcpListener,
    server: SmtpServer,
}

impl Listening {
    /// # Errors
    ///
    /// Fails if the bound socket cannot report its address.
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept connections until shutdown, then wait for every session to
    /// finish.
    ///
    /// # Errors
    ///
    /// An accept failure ends the listener.
    #[tracing::instrument(level = "debug", skip_all, err)]
    pub async fn serve(self, mut shutdown: broadcast::Receiver<Signal>) -> Result<(), ListenerError> {
        let mut sessions: Vec<JoinHandle<()>> = Vec::new();

        loop {
            tokio::select! {
                signal = shutdown.recv() => {
                    if matches!(signal, Ok(Signal::Shutdown) | Err(RecvError::Closed)) {
                        internal!(
                            level = INFO,
                            "SMTP listener received shutdown signal, finishing {} sessions ...",
                            sessions.len()
                        );
                        join_all(sessions).await;
                        return Ok(());
                    }
                }

                connection = self.listener.accept() => {
                    let (stream, peer) = connection?;
                    let local = stream.local_addr()?;
                    tracing::debug!("Connection received from {peer}");

                    sessions.retain(|session| !session.is_finished());

                    let session = self.server.handle(stream, peer, local, shutdown.resubscribe());
                    sessions.push(tokio::spawn(async move {
                        match session.await {
                            Ok(()) => {}
                            Err(err) if err.is_shutdown() || err.is_client_error() => {
                                internal!(level = DEBUG, "Session ended: {err}");
                            }
                            Err(err) => internal!(level = WARN, "Session failed: {err}"),
                        }
                    }));
                }
            }
        }
    }
}
