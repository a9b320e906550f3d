//! One inbound SMTP session, from greeting to close.

use std::{
    fmt::Display,
    net::SocketAddr,
    sync::Arc,
    time::{Duration, Instant},
};

use tether_common::{
    Signal, address::Address, config::TimeoutConfig, error::SessionError, incoming, internal, outgoing,
    status::Status, tracing,
};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    sync::broadcast,
};

use crate::{
    command::{Command, HeloVariant, MailParameters},
    connection::Connection,
    error::ConnectionError,
    hooks::{Callback, Envelope, Hooks, Pending, Rejection, SessionInfo},
    server::ListenConfig,
};

mod auth;
mod data;

/// Longest accepted command line. Large enough for an AUTH initial response.
const LINE_LIMIT: usize = 12_288;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum State {
    Connected,
    Greeted,
    Mail,
    Rcpt,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Flow {
    Continue,
    Close,
}

impl From<ConnectionError> for SessionError {
    fn from(err: ConnectionError) -> Self {
        match err {
            ConnectionError::Io(err) => Self::Connection(err),
            other => Self::Protocol(other.to_string()),
        }
    }
}

/// Await a hook's verdict. A dropped or late callback becomes `fallback`.
async fn settle<T>(pending: Pending<T>, limit: Duration, fallback: Rejection) -> Result<T, Rejection> {
    match tokio::time::timeout(limit, pending).await {
        Ok(Ok(outcome)) => outcome,
        Ok(Err(_)) => Err(fallback),
        Err(_) => {
            internal!(level = WARN, "Timed out waiting for a hook verdict");
            Err(fallback)
        }
    }
}

/// Shutdown is the only signal, so a lag or a dropped sender means the same.
async fn shutdown_requested(shutdown: &mut broadcast::Receiver<Signal>) {
    let _ = shutdown.recv().await;
}

pub(crate) struct Session<S> {
    connection: Connection<S>,
    info: Arc<SessionInfo>,
    config: Arc<ListenConfig>,
    hooks: Arc<dyn Hooks>,
    banner: String,
    state: State,
    /// Set by EHLO, which is required before AUTH.
    extended: bool,
    authenticated: bool,
    envelope: Envelope,
    started: Instant,
}

impl<S: AsyncRead + AsyncWrite + Unpin + Send> Session<S> {
    pub(crate) fn new(
        stream: S,
        peer: SocketAddr,
        local: SocketAddr,
        config: Arc<ListenConfig>,
        hooks: Arc<dyn Hooks>,
    ) -> Self {
        Self {
            connection: Connection::new(stream),
            info: Arc::new(SessionInfo::new(peer, local)),
            banner: config.banner(),
            config,
            hooks,
            state: State::Connected,
            extended: false,
            authenticated: false,
            envelope: Envelope::default(),
            started: Instant::now(),
        }
    }

    #[tracing::instrument(
        level = "debug",
        skip_all,
        fields(session = %self.info.id, peer = %self.info.peer)
    )]
    pub(crate) async fn run(
        mut self,
        mut shutdown: broadcast::Receiver<Signal>,
    ) -> Result<(), SessionError> {
        internal!("Connected");

        let result = self.serve(&mut shutdown).await;

        self.hooks.on_close(Arc::clone(&self.info));
        internal!("Connection closed");

        result
    }

    async fn reply(&mut self, status: Status, message: impl Display) -> Result<(), SessionError> {
        let line = format!("{status} {message}");
        outgoing!("{line}");
        self.connection.send(&line).await?;
        Ok(())
    }

    async fn reject(&mut self, rejection: &Rejection) -> Result<(), SessionError> {
        self.reply(rejection.status, &rejection.message).await
    }

    /// Next client line under `limit`. Answers `421` and fails on timeout.
    async fn next_line(&mut self, limit: Duration) -> Result<Option<Vec<u8>>, SessionError> {
        loop {
            match tokio::time::timeout(limit, self.connection.read_line(LINE_LIMIT)).await {
                Ok(Ok(line)) => return Ok(line),
                Ok(Err(ConnectionError::LineTooLong(_))) => {
                    self.reply(Status::SyntaxError, "5.5.6 Line too long").await?;
                }
                Ok(Err(err)) => return Err(err.into()),
                Err(_) => {
                    tracing::warn!(state = ?self.state, "Client connection timed out");
                    let _ = self
                        .reply(Status::Unavailable, "4.4.2 Timeout waiting for client")
                        .await;
                    return Err(SessionError::Timeout(limit.as_secs()));
                }
            }
        }
    }

    async fn serve(&mut self, shutdown: &mut broadcast::Receiver<Signal>) -> Result<(), SessionError> {
        let (callback, pending) = Callback::new();
        self.hooks.on_connect(Arc::clone(&self.info), callback);

        let verdict = settle(
            pending,
            self.config.timeouts.command_timeout(),
            Rejection::new(Status::Unavailable, "4.3.0 Service not available"),
        )
        .await;

        if let Err(rejection) = verdict {
            internal!(level = INFO, "Connection refused: {rejection}");
            return self.reject(&rejection).await;
        }

        let greeting = format!("{} ESMTP", self.banner);
        self.reply(Status::ServiceReady, greeting).await?;

        let lifetime = self.config.timeouts.connection_timeout();
        let command_timeout = self.config.timeouts.command_timeout();

        loop {
            if self.started.elapsed() >= lifetime {
                tracing::warn!(
                    max_secs = lifetime.as_secs(),
                    "Connection exceeded maximum lifetime, closing"
                );
                let _ = self
                    .reply(Status::Unavailable, "4.4.2 Connection time limit exceeded")
                    .await;
                return Err(SessionError::Timeout(lifetime.as_secs()));
            }

            let line = tokio::select! {
                () = shutdown_requested(shutdown) => {
                    internal!(level = DEBUG, "Shutdown requested");
                    let _ = self.reply(Status::Unavailable, "4.3.2 Server shutting down").await;
                    return Err(SessionError::Shutdown);
                }
                line = self.next_line(command_timeout) => line?,
            };

            // Peer closed the connection
            let Some(line) = line else {
                return Ok(());
            };

            let command = Command::try_from(line.as_slice()).unwrap_or_else(|invalid| invalid);
            incoming!("{command}");

            if self.dispatch(command).await? == Flow::Close {
                return Ok(());
            }
        }
    }

    async fn dispatch(&mut self, command: Command) -> Result<Flow, SessionError> {
        match command {
            Command::Helo(variant) => self.greet(&variant).await?,
            Command::StartTls => return self.start_tls().await,
            Command::Auth { mechanism, initial } => {
                return self.authenticate(&mechanism, initial).await;
            }
            Command::MailFrom(sender, params) => self.mail_from(sender, &params).await?,
            Command::RcptTo(recipient) => self.rcpt_to(recipient).await?,
            Command::Data if self.state == State::Rcpt => return self.receive_data().await,
            Command::Data => {
                self.reply(Status::InvalidCommandSequence, "5.5.1 Need RCPT before DATA")
                    .await?;
            }
            Command::Rset => {
                self.envelope = Envelope::default();
                if self.state != State::Connected {
                    self.state = State::Greeted;
                }
                self.reply(Status::Ok, "2.0.0 Ok").await?;
            }
            Command::Noop => self.reply(Status::Ok, "2.0.0 Ok").await?,
            Command::Help => {
                self.reply(Status::HelpMessage, "2.0.0 See RFC 5321").await?;
            }
            Command::Quit => {
                self.reply(Status::GoodBye, "2.0.0 Bye").await?;
                return Ok(Flow::Close);
            }
            Command::Invalid(reason) => {
                tracing::debug!("Invalid command: {reason}");
                self.reply(Status::SyntaxError, "5.5.2 Syntax error").await?;
            }
        }

        Ok(Flow::Continue)
    }

    async fn greet(&mut self, variant: &HeloVariant) -> Result<(), SessionError> {
        self.envelope = Envelope::default();
        self.state = State::Greeted;

        match variant {
            HeloVariant::Helo(id) => {
                self.extended = false;
                let message = format!("{} says hello to {id}", self.banner);
                self.reply(Status::Ok, message).await
            }
            HeloVariant::Ehlo(id) => {
                self.extended = true;
                let mut lines = vec![format!("{} says hello to {id}", self.banner)];
                lines.extend(
                    self.config
                        .extensions(self.connection.is_tls())
                        .iter()
                        .map(ToString::to_string),
                );

                let last = lines.len() - 1;
                let response = lines
                    .iter()
                    .enumerate()
                    .map(|(index, line)| {
                        let separator = if index == last { ' ' } else { '-' };
                        format!("{}{separator}{line}", Status::Ok)
                    })
                    .collect::<Vec<_>>()
                    .join("\r\n");

                outgoing!("{response}");
                self.connection.send(&response).await?;
                Ok(())
            }
        }
    }

    async fn start_tls(&mut self) -> Result<Flow, SessionError> {
        let Some(tls) = self.config.tls.clone() else {
            self.reply(Status::NotImplemented, "5.5.1 STARTTLS not available")
                .await?;
            return Ok(Flow::Continue);
        };

        if self.connection.is_tls() {
            self.reply(Status::InvalidCommandSequence, "5.5.1 TLS already active")
                .await?;
            return Ok(Flow::Continue);
        }

        self.reply(Status::ServiceReady, "2.0.0 Ready to start TLS").await?;

        let info = self
            .connection
            .upgrade(&tls)
            .await
            .map_err(|err| SessionError::Tls(err.to_string()))?;

        internal!(
            level = DEBUG,
            "Connection upgraded with {} {}",
            info.protocol,
            info.cipher
        );

        self.info = Arc::new(SessionInfo {
            tls: Some(info),
            ..(*self.info).clone()
        });
        // RFC 3207: forget everything learned over plaintext
        self.state = State::Connected;
        self.extended = false;
        self.envelope = Envelope::default();

        if std::mem::take(&mut self.authenticated) {
            let (callback, pending) = Callback::new();
            self.hooks.on_reset(Arc::clone(&self.info), callback);

            let verdict = settle(
                pending,
                self.config.timeouts.command_timeout(),
                Rejection::new(Status::Unavailable, "4.3.0 Service not available"),
            )
            .await;

            if let Err(rejection) = verdict {
                internal!(level = WARN, "Earlier authentication was not discarded: {rejection}");
                self.reject(&rejection).await?;
                return Ok(Flow::Close);
            }
        }

        Ok(Flow::Continue)
    }

    async fn mail_from(
        &mut self,
        sender: Option<Address>,
        params: &MailParameters,
    ) -> Result<(), SessionError> {
        match self.state {
            State::Connected => {
                return self
                    .reply(Status::InvalidCommandSequence, "5.5.1 Send HELO/EHLO first")
                    .await;
            }
            State::Mail | State::Rcpt => {
                return self
                    .reply(Status::InvalidCommandSequence, "5.5.1 Sender already specified")
                    .await;
            }
            State::Greeted => {}
        }

        if self.config.require_auth && !self.authenticated {
            return self
                .reply(Status::AuthRequired, "5.7.0 Authentication required")
                .await;
        }

        let limit = self.config.max_message_size;
        if let Some(declared) = params.size()
            && limit > 0
            && declared > limit
        {
            return self
                .reply(
                    Status::ExceededStorage,
                    format!(
                        "5.3.4 Declared message size {declared} exceeds maximum {limit} bytes"
                    ),
                )
                .await;
        }

        let (callback, pending) = Callback::new();
        self.hooks
            .on_mail_from(sender.clone(), Arc::clone(&self.info), callback);

        match settle(
            pending,
            self.config.timeouts.command_timeout(),
            Rejection::temporary("4.3.0 Sender could not be verified"),
        )
        .await
        {
            Ok(()) => {
                self.envelope = Envelope {
                    sender,
                    recipients: Vec::new(),
                };
                self.state = State::Mail;
                self.reply(Status::Ok, "2.1.0 Ok").await
            }
            Err(rejection) => self.reject(&rejection).await,
        }
    }

    async fn rcpt_to(
        &mut self,
        recipient: Address,
    ) -> Result<(), SessionError> {
        if !matches!(self.state, State::Mail | State::Rcpt) {
            return self
                .reply(Status::InvalidCommandSequence, "5.5.1 Need MAIL before RCPT")
                .await;
        }

        let (callback, pending) = Callback::new();
        self.hooks
            .on_rcpt_to(recipient.clone(), Arc::clone(&self.info), callback);

        match settle(
            pending,
            self.config.timeouts.command_timeout(),
            Rejection::temporary("4.3.0 Recipient could not be verified"),
        )
        .await
        {
            Ok(()) => {
                self.envelope.recipients.push(recipient);
                self.state = State::Rcpt;
                self.reply(Status::Ok, "2.1.5 Ok").await
            }
            Err(rejection) => self.reject(&rejection).await,
        }
    }
}
