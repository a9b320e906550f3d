//! The inbound engine, seen as a source of [`Event`]s.
//!
//! Every hook the engine calls turns into one published event that carries
//! the hook's callback as a [`Reply`]. Nothing is decided here: whichever
//! pipeline receives the event completes the reply when it is ready.

use std::{net::SocketAddr, sync::Arc};

use parking_lot::Mutex;
use tether_common::{Signal, address::Address, error::ListenerError, internal};
use tether_smtp::{
    Authentication, ByteSource, Callback, Envelope, Hooks, ListenConfig, SessionInfo, SmtpServer,
    hooks::AuthResponse,
};
use thiserror::Error;
use tokio::{sync::broadcast, task::JoinHandle};

use crate::events::{Claim, Event, EventBus, Reply};

#[derive(Debug, Error, Clone)]
pub enum EventsError {
    #[error("Event source has already been started")]
    AlreadyStarted,

    #[error("Unable to start listener: {0}")]
    Listen(Arc<ListenerError>),
}

enum Lifecycle {
    Idle,
    Starting,
    Running {
        shutdown: broadcast::Sender<Signal>,
        _serve: JoinHandle<()>,
    },
    Stopped,
}

/// Owns one inbound engine and the bus its events are published on.
pub struct ServerEvents {
    socket: SocketAddr,
    config: ListenConfig,
    bus: EventBus,
    lifecycle: Mutex<Lifecycle>,
}

impl ServerEvents {
    #[must_use]
    pub fn new(socket: SocketAddr, config: ListenConfig) -> Self {
        Self {
            socket,
            config,
            bus: EventBus::new(),
            lifecycle: Mutex::new(Lifecycle::Idle),
        }
    }

    /// Subscribe through this before calling [`ServerEvents::start`] to see
    /// every event.
    #[must_use]
    pub const fn bus(&self) -> &EventBus {
        &self.bus
    }

    /// Bind the listener and start accepting sessions. Publishes `Started`
    /// once bound; `Close` or `Error` follows when the listener ends.
    ///
    /// # Errors
    ///
    /// [`EventsError::AlreadyStarted`] on any call after the first, and
    /// [`EventsError::Listen`] if binding fails. A bind failure is also
    /// published as the terminal `Error` event.
    pub async fn start(&self) -> Result<SocketAddr, EventsError> {
        {
            let mut lifecycle = self.lifecycle.lock();
            if !matches!(*lifecycle, Lifecycle::Idle) {
                return Err(EventsError::AlreadyStarted);
            }
            *lifecycle = Lifecycle::Starting;
        }

        let hooks = Arc::new(Publisher {
            bus: self.bus.clone(),
        });
        let server = SmtpServer::new(self.config.clone(), hooks);

        let listening = match server.listen(self.socket).await {
            Ok(listening) => listening,
            Err(err) => return Err(self.fail(err)),
        };
        let address = match listening.local_addr() {
            Ok(address) => address,
            Err(err) => return Err(self.fail(ListenerError::AcceptFailed(err))),
        };

        let (shutdown, receiver) = broadcast::channel(1);
        self.bus.publish(Event::Started);

        let bus = self.bus.clone();
        let serve = tokio::spawn(async move {
            match listening.serve(receiver).await {
                Ok(()) => {
                    internal!(level = DEBUG, "Listener closed");
                    bus.publish(Event::Close);
                }
                Err(err) => {
                    internal!(level = ERROR, "Listener failed: {err}");
                    bus.publish(Event::Error(Arc::new(err)));
                }
            }
        });

        let mut lifecycle = self.lifecycle.lock();
        if matches!(*lifecycle, Lifecycle::Stopped) {
            // Shut down while binding
            let _ = shutdown.send(Signal::Shutdown);
        } else {
            *lifecycle = Lifecycle::Running {
                shutdown,
                _serve: serve,
            };
        }

        Ok(address)
    }

    fn fail(&self, err: ListenerError) -> EventsError {
        let err = Arc::new(err);
        *self.lifecycle.lock() = Lifecycle::Stopped;
        self.bus.publish(Event::Error(Arc::clone(&err)));
        EventsError::Listen(err)
    }

    /// Stop accepting, let open sessions finish, then publish `Close`.
    pub fn shutdown(&self) {
        let previous = std::mem::replace(&mut *self.lifecycle.lock(), Lifecycle::Stopped);

        match previous {
            Lifecycle::Running { shutdown, .. } => {
                internal!(level = INFO, "Shutting down inbound listener");
                let _ = shutdown.send(Signal::Shutdown);
            }
            Lifecycle::Idle => {
                self.bus.publish(Event::Close);
            }
            Lifecycle::Starting | Lifecycle::Stopped => {}
        }
    }
}

impl Drop for ServerEvents {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Hook implementation that forwards everything onto the bus.
struct Publisher {
    bus: EventBus,
}

impl Hooks for Publisher {
    fn on_connect(&self, session: Arc<SessionInfo>, callback: Callback) {
        self.bus.publish(Event::Connect {
            session,
            reply: Reply::new(callback),
        });
    }

    fn on_auth(
        &self,
        authentication: Authentication,
        session: Arc<SessionInfo>,
        callback: Callback<AuthResponse>,
    ) {
        self.bus.publish(Event::Auth {
            credentials: authentication,
            session,
            reply: Reply::new(callback),
        });
    }

    fn on_mail_from(&self, sender: Option<Address>, session: Arc<SessionInfo>, callback: Callback) {
        self.bus.publish(Event::MailFrom {
            sender,
            session,
            reply: Reply::new(callback),
        });
    }

    fn on_rcpt_to(&self, recipient: Address, session: Arc<SessionInfo>, callback: Callback) {
        self.bus.publish(Event::RcptTo {
            recipient,
            session,
            reply: Reply::new(callback),
        });
    }

    fn on_data(
        &self,
        source: ByteSource,
        session: Arc<SessionInfo>,
        envelope: Envelope,
        callback: Callback,
    ) {
        self.bus.publish(Event::Data {
            source: Claim::new(source),
            envelope,
            session,
            reply: Reply::new(callback),
        });
    }

    fn on_reset(&self, session: Arc<SessionInfo>, callback: Callback) {
        self.bus.publish(Event::Reset {
            session,
            reply: Reply::new(callback),
        });
    }

    fn on_close(&self, session: Arc<SessionInfo>) {
        self.bus.publish(Event::Disconnect { session });
    }
}
