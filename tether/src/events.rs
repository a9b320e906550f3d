//! One shared source of inbound engine events.
//!
//! Every subscriber owns an unbounded queue and names the kinds it wants.
//! `Close` and `Error` are terminal: they reach every subscriber, after which
//! all queues end. A subscriber that joins after the terminal event sees it
//! immediately and nothing else.

use core::{
    fmt::{self, Debug, Formatter},
    pin::Pin,
    task::{Context, Poll},
};
use std::sync::Arc;

use futures_util::Stream;
use parking_lot::Mutex;
use tether_common::{address::Address, error::ListenerError, internal};
use tether_smtp::{
    Authentication, ByteSource, Callback, Envelope, Rejection, SessionInfo, hooks::AuthResponse,
};
use tokio::sync::mpsc;

/// Shared handle on an engine callback. The first completion wins, later ones
/// are ignored and report `false`.
pub struct Reply<T = ()> {
    callback: Arc<Mutex<Option<Callback<T>>>>,
}

impl<T> Clone for Reply<T> {
    fn clone(&self) -> Self {
        Self {
            callback: Arc::clone(&self.callback),
        }
    }
}

impl<T> Debug for Reply<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reply")
            .field("pending", &self.is_pending())
            .finish()
    }
}

impl<T> Reply<T> {
    #[must_use]
    pub fn new(callback: Callback<T>) -> Self {
        Self {
            callback: Arc::new(Mutex::new(Some(callback))),
        }
    }

    /// Returns `true` only if this call completed the callback and the session
    /// was still waiting for it.
    pub fn complete(&self, outcome: Result<T, Rejection>) -> bool {
        let callback = self.callback.lock().take();
        callback.is_some_and(|callback| callback.complete(outcome))
    }

    pub fn reject(&self, rejection: Rejection) -> bool {
        self.complete(Err(rejection))
    }

    /// Not yet completed, and the session is still waiting.
    #[must_use]
    pub fn is_pending(&self) -> bool {
        self.callback
            .lock()
            .as_ref()
            .is_some_and(|callback| !callback.is_closed())
    }
}

impl<T: Default> Reply<T> {
    pub fn accept(&self) -> bool {
        self.complete(Ok(T::default()))
    }
}

/// A value that can be taken out of a cloned event exactly once.
pub struct Claim<T> {
    value: Arc<Mutex<Option<T>>>,
}

impl<T> Claim<T> {
    #[must_use]
    pub fn new(value: T) -> Self {
        Self {
            value: Arc::new(Mutex::new(Some(value))),
        }
    }

    pub fn take(&self) -> Option<T> {
        self.value.lock().take()
    }
}

impl<T> Clone for Claim<T> {
    fn clone(&self) -> Self {
        Self {
            value: Arc::clone(&self.value),
        }
    }
}

impl<T> Debug for Claim<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Claim")
            .field("claimed", &self.value.lock().is_none())
            .finish()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EventKind {
    Started,
    Connect,
    Auth,
    MailFrom,
    RcptTo,
    Data,
    Reset,
    Disconnect,
    Close,
    Error,
}

impl EventKind {
    /// Kinds that end the source and reach every subscriber.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Close | Self::Error)
    }
}

#[derive(Clone, Debug)]
pub enum Event {
    /// The listener is bound.
    Started,
    Connect {
        session: Arc<SessionInfo>,
        reply: Reply,
    },
    Auth {
        credentials: Authentication,
        session: Arc<SessionInfo>,
        reply: Reply<AuthResponse>,
    },
    MailFrom {
        sender: Option<Address>,
        session: Arc<SessionInfo>,
        reply: Reply,
    },
    RcptTo {
        recipient: Address,
        session: Arc<SessionInfo>,
        reply: Reply,
    },
    Data {
        source: Claim<ByteSource>,
        envelope: Envelope,
        session: Arc<SessionInfo>,
        reply: Reply,
    },
    /// A session discarded its authentication and waits until its channel
    /// is gone.
    Reset {
        session: Arc<SessionInfo>,
        reply: Reply,
    },
    /// A single inbound session ended.
    Disconnect { session: Arc<SessionInfo> },
    /// The listener stopped after a shutdown.
    Close,
    /// The listener failed.
    Error(Arc<ListenerError>),
}

impl Event {
    #[must_use]
    pub const fn kind(&self) -> EventKind {
        match self {
            Self::Started => EventKind::Started,
            Self::Connect { .. } => EventKind::Connect,
            Self::Auth { .. } => EventKind::Auth,
            Self::MailFrom { .. } => EventKind::MailFrom,
            Self::RcptTo { .. } => EventKind::RcptTo,
            Self::Data { .. } => EventKind::Data,
            Self::Reset { .. } => EventKind::Reset,
            Self::Disconnect { .. } => EventKind::Disconnect,
            Self::Close => EventKind::Close,
            Self::Error(_) => EventKind::Error,
        }
    }
}

struct Subscriber {
    kinds: Vec<EventKind>,
    tx: mpsc::UnboundedSender<Event>,
}

impl Subscriber {
    fn wants(&self, kind: EventKind) -> bool {
        kind.is_terminal() || self.kinds.contains(&kind)
    }
}

#[derive(Default)]
struct Subscribers {
    active: Vec<Subscriber>,
    terminal: Option<Event>,
}

/// Fan-out point between the engine and the pipelines.
#[derive(Clone, Default)]
pub struct EventBus {
    subscribers: Arc<Mutex<Subscribers>>,
}

impl EventBus {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Receive events of the given kinds, plus the terminal event.
    #[must_use]
    pub fn subscribe(&self, kinds: &[EventKind]) -> EventStream {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut subscribers = self.subscribers.lock();

        if let Some(terminal) = &subscribers.terminal {
            let _ = tx.send(terminal.clone());
        } else {
            subscribers.active.push(Subscriber {
                kinds: kinds.to_vec(),
                tx,
            });
        }

        EventStream { rx }
    }

    /// Deliver `event` to everyone subscribed to its kind and return how many
    /// received it.
    ///
    /// An event nobody receives is dropped along with any reply it carries,
    /// which the engine answers as a temporary failure.
    pub fn publish(&self, event: Event) -> usize {
        let kind = event.kind();
        let mut subscribers = self.subscribers.lock();

        if subscribers.terminal.is_some() {
            internal!(level = DEBUG, "Dropping {kind:?} event published after the source ended");
            return 0;
        }

        let mut delivered = 0;
        subscribers.active.retain(|subscriber| {
            if !subscriber.wants(kind) {
                return !subscriber.tx.is_closed();
            }

            let sent = subscriber.tx.send(event.clone()).is_ok();
            delivered += usize::from(sent);
            sent
        });

        if kind.is_terminal() {
            // Dropping the senders ends every stream once it is drained
            subscribers.active.clear();
            subscribers.terminal = Some(event);
        } else if delivered == 0 {
            internal!(level = WARN, "No subscriber for {kind:?} event");
        }

        delivered
    }

    /// Whether `Close` or `Error` has been published.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.subscribers.lock().terminal.is_some()
    }

    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().active.len()
    }
}

/// One subscriber's view of the bus. Ends after the terminal event.
#[derive(Debug)]
pub struct EventStream {
    rx: mpsc::UnboundedReceiver<Event>,
}

impl EventStream {
    pub async fn recv(&mut self) -> Option<Event> {
        self.rx.recv().await
    }
}

impl Stream for EventStream {
    type Item = Event;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}
