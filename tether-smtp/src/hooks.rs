//! The contract between the session engine and whatever decides what to do
//! with a session.
//!
//! Every decision point hands the implementation a [`Callback`]. The engine
//! suspends that session until the callback is completed, and treats a
//! callback dropped without completion as a temporary failure. Hook methods
//! themselves are synchronous and must not block: they should stash the
//! callback somewhere and return.

use core::fmt::{self, Display, Formatter};
use std::{net::SocketAddr, sync::Arc, time::SystemTime};

use tether_common::{address::Address, status::Status};
use thiserror::Error;
use tokio::sync::oneshot;
use ulid::Ulid;

use crate::{auth::Authentication, connection::TlsInfo, source::ByteSource};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(Ulid);

impl SessionId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for SessionId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}

/// Immutable metadata for one inbound connection.
///
/// A new value with the same id replaces the old one after STARTTLS.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionInfo {
    pub id: SessionId,
    pub peer: SocketAddr,
    pub local: SocketAddr,
    pub connected_at: SystemTime,
    pub tls: Option<TlsInfo>,
}

impl SessionInfo {
    #[must_use]
    pub fn new(peer: SocketAddr, local: SocketAddr) -> Self {
        Self {
            id: SessionId::new(),
            peer,
            local,
            connected_at: SystemTime::now(),
            tls: None,
        }
    }
}

/// Reverse-path and forward-paths collected before DATA.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Envelope {
    /// `None` for the null sender.
    pub sender: Option<Address>,
    pub recipients: Vec<Address>,
}

/// A negative outcome for a hook, sent to the client verbatim.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("{status} {message}")]
pub struct Rejection {
    pub status: Status,
    pub message: String,
}

impl Rejection {
    #[must_use]
    pub fn new(status: Status, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    /// `451`: the client may retry later.
    #[must_use]
    pub fn temporary(message: impl Into<String>) -> Self {
        Self::new(Status::ActionUnavailable, message)
    }
}

/// Returned through an accepted auth callback.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AuthResponse {
    /// Identity to log in place of the presented username.
    pub user: Option<String>,
}

pub type Pending<T> = oneshot::Receiver<Result<T, Rejection>>;

/// Exactly-once completion handle for a hook.
#[derive(Debug)]
pub struct Callback<T = ()> {
    tx: oneshot::Sender<Result<T, Rejection>>,
}

impl<T> Callback<T> {
    #[must_use]
    pub fn new() -> (Self, Pending<T>) {
        let (tx, rx) = oneshot::channel();
        (Self { tx }, rx)
    }

    /// Returns `false` if the session stopped waiting.
    pub fn complete(self, outcome: Result<T, Rejection>) -> bool {
        self.tx.send(outcome).is_ok()
    }

    pub fn reject(self, rejection: Rejection) -> bool {
        self.complete(Err(rejection))
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

impl<T: Default> Callback<T> {
    pub fn accept(self) -> bool {
        self.complete(Ok(T::default()))
    }
}

pub trait Hooks: Send + Sync {
    fn on_connect(&self, session: Arc<SessionInfo>, callback: Callback) {
        let _ = session;
        callback.accept();
    }

    /// Without an implementation every login fails.
    fn on_auth(
        &self,
        authentication: Authentication,
        session: Arc<SessionInfo>,
        callback: Callback<AuthResponse>,
    ) {
        let _ = (authentication, session);
        callback.reject(Rejection::new(
            Status::AuthFailed,
            "5.7.8 Authentication credentials invalid",
        ));
    }

    fn on_mail_from(
        &self,
        sender: Option<Address>,
        session: Arc<SessionInfo>,
        callback: Callback,
    ) {
        let _ = (sender, session);
        callback.accept();
    }

    fn on_rcpt_to(&self, recipient: Address, session: Arc<SessionInfo>, callback: Callback) {
        let _ = (recipient, session);
        callback.accept();
    }

    /// The source must be drained or dropped; the session keeps reading the
    /// message off the wire either way.
    fn on_data(
        &self,
        source: ByteSource,
        session: Arc<SessionInfo>,
        envelope: Envelope,
        callback: Callback,
    ) {
        let _ = (source, session, envelope);
        callback.accept();
    }

    /// The session dropped an earlier successful AUTH, as STARTTLS requires.
    /// No further command is read until the callback completes.
    fn on_reset(&self, session: Arc<SessionInfo>, callback: Callback) {
        let _ = session;
        callback.accept();
    }

    /// Called exactly once per session, after the last reply.
    fn on_close(&self, session: Arc<SessionInfo>) {
        let _ = session;
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[tokio::test]
    async fn test_callback_completes_once() {
        let (callback, pending) = Callback::<()>::new();
        assert!(callback.accept());
        assert_eq!(pending.await.unwrap(), Ok(()));
    }

    #[tokio::test]
    async fn test_callback_after_receiver_dropped() {
        let (callback, pending) = Callback::<AuthResponse>::new();
        drop(pending);

        assert!(callback.is_closed());
        assert!(!callback.reject(Rejection::temporary("gone")));
    }

    #[tokio::test]
    async fn test_dropped_callback_is_observable() {
        let (callback, pending) = Callback::<()>::new();
        drop(callback);
        assert!(pending.await.is_err());
    }

    #[test]
    fn test_rejection_display() {
        assert_eq!(
            Rejection::temporary("4.3.0 No outbound channel for this session").to_string(),
            "451 4.3.0 No outbound channel for this session"
        );
    }
}
