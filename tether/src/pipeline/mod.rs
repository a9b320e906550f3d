//! Event handling, one pipeline per concern.
//!
//! - [`auth`]: opens the outbound channel and records it in the session table
//! - [`relay`]: streams each message body into its session's channel
//! - [`lifecycle`]: admits connections and envelope commands, evicts sessions
//!
//! Each pipeline reads its own subscription and handles events concurrently;
//! a slow provider for one session never holds up another.

use std::{future::Future, sync::Arc};

use tether_common::{internal, status::Status};
use tether_smtp::{Rejection, SessionId, SourceError};
use thiserror::Error;
use tokio::task::JoinSet;

use crate::{
    delivery::{Delivery, DeliveryError},
    events::{Event, EventStream},
    stream::Encoding,
    table::{TableClosed, TableHandle},
};

pub mod auth;
pub mod lifecycle;
pub mod relay;

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("No outbound channel for session {0}")]
    MissingChannel(SessionId),

    #[error(transparent)]
    Table(#[from] TableClosed),

    #[error("Message data was already claimed")]
    SourceClaimed,

    #[error(transparent)]
    Source(#[from] SourceError),

    #[error(transparent)]
    Delivery(#[from] DeliveryError),
}

impl RelayError {
    /// The reply sent to the inbound client for this failure.
    #[must_use]
    pub fn to_rejection(&self) -> Rejection {
        match self {
            Self::MissingChannel(_) => {
                Rejection::temporary("4.3.0 No outbound channel for this session")
            }
            Self::Source(SourceError::TooLarge { limit }) => Rejection::new(
                Status::ExceededStorage,
                format!("5.3.4 Message exceeds maximum size of {limit} bytes"),
            ),
            Self::Delivery(err) => err.to_data_rejection(),
            Self::Table(_) | Self::SourceClaimed | Self::Source(_) => {
                Rejection::temporary("4.3.0 Message could not be relayed")
            }
        }
    }
}

/// What every pipeline shares.
#[derive(Clone)]
pub struct Context {
    pub delivery: Arc<dyn Delivery>,
    pub table: TableHandle,
    pub encoding: Encoding,
}

/// What happens to handlers still running when the source ends.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum OnEnd {
    Abort,
    Drain,
}

/// Feed every event to `handle`, running the futures it returns concurrently,
/// until the terminal event. Returns that event, or `None` if the stream
/// ended without one.
pub(crate) async fn drive<F, Fut>(
    name: &'static str,
    mut events: EventStream,
    on_end: OnEnd,
    mut handle: F,
) -> Option<Event>
where
    F: FnMut(Event) -> Option<Fut>,
    Fut: Future<Output = ()> + Send + 'static,
{
    let mut tasks = JoinSet::new();

    let terminal = loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(event) if event.kind().is_terminal() => break Some(event),
                Some(event) => {
                    if let Some(task) = handle(event) {
                        tasks.spawn(task);
                    }
                }
                None => break None,
            },

            Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                if let Err(err) = joined && err.is_panic() {
                    internal!(level = ERROR, "{name} handler panicked: {err}");
                }
            }
        }
    };

    match on_end {
        OnEnd::Abort => {
            if !tasks.is_empty() {
                internal!(level = DEBUG, "{name}: abandoning {} handlers", tasks.len());
            }
            tasks.shutdown().await;
        }
        OnEnd::Drain => while tasks.join_next().await.is_some() {},
    }

    internal!(level = DEBUG, "{name} pipeline finished");
    terminal
}
