//! Live sessions and the channel each one authenticated.
//!
//! The table is never changed in place. A single actor task owns the current
//! value and folds [`Mutation`]s over it in the order they arrive, publishing
//! every result as a fresh [`Arc<SessionTable>`]. Snapshot requests travel
//! through the same queue, so a snapshot always reflects every mutation that
//! was acknowledged before it was asked for.

use core::fmt::{self, Debug, Formatter};
use std::sync::Arc;

use ahash::AHashMap;
use tether_common::internal;
use tether_smtp::{SessionId, SessionInfo};
use thiserror::Error;
use tokio::{
    sync::{mpsc, oneshot, watch},
    task::JoinHandle,
};

use crate::delivery::Channel;

const QUEUE_DEPTH: usize = 256;

#[derive(Clone)]
pub struct Entry {
    pub session: Arc<SessionInfo>,
    pub channel: Arc<dyn Channel>,
}

impl Debug for Entry {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Entry")
            .field("session", &self.session.id)
            .finish_non_exhaustive()
    }
}

#[derive(Clone, Debug, Default)]
pub struct SessionTable {
    entries: AHashMap<SessionId, Entry>,
}

impl SessionTable {
    #[must_use]
    pub fn get(&self, id: &SessionId) -> Option<&Entry> {
        self.entries.get(id)
    }

    #[must_use]
    pub fn contains(&self, id: &SessionId) -> bool {
        self.entries.contains_key(id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// A copy of this table with `id` mapped to `entry`.
    #[must_use]
    pub fn with(&self, id: SessionId, entry: Entry) -> Self {
        let mut entries = self.entries.clone();
        entries.insert(id, entry);
        Self { entries }
    }

    /// A copy of this table without `id`.
    #[must_use]
    pub fn without(&self, id: &SessionId) -> Self {
        let mut entries = self.entries.clone();
        entries.remove(id);
        Self { entries }
    }
}

/// A pure step from one table to the next.
pub type Mutation = Box<dyn FnOnce(&SessionTable) -> SessionTable + Send>;

#[must_use]
pub fn insert(id: SessionId, entry: Entry) -> Mutation {
    Box::new(move |table| table.with(id, entry))
}

#[must_use]
pub fn remove(id: SessionId) -> Mutation {
    Box::new(move |table| table.without(&id))
}

/// Remove `id` only while it still maps to `channel`.
#[must_use]
pub fn remove_channel(id: SessionId, channel: Arc<dyn Channel>) -> Mutation {
    Box::new(move |table| match table.get(&id) {
        Some(entry) if Arc::ptr_eq(&entry.channel, &channel) => table.without(&id),
        _ => table.clone(),
    })
}

#[must_use]
pub fn clear() -> Mutation {
    Box::new(|_| SessionTable::default())
}

/// The tables on either side of one applied mutation.
#[derive(Clone, Debug)]
pub struct Transition {
    pub previous: Arc<SessionTable>,
    pub current: Arc<SessionTable>,
}

impl Transition {
    /// Entries the mutation dropped or replaced.
    pub fn displaced(&self) -> impl Iterator<Item = &Entry> {
        self.previous.entries.iter().filter_map(|(id, entry)| {
            match self.current.get(id) {
                Some(kept) if Arc::ptr_eq(&kept.channel, &entry.channel) => None,
                _ => Some(entry),
            }
        })
    }
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("Session table is no longer running")]
pub struct TableClosed;

enum Message {
    Apply {
        mutation: Mutation,
        done: oneshot::Sender<Transition>,
    },
    Snapshot {
        reply: oneshot::Sender<Arc<SessionTable>>,
    },
}

/// Cheap handle on the table actor. The actor stops once every handle is
/// gone.
#[derive(Clone)]
pub struct TableHandle {
    tx: mpsc::Sender<Message>,
    latest: watch::Receiver<Arc<SessionTable>>,
}

impl TableHandle {
    /// Start the actor from the empty table.
    #[must_use]
    pub fn spawn() -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(QUEUE_DEPTH);
        let (publish, latest) = watch::channel(Arc::new(SessionTable::default()));
        let actor = tokio::spawn(run(rx, publish));

        (Self { tx, latest }, actor)
    }

    /// Apply `mutation` and wait until its result is the current table.
    ///
    /// # Errors
    ///
    /// Fails if the actor has stopped.
    pub async fn apply(&self, mutation: Mutation) -> Result<Transition, TableClosed> {
        let (done, applied) = oneshot::channel();
        self.tx
            .send(Message::Apply { mutation, done })
            .await
            .map_err(|_| TableClosed)?;
        applied.await.map_err(|_| TableClosed)
    }

    /// The table after every mutation acknowledged so far.
    ///
    /// # Errors
    ///
    /// Fails if the actor has stopped.
    pub async fn snapshot(&self) -> Result<Arc<SessionTable>, TableClosed> {
        let (reply, snapshot) = oneshot::channel();
        self.tx
            .send(Message::Snapshot { reply })
            .await
            .map_err(|_| TableClosed)?;
        snapshot.await.map_err(|_| TableClosed)
    }

    /// The most recently published table, without queueing behind pending
    /// mutations.
    #[must_use]
    pub fn latest(&self) -> Arc<SessionTable> {
        Arc::clone(&self.latest.borrow())
    }
}

async fn run(mut rx: mpsc::Receiver<Message>, publish: watch::Sender<Arc<SessionTable>>) {
    let mut current = Arc::new(SessionTable::default());

    while let Some(message) = rx.recv().await {
        match message {
            Message::Apply { mutation, done } => {
                let next = Arc::new(mutation(&current));
                let previous = std::mem::replace(&mut current, next);

                internal!(
                    level = TRACE,
                    "Session table now holds {} sessions (was {})",
                    current.len(),
                    previous.len()
                );

                publish.send_replace(Arc::clone(&current));
                let _ = done.send(Transition {
                    previous,
                    current: Arc::clone(&current),
                });
            }
            Message::Snapshot { reply } => {
                let _ = reply.send(Arc::clone(&current));
            }
        }
    }

    internal!(level = DEBUG, "Session table stopped");
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;

    use async_trait::async_trait;
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{delivery::DeliveryError, stream::Chunk};

    struct Idle;

    #[async_trait]
    impl Channel for Idle {
        async fn verify(&self) -> Result<(), DeliveryError> {
            Ok(())
        }

        async fn send(&self, _chunk: &Chunk) -> Result<(), DeliveryError> {
            Ok(())
        }
    }

    fn entry() -> Entry {
        let address = SocketAddr::from(([127, 0, 0, 1], 25));
        Entry {
            session: Arc::new(SessionInfo::new(address, address)),
            channel: Arc::new(Idle),
        }
    }

    #[tokio::test]
    async fn test_apply_then_snapshot() {
        let (table, _actor) = TableHandle::spawn();
        let entry = entry();
        let id = entry.session.id;

        let transition = table.apply(insert(id, entry)).await.unwrap();
        assert!(transition.previous.is_empty());
        assert!(transition.current.contains(&id));

        assert!(table.snapshot().await.unwrap().contains(&id));
        assert!(table.latest().contains(&id));
    }

    #[tokio::test]
    async fn test_snapshots_are_immutable() {
        let (table, _actor) = TableHandle::spawn();
        let entry = entry();
        let id = entry.session.id;

        let before = table.snapshot().await.unwrap();
        table.apply(insert(id, entry)).await.unwrap();

        assert!(before.is_empty());
        assert_eq!(table.snapshot().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_mutations_are_not_lost() {
        let (table, _actor) = TableHandle::spawn();

        let inserts = (0..64).map(|_| {
            let table = table.clone();
            tokio::spawn(async move {
                let entry = entry();
                table.apply(insert(entry.session.id, entry)).await.unwrap();
            })
        });
        for insert in inserts.collect::<Vec<_>>() {
            insert.await.unwrap();
        }

        assert_eq!(table.snapshot().await.unwrap().len(), 64);
    }

    #[tokio::test]
    async fn test_remove_channel_only_matches_owner() {
        let (table, _actor) = TableHandle::spawn();
        let first = entry();
        let id = first.session.id;
        let stale = Arc::clone(&first.channel);

        table.apply(insert(id, first)).await.unwrap();
        let replacement = Entry {
            channel: Arc::new(Idle),
            ..entry()
        };
        let transition = table.apply(insert(id, replacement)).await.unwrap();
        assert_eq!(transition.displaced().count(), 1);

        table.apply(remove_channel(id, stale)).await.unwrap();
        assert!(table.snapshot().await.unwrap().contains(&id));

        let transition = table.apply(remove(id)).await.unwrap();
        assert_eq!(transition.displaced().count(), 1);
        assert!(transition.current.is_empty());
    }

    #[tokio::test]
    async fn test_closed_actor() {
        let (table, actor) = TableHandle::spawn();
        actor.abort();
        let _ = actor.await;

        assert_eq!(table.snapshot().await.unwrap_err(), TableClosed);
    }
}
