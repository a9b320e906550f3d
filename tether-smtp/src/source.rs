//! Push-based byte source handed to the data hook.
//!
//! The session writes into a [`SourceWriter`] while the consumer reads from a
//! [`ByteSource`]. Events are buffered in order, so an `end` sent before the
//! consumer starts reading is never lost.

use std::io;

use thiserror::Error;
use tokio::sync::mpsc;

const CAPACITY: usize = 16;

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("I/O error while reading message data: {0}")]
    Io(#[from] io::Error),

    #[error("Message exceeds the maximum size of {limit} bytes")]
    TooLarge { limit: usize },

    /// The writer went away without signalling the end of the message.
    #[error("Message data ended unexpectedly")]
    Truncated,

    #[error("Timed out waiting for message data")]
    Timeout,
}

#[derive(Debug)]
pub enum SourceEvent {
    Data(Vec<u8>),
    Error(SourceError),
    End,
}

/// Create a connected writer and source pair.
#[must_use]
pub fn channel() -> (SourceWriter, ByteSource) {
    let (tx, rx) = mpsc::channel(CAPACITY);
    (SourceWriter { tx }, ByteSource { rx })
}

/// Producing half, owned by the session.
#[derive(Debug)]
pub struct SourceWriter {
    tx: mpsc::Sender<SourceEvent>,
}

impl SourceWriter {
    /// Returns `false` once the consumer has gone away.
    pub async fn data(&self, bytes: Vec<u8>) -> bool {
        self.tx.send(SourceEvent::Data(bytes)).await.is_ok()
    }

    pub async fn error(self, error: SourceError) -> bool {
        self.tx.send(SourceEvent::Error(error)).await.is_ok()
    }

    pub async fn end(self) -> bool {
        self.tx.send(SourceEvent::End).await.is_ok()
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Consuming half.
#[derive(Debug)]
pub struct ByteSource {
    rx: mpsc::Receiver<SourceEvent>,
}

impl ByteSource {
    /// `None` means the writer was dropped and every buffered event has been
    /// read.
    pub async fn next_event(&mut self) -> Option<SourceEvent> {
        self.rx.recv().await
    }

    /// A source whose events are all available up front.
    #[must_use]
    pub fn from_events(events: impl IntoIterator<Item = SourceEvent>) -> Self {
        let events: Vec<_> = events.into_iter().collect();
        let (tx, rx) = mpsc::channel(events.len().max(1));

        for event in events {
            // Capacity matches the event count, so this cannot fail
            let _ = tx.try_send(event);
        }

        Self { rx }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_end_before_consumer() {
        let (writer, mut source) = channel();

        assert!(writer.data(b"a".to_vec()).await);
        assert!(writer.end().await);

        assert!(matches!(source.next_event().await, Some(SourceEvent::Data(d)) if d == b"a"));
        assert!(matches!(source.next_event().await, Some(SourceEvent::End)));
        assert!(source.next_event().await.is_none());
    }

    #[tokio::test]
    async fn test_writer_sees_dropped_source() {
        let (writer, source) = channel();
        drop(source);

        assert!(writer.is_closed());
        assert!(!writer.data(b"a".to_vec()).await);
    }

    #[tokio::test]
    async fn test_from_events() {
        let mut source = ByteSource::from_events([
            SourceEvent::Data(b"x".to_vec()),
            SourceEvent::Error(SourceError::Truncated),
        ]);

        assert!(matches!(source.next_event().await, Some(SourceEvent::Data(_))));
        assert!(matches!(
            source.next_event().await,
            Some(SourceEvent::Error(SourceError::Truncated))
        ));
        assert!(source.next_event().await.is_none());
    }
}
