//! In-process stand-in for the outbound provider.
//!
//! Accounts are registered up front. A user can be gated so that opening
//! their channel waits until the test releases it, which makes slow
//! providers deterministic.

use std::{
    collections::HashMap,
    io,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
};

use async_trait::async_trait;
use parking_lot::Mutex;
use tether::{Channel, Chunk, Delivery, DeliveryError, OutboundCredentials};
use tether_smtp::Envelope;
use tokio::sync::Semaphore;

#[derive(Default)]
struct Accounts {
    passwords: HashMap<String, String>,
    gates: HashMap<String, Arc<Semaphore>>,
}

#[derive(Clone, Default)]
pub struct MockDelivery {
    accounts: Arc<Mutex<Accounts>>,
    opened: Arc<Mutex<Vec<Arc<MockChannel>>>>,
    unreachable: Arc<AtomicBool>,
    fail_sends: Arc<AtomicBool>,
}

impl MockDelivery {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_account(self, user: &str, pass: &str) -> Self {
        self.accounts
            .lock()
            .passwords
            .insert(user.to_string(), pass.to_string());
        self
    }

    /// Every connect fails as if the provider refused the TCP connection.
    #[must_use]
    pub fn unreachable(self) -> Self {
        self.unreachable.store(true, Ordering::SeqCst);
        self
    }

    /// Channels fail on their first chunk.
    #[must_use]
    pub fn failing_sends(self) -> Self {
        self.fail_sends.store(true, Ordering::SeqCst);
        self
    }

    /// Opening a channel for `user` blocks until the returned gate gets a
    /// permit.
    pub fn gate(&self, user: &str) -> Arc<Semaphore> {
        let gate = Arc::new(Semaphore::new(0));
        self.accounts
            .lock()
            .gates
            .insert(user.to_string(), Arc::clone(&gate));
        gate
    }

    pub fn opened(&self) -> Vec<Arc<MockChannel>> {
        self.opened.lock().clone()
    }

    pub fn channel_for(&self, user: &str) -> Option<Arc<MockChannel>> {
        self.opened().into_iter().find(|channel| channel.user == user)
    }
}

#[async_trait]
impl Delivery for MockDelivery {
    async fn connect(
        &self,
        credentials: OutboundCredentials,
    ) -> Result<Arc<dyn Channel>, DeliveryError> {
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(DeliveryError::Connect {
                address: "mock:587".to_string(),
                source: io::Error::from(io::ErrorKind::ConnectionRefused),
            });
        }

        let gate = self.accounts.lock().gates.get(&credentials.user).cloned();
        if let Some(gate) = gate {
            let _ = gate.acquire().await.map(|permit| permit.forget());
        }

        let known = self.accounts.lock().passwords.get(&credentials.user).cloned();
        if known.as_deref() != Some(credentials.pass.as_str()) {
            return Err(DeliveryError::Rejected {
                stage: "AUTH",
                code: 535,
                message: "5.7.8 Bad credentials".to_string(),
            });
        }

        let channel = Arc::new(MockChannel::new(
            &credentials.user,
            self.fail_sends.load(Ordering::SeqCst),
        ));
        self.opened.lock().push(Arc::clone(&channel));
        Ok(channel)
    }
}

pub struct MockChannel {
    pub user: String,
    fail_sends: bool,
    envelopes: Mutex<Vec<Envelope>>,
    chunks: Mutex<Vec<Chunk>>,
    finished: AtomicUsize,
    aborted: AtomicUsize,
    released: AtomicBool,
}

impl MockChannel {
    fn new(user: &str, fail_sends: bool) -> Self {
        Self {
            user: user.to_string(),
            fail_sends,
            envelopes: Mutex::default(),
            chunks: Mutex::default(),
            finished: AtomicUsize::new(0),
            aborted: AtomicUsize::new(0),
            released: AtomicBool::new(false),
        }
    }

    pub fn envelopes(&self) -> Vec<Envelope> {
        self.envelopes.lock().clone()
    }

    pub fn chunks(&self) -> Vec<Chunk> {
        self.chunks.lock().clone()
    }

    pub fn body(&self) -> Vec<u8> {
        self.chunks
            .lock()
            .iter()
            .flat_map(|chunk| chunk.as_bytes().to_vec())
            .collect()
    }

    pub fn finished(&self) -> usize {
        self.finished.load(Ordering::SeqCst)
    }

    pub fn aborted(&self) -> usize {
        self.aborted.load(Ordering::SeqCst)
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Channel for MockChannel {
    async fn verify(&self) -> Result<(), DeliveryError> {
        Ok(())
    }

    async fn begin(&self, envelope: &Envelope) -> Result<(), DeliveryError> {
        self.envelopes.lock().push(envelope.clone());
        Ok(())
    }

    async fn send(&self, chunk: &Chunk) -> Result<(), DeliveryError> {
        if self.fail_sends {
            return Err(DeliveryError::Client(
                tether_smtp::client::ClientError::ConnectionClosed,
            ));
        }

        self.chunks.lock().push(chunk.clone());
        Ok(())
    }

    async fn finish(&self) -> Result<(), DeliveryError> {
        self.finished.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn abort(&self) {
        self.aborted.fetch_add(1, Ordering::SeqCst);
    }

    async fn release(&self) {
        self.released.store(true, Ordering::SeqCst);
    }
}
