//! The outbound side of the relay, as the pipelines see it.
//!
//! A [`Delivery`] opens one [`Channel`] per authenticated inbound session,
//! using the credentials that session presented. The channel stays open for
//! as long as the session lives and carries every message relayed for it.

use core::fmt::{self, Debug, Formatter};
use std::{collections::BTreeMap, io, sync::Arc};

use async_trait::async_trait;
use tether_common::status::Status;
use tether_smtp::{Authentication, Envelope, Mechanism, Rejection, client::ClientError};
use thiserror::Error;

use crate::stream::Chunk;

/// Extra key carrying the PLAIN authorization identity.
pub const AUTHORIZATION_ID: &str = "authzid";

/// Credentials replayed against the provider.
#[derive(Clone, PartialEq, Eq)]
pub struct OutboundCredentials {
    pub kind: Mechanism,
    pub user: String,
    pub pass: String,
    /// Mechanism-specific options.
    pub extra: BTreeMap<String, String>,
}

impl OutboundCredentials {
    #[must_use]
    pub fn authorization_id(&self) -> Option<&str> {
        self.extra.get(AUTHORIZATION_ID).map(String::as_str)
    }
}

impl From<Authentication> for OutboundCredentials {
    fn from(authentication: Authentication) -> Self {
        let Authentication {
            mechanism,
            username,
            secret,
            authorization_id,
        } = authentication;

        let extra = authorization_id
            .map(|id| (AUTHORIZATION_ID.to_string(), id))
            .into_iter()
            .collect();

        Self {
            kind: mechanism,
            user: username,
            pass: secret,
            extra,
        }
    }
}

impl Debug for OutboundCredentials {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutboundCredentials")
            .field("kind", &self.kind)
            .field("user", &self.user)
            .field("pass", &"<redacted>")
            .field("extra", &self.extra)
            .finish()
    }
}

#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("Unable to connect to {address}: {source}")]
    Connect {
        address: String,
        #[source]
        source: io::Error,
    },

    #[error("Timed out waiting for the provider during {stage}")]
    Timeout { stage: &'static str },

    #[error("Provider rejected {stage}: {code} {message}")]
    Rejected {
        stage: &'static str,
        code: u16,
        message: String,
    },

    #[error("Provider does not offer STARTTLS and TLS is required")]
    TlsUnavailable,

    #[error(transparent)]
    Client(#[from] ClientError),

    #[error("Channel has already been released")]
    Released,
}

impl DeliveryError {
    /// Whether retrying later could succeed. Only a permanent reply from the
    /// provider is final.
    #[must_use]
    pub const fn is_temporary(&self) -> bool {
        match self {
            Self::Rejected { code, .. } => *code < 500,
            Self::Client(
                ClientError::SmtpError { code, .. } | ClientError::UnexpectedResponse { code, .. },
            ) => *code < 500,
            _ => true,
        }
    }

    /// Answer for the inbound `AUTH` that triggered the failed open.
    #[must_use]
    pub fn to_auth_rejection(&self) -> Rejection {
        if self.is_temporary() {
            Rejection::new(
                Status::TemporaryAuthFailure,
                "4.7.0 Temporary authentication failure",
            )
        } else {
            Rejection::new(Status::AuthFailed, "5.7.8 Authentication credentials invalid")
        }
    }

    /// Answer for the inbound `DATA` whose relay failed.
    #[must_use]
    pub fn to_data_rejection(&self) -> Rejection {
        if self.is_temporary() {
            Rejection::temporary("4.3.0 Message could not be relayed")
        } else {
            Rejection::new(
                Status::TransactionFailed,
                "5.0.0 Message rejected by provider",
            )
        }
    }
}

/// An open, authenticated connection to the provider.
///
/// Shared between the session table and any relay in flight, so every method
/// takes `&self`. The framing hooks default to no-ops for transports without
/// a transaction of their own.
#[async_trait]
pub trait Channel: Send + Sync {
    /// Confirm the connection is usable.
    async fn verify(&self) -> Result<(), DeliveryError>;

    /// Called before the first chunk of each message.
    async fn begin(&self, envelope: &Envelope) -> Result<(), DeliveryError> {
        let _ = envelope;
        Ok(())
    }

    async fn send(&self, chunk: &Chunk) -> Result<(), DeliveryError>;

    /// Called after the last chunk of each message.
    async fn finish(&self) -> Result<(), DeliveryError> {
        Ok(())
    }

    /// Called when a message cannot be completed.
    async fn abort(&self) {}

    /// Called once the owning session has gone.
    async fn release(&self) {}
}

#[async_trait]
pub trait Delivery: Send + Sync {
    /// Connect and authenticate with `credentials`.
    async fn connect(
        &self,
        credentials: OutboundCredentials,
    ) -> Result<Arc<dyn Channel>, DeliveryError>;

    /// [`Delivery::connect`], then [`Channel::verify`]. A channel that fails
    /// verification is released before the error is returned.
    async fn open(
        &self,
        credentials: OutboundCredentials,
    ) -> Result<Arc<dyn Channel>, DeliveryError> {
        let channel = self.connect(credentials).await?;

        if let Err(err) = channel.verify().await {
            channel.release().await;
            return Err(err);
        }

        Ok(channel)
    }
}
