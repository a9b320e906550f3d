//! SMTP submission to the upstream provider.
//!
//! Each channel is one SMTP connection, authenticated with the credentials
//! of the inbound session that opened it. Message bytes are written exactly
//! as the inbound client sent them, dot-stuffing and final dot included.

use std::{future::Future, sync::Arc, time::Duration};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tether_common::{
    config::{ClientTimeouts, TlsConfig},
    error::ProtocolError,
    internal, tracing,
};
use tether_smtp::{
    Envelope,
    client::{self, ClientError, Response, SmtpClient},
};
use tokio::sync::Mutex;

use crate::{
    delivery::{Channel, Delivery, DeliveryError, OutboundCredentials},
    stream::Chunk,
};

mod defaults {
    pub const fn port() -> u16 {
        587
    }
}

/// Where, and how, to reach the provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub host: String,

    #[serde(default = "defaults::port")]
    pub port: u16,

    /// Implicit TLS from the first byte (SMTPS).
    #[serde(default)]
    pub secure: bool,

    /// STARTTLS policy when `secure` is off, and certificate validation.
    #[serde(default)]
    pub tls: TlsConfig,

    /// Name sent in EHLO. Falls back to `$HOSTNAME`, then `localhost`.
    #[serde(default)]
    pub helo_name: Option<String>,

    #[serde(default)]
    pub timeouts: ClientTimeouts,
}

impl ProviderConfig {
    #[must_use]
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            secure: false,
            tls: TlsConfig::default(),
            helo_name: None,
            timeouts: ClientTimeouts::default(),
        }
    }

    #[must_use]
    pub const fn with_secure(mut self, secure: bool) -> Self {
        self.secure = secure;
        self
    }

    #[must_use]
    pub const fn with_tls(mut self, tls: TlsConfig) -> Self {
        self.tls = tls;
        self
    }

    #[must_use]
    pub fn with_helo_name(mut self, name: impl Into<String>) -> Self {
        self.helo_name = Some(name.into());
        self
    }

    #[must_use]
    pub fn with_timeouts(mut self, timeouts: ClientTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    #[must_use]
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    #[must_use]
    pub fn helo(&self) -> String {
        self.helo_name
            .clone()
            .filter(|name| !name.is_empty())
            .or_else(|| std::env::var("HOSTNAME").ok())
            .unwrap_or_else(|| "localhost".to_string())
    }

    /// # Errors
    ///
    /// Fails if the host is empty or the port is zero.
    pub fn validate(&self) -> Result<(), ProtocolError> {
        if self.host.trim().is_empty() {
            return Err(ProtocolError::MissingField("provider.host"));
        }

        if self.port == 0 {
            return Err(ProtocolError::InvalidConfiguration {
                field: "provider.port".to_string(),
                reason: "must be non-zero".to_string(),
            });
        }

        Ok(())
    }
}

/// Run one client step under a deadline.
async fn within<T>(
    secs: u64,
    stage: &'static str,
    step: impl Future<Output = client::Result<T>>,
) -> Result<T, DeliveryError> {
    tokio::time::timeout(Duration::from_secs(secs), step)
        .await
        .map_err(|_| DeliveryError::Timeout { stage })?
        .map_err(DeliveryError::from)
}

/// Accept `success` replies only, keeping the provider's answer otherwise.
fn expect(response: Response, stage: &'static str, success: u16) -> Result<Response, DeliveryError> {
    if response.code == success {
        Ok(response)
    } else {
        Err(DeliveryError::Rejected {
            stage,
            code: response.code,
            message: response.message(),
        })
    }
}

pub struct SmtpProvider {
    config: Arc<ProviderConfig>,
}

impl SmtpProvider {
    #[must_use]
    pub fn new(config: ProviderConfig) -> Self {
        Self {
            config: Arc::new(config),
        }
    }

    #[must_use]
    pub fn config(&self) -> &ProviderConfig {
        &self.config
    }

    async fn dial(&self) -> Result<SmtpClient, DeliveryError> {
        let config = &self.config;
        let address = config.address();
        let accept_invalid = config.tls.accepts_invalid_certs();

        let connect = async {
            if config.secure {
                SmtpClient::connect_tls(&address, config.host.clone(), accept_invalid).await
            } else {
                SmtpClient::connect(&address, config.host.clone())
                    .await
                    .map(|client| client.accept_invalid_certs(accept_invalid))
            }
        };

        match tokio::time::timeout(Duration::from_secs(config.timeouts.connect_secs), connect).await
        {
            Err(_) => Err(DeliveryError::Timeout { stage: "connect" }),
            Ok(Err(ClientError::Io(source))) => Err(DeliveryError::Connect { address, source }),
            Ok(result) => result.map_err(DeliveryError::from),
        }
    }
}

#[async_trait]
impl Delivery for SmtpProvider {
    #[tracing::instrument(
        level = "debug",
        skip_all,
        fields(provider = %self.config.address(), user = %credentials.user),
        err
    )]
    async fn connect(
        &self,
        credentials: OutboundCredentials,
    ) -> Result<Arc<dyn Channel>, DeliveryError> {
        let config = &self.config;
        let timeouts = &config.timeouts;
        let helo = config.helo();

        let mut client = self.dial().await?;

        expect(
            within(timeouts.ehlo_secs, "greeting", client.read_greeting()).await?,
            "greeting",
            220,
        )?;
        let mut ehlo = expect(
            within(timeouts.ehlo_secs, "EHLO", client.ehlo(&helo)).await?,
            "EHLO",
            250,
        )?;

        if !config.secure && !config.tls.is_disabled() {
            if ehlo.has_capability("STARTTLS") {
                expect(
                    within(timeouts.starttls_secs, "STARTTLS", client.starttls()).await?,
                    "STARTTLS",
                    220,
                )?;
                ehlo = expect(
                    within(timeouts.ehlo_secs, "EHLO", client.ehlo(&helo)).await?,
                    "EHLO",
                    250,
                )?;
            } else if config.tls.is_required() {
                return Err(DeliveryError::TlsUnavailable);
            }
        }

        let offered = ehlo.auth_mechanisms();
        if !offered.is_empty() && !offered.contains(&credentials.kind) {
            internal!(
                level = WARN,
                "Provider does not advertise {}, trying it anyway",
                credentials.kind
            );
        }

        expect(
            within(
                timeouts.auth_secs,
                "AUTH",
                client.authenticate(
                    credentials.kind,
                    &credentials.user,
                    &credentials.pass,
                    credentials.authorization_id(),
                ),
            )
            .await?,
            "AUTH",
            235,
        )?;

        internal!(level = DEBUG, "Authenticated to provider as {}", credentials.user);

        Ok(Arc::new(SmtpChannel {
            client: Mutex::new(Some(client)),
            timeouts: timeouts.clone(),
        }))
    }
}

/// One authenticated provider connection. `None` once aborted or released.
pub struct SmtpChannel {
    client: Mutex<Option<SmtpClient>>,
    timeouts: ClientTimeouts,
}

#[async_trait]
impl Channel for SmtpChannel {
    async fn verify(&self) -> Result<(), DeliveryError> {
        let mut guard = self.client.lock().await;
        let client = guard.as_mut().ok_or(DeliveryError::Released)?;

        expect(
            within(self.timeouts.ehlo_secs, "NOOP", client.noop()).await?,
            "NOOP",
            250,
        )
        .map(drop)
    }

    async fn begin(&self, envelope: &Envelope) -> Result<(), DeliveryError> {
        let mut guard = self.client.lock().await;
        let client = guard.as_mut().ok_or(DeliveryError::Released)?;
        let timeouts = &self.timeouts;

        let sender = envelope.sender.as_ref().map(ToString::to_string);
        let mut result = within(
            timeouts.mail_from_secs,
            "MAIL FROM",
            client.mail_from(sender.as_deref()),
        )
        .await
        .and_then(|response| expect(response, "MAIL FROM", 250));

        for recipient in &envelope.recipients {
            if result.is_err() {
                break;
            }

            result = within(
                timeouts.rcpt_to_secs,
                "RCPT TO",
                client.rcpt_to(&recipient.to_string()),
            )
            .await
            .and_then(|response| {
                if response.is_success() {
                    Ok(response)
                } else {
                    expect(response, "RCPT TO", 250)
                }
            });
        }

        if result.is_ok() {
            result = within(timeouts.data_secs, "DATA", client.data())
                .await
                .and_then(|response| expect(response, "DATA", 354));
        }

        if let Err(err @ DeliveryError::Rejected { .. }) = &result {
            // The connection is still in step; clear the half-built transaction
            internal!(level = DEBUG, "Resetting provider transaction after {err}");
            let _ = within(timeouts.mail_from_secs, "RSET", client.rset()).await;
        }

        result.map(drop)
    }

    async fn send(&self, chunk: &Chunk) -> Result<(), DeliveryError> {
        let mut guard = self.client.lock().await;
        let client = guard.as_mut().ok_or(DeliveryError::Released)?;

        within(self.timeouts.data_secs, "message data", client.write_raw(chunk.as_bytes())).await
    }

    async fn finish(&self) -> Result<(), DeliveryError> {
        let mut guard = self.client.lock().await;
        let client = guard.as_mut().ok_or(DeliveryError::Released)?;

        expect(
            within(self.timeouts.data_secs, "end of data", client.read_response()).await?,
            "end of data",
            250,
        )
        .map(drop)
    }

    async fn abort(&self) {
        if self.client.lock().await.take().is_some() {
            internal!(level = DEBUG, "Dropped provider connection mid-message");
        }
    }

    async fn release(&self) {
        let Some(mut client) = self.client.lock().await.take() else {
            return;
        };

        if let Err(err) = within(self.timeouts.quit_secs, "QUIT", client.quit()).await {
            internal!(level = DEBUG, "Provider QUIT failed: {err}");
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_provider_config_defaults() {
        let config: ProviderConfig = ron::from_str("(host: \"smtp.example.com\")").unwrap();

        assert_eq!(config.port, 587);
        assert!(!config.secure);
        assert_eq!(config.tls, TlsConfig::default());
        assert_eq!(config.address(), "smtp.example.com:587");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_provider_config_validation() {
        assert!(matches!(
            ProviderConfig::new("", 587).validate(),
            Err(ProtocolError::MissingField("provider.host"))
        ));
        assert!(ProviderConfig::new("smtp.example.com", 0).validate().is_err());
    }

    #[test]
    fn test_expect_keeps_provider_reply() {
        let response = Response::new(535, vec!["5.7.8 Bad credentials".to_string()]);

        let err = expect(response, "AUTH", 235).unwrap_err();
        assert!(matches!(
            err,
            DeliveryError::Rejected { stage: "AUTH", code: 535, ref message } if message == "5.7.8 Bad credentials"
        ));
    }

    #[tokio::test]
    async fn test_within_times_out() {
        let err = within(0, "greeting", std::future::pending::<client::Result<()>>())
            .await
            .unwrap_err();
        assert!(matches!(err, DeliveryError::Timeout { stage: "greeting" }));
    }

    #[tokio::test]
    #[cfg_attr(miri, ignore)]
    async fn test_connection_refused() {
        // Bind then drop to find a port nothing listens on
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let provider = SmtpProvider::new(ProviderConfig::new("127.0.0.1", port));
        let credentials = OutboundCredentials::from(tether_smtp::Authentication::new(
            tether_smtp::Mechanism::Plain,
            "u",
            "p",
        ));

        let err = provider.open(credentials).await.err().unwrap();
        assert!(matches!(err, DeliveryError::Connect { .. }), "{err}");
        assert!(err.is_temporary());
    }
}
