use std::{net::SocketAddr, path::Path, sync::Arc};

use serde::Deserialize;
use tether_common::{internal, logging, tracing};
use tether_smtp::ListenConfig;

use crate::{
    orchestrator::{Orchestrator, RelayConfig},
    provider::{ProviderConfig, SmtpProvider},
    server::ServerEvents,
};

mod defaults {
    use std::net::SocketAddr;

    pub fn socket() -> SocketAddr {
        SocketAddr::from(([0, 0, 0, 0], 587))
    }
}

/// The whole relay, as described by its configuration file.
#[derive(Debug, Deserialize)]
pub struct Tether {
    /// Where inbound clients connect.
    #[serde(default = "defaults::socket")]
    pub socket: SocketAddr,

    #[serde(default)]
    pub listen: ListenConfig,

    pub provider: ProviderConfig,

    #[serde(default)]
    pub relay: RelayConfig,
}

/// Wait for SIGINT or SIGTERM.
#[tracing::instrument(level = "trace")]
async fn shutdown_signal() -> anyhow::Result<()> {
    let mut terminate = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            internal!("CTRL+C entered -- Enter it again to force shutdown");
        }
        _ = terminate.recv() => {
            internal!("Terminate Signal received, shutting down");
        }
    };

    Ok(())
}

impl Tether {
    /// Read and parse a RON configuration file.
    ///
    /// # Errors
    ///
    /// Fails if the file cannot be read or does not parse.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            anyhow::anyhow!("Failed to read config from {}: {}", path.display(), e)
        })?;

        ron::from_str(&content)
            .map_err(|e| anyhow::anyhow!("Invalid config in {}: {}", path.display(), e))
    }

    /// Check everything that can be checked before binding.
    ///
    /// # Errors
    ///
    /// Fails on missing TLS material, an unusable auth setup, or an
    /// incomplete provider.
    pub fn validate(&self) -> anyhow::Result<()> {
        self.listen.validate()?;
        self.provider.validate()?;

        if self.relay.encoding.is_text() {
            internal!(
                level = WARN,
                "relay.encoding is {:?}; the SMTP provider expects raw message bytes",
                self.relay.encoding
            );
        }

        Ok(())
    }

    /// Run the relay until a shutdown signal, or until the listener fails.
    ///
    /// # Errors
    ///
    /// Fails on invalid configuration, if the listener cannot bind, or if it
    /// fails while running.
    #[tracing::instrument(level = "trace", skip_all, err)]
    pub async fn run(self) -> anyhow::Result<()> {
        logging::init();
        self.validate()?;

        let provider = self.provider.address();
        let events = ServerEvents::new(self.socket, self.listen);
        let orchestrator = Orchestrator::new(Arc::new(SmtpProvider::new(self.provider)), self.relay)
            .attach(events.bus());

        let address = events.start().await?;
        internal!(level = INFO, "Relaying {address} through {provider}");

        let running = orchestrator.run();
        tokio::pin!(running);

        tokio::select! {
            result = &mut running => {
                // The listener ended by itself
                return result.map_err(|err| anyhow::anyhow!("Listener failed: {err}"));
            }
            result = shutdown_signal() => result?,
        }

        events.shutdown();
        internal!("Shutting down...");

        tokio::select! {
            result = &mut running => {
                result.map_err(|err| anyhow::anyhow!("Listener failed: {err}"))?;
            }
            _ = tokio::signal::ctrl_c() => {
                internal!(level = WARN, "Forced shutdown");
            }
        }

        Ok(())
    }
}
