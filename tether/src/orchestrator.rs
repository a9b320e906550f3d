//! Wires the pipelines to an event bus and a session table.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tether_common::{error::ListenerError, internal};

use crate::{
    delivery::Delivery,
    events::{Event, EventBus, EventKind, EventStream},
    pipeline::{self, Context},
    stream::Encoding,
    table::{self, TableHandle},
};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayConfig {
    /// How message bodies are rendered before they reach the channel.
    #[serde(default)]
    pub encoding: Encoding,
}

pub struct Orchestrator {
    delivery: Arc<dyn Delivery>,
    config: RelayConfig,
}

impl Orchestrator {
    #[must_use]
    pub fn new(delivery: Arc<dyn Delivery>, config: RelayConfig) -> Self {
        Self { delivery, config }
    }

    /// Subscribe every pipeline to `bus` and start the session table.
    ///
    /// Attach before the event source starts, or early events are missed.
    #[must_use]
    pub fn attach(self, bus: &EventBus) -> Attached {
        // The actor stops by itself once the last handle is dropped
        let (table, _actor) = TableHandle::spawn();

        Attached {
            auth: bus.subscribe(&[EventKind::Auth]),
            relay: bus.subscribe(&[EventKind::Data]),
            lifecycle: bus.subscribe(&[
                EventKind::Connect,
                EventKind::MailFrom,
                EventKind::RcptTo,
                EventKind::Reset,
                EventKind::Disconnect,
            ]),
            context: Context {
                delivery: self.delivery,
                table,
                encoding: self.config.encoding,
            },
        }
    }
}

/// Pipelines subscribed and ready to run.
pub struct Attached {
    auth: EventStream,
    relay: EventStream,
    lifecycle: EventStream,
    context: Context,
}

impl Attached {
    #[must_use]
    pub fn table(&self) -> TableHandle {
        self.context.table.clone()
    }

    /// Run until the event source ends, then release any channel still in
    /// the table.
    ///
    /// # Errors
    ///
    /// Returns the listener's error if that is how the source ended.
    pub async fn run(self) -> Result<(), Arc<ListenerError>> {
        let Self {
            auth,
            relay,
            lifecycle,
            context,
        } = self;

        internal!(level = DEBUG, "Orchestrator running");

        let (auth, relay, lifecycle) = tokio::join!(
            pipeline::auth::run(auth, context.clone()),
            pipeline::relay::run(relay, context.clone()),
            pipeline::lifecycle::run(lifecycle, context.clone()),
        );

        match context.table.apply(table::clear()).await {
            Ok(transition) => {
                for entry in transition.displaced() {
                    entry.channel.release().await;
                }
            }
            Err(err) => internal!(level = WARN, "Unable to release channels: {err}"),
        }

        internal!(level = DEBUG, "Orchestrator finished");

        match [auth, relay, lifecycle].into_iter().flatten().next() {
            Some(Event::Error(err)) => Err(err),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_relay_config_defaults() {
        let config: RelayConfig = ron::from_str("()").unwrap();
        assert_eq!(config.encoding, Encoding::None);

        let config: RelayConfig = ron::from_str("(encoding: utf8)").unwrap();
        assert_eq!(config.encoding, Encoding::Utf8);
    }
}
