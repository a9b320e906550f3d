//! Session orchestration for the relay.
//!
//! [`server::ServerEvents`] turns the inbound engine's hooks into one shared
//! [`events::EventBus`]. The [`orchestrator::Orchestrator`] subscribes to it
//! and runs the pipelines: authentication opens an outbound
//! [`delivery::Channel`] and records it in the [`table`], data events are
//! joined against the table and relayed through that channel.

pub mod controller;
pub mod delivery;
pub mod events;
pub mod orchestrator;
pub mod pipeline;
pub mod provider;
pub mod server;
pub mod stream;
pub mod table;

pub use delivery::{Channel, Delivery, DeliveryError, OutboundCredentials};
pub use events::{Event, EventBus, EventKind, EventStream, Reply};
pub use orchestrator::{Orchestrator, RelayConfig};
pub use server::ServerEvents;
pub use stream::{Chunk, Encoding};
pub use table::{SessionTable, TableHandle};
