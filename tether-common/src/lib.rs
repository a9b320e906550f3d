pub mod address;
pub mod config;
pub mod error;
pub mod logging;
pub mod status;

pub use tracing;

/// Process-wide lifecycle notifications, carried over a broadcast channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    /// Stop accepting work and drain what is in flight.
    Shutdown,
}
