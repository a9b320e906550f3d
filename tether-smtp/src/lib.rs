//! SMTP plumbing for the relay.
//!
//! The [`server`] half accepts submission sessions and reports every
//! decision point (connect, auth, envelope, data, close) to a [`hooks::Hooks`]
//! implementation that completes an explicit [`hooks::Callback`] whenever it
//! is ready. The [`client`] half speaks to the outbound provider.

pub mod auth;
pub mod client;
pub mod command;
pub mod connection;
pub mod error;
pub mod extensions;
pub mod hooks;
pub mod server;
pub mod session;
pub mod source;

pub use auth::{Authentication, Mechanism};
pub use hooks::{AuthResponse, Callback, Envelope, Hooks, Rejection, SessionId, SessionInfo};
pub use server::{ListenConfig, Listening, SmtpServer};
pub use source::{ByteSource, SourceError, SourceEvent, SourceWriter};
