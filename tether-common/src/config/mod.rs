//! Configuration types shared by the inbound listener and the outbound
//! provider connection.
//!
//! - [`timeouts`]: per-stage timeouts for both directions
//! - [`tls`]: certificate material for STARTTLS and the outbound TLS policy

pub mod timeouts;
pub mod tls;

pub use timeouts::{ClientTimeouts, ServerTimeouts, TimeoutConfig};
pub use tls::{TlsCertificatePolicy, TlsConfig, TlsContext, TlsPolicy};
