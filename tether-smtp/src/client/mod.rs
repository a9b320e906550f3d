//! SMTP client used to talk to the outbound provider.
//!
//! Supports plain TCP, implicit TLS and STARTTLS, plus the AUTH mechanisms
//! the relay accepts inbound so credentials can be replayed unchanged.
//!
//! ```no_run
//! use tether_smtp::client::SmtpClient;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut client = SmtpClient::connect("smtp.example.com:587", "smtp.example.com".to_string()).await?;
//! client.read_greeting().await?;
//! client.ehlo("relay.example.com").await?;
//! client.starttls().await?;
//! client.ehlo("relay.example.com").await?;
//! # Ok(())
//! # }
//! ```

mod error;
mod response;
mod smtp_client;

pub use error::{ClientError, Result};
pub use response::{Response, ResponseLine};
pub use smtp_client::SmtpClient;
