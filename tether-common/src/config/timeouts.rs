//! Timeouts for both sides of the relay.
//!
//! The inbound side follows the RFC 5321 recommendations for a receiving
//! server. The outbound side is tighter; a provider that stalls during
//! authentication should fail the inbound `AUTH` quickly rather than hold the
//! client for minutes.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Common accessors over either timeout set.
pub trait TimeoutConfig {
    /// Timeout for a single command round trip.
    fn command_timeout(&self) -> Duration;

    /// Timeout for message transfer.
    fn data_timeout(&self) -> Duration;

    /// Upper bound on a whole connection.
    fn connection_timeout(&self) -> Duration;
}

/// Inbound (listener) timeouts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerTimeouts {
    /// Waiting for the next command line.
    ///
    /// Default: 300 seconds
    #[serde(default = "defaults::server_command_secs")]
    pub command_secs: u64,

    /// Waiting for the authentication verdict, which includes opening the
    /// outbound connection.
    ///
    /// Default: 60 seconds
    #[serde(default = "defaults::server_auth_secs")]
    pub auth_secs: u64,

    /// Waiting for each block of message data.
    ///
    /// Default: 180 seconds
    #[serde(default = "defaults::server_data_block_secs")]
    pub data_block_secs: u64,

    /// Waiting for the relay verdict after the final dot.
    ///
    /// Default: 600 seconds
    #[serde(default = "defaults::server_data_termination_secs")]
    pub data_termination_secs: u64,

    /// Maximum total connection duration.
    ///
    /// Default: 1800 seconds
    #[serde(default = "defaults::server_connection_secs")]
    pub connection_secs: u64,
}

impl Default for ServerTimeouts {
    fn default() -> Self {
        Self {
            command_secs: defaults::server_command_secs(),
            auth_secs: defaults::server_auth_secs(),
            data_block_secs: defaults::server_data_block_secs(),
            data_termination_secs: defaults::server_data_termination_secs(),
            connection_secs: defaults::server_connection_secs(),
        }
    }
}

impl ServerTimeouts {
    #[must_use]
    pub const fn auth_timeout(&self) -> Duration {
        Duration::from_secs(self.auth_secs)
    }

    #[must_use]
    pub const fn data_termination_timeout(&self) -> Duration {
        Duration::from_secs(self.data_termination_secs)
    }
}

impl TimeoutConfig for ServerTimeouts {
    fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_secs)
    }

    fn data_timeout(&self) -> Duration {
        Duration::from_secs(self.data_block_secs)
    }

    fn connection_timeout(&self) -> Duration {
        Duration::from_secs(self.connection_secs)
    }
}

/// Outbound (provider) timeouts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientTimeouts {
    /// Establishing the TCP (and, for implicit TLS, the TLS) connection.
    ///
    /// Default: 30 seconds
    #[serde(default = "defaults::client_connect_secs")]
    pub connect_secs: u64,

    /// Greeting, EHLO and NOOP.
    ///
    /// Default: 30 seconds
    #[serde(default = "defaults::client_ehlo_secs")]
    pub ehlo_secs: u64,

    /// STARTTLS and the handshake that follows.
    ///
    /// Default: 30 seconds
    #[serde(default = "defaults::client_starttls_secs")]
    pub starttls_secs: u64,

    /// The whole AUTH exchange.
    ///
    /// Default: 30 seconds
    #[serde(default = "defaults::client_auth_secs")]
    pub auth_secs: u64,

    /// MAIL FROM.
    ///
    /// Default: 30 seconds
    #[serde(default = "defaults::client_mail_from_secs")]
    pub mail_from_secs: u64,

    /// Each RCPT TO.
    ///
    /// Default: 30 seconds
    #[serde(default = "defaults::client_rcpt_to_secs")]
    pub rcpt_to_secs: u64,

    /// DATA, each chunk written, and the final reply.
    ///
    /// Default: 120 seconds
    #[serde(default = "defaults::client_data_secs")]
    pub data_secs: u64,

    /// QUIT when a channel is released.
    ///
    /// Default: 10 seconds
    #[serde(default = "defaults::client_quit_secs")]
    pub quit_secs: u64,
}

impl Default for ClientTimeouts {
    fn default() -> Self {
        Self {
            connect_secs: defaults::client_connect_secs(),
            ehlo_secs: defaults::client_ehlo_secs(),
            starttls_secs: defaults::client_starttls_secs(),
            auth_secs: defaults::client_auth_secs(),
            mail_from_secs: defaults::client_mail_from_secs(),
            rcpt_to_secs: defaults::client_rcpt_to_secs(),
            data_secs: defaults::client_data_secs(),
            quit_secs: defaults::client_quit_secs(),
        }
    }
}

impl TimeoutConfig for ClientTimeouts {
    fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.ehlo_secs)
    }

    fn data_timeout(&self) -> Duration {
        Duration::from_secs(self.data_secs)
    }

    fn connection_timeout(&self) -> Duration {
        // Channels live as long as their inbound session, so the closest
        // meaningful bound is the time to establish one.
        Duration::from_secs(
            self.connect_secs + self.ehlo_secs + self.starttls_secs + self.auth_secs,
        )
    }
}

mod defaults {
    pub const fn server_command_secs() -> u64 {
        300
    }
    pub const fn server_auth_secs() -> u64 {
        60
    }
    pub const fn server_data_block_secs() -> u64 {
        180
    }
    pub const fn server_data_termination_secs() -> u64 {
        600
    }
    pub const fn server_connection_secs() -> u64 {
        1800
    }

    pub const fn client_connect_secs() -> u64 {
        30
    }
    pub const fn client_ehlo_secs() -> u64 {
        30
    }
    pub const fn client_starttls_secs() -> u64 {
        30
    }
    pub const fn client_auth_secs() -> u64 {
        30
    }
    pub const fn client_mail_from_secs() -> u64 {
        30
    }
    pub const fn client_rcpt_to_secs() -> u64 {
        30
    }
    pub const fn client_data_secs() -> u64 {
        120
    }
    pub const fn client_quit_secs() -> u64 {
        10
    }
}
