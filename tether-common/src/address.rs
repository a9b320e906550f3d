use std::{
    fmt::{self, Display},
    str::FromStr,
};

use mailparse::MailAddr;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AddressError {
    #[error("Unable to parse address: {0}")]
    Parse(String),

    #[error("Expected a single mailbox, found a group")]
    Group,

    #[error("Expected exactly one address, found {0}")]
    Count(usize),

    #[error("Address {0} has no domain")]
    MissingDomain(String),
}

/// A single envelope mailbox, `local-part@domain`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Address {
    local_part: String,
    domain: String,
}

impl Address {
    /// Parse one mailbox, with or without surrounding angle brackets.
    ///
    /// # Errors
    ///
    /// Fails on anything other than exactly one mailbox with a domain.
    pub fn parse(input: &str) -> Result<Self, AddressError> {
        let mut parsed = mailparse::addrparse(input.trim())
            .map_err(|err| AddressError::Parse(err.to_string()))?;

        if parsed.len() != 1 {
            return Err(AddressError::Count(parsed.len()));
        }

        match parsed.remove(0) {
            MailAddr::Group(_) => Err(AddressError::Group),
            MailAddr::Single(info) => {
                let (local_part, domain) = info
                    .addr
                    .rsplit_once('@')
                    .filter(|(local, domain)| !local.is_empty() && !domain.is_empty())
                    .ok_or_else(|| AddressError::MissingDomain(info.addr.clone()))?;

                Ok(Self {
                    local_part: local_part.to_string(),
                    domain: domain.to_ascii_lowercase(),
                })
            }
        }
    }

    #[must_use]
    pub fn local_part(&self) -> &str {
        &self.local_part
    }

    #[must_use]
    pub fn domain(&self) -> &str {
        &self.domain
    }
}

impl FromStr for Address {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.local_part, self.domain)
    }
}
