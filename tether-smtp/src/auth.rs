//! SASL mechanisms accepted on the inbound side and replayed on the outbound
//! side.
//!
//! Only mechanisms that carry the secret itself are supported: the relay has
//! to present the same credentials to the provider, so challenge/response
//! schemes such as CRAM-MD5 cannot be proxied.

use core::fmt::{self, Display, Formatter};
use std::str::FromStr;

use base64::{Engine as _, engine::general_purpose::STANDARD as B64};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Mechanism {
    /// RFC 4616
    Plain,
    Login,
    #[serde(rename = "XOAUTH2")]
    XOAuth2,
}

impl Mechanism {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Plain => "PLAIN",
            Self::Login => "LOGIN",
            Self::XOAuth2 => "XOAUTH2",
        }
    }
}

impl Display for Mechanism {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Mechanism {
    type Err = AuthError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        [Self::Plain, Self::Login, Self::XOAuth2]
            .into_iter()
            .find(|mechanism| s.eq_ignore_ascii_case(mechanism.as_str()))
            .ok_or_else(|| AuthError::UnsupportedMechanism(s.to_string()))
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("Unsupported authentication mechanism {0}")]
    UnsupportedMechanism(String),

    #[error("Invalid base64 in authentication exchange")]
    Encoding,

    #[error("Authentication payload is not valid UTF-8")]
    Utf8,

    #[error("Malformed {0} payload")]
    Malformed(Mechanism),

    #[error("Authentication cancelled by client")]
    Cancelled,
}

/// Credentials presented by an inbound client.
#[derive(Clone, PartialEq, Eq)]
pub struct Authentication {
    pub mechanism: Mechanism,
    pub username: String,
    /// Password, or bearer token for XOAUTH2.
    pub secret: String,
    /// PLAIN authorization identity, when different from the username.
    pub authorization_id: Option<String>,
}

impl Authentication {
    #[must_use]
    pub fn new(
        mechanism: Mechanism,
        username: impl Into<String>,
        secret: impl Into<String>,
    ) -> Self {
        Self {
            mechanism,
            username: username.into(),
            secret: secret.into(),
            authorization_id: None,
        }
    }
}

impl fmt::Debug for Authentication {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Authentication")
            .field("mechanism", &self.mechanism)
            .field("username", &self.username)
            .field("secret", &"<redacted>")
            .field("authorization_id", &self.authorization_id)
            .finish()
    }
}

/// A single client line during an AUTH exchange: `*` cancels, `=` is an
/// empty initial response.
fn decode(line: &str) -> Result<Vec<u8>, AuthError> {
    match line.trim() {
        "*" => Err(AuthError::Cancelled),
        "=" | "" => Ok(Vec::new()),
        encoded => B64.decode(encoded).map_err(|_| AuthError::Encoding),
    }
}

pub fn decode_text(line: &str) -> Result<String, AuthError> {
    String::from_utf8(decode(line)?).map_err(|_| AuthError::Utf8)
}

/// `[authzid] NUL authcid NUL passwd`
pub fn decode_plain(line: &str) -> Result<Authentication, AuthError> {
    let text = decode_text(line)?;
    let mut parts = text.split('\0');

    let (Some(authzid), Some(username), Some(secret), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(AuthError::Malformed(Mechanism::Plain));
    };

    if username.is_empty() {
        return Err(AuthError::Malformed(Mechanism::Plain));
    }

    Ok(Authentication {
        mechanism: Mechanism::Plain,
        username: username.to_string(),
        secret: secret.to_string(),
        authorization_id: (!authzid.is_empty() && authzid != username)
            .then(|| authzid.to_string()),
    })
}

/// `user=<user> ^A auth=Bearer <token> ^A ^A`
pub fn decode_xoauth2(line: &str) -> Result<Authentication, AuthError> {
    let text = decode_text(line)?;
    let mut username = None;
    let mut token = None;

    for field in text.split('\u{1}').filter(|field| !field.is_empty()) {
        if let Some(user) = field.strip_prefix("user=") {
            username = Some(user);
        } else if let Some(auth) = field.strip_prefix("auth=") {
            token = auth
                .strip_prefix("Bearer ")
                .or_else(|| auth.strip_prefix("bearer "));
        }
    }

    match (username, token) {
        (Some(username), Some(token)) if !username.is_empty() => Ok(Authentication::new(
            Mechanism::XOAuth2,
            username,
            token,
        )),
        _ => Err(AuthError::Malformed(Mechanism::XOAuth2)),
    }
}

#[must_use]
pub fn encode_text(text: &str) -> String {
    B64.encode(text)
}

#[must_use]
pub fn encode_plain(authorization_id: Option<&str>, username: &str, secret: &str) -> String {
    B64.encode(format!(
        "{}\0{username}\0{secret}",
        authorization_id.unwrap_or_default()
    ))
}

#[must_use]
pub fn encode_xoauth2(username: &str, token: &str) -> String {
    B64.encode(format!("user={username}\u{1}auth=Bearer {token}\u{1}\u{1}"))
}
