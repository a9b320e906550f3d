use core::fmt::{self, Display, Formatter};

use ahash::AHashMap;
use tether_common::address::Address;

/// ESMTP parameters for MAIL FROM command (RFC 5321 Section 3.3).
///
/// Keys are stored upper-cased so lookups are case-insensitive.
#[derive(PartialEq, Eq, Debug, Clone, Default)]
pub struct MailParameters {
    params: AHashMap<String, Option<String>>,
}

impl MailParameters {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse `KEY=VALUE` and `FLAG` tokens.
    ///
    /// # Errors
    ///
    /// Rejects duplicate keys and a `SIZE` that is not a positive integer.
    pub fn from_params_str(params_str: &str) -> Result<Self, String> {
        let mut params = Self::new();

        for token in params_str.split_whitespace() {
            let (key, value) = token
                .split_once('=')
                .map_or((token, None), |(key, value)| (key, Some(value)));
            let key = key.to_ascii_uppercase();

            if params.params.contains_key(&key) {
                return Err(format!("Duplicate parameter '{key}' not allowed"));
            }

            if key == "SIZE" {
                match value.map(str::parse::<usize>) {
                    Some(Ok(0)) => return Err(String::from("SIZE=0 is not allowed")),
                    Some(Ok(_)) => {}
                    _ => return Err(format!("Invalid SIZE value: {}", value.unwrap_or(""))),
                }
            }

            params.params.insert(key, value.map(str::to_string));
        }

        Ok(params)
    }

    pub fn insert(&mut self, key: &str, value: impl Into<String>) {
        self.params
            .insert(key.to_ascii_uppercase(), Some(value.into()));
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.params.get(&key.to_ascii_uppercase())?.as_deref()
    }

    #[must_use]
    pub fn has(&self, key: &str) -> bool {
        self.params.contains_key(&key.to_ascii_uppercase())
    }

    /// Declared message size (RFC 1870), if present.
    #[must_use]
    pub fn size(&self) -> Option<usize> {
        self.get("SIZE")?.parse().ok()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }
}

impl Display for MailParameters {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let mut keys: Vec<_> = self.params.keys().collect();
        keys.sort_unstable();

        for (i, key) in keys.into_iter().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }

            match &self.params[key] {
                None => f.write_str(key)?,
                Some(value) => write!(f, "{key}={value}")?,
            }
        }

        Ok(())
    }
}

#[derive(PartialEq, Eq, Hash, Debug, Clone)]
pub enum HeloVariant {
    Ehlo(String),
    Helo(String),
}

impl HeloVariant {
    #[must_use]
    pub fn client_id(&self) -> &str {
        match self {
            Self::Ehlo(id) | Self::Helo(id) => id,
        }
    }
}

impl Display for HeloVariant {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ehlo(id) => write!(f, "EHLO {id}"),
            Self::Helo(id) => write!(f, "HELO {id}"),
        }
    }
}

#[derive(Eq, PartialEq, Debug, Clone)]
pub enum Command {
    Helo(HeloVariant),
    /// `None` is the null reverse-path, `MAIL FROM:<>`.
    MailFrom(Option<Address>, MailParameters),
    RcptTo(Address),
    Data,
    Rset,
    Noop,
    Help,
    Quit,
    StartTls,
    /// The mechanism is kept verbatim so an unknown one can be answered with
    /// 504 rather than a syntax error.
    Auth {
        mechanism: String,
        initial: Option<String>,
    },
    Invalid(String),
}

impl Display for Command {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Helo(v) => Display::fmt(v, fmt),
            Self::MailFrom(sender, params) => {
                let sender = sender.as_ref().map(ToString::to_string).unwrap_or_default();
                if params.is_empty() {
                    write!(fmt, "MAIL FROM:<{sender}>")
                } else {
                    write!(fmt, "MAIL FROM:<{sender}> {params}")
                }
            }
            Self::RcptTo(rcpt) => write!(fmt, "RCPT TO:<{rcpt}>"),
            Self::Data => fmt.write_str("DATA"),
            Self::Rset => fmt.write_str("RSET"),
            Self::Noop => fmt.write_str("NOOP"),
            Self::Help => fmt.write_str("HELP"),
            Self::Quit => fmt.write_str("QUIT"),
            Self::StartTls => fmt.write_str("STARTTLS"),
            // Never log the initial response, it carries the credentials
            Self::Auth { mechanism, initial } => {
                if initial.is_some() {
                    write!(fmt, "AUTH {mechanism} <credentials>")
                } else {
                    write!(fmt, "AUTH {mechanism}")
                }
            }
            Self::Invalid(s) => fmt.write_str(s),
        }
    }
}

fn strip_prefix_ignore_case<'a>(input: &'a str, prefix: &str) -> Option<&'a str> {
    input
        .get(..prefix.len())
        .filter(|head| head.eq_ignore_ascii_case(prefix))
        .map(|_| &input[prefix.len()..])
}

fn parse_mail_from(rest: &str) -> Result<Command, Command> {
    let rest = rest.trim();
    let (addr, params) = rest
        .split_once(char::is_whitespace)
        .map_or((rest, ""), |(addr, params)| (addr, params));

    let params = MailParameters::from_params_str(params).map_err(Command::Invalid)?;

    if addr.is_empty() {
        return Err(Command::Invalid(String::from("Expected a reverse-path")));
    }

    // mailparse does not accept the null sender
    if addr == "<>" {
        return Ok(Command::MailFrom(None, params));
    }

    Address::parse(addr)
        .map(|from| Command::MailFrom(Some(from), params))
        .map_err(|err| Command::Invalid(err.to_string()))
}

fn parse_auth(rest: &str) -> Result<Command, Command> {
    let mut parts = rest.split_whitespace();

    match (parts.next(), parts.next(), parts.next()) {
        (Some(mechanism), initial, None) => Ok(Command::Auth {
            mechanism: mechanism.to_string(),
            initial: initial.map(str::to_string),
        }),
        _ => Err(Command::Invalid(String::from(
            "Expected AUTH <mechanism> [initial-response]",
        ))),
    }
}

impl TryFrom<&str> for Command {
    type Error = Self;

    fn try_from(command: &str) -> Result<Self, Self::Error> {
        let trimmed = command.trim();

        if let Some(rest) = strip_prefix_ignore_case(trimmed, "MAIL FROM:") {
            return parse_mail_from(rest);
        }

        if let Some(rest) = strip_prefix_ignore_case(trimmed, "RCPT TO:") {
            let rest = rest.trim();
            let addr = rest.split_whitespace().next().unwrap_or_default();
            return Address::parse(addr)
                .map(Self::RcptTo)
                .map_err(|err| Self::Invalid(err.to_string()));
        }

        let (verb, rest) = trimmed
            .split_once(' ')
            .map_or((trimmed, ""), |(verb, rest)| (verb, rest.trim()));

        match verb.to_ascii_uppercase().as_str() {
            "EHLO" | "HELO" if rest.is_empty() => {
                Err(Self::Invalid(format!("Expected hostname in {trimmed}")))
            }
            "EHLO" => Ok(Self::Helo(HeloVariant::Ehlo(rest.to_string()))),
            "HELO" => Ok(Self::Helo(HeloVariant::Helo(rest.to_string()))),
            "AUTH" => parse_auth(rest),
            "DATA" if rest.is_empty() => Ok(Self::Data),
            "RSET" if rest.is_empty() => Ok(Self::Rset),
            "QUIT" if rest.is_empty() => Ok(Self::Quit),
            "STARTTLS" if rest.is_empty() => Ok(Self::StartTls),
            // Both may carry an argument that we are free to ignore
            "NOOP" => Ok(Self::Noop),
            "HELP" => Ok(Self::Help),
            _ => Err(Self::Invalid(command.to_owned())),
        }
    }
}

impl TryFrom<&[u8]> for Command {
    type Error = Self;

    fn try_from(command: &[u8]) -> Result<Self, Self::Error> {
        std::str::from_utf8(command).map_or_else(
            |_| Err(Self::Invalid("Unable to interpret command".to_string())),
            Self::try_from,
        )
    }
}

impl TryFrom<String> for Command {
    type Error = Self;

    fn try_from(command: String) -> Result<Self, Self::Error> {
        Self::try_from(command.as_str())
    }
}
