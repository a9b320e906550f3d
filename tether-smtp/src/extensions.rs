use core::fmt::{self, Display};

use crate::auth::Mechanism;

/// SMTP service extensions advertised in the EHLO response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Extension {
    /// RFC 1870. Zero means no limit is declared.
    Size(usize),

    /// RFC 3207
    StartTls,

    /// RFC 4954. Only advertised once the configured policy allows AUTH on
    /// the current transport.
    Auth(Vec<Mechanism>),

    EightBitMime,

    Help,
}

impl Display for Extension {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> Result<(), fmt::Error> {
        match self {
            Self::Size(0) => fmt.write_str("SIZE"),
            Self::Size(max) => write!(fmt, "SIZE {max}"),
            Self::StartTls => fmt.write_str("STARTTLS"),
            Self::Auth(mechanisms) => {
                fmt.write_str("AUTH")?;
                for mechanism in mechanisms {
                    write!(fmt, " {mechanism}")?;
                }
                Ok(())
            }
            Self::EightBitMime => fmt.write_str("8BITMIME"),
            Self::Help => fmt.write_str("HELP"),
        }
    }
}
