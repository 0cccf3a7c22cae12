//! SMTP reply codes and their wire form.

use std::borrow::Cow;
use std::fmt;

use crate::error::{DecodeError, DeliveryError};

/// A reply line (or lines) sent back to the SMTP client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub code: u16,
    pub text: Cow<'static, str>,
}

impl Reply {
    pub const fn new(code: u16, text: &'static str) -> Self {
        Self {
            code,
            text: Cow::Borrowed(text),
        }
    }

    pub fn with_text(code: u16, text: impl Into<String>) -> Self {
        Self {
            code,
            text: Cow::Owned(text.into()),
        }
    }

    pub const OK: Self = Self::new(250, "OK");
    pub const BYE: Self = Self::new(221, "Bye");
    pub const START_DATA: Self = Self::new(354, "End data with <CR><LF>.<CR><LF>");
    pub const SHUTTING_DOWN: Self = Self::new(421, "4.3.2 Service shutting down");
    pub const TOO_LARGE: Self = Self::new(552, "5.3.4 Message size exceeds fixed limit");
    pub const SYNTAX_ERROR: Self = Self::new(500, "5.5.2 Command not recognized");
    pub const LINE_TOO_LONG: Self = Self::new(500, "5.5.6 Line too long");
    pub const NOT_IMPLEMENTED: Self = Self::new(502, "5.5.1 Command not implemented");
    pub const CANNOT_VRFY: Self = Self::new(252, "2.5.0 Cannot VRFY user");

    /// 2xx replies.
    #[must_use]
    pub const fn is_positive(&self) -> bool {
        self.code >= 200 && self.code < 300
    }

    /// 4xx replies: the client may try again later.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        self.code >= 400 && self.code < 500
    }

    /// 5xx replies.
    #[must_use]
    pub const fn is_permanent(&self) -> bool {
        self.code >= 500
    }

    /// Reply for a successfully relayed message.
    pub fn relayed(id: impl fmt::Display) -> Self {
        Self::with_text(250, format!("2.0.0 OK: relayed as {id}"))
    }

    /// Wire form; multi-line text is split into continuation lines.
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut lines = self.text.split('\n').peekable();
        let mut out = String::new();
        while let Some(line) = lines.next() {
            let sep = if lines.peek().is_some() { '-' } else { ' ' };
            out.push_str(&format!("{}{sep}{}\r\n", self.code, line.trim_end_matches('\r')));
        }
        out.into_bytes()
    }
}

impl fmt::Display for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.code, self.text)
    }
}

impl From<&DecodeError> for Reply {
    fn from(e: &DecodeError) -> Self {
        Self::with_text(554, format!("5.6.0 Message rejected: {e}"))
    }
}

impl From<&DeliveryError> for Reply {
    fn from(e: &DeliveryError) -> Self {
        match e {
            DeliveryError::Transient(_) => {
                Self::new(451, "4.3.0 Upstream temporarily unavailable, try again later")
            }
            DeliveryError::Auth(_) => Self::new(554, "5.7.0 Relay is not authorized upstream"),
            DeliveryError::Rejected { message, .. } => {
                Self::with_text(554, format!("5.0.0 Rejected upstream: {}", single_line(message)))
            }
            DeliveryError::Cancelled => Self::SHUTTING_DOWN,
        }
    }
}

fn single_line(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}
