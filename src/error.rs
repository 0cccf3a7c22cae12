//! Custom error types for smtp-graph-relay.

use std::fmt;
use std::io;

/// Main error type for relay operations.
#[derive(Debug)]
pub enum Error {
    /// I/O errors (listener, sockets)
    Io(io::Error),
    /// Configuration errors
    Config(String),
}

/// Reasons a DATA payload could not be decoded into a mail document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// The payload contained no bytes
    Empty,
    /// No blank line terminates the header block
    MissingHeaderTerminator,
    /// A header line is neither a field nor a folded continuation
    MalformedHeader { line: usize },
    /// A multipart entity declares no boundary parameter
    MissingBoundary,
    /// The closing delimiter of a multipart entity never appears
    UnterminatedBoundary(String),
    /// The MIME parser rejected the payload
    Unparseable,
}

/// Failure classes reported by the delivery client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryError {
    /// Network failures, timeouts, throttling and upstream 5xx
    Transient(String),
    /// Credential or authorization failures
    Auth(String),
    /// The API refused the message content
    Rejected { status: u16, message: String },
    /// The send was aborted because the relay is shutting down
    Cancelled,
}

impl DeliveryError {
    /// Whether the SMTP client may usefully retry later.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_) | Self::Cancelled)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "I/O error: {e}"),
            Self::Config(msg) => write!(f, "configuration error: {msg}"),
        }
    }
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => write!(f, "empty message"),
            Self::MissingHeaderTerminator => write!(f, "header block is not terminated"),
            Self::MalformedHeader { line } => write!(f, "malformed header on line {line}"),
            Self::MissingBoundary => write!(f, "multipart entity without boundary"),
            Self::UnterminatedBoundary(b) => write!(f, "unterminated multipart boundary {b:?}"),
            Self::Unparseable => write!(f, "message is not valid MIME"),
        }
    }
}

impl fmt::Display for DeliveryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transient(msg) => write!(f, "temporary failure: {msg}"),
            Self::Auth(msg) => write!(f, "authorization failed: {msg}"),
            Self::Rejected { status, message } => {
                write!(f, "rejected by API ({status}): {message}")
            }
            Self::Cancelled => write!(f, "delivery cancelled"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            Self::Config(_) => None,
        }
    }
}

impl std::error::Error for DecodeError {}

impl std::error::Error for DeliveryError {}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<reqwest::Error> for DeliveryError {
    fn from(e: reqwest::Error) -> Self {
        Self::Transient(e.to_string())
    }
}

/// Result type alias for relay operations.
pub type Result<T> = std::result::Result<T, Error>;
