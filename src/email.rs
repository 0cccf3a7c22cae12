//! Mail data types shared by the session, decoder and transformer.

use bytes::Bytes;

/// SMTP envelope collected by the session from MAIL FROM and RCPT TO.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Envelope {
    pub mail_from: Option<String>,
    pub rcpt_to: Vec<String>,
}

/// One completed DATA payload, as delivered by the session in read order.
#[derive(Debug, Clone, Default)]
pub struct RawTransaction {
    pub envelope: Envelope,
    chunks: Vec<Bytes>,
}

impl RawTransaction {
    #[must_use]
    pub const fn new(envelope: Envelope, chunks: Vec<Bytes>) -> Self {
        Self { envelope, chunks }
    }

    /// Total payload size in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.chunks.iter().map(Bytes::len).sum()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.chunks.iter().all(Bytes::is_empty)
    }

    /// Concatenate the chunks in order, consuming the transaction.
    ///
    /// The chunks are dropped here; only the contiguous buffer survives.
    #[must_use]
    pub fn into_contiguous(self) -> (Envelope, Vec<u8>) {
        let mut data = Vec::with_capacity(self.len());
        for chunk in self.chunks {
            data.extend_from_slice(&chunk);
        }
        (self.envelope, data)
    }
}

/// An address with an optional display name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mailbox {
    pub address: String,
    pub name: Option<String>,
}

impl Mailbox {
    #[must_use]
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            name: None,
        }
    }
}

/// A decoded attachment. `bytes` never holds the transfer-encoded form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    pub name: String,
    pub mime_type: String,
    pub content_id: Option<String>,
    pub bytes: Vec<u8>,
}

/// Structured form of a received message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MailDocument {
    pub from: Option<Mailbox>,
    pub to: Vec<Mailbox>,
    pub cc: Vec<Mailbox>,
    pub bcc: Vec<Mailbox>,
    pub subject: String,
    pub body_text: Option<String>,
    pub body_html: Option<String>,
    /// Declared `type/subtype` of the root body.
    pub body_mime_type: String,
    pub attachments: Vec<Attachment>,
}

impl MailDocument {
    /// All header recipients, To first, then Cc, then Bcc.
    pub fn recipients(&self) -> impl Iterator<Item = &Mailbox> {
        self.to.iter().chain(&self.cc).chain(&self.bcc)
    }
}

impl Default for MailDocument {
    fn default() -> Self {
        Self {
            from: None,
            to: Vec::new(),
            cc: Vec::new(),
            bcc: Vec::new(),
            subject: String::new(),
            body_text: None,
            body_html: None,
            body_mime_type: "text/plain".to_string(),
            attachments: Vec::new(),
        }
    }
}
