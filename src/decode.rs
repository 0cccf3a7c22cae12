//! Decoding of raw DATA payloads into [`MailDocument`]s.
//!
//! `mail_parser` is deliberately forgiving, so the framing checks that decide
//! whether a payload is MIME at all run before and after it.

use mail_parser::{Address, Addr, ContentType, Message, MessageParser, MessagePart, MimeHeaders, PartType};

use crate::email::{Attachment, Envelope, MailDocument, Mailbox};
use crate::error::DecodeError;

const DEFAULT_BODY_TYPE: &str = "text/plain";
const DEFAULT_ATTACHMENT_TYPE: &str = "application/octet-stream";
const DEFAULT_MESSAGE_TYPE: &str = "message/rfc822";

/// Decode a complete RFC 5322 message.
pub fn decode(raw: &[u8]) -> Result<MailDocument, DecodeError> {
    if raw.is_empty() {
        return Err(DecodeError::Empty);
    }
    check_header_block(raw)?;

    let msg = MessageParser::default()
        .parse(raw)
        .ok_or(DecodeError::Unparseable)?;
    check_boundaries(&msg)?;

    let root = msg.root_part();
    let body_mime_type = root
        .content_type()
        .map_or_else(|| DEFAULT_BODY_TYPE.to_string(), mime_type);

    Ok(MailDocument {
        from: mailboxes(msg.from()).into_iter().next(),
        to: mailboxes(msg.to()),
        cc: mailboxes(msg.cc()),
        bcc: mailboxes(msg.bcc()),
        subject: msg.subject().unwrap_or_default().to_string(),
        body_text: first_body(&msg, &msg.text_body, false),
        body_html: first_body(&msg, &msg.html_body, true),
        body_mime_type,
        attachments: attachments(&msg),
    })
}

/// Decode a payload and fill gaps in the headers from the SMTP envelope.
///
/// A missing `From` header falls back to the envelope sender, and when the
/// headers name no recipients at all the envelope recipients become `To`.
pub fn decode_transaction(envelope: &Envelope, raw: &[u8]) -> Result<MailDocument, DecodeError> {
    let mut doc = decode(raw)?;

    if doc.from.is_none() {
        doc.from = envelope
            .mail_from
            .as_deref()
            .filter(|s| !s.is_empty())
            .map(Mailbox::new);
    }

    if doc.recipients().next().is_none() {
        doc.to = envelope.rcpt_to.iter().map(Mailbox::new).collect();
    }

    Ok(doc)
}

fn check_header_block(raw: &[u8]) -> Result<(), DecodeError> {
    let mut rest = raw;
    let mut line_no = 0;

    while let Some(end) = rest.iter().position(|&b| b == b'\n') {
        line_no += 1;
        let line = &rest[..end];
        let line = line.strip_suffix(b"\r").unwrap_or(line);

        match line.first() {
            None => return Ok(()),
            Some(b' ' | b'\t') if line_no > 1 => {}
            Some(_) if is_header_field(line) => {}
            Some(_) => return Err(DecodeError::MalformedHeader { line: line_no }),
        }

        rest = &rest[end + 1..];
    }

    Err(DecodeError::MissingHeaderTerminator)
}

fn is_header_field(line: &[u8]) -> bool {
    match line.iter().position(|&b| b == b':') {
        Some(0) | None => false,
        Some(colon) => {
            // Obsolete syntax allows whitespace between the name and the colon.
            let name = line[..colon].trim_ascii_end();
            !name.is_empty() && name.iter().all(|&b| (33..=126).contains(&b))
        }
    }
}

fn check_boundaries(msg: &Message<'_>) -> Result<(), DecodeError> {
    let raw = msg.raw_message.as_ref();

    for part in &msg.parts {
        if let Some(ct) = part.content_type() {
            if ct.ctype().eq_ignore_ascii_case("multipart") {
                let boundary = ct.attribute("boundary").ok_or(DecodeError::MissingBoundary)?;
                let closing = format!("--{boundary}--");
                if !contains(raw, closing.as_bytes()) {
                    return Err(DecodeError::UnterminatedBoundary(boundary.to_string()));
                }
            }
        }

        if let PartType::Message(nested) = &part.body {
            check_boundaries(nested)?;
        }
    }

    Ok(())
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|w| w == needle)
}

fn mime_type(ct: &ContentType<'_>) -> String {
    ct.subtype().map_or_else(
        || ct.ctype().to_string(),
        |subtype| format!("{}/{}", ct.ctype(), subtype),
    )
}

fn mailboxes(address: Option<&Address<'_>>) -> Vec<Mailbox> {
    match address {
        Some(Address::List(list)) => list.iter().filter_map(to_mailbox).collect(),
        Some(Address::Group(groups)) => groups
            .iter()
            .flat_map(|g| g.addresses.iter())
            .filter_map(to_mailbox)
            .collect(),
        None => Vec::new(),
    }
}

fn to_mailbox(addr: &Addr<'_>) -> Option<Mailbox> {
    let address = addr.address()?.trim();
    if address.is_empty() {
        return None;
    }
    Some(Mailbox {
        address: address.to_string(),
        name: addr
            .name()
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .map(String::from),
    })
}

// mail_parser mirrors plain text into html_body (and the reverse), so only
// parts that are natively of the requested kind count.
fn first_body(msg: &Message<'_>, ids: &[usize], html: bool) -> Option<String> {
    ids.iter()
        .filter_map(|&id| msg.part(id))
        .find_map(|part| match (&part.body, html) {
            (PartType::Text(text), false) | (PartType::Html(text), true) => Some(text.to_string()),
            _ => None,
        })
}

fn attachments(msg: &Message<'_>) -> Vec<Attachment> {
    msg.attachments()
        .filter(|part| part.is_message() || !is_inline(part))
        .map(to_attachment)
        .collect()
}

fn is_inline(part: &MessagePart<'_>) -> bool {
    part.content_disposition()
        .is_some_and(|cd| cd.ctype().eq_ignore_ascii_case("inline"))
}

fn to_attachment(part: &MessagePart<'_>) -> Attachment {
    let declared = part.content_type().map(mime_type);
    let mime_type = if part.is_message() {
        declared
            .filter(|t| t.to_ascii_lowercase().starts_with("message/"))
            .unwrap_or_else(|| DEFAULT_MESSAGE_TYPE.to_string())
    } else {
        declared.unwrap_or_else(|| DEFAULT_ATTACHMENT_TYPE.to_string())
    };

    Attachment {
        name: part.attachment_name().unwrap_or_default().to_string(),
        mime_type,
        content_id: part
            .content_id()
            .map(|s| s.trim_matches(['<', '>']).to_string()),
        bytes: part.contents().to_vec(),
    }
}
