//! Mapping of decoded mail onto the Graph message schema.

use chrono::{DateTime, SecondsFormat, Utc};

use crate::email::{Attachment, MailDocument, Mailbox};
use crate::outbound::{BodyType, EmailAddress, FileAttachment, ItemBody, OutboundMessage, Recipient};

/// Tag put in front of every forwarded subject.
pub const SUBJECT_PREFIX: &str = "Scan from proxy: ";

/// Line separating the original body from the relay footer.
pub const SEPARATOR: &str = "------";

/// Builds [`OutboundMessage`]s. Holds only the footer host name.
#[derive(Debug, Clone)]
pub struct Transformer {
    host_name: String,
}

impl Transformer {
    #[must_use]
    pub fn new(host_name: impl Into<String>) -> Self {
        Self {
            host_name: host_name.into(),
        }
    }

    #[must_use]
    pub fn host_name(&self) -> &str {
        &self.host_name
    }

    #[must_use]
    pub fn transform(&self, doc: MailDocument) -> OutboundMessage {
        self.transform_at(doc, Utc::now())
    }

    /// Same as [`transform`](Self::transform) with a fixed footer timestamp.
    #[must_use]
    pub fn transform_at(&self, doc: MailDocument, now: DateTime<Utc>) -> OutboundMessage {
        let content_type = body_type(&doc.body_mime_type);

        // The declared type only labels the content. HTML is sent only without a text body.
        let chosen = doc.body_text.or(doc.body_html);

        let content = format!(
            "{}\n\n{SEPARATOR}\n\n{}",
            chosen.unwrap_or_default(),
            self.footer(now)
        );

        OutboundMessage {
            subject: format!("{SUBJECT_PREFIX}{}", doc.subject),
            body: ItemBody {
                content_type,
                content,
            },
            to_recipients: recipients(doc.to),
            cc_recipients: recipients(doc.cc),
            bcc_recipients: recipients(doc.bcc),
            attachments: doc.attachments.into_iter().map(file_attachment).collect(),
        }
    }

    fn footer(&self, now: DateTime<Utc>) -> String {
        format!(
            "Sent from SMTP Proxy on {}\n{}",
            self.host_name,
            now.to_rfc3339_opts(SecondsFormat::Micros, true)
        )
    }
}

/// HTML when the declared type mentions "html" in any case, text otherwise.
#[must_use]
pub fn body_type(mime_type: &str) -> BodyType {
    if mime_type.to_ascii_lowercase().contains("html") {
        BodyType::Html
    } else {
        BodyType::Text
    }
}

fn recipients(list: Vec<Mailbox>) -> Vec<Recipient> {
    list.into_iter()
        .map(|m| Recipient {
            email_address: EmailAddress {
                address: m.address,
                name: m.name,
            },
        })
        .collect()
}

fn file_attachment(att: Attachment) -> FileAttachment {
    FileAttachment {
        odata_type: FileAttachment::ODATA_TYPE,
        name: att.name,
        content_type: att.mime_type,
        content_id: att.content_id,
        content_bytes: att.bytes,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode::decode;
    use chrono::TimeZone;

    fn fixed_now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 17, 9, 30, 0).unwrap()
    }

    fn transformer() -> Transformer {
        Transformer::new("relay-host")
    }

    #[test]
    fn plain_text_scenario() {
        let raw = b"To: a@x.com\r\nSubject: Hi\r\n\r\nhello";
        let doc = decode(raw).unwrap();
        let out = transformer().transform_at(doc, fixed_now());

        assert_eq!(out.subject, "Scan from proxy: Hi");
        assert_eq!(out.body.content_type, BodyType::Text);
        assert_eq!(
            out.body.content,
            "hello\n\n------\n\nSent from SMTP Proxy on relay-host\n2026-10-17T09:30:00.000000Z"
        );
        assert_eq!(out.to_recipients.len(), 1);
        assert_eq!(out.to_recipients[0].email_address.address, "a@x.com");
        assert!(out.cc_recipients.is_empty());
        assert!(out.bcc_recipients.is_empty());
        assert!(out.attachments.is_empty());
    }

    #[test]
    fn body_is_unchanged_apart_from_footer() {
        for body in ["", "one line", "two\r\nlines\r\n", "Héllo Wörld! 🎉"] {
            let doc = MailDocument {
                body_text: Some(body.to_string()),
                ..MailDocument::default()
            };
            let out = transformer().transform_at(doc, fixed_now());
            let expected_tail = format!("\n\n{SEPARATOR}\n\nSent from SMTP Proxy on relay-host\n");
            let (head, tail) = out.body.content.split_at(body.len());
            assert_eq!(head, body);
            assert!(tail.starts_with(&expected_tail));
        }
    }

    #[test]
    fn content_type_follows_declared_mime_type() {
        let cases = [
            ("text/html", BodyType::Html),
            ("TEXT/HTML", BodyType::Html),
            ("text/plain", BodyType::Text),
            ("application/octet-stream", BodyType::Text),
        ];
        for (mime, expected) in cases {
            let doc = MailDocument {
                body_mime_type: mime.to_string(),
                body_text: Some("x".into()),
                ..MailDocument::default()
            };
            let out = transformer().transform_at(doc, fixed_now());
            assert_eq!(out.body.content_type, expected, "{mime}");
        }
    }

    #[test]
    fn html_type_labels_but_does_not_choose_body() {
        let doc = MailDocument {
            body_mime_type: "text/html".into(),
            body_text: Some("plain".into()),
            body_html: Some("<b>rich</b>".into()),
            ..MailDocument::default()
        };
        let out = transformer().transform_at(doc, fixed_now());
        assert_eq!(out.body.content_type, BodyType::Html);
        assert!(out.body.content.starts_with("plain\n\n------"));
    }

    #[test]
    fn html_body_used_only_without_text_body() {
        let doc = MailDocument {
            body_mime_type: "text/html".into(),
            body_text: None,
            body_html: Some("<b>rich</b>".into()),
            ..MailDocument::default()
        };
        let out = transformer().transform_at(doc, fixed_now());
        assert!(out.body.content.starts_with("<b>rich</b>\n\n------"));
    }

    #[test]
    fn alternative_message_is_sent_as_text() {
        let doc = MailDocument {
            body_mime_type: "multipart/alternative".into(),
            body_text: Some("plain".into()),
            body_html: Some("<b>rich</b>".into()),
            ..MailDocument::default()
        };
        let out = transformer().transform_at(doc, fixed_now());
        assert_eq!(out.body.content_type, BodyType::Text);
        assert!(out.body.content.starts_with("plain\n\n"));
    }

    #[test]
    fn empty_subject_yields_bare_tag() {
        let out = transformer().transform_at(MailDocument::default(), fixed_now());
        assert_eq!(out.subject, SUBJECT_PREFIX);
        assert!(out.body.content.starts_with("\n\n------\n\n"));
    }

    #[test]
    fn recipients_keep_length_and_order() {
        for n in 0..6 {
            let list: Vec<Mailbox> = (0..n).map(|i| Mailbox::new(format!("r{i}@x.com"))).collect();
            let doc = MailDocument {
                to: list.clone(),
                cc: list.iter().rev().cloned().collect(),
                bcc: list.clone(),
                ..MailDocument::default()
            };
            let out = transformer().transform_at(doc, fixed_now());
            let to: Vec<_> = out.to_recipients.iter().map(|r| r.email_address.address.clone()).collect();
            let cc: Vec<_> = out.cc_recipients.iter().map(|r| r.email_address.address.clone()).collect();
            let expected: Vec<_> = list.iter().map(|m| m.address.clone()).collect();
            assert_eq!(to, expected);
            assert_eq!(cc, expected.iter().rev().cloned().collect::<Vec<_>>());
            assert_eq!(out.bcc_recipients.len(), n);
        }
    }

    #[test]
    fn display_names_are_carried() {
        let doc = MailDocument {
            to: vec![Mailbox {
                address: "a@x.com".into(),
                name: Some("Ann".into()),
            }],
            ..MailDocument::default()
        };
        let out = transformer().transform_at(doc, fixed_now());
        assert_eq!(out.to_recipients[0].email_address.name.as_deref(), Some("Ann"));
    }

    #[test]
    fn attachments_are_carried_unchanged() {
        let attachments = vec![
            Attachment {
                name: "b.bin".into(),
                mime_type: "application/octet-stream".into(),
                content_id: None,
                bytes: vec![0, 1, 2, 255],
            },
            Attachment {
                name: String::new(),
                mime_type: "image/png".into(),
                content_id: Some("logo".into()),
                bytes: vec![9; 10],
            },
        ];
        let doc = MailDocument {
            attachments: attachments.clone(),
            ..MailDocument::default()
        };
        let out = transformer().transform_at(doc, fixed_now());
        assert_eq!(out.attachments.len(), 2);
        for (sent, orig) in out.attachments.iter().zip(&attachments) {
            assert_eq!(sent.name, orig.name);
            assert_eq!(sent.content_type, orig.mime_type);
            assert_eq!(sent.content_id, orig.content_id);
            assert_eq!(sent.content_bytes, orig.bytes);
        }
    }
}
