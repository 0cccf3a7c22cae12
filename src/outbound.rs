//! Wire types for the Graph `sendMail` request.

use base64::prelude::*;
use serde::{Serialize, Serializer};

/// How the API should interpret the body content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BodyType {
    Text,
    Html,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemBody {
    pub content_type: BodyType,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EmailAddress {
    pub address: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Recipient {
    pub email_address: EmailAddress,
}

/// A `#microsoft.graph.fileAttachment`. Bytes are base64-encoded only when serialized.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FileAttachment {
    #[serde(rename = "@odata.type")]
    pub odata_type: &'static str,
    pub name: String,
    pub content_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_id: Option<String>,
    #[serde(serialize_with = "serialize_base64")]
    pub content_bytes: Vec<u8>,
}

impl FileAttachment {
    pub const ODATA_TYPE: &'static str = "#microsoft.graph.fileAttachment";
}

/// The message handed to the delivery client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboundMessage {
    pub subject: String,
    pub body: ItemBody,
    pub to_recipients: Vec<Recipient>,
    pub cc_recipients: Vec<Recipient>,
    pub bcc_recipients: Vec<Recipient>,
    pub attachments: Vec<FileAttachment>,
}

/// Request body of `POST /users/{id}/sendMail`.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMailRequest<'a> {
    pub message: &'a OutboundMessage,
    pub save_to_sent_items: bool,
}

fn serialize_base64<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&BASE64_STANDARD.encode(bytes))
}
