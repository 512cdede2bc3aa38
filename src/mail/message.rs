use serde::Deserialize;

use crate::mail::decoders::{decode_mime_words, parse_date_header};

/// One entry of a message listing; only the id is used downstream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageRef {
    pub id: String,
    /// Token of the page this reference was listed on (`None` for the
    /// first page). Listing can resume from here.
    pub page_token: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessagePage {
    pub refs: Vec<MessageRef>,
    pub next_page_token: Option<String>,
}

/// `users.messages.list` response.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ListResponse {
    #[serde(default)]
    pub messages: Vec<MessageStub>,
    pub next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct MessageStub {
    pub id: String,
}

/// A message as returned by `users.messages.get?format=full`.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RawMessage {
    pub id: String,
    #[serde(default)]
    pub thread_id: Option<String>,
    #[serde(default)]
    pub snippet: Option<String>,
    #[serde(default)]
    pub payload: MessagePart,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MessagePart {
    #[serde(default)]
    pub part_id: Option<String>,
    #[serde(default)]
    pub mime_type: String,
    #[serde(default)]
    pub filename: Option<String>,
    #[serde(default)]
    pub headers: Vec<Header>,
    #[serde(default)]
    pub body: PartBody,
    #[serde(default)]
    pub parts: Vec<MessagePart>,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PartBody {
    #[serde(default)]
    pub size: u64,
    /// base64url-encoded content, absent for multipart containers and
    /// attachments stored out of line.
    #[serde(default)]
    pub data: Option<String>,
    #[serde(default)]
    pub attachment_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct Header {
    pub name: String,
    pub value: String,
}

impl MessagePart {
    pub fn inline_data(&self) -> Option<&str> {
        self.body.data.as_deref().filter(|d| !d.is_empty())
    }

    pub fn is_mime(&self, mime: &str) -> bool {
        self.mime_type.eq_ignore_ascii_case(mime)
    }
}

impl RawMessage {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.payload
            .headers
            .iter()
            .find(|h| h.name.eq_ignore_ascii_case(name))
            .map(|h| h.value.as_str())
    }

    pub fn subject(&self) -> String {
        self.header("Subject")
            .map(|s| decode_mime_words(s.as_bytes()))
            .unwrap_or_else(|| "(no subject)".to_string())
    }

    /// Epoch seconds of the `Date` header, 0 when absent or unparsable.
    pub fn received_at(&self) -> i64 {
        self.header("Date").map(parse_date_header).unwrap_or(0)
    }
}
