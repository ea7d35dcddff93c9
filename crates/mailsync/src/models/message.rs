//! Mirrored message rows: stubs and enriched detail

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{LabelId, UserId};

/// Remote message identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MessageId(pub String);

impl MessageId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for MessageId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for MessageId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Remote thread identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ThreadId(pub String);

impl ThreadId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ThreadId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// An email address with optional display name
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmailAddress {
    pub name: Option<String>,
    pub email: String,
}

impl EmailAddress {
    pub fn new(email: impl Into<String>) -> Self {
        Self {
            name: None,
            email: email.into(),
        }
    }

    /// Parse an address like "John Doe <john@example.com>"
    pub fn parse(s: &str) -> Self {
        let s = s.trim();

        if let Some(angle_start) = s.rfind('<')
            && let Some(angle_end) = s.rfind('>')
            && angle_start < angle_end
        {
            let name = s[..angle_start].trim().trim_matches('"').trim();
            let email = s[angle_start + 1..angle_end].trim();
            return Self {
                name: if name.is_empty() {
                    None
                } else {
                    Some(name.to_string())
                },
                email: email.to_string(),
            };
        }

        Self::new(s)
    }
}

/// Identity of a message known to exist remotely, before enrichment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageStub {
    pub id: MessageId,
    pub thread_id: ThreadId,
}

impl MessageStub {
    pub fn new(id: impl Into<MessageId>, thread_id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            thread_id: ThreadId::new(thread_id),
        }
    }
}

/// A single header (name-value pair)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    pub name: String,
    pub value: String,
}

impl Header {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// One leaf MIME part with its decoded text, if textual
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BodyPart {
    pub part_id: Option<String>,
    pub mime_type: String,
    pub filename: Option<String>,
    pub size: u64,
    /// Decoded content for text/* parts
    pub text: Option<String>,
    /// Remote attachment id for parts whose content is fetched separately
    pub attachment_id: Option<String>,
}

/// Headers and body parts persisted with an enriched message
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessagePayload {
    pub mime_type: Option<String>,
    pub headers: Vec<Header>,
    pub parts: Vec<BodyPart>,
}

impl MessagePayload {
    /// First header value with the given name, case-insensitively
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|h| h.name.eq_ignore_ascii_case(name))
            .map(|h| h.value.as_str())
    }

    /// Decoded text of the first part with the given MIME type prefix
    pub fn body(&self, mime_prefix: &str) -> Option<&str> {
        self.parts
            .iter()
            .find(|p| p.mime_type.starts_with(mime_prefix))
            .and_then(|p| p.text.as_deref())
    }
}

/// Enrichment written back onto a stub by the detail engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageDetail {
    pub thread_id: ThreadId,
    /// Milliseconds since epoch; never absent after normalization
    pub internal_date: i64,
    pub history_id: Option<String>,
    pub snippet: String,
    pub subject: String,
    pub from: Option<EmailAddress>,
    pub size_estimate: u64,
    pub label_ids: Vec<LabelId>,
    pub payload: MessagePayload,
}

/// A mirrored message row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub user_id: UserId,
    pub id: MessageId,
    pub thread_id: ThreadId,
    pub internal_date: Option<i64>,
    pub payload: Option<MessagePayload>,
    pub history_id: Option<String>,
    pub snippet: Option<String>,
    pub subject: Option<String>,
    pub from: Option<EmailAddress>,
    pub size_estimate: Option<u64>,
    pub label_ids: Vec<LabelId>,
    /// Enrichment attempts that failed with data errors
    pub detail_failures: u32,
}

impl Message {
    /// A bare stub row
    pub fn stub(user_id: UserId, stub: MessageStub) -> Self {
        Self {
            user_id,
            id: stub.id,
            thread_id: stub.thread_id,
            internal_date: None,
            payload: None,
            history_id: None,
            snippet: None,
            subject: None,
            from: None,
            size_estimate: None,
            label_ids: Vec::new(),
            detail_failures: 0,
        }
    }

    /// Stub rows lack a date or a payload
    pub fn needs_detail(&self) -> bool {
        self.internal_date.is_none() || self.payload.is_none()
    }

    /// Overwrite the enrichable fields, keeping identity
    pub fn apply_detail(&mut self, detail: MessageDetail) {
        self.thread_id = detail.thread_id;
        self.internal_date = Some(detail.internal_date);
        self.history_id = detail.history_id;
        self.snippet = Some(detail.snippet);
        self.subject = Some(detail.subject);
        self.from = detail.from;
        self.size_estimate = Some(detail.size_estimate);
        self.label_ids = detail.label_ids;
        self.payload = Some(detail.payload);
    }

    pub fn received_at(&self) -> Option<DateTime<Utc>> {
        self.internal_date
            .and_then(DateTime::<Utc>::from_timestamp_millis)
    }
}
