//! Remote mailbox integration
//!
//! This module provides:
//! - Gmail API response types
//! - The `RemoteMailbox` boundary the sync engines consume
//! - Access-token refresh against a per-user credential store
//! - A retrying ureq client and response normalization

mod auth;
mod client;
mod normalize;

use std::sync::Arc;

use anyhow::Result;

use crate::models::{MessageId, UserId};

pub use auth::{CredentialStore, FileCredentialStore, GmailAuth, StoredToken};
pub use client::{GmailClient, GmailMailboxProvider};
pub use normalize::{normalize_detail, normalize_label};

use api::{GmailLabel, GmailMessage, HistoryResponse, ListMessagesResponse, ProfileResponse};

/// One user's remote mailbox
///
/// Every call may refresh credentials under the hood; callers only see
/// success or a typed [`crate::SyncError`].
pub trait RemoteMailbox: Send + Sync {
    /// One page of message identities
    fn list_messages(
        &self,
        page_token: Option<&str>,
        page_size: usize,
    ) -> Result<ListMessagesResponse>;

    /// Full message detail
    fn get_message(&self, id: &MessageId) -> Result<GmailMessage>;

    /// One page of changes since `start_history_id`
    ///
    /// Fails with [`crate::SyncError::HistoryExpired`] when the remote no
    /// longer keeps history that far back.
    fn list_history(
        &self,
        start_history_id: &str,
        page_token: Option<&str>,
    ) -> Result<HistoryResponse>;

    /// The complete label set
    fn list_labels(&self) -> Result<Vec<GmailLabel>>;

    /// Mailbox profile, including the current history id
    fn get_profile(&self) -> Result<ProfileResponse>;
}

/// Hands out a mailbox client bound to one user's credentials
pub trait MailboxProvider: Send + Sync {
    fn mailbox(&self, user_id: &UserId) -> Result<Arc<dyn RemoteMailbox>>;
}

/// Gmail API response types
pub mod api {
    use serde::{Deserialize, Serialize};

    /// Response from listing messages
    #[derive(Debug, Clone, Default, Deserialize, Serialize)]
    #[serde(rename_all = "camelCase")]
    pub struct ListMessagesResponse {
        pub messages: Option<Vec<MessageRef>>,
        pub next_page_token: Option<String>,
        pub result_size_estimate: Option<u32>,
    }

    /// Reference to a message (just ID and thread ID)
    #[derive(Debug, Clone, Default, Deserialize, Serialize)]
    #[serde(rename_all = "camelCase")]
    pub struct MessageRef {
        #[serde(default)]
        pub id: String,
        #[serde(default)]
        pub thread_id: String,
        pub label_ids: Option<Vec<String>>,
    }

    impl MessageRef {
        pub fn new(id: impl Into<String>, thread_id: impl Into<String>) -> Self {
            Self {
                id: id.into(),
                thread_id: thread_id.into(),
                label_ids: None,
            }
        }
    }

    /// Full message from the Gmail API
    #[derive(Debug, Clone, Default, Deserialize, Serialize)]
    #[serde(rename_all = "camelCase")]
    pub struct GmailMessage {
        #[serde(default)]
        pub id: String,
        #[serde(default)]
        pub thread_id: String,
        pub label_ids: Option<Vec<String>>,
        #[serde(default)]
        pub snippet: String,
        /// Milliseconds since epoch as a decimal string
        pub internal_date: Option<String>,
        pub history_id: Option<String>,
        pub size_estimate: Option<u64>,
        pub payload: Option<MessagePayload>,
    }

    /// Message payload containing headers and body
    #[derive(Debug, Clone, Default, Deserialize, Serialize)]
    #[serde(rename_all = "camelCase")]
    pub struct MessagePayload {
        pub headers: Option<Vec<Header>>,
        pub body: Option<MessageBody>,
        pub parts: Option<Vec<MessagePart>>,
        pub mime_type: Option<String>,
        pub filename: Option<String>,
        pub part_id: Option<String>,
    }

    /// Email header (name-value pair)
    #[derive(Debug, Clone, Deserialize, Serialize)]
    pub struct Header {
        pub name: String,
        pub value: String,
    }

    /// Message body (base64url encoded)
    #[derive(Debug, Clone, Default, Deserialize, Serialize)]
    #[serde(rename_all = "camelCase")]
    pub struct MessageBody {
        pub size: Option<u64>,
        pub data: Option<String>,
        pub attachment_id: Option<String>,
    }

    /// Message part (for multipart messages)
    #[derive(Debug, Clone, Default, Deserialize, Serialize)]
    #[serde(rename_all = "camelCase")]
    pub struct MessagePart {
        pub part_id: Option<String>,
        pub mime_type: Option<String>,
        pub filename: Option<String>,
        pub headers: Option<Vec<Header>>,
        pub body: Option<MessageBody>,
        pub parts: Option<Vec<MessagePart>>,
    }

    /// Response from the history endpoint
    #[derive(Debug, Clone, Default, Deserialize, Serialize)]
    #[serde(rename_all = "camelCase")]
    pub struct HistoryResponse {
        pub history: Option<Vec<HistoryRecord>>,
        pub next_page_token: Option<String>,
        /// Current mailbox history id
        pub history_id: Option<String>,
    }

    /// One change record; any combination of the four change lists may be set
    #[derive(Debug, Clone, Default, Deserialize, Serialize)]
    #[serde(rename_all = "camelCase")]
    pub struct HistoryRecord {
        #[serde(default)]
        pub id: String,
        pub messages_added: Option<Vec<HistoryMessage>>,
        pub messages_deleted: Option<Vec<HistoryMessage>>,
        pub labels_added: Option<Vec<HistoryLabelChange>>,
        pub labels_removed: Option<Vec<HistoryLabelChange>>,
    }

    /// A message added to or deleted from the mailbox
    #[derive(Debug, Clone, Default, Deserialize, Serialize)]
    pub struct HistoryMessage {
        pub message: MessageRef,
    }

    /// Labels added to or removed from one message
    #[derive(Debug, Clone, Default, Deserialize, Serialize)]
    #[serde(rename_all = "camelCase")]
    pub struct HistoryLabelChange {
        pub message: MessageRef,
        #[serde(default)]
        pub label_ids: Vec<String>,
    }

    /// Response from listing labels
    #[derive(Debug, Clone, Default, Deserialize, Serialize)]
    pub struct ListLabelsResponse {
        pub labels: Option<Vec<GmailLabel>>,
    }

    /// A label as returned by the API
    #[derive(Debug, Clone, Default, Deserialize, Serialize)]
    #[serde(rename_all = "camelCase")]
    pub struct GmailLabel {
        #[serde(default)]
        pub id: String,
        #[serde(default)]
        pub name: String,
        /// "system" or "user"
        #[serde(rename = "type")]
        pub label_type: Option<String>,
        pub message_list_visibility: Option<String>,
        pub label_list_visibility: Option<String>,
        pub messages_total: Option<u32>,
        pub messages_unread: Option<u32>,
        pub threads_total: Option<u32>,
        pub threads_unread: Option<u32>,
    }

    impl GmailLabel {
        pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
            Self {
                id: id.into(),
                name: name.into(),
                ..Self::default()
            }
        }
    }

    /// Mailbox profile
    #[derive(Debug, Clone, Default, Deserialize, Serialize)]
    #[serde(rename_all = "camelCase")]
    pub struct ProfileResponse {
        #[serde(default)]
        pub email_address: String,
        pub messages_total: Option<u64>,
        pub threads_total: Option<u64>,
        #[serde(default)]
        pub history_id: String,
    }
}

#[cfg(test)]
mod tests {
    use super::api::*;

    #[test]
    fn test_history_record_with_mixed_changes() {
        let json = r#"{
            "history": [{
                "id": "101",
                "messagesAdded": [{ "message": { "id": "m1", "threadId": "t1", "labelIds": ["INBOX"] } }],
                "labelsRemoved": [{ "message": { "id": "m0", "threadId": "t0" }, "labelIds": ["UNREAD"] }]
            }],
            "historyId": "105"
        }"#;

        let response: HistoryResponse = serde_json::from_str(json).unwrap();
        let records = response.history.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].messages_added.as_ref().unwrap()[0].message.id, "m1");
        assert!(records[0].messages_deleted.is_none());
        assert!(records[0].labels_added.is_none());
        assert_eq!(records[0].labels_removed.as_ref().unwrap()[0].label_ids, vec!["UNREAD"]);
        assert_eq!(response.history_id.as_deref(), Some("105"));
    }

    #[test]
    fn test_list_messages_without_messages() {
        let response: ListMessagesResponse =
            serde_json::from_str(r#"{ "resultSizeEstimate": 0 }"#).unwrap();
        assert!(response.messages.is_none());
        assert!(response.next_page_token.is_none());
    }

    #[test]
    fn test_label_type_field() {
        let label: GmailLabel = serde_json::from_str(
            r#"{ "id": "INBOX", "name": "INBOX", "type": "system", "messagesTotal": 12 }"#,
        )
        .unwrap();
        assert_eq!(label.label_type.as_deref(), Some("system"));
        assert_eq!(label.messages_total, Some(12));
    }
}
