//! Mirrored label rows

use serde::{Deserialize, Serialize};

/// Remote label identifier (e.g. "INBOX", "Label_123")
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LabelId(pub String);

impl LabelId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    // Well-known system labels
    pub const INBOX: &'static str = "INBOX";
    pub const SENT: &'static str = "SENT";
    pub const DRAFTS: &'static str = "DRAFT";
    pub const TRASH: &'static str = "TRASH";
    pub const SPAM: &'static str = "SPAM";
    pub const STARRED: &'static str = "STARRED";
    pub const UNREAD: &'static str = "UNREAD";
}

impl From<String> for LabelId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for LabelId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// A mailbox label (folder)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Label {
    pub id: LabelId,
    pub name: String,
    /// System labels are managed by the remote and cannot be renamed
    pub is_system: bool,
    pub message_list_visibility: Option<String>,
    pub label_list_visibility: Option<String>,
    pub messages_total: u32,
    pub messages_unread: u32,
    pub threads_total: u32,
    pub threads_unread: u32,
}

impl Label {
    /// Create a user label with zero counters
    pub fn new(id: impl Into<LabelId>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            is_system: false,
            message_list_visibility: None,
            label_list_visibility: None,
            messages_total: 0,
            messages_unread: 0,
            threads_total: 0,
            threads_unread: 0,
        }
    }

    /// Create a system label
    pub fn system(id: impl Into<LabelId>, name: impl Into<String>) -> Self {
        Self {
            is_system: true,
            ..Self::new(id, name)
        }
    }

    pub fn with_counts(mut self, messages_total: u32, messages_unread: u32) -> Self {
        self.messages_total = messages_total;
        self.messages_unread = messages_unread;
        self
    }
}
