use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Standard IMAP message flags, stored as a set.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum MessageFlag {
    Seen,
    Answered,
    Flagged,
    Deleted,
    Draft,
}

/// Email address with optional display name. Two addresses are equal when
/// their addr-specs match case-insensitively, regardless of display name.
#[derive(Clone, Debug, Serialize, Deserialize, Eq)]
pub struct Address {
    pub addr: String,
    #[serde(default)]
    pub name: String,
}

impl Address {
    pub fn new(addr: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            name: name.into(),
        }
    }

    pub fn bare(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            name: String::new(),
        }
    }
}

impl PartialEq for Address {
    fn eq(&self, other: &Self) -> bool {
        self.addr.eq_ignore_ascii_case(&other.addr)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.name.is_empty() {
            write!(f, "{}", self.addr)
        } else {
            write!(f, "{} <{}>", self.name, self.addr)
        }
    }
}

/// Attachment metadata. Content bytes are never persisted; they are fetched
/// from the server on demand.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Attachment {
    pub filename: String,
    pub size: u64,
    pub content_type: String,
}

/// A single email message as stored in the cache.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Message {
    pub message_id: String,
    pub conv_id: String,
    pub account: String,
    pub folder: String,

    pub from: Address,
    #[serde(default)]
    pub to: Vec<Address>,
    #[serde(default)]
    pub cc: Vec<Address>,
    #[serde(default)]
    pub reply_to: Vec<Address>,

    pub date: DateTime<Utc>,
    #[serde(default)]
    pub subject: String,

    pub body_text: Option<String>,
    pub body_html: Option<String>,

    #[serde(default)]
    pub flags: Vec<MessageFlag>,
    #[serde(default)]
    pub attachments: Vec<Attachment>,

    pub in_reply_to: Option<String>,
    #[serde(default)]
    pub references: Vec<String>,

    pub headers_fetched_at: DateTime<Utc>,
    pub body_fetched_at: Option<DateTime<Utc>>,
}

impl Message {
    pub fn is_read(&self) -> bool {
        self.flags.contains(&MessageFlag::Seen)
    }

    pub fn is_flagged(&self) -> bool {
        self.flags.contains(&MessageFlag::Flagged)
    }
}

/// A conversation (thread) of related messages, materialized on demand from
/// stored message rows. Messages are ordered date-ascending.
#[derive(Clone, Debug, Serialize)]
pub struct Conversation {
    pub conv_id: String,
    pub subject: String,
    pub participants: Vec<String>,
    pub message_count: usize,
    pub unread_count: usize,
    pub latest_date: DateTime<Utc>,
    pub messages: Vec<Message>,
    pub account: String,
}

impl Conversation {
    pub fn has_unread(&self) -> bool {
        self.unread_count > 0
    }
}

/// Lightweight conversation projection for listings and disambiguation.
#[derive(Clone, Debug, Serialize)]
pub struct ConversationSummary {
    pub conv_id: String,
    pub subject: String,
    pub participants: Vec<String>,
    pub message_count: usize,
    pub unread_count: usize,
    pub latest_date: DateTime<Utc>,
    /// Preview of the latest message body, at most 100 characters.
    pub snippet: String,
    pub account: String,
}

/// A locally stored draft. Drafts never carry a Message-ID until sent.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Draft {
    pub draft_id: String,
    pub account: String,

    pub to: Vec<Address>,
    #[serde(default)]
    pub cc: Vec<Address>,
    #[serde(default)]
    pub bcc: Vec<Address>,

    pub subject: String,
    pub body_text: String,
    pub body_html: Option<String>,

    pub reply_to_conv_id: Option<String>,
    pub in_reply_to: Option<String>,
    #[serde(default)]
    pub references: Vec<String>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Unread message counts per folder for one account.
#[derive(Clone, Debug, Serialize)]
pub struct UnreadCounts {
    pub account: String,
    pub folders: BTreeMap<String, u32>,
    pub total: u32,
}

/// Information about an IMAP folder as advertised by LIST.
#[derive(Clone, Debug, Serialize)]
pub struct FolderInfo {
    pub name: String,
    pub flags: Vec<String>,
    pub delimiter: String,
    pub message_count: Option<u32>,
    pub unread_count: Option<u32>,
}

/// Statistics about the local cache.
#[derive(Clone, Debug, Serialize)]
pub struct CacheStats {
    pub message_count: u64,
    pub conversation_count: u64,
    pub oldest_message: Option<DateTime<Utc>>,
    pub newest_message: Option<DateTime<Utc>>,
    pub cache_size_bytes: u64,
    pub last_sync: Option<DateTime<Utc>>,
}

/// Result of a completed send.
#[derive(Clone, Debug, Serialize)]
pub struct SendResult {
    pub success: bool,
    pub message_id: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// One row of the append-only send audit log.
#[derive(Clone, Debug, Serialize)]
pub struct SendLogEntry {
    pub id: i64,
    pub timestamp: DateTime<Utc>,
    pub account: String,
    pub to: Vec<Address>,
    pub cc: Vec<Address>,
    pub bcc: Vec<Address>,
    pub subject: String,
    pub message_id: Option<String>,
}

pub fn now_utc() -> DateTime<Utc> {
    Utc::now()
}
