use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum Provider {
    Gmail,
    #[default]
    Generic,
}

impl Provider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::Gmail => "gmail",
            Provider::Generic => "generic",
        }
    }

    pub fn default_trash(&self) -> &'static str {
        match self {
            Provider::Gmail => "[Gmail]/Trash",
            Provider::Generic => "Trash",
        }
    }

    pub fn default_drafts(&self) -> &'static str {
        match self {
            Provider::Gmail => "[Gmail]/Drafts",
            Provider::Generic => "Drafts",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

/// A configured mailbox source. Loaded once at startup.
#[derive(Clone)]
pub struct Account {
    pub address: String,
    pub provider: Provider,
    pub endpoint: Endpoint,
    pub username: String,
    pub secret: String,
    pub trash_mailbox: String,
    pub drafts_mailbox: String,
}

impl fmt::Debug for Account {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Account")
            .field("address", &self.address)
            .field("provider", &self.provider)
            .field("endpoint", &self.endpoint)
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Attachment {
    pub part_id: String,
    pub filename: String,
    pub content_type: String,
    pub size: u64,
    #[serde(default)]
    pub encoding: String,
}

/// One mirrored message. An empty `body_html` means the body has not been
/// fetched yet.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct EmailRecord {
    pub account: String,
    pub mailbox: String,
    pub uid: u32,
    pub message_id: String,
    pub internal_date: i64,
    pub from: String,
    pub to: String,
    pub cc: String,
    pub subject: String,
    pub date: Option<i64>,
    pub unread: bool,
    pub body_html: String,
    pub snippet: String,
    pub attachments: Vec<Attachment>,
}

impl EmailRecord {
    pub fn has_body(&self) -> bool {
        !self.body_html.is_empty()
    }

    pub fn key(&self) -> RecordKey {
        RecordKey::new(&self.account, &self.mailbox, self.uid)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct RecordKey {
    pub account: String,
    pub mailbox: String,
    pub uid: u32,
}

impl RecordKey {
    pub fn new(account: &str, mailbox: &str, uid: u32) -> Self {
        Self {
            account: account.to_string(),
            mailbox: mailbox.to_string(),
            uid,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MailboxMetadata {
    pub account: String,
    pub mailbox: String,
    pub uid_validity: u32,
    pub last_sync_ts: i64,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum OpKind {
    Delete,
    MoveTrash,
    MarkRead,
    MarkUnread,
}

impl OpKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OpKind::Delete => "delete",
            OpKind::MoveTrash => "move_trash",
            OpKind::MarkRead => "mark_read",
            OpKind::MarkUnread => "mark_unread",
        }
    }

    /// Kinds that take the message out of the mailbox.
    pub fn removes_message(&self) -> bool {
        matches!(self, OpKind::Delete | OpKind::MoveTrash)
    }

    /// The cached `unread` value a read-state kind leaves behind.
    pub fn unread_value(&self) -> Option<bool> {
        match self {
            OpKind::MarkRead => Some(false),
            OpKind::MarkUnread => Some(true),
            _ => None,
        }
    }
}

impl FromStr for OpKind {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw {
            "delete" => Ok(OpKind::Delete),
            "move_trash" => Ok(OpKind::MoveTrash),
            "mark_read" => Ok(OpKind::MarkRead),
            "mark_unread" => Ok(OpKind::MarkUnread),
            other => Err(format!("unknown operation kind: {other}")),
        }
    }
}

/// A user mutation accepted locally but not yet confirmed remotely.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct PendingOp {
    pub id: i64,
    pub account: String,
    pub mailbox: String,
    pub kind: OpKind,
    pub uid: u32,
    /// uidValidity of the mailbox when the op was queued; `None` if the
    /// mailbox had never been synced.
    pub uid_validity: Option<u32>,
    pub created_at: i64,
    pub attempts: u32,
    pub last_error: Option<String>,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OpStatus {
    Success,
    Failed,
}

impl OpStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OpStatus::Success => "success",
            OpStatus::Failed => "failed",
        }
    }

    pub fn from_str_lossy(raw: &str) -> Self {
        if raw == "success" {
            OpStatus::Success
        } else {
            OpStatus::Failed
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct OpLogEntry {
    pub account: String,
    pub mailbox: String,
    pub kind: OpKind,
    pub uid: u32,
    pub status: OpStatus,
    pub error: Option<String>,
    pub queued_at: i64,
    pub processed_at: i64,
}

pub fn now_ts() -> i64 {
    Utc::now().timestamp()
}

pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}
