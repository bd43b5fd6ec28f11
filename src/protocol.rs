//! Wire types for the local socket. One JSON object per line; every request
//! carries an `id` that the matching response echoes. Events have no id.
use serde::{Deserialize, Serialize};
use tokio_util::codec::LinesCodec;

use crate::pool::Liveness;
use crate::types::{EmailRecord, PendingOp};

/// Server and client must run the same build of the protocol.
pub const PROTOCOL_VERSION: &str = env!("CARGO_PKG_VERSION");

pub const DEFAULT_PAGE_SIZE: u32 = 50;
const MAX_FRAME_BYTES: usize = 32 * 1024 * 1024;

pub fn codec() -> LinesCodec {
    LinesCodec::new_with_max_length(MAX_FRAME_BYTES)
}

fn default_mailbox() -> String {
    "INBOX".to_string()
}

fn default_limit() -> u32 {
    DEFAULT_PAGE_SIZE
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    pub id: u64,
    #[serde(flatten)]
    pub body: RequestBody,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RequestBody {
    Hello {
        client_version: String,
    },
    Ping,
    GetAccounts,
    GetEmails {
        account: String,
        #[serde(default = "default_mailbox")]
        mailbox: String,
        #[serde(default)]
        offset: u32,
        #[serde(default = "default_limit")]
        limit: u32,
    },
    GetEmail {
        account: String,
        #[serde(default = "default_mailbox")]
        mailbox: String,
        uid: u32,
    },
    GetLabels {
        account: String,
    },
    GetSyncStatus {
        #[serde(default)]
        account: Option<String>,
    },
    GetPendingOps {
        #[serde(default)]
        account: Option<String>,
    },
    Sync {
        account: String,
        #[serde(default = "default_mailbox")]
        mailbox: String,
    },
    MarkRead {
        account: String,
        #[serde(default = "default_mailbox")]
        mailbox: String,
        uids: Vec<u32>,
    },
    MarkUnread {
        account: String,
        #[serde(default = "default_mailbox")]
        mailbox: String,
        uids: Vec<u32>,
    },
    DeleteEmail {
        account: String,
        #[serde(default = "default_mailbox")]
        mailbox: String,
        uids: Vec<u32>,
    },
    MoveToTrash {
        account: String,
        #[serde(default = "default_mailbox")]
        mailbox: String,
        uids: Vec<u32>,
    },
    QueueDelete {
        account: String,
        #[serde(default = "default_mailbox")]
        mailbox: String,
        uids: Vec<u32>,
    },
    QueueMoveTrash {
        account: String,
        #[serde(default = "default_mailbox")]
        mailbox: String,
        uids: Vec<u32>,
    },
    QueueMarkRead {
        account: String,
        #[serde(default = "default_mailbox")]
        mailbox: String,
        uids: Vec<u32>,
        /// `true` queues a mark-unread instead.
        #[serde(default)]
        unread: bool,
    },
    Search {
        account: String,
        #[serde(default = "default_mailbox")]
        mailbox: String,
        query: String,
    },
    SaveDraft {
        account: String,
        #[serde(default)]
        to: String,
        #[serde(default)]
        subject: String,
        #[serde(default)]
        body: String,
    },
    DownloadAttachment {
        account: String,
        #[serde(default = "default_mailbox")]
        mailbox: String,
        uid: u32,
        part_id: String,
    },
    Shutdown,
}

impl RequestBody {
    pub fn name(&self) -> &'static str {
        match self {
            RequestBody::Hello { .. } => "hello",
            RequestBody::Ping => "ping",
            RequestBody::GetAccounts => "get_accounts",
            RequestBody::GetEmails { .. } => "get_emails",
            RequestBody::GetEmail { .. } => "get_email",
            RequestBody::GetLabels { .. } => "get_labels",
            RequestBody::GetSyncStatus { .. } => "get_sync_status",
            RequestBody::GetPendingOps { .. } => "get_pending_ops",
            RequestBody::Sync { .. } => "sync",
            RequestBody::MarkRead { .. } => "mark_read",
            RequestBody::MarkUnread { .. } => "mark_unread",
            RequestBody::DeleteEmail { .. } => "delete_email",
            RequestBody::MoveToTrash { .. } => "move_to_trash",
            RequestBody::QueueDelete { .. } => "queue_delete",
            RequestBody::QueueMoveTrash { .. } => "queue_move_trash",
            RequestBody::QueueMarkRead { .. } => "queue_mark_read",
            RequestBody::Search { .. } => "search",
            RequestBody::SaveDraft { .. } => "save_draft",
            RequestBody::DownloadAttachment { .. } => "download_attachment",
            RequestBody::Shutdown => "shutdown",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    pub id: u64,
    #[serde(flatten)]
    pub body: ResponseBody,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResponseBody {
    Hello { server_version: String },
    VersionMismatch { server_version: String },
    Pong,
    Accounts { accounts: Vec<AccountSummary> },
    Emails { emails: Vec<EmailSummary>, total: i64 },
    Email { email: EmailRecord },
    Labels { labels: Vec<String> },
    SyncStatus { accounts: Vec<AccountStatus> },
    PendingOps { ops: Vec<PendingOp> },
    SyncAccepted { already_syncing: bool },
    Queued { count: usize },
    Done,
    SearchResults { emails: Vec<EmailSummary> },
    AttachmentSaved { path: String },
    ShuttingDown,
    Error { message: String },
}

impl ResponseBody {
    pub fn error(message: impl Into<String>) -> Self {
        ResponseBody::Error {
            message: message.into(),
        }
    }
}

/// Broadcast to every connected client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    SyncStarted {
        account: String,
        mailbox: String,
    },
    SyncCompleted {
        account: String,
        mailbox: String,
        new: usize,
        updated: usize,
        deleted: usize,
        total: usize,
    },
    SyncError {
        account: String,
        mailbox: String,
        message: String,
    },
    NewEmails {
        account: String,
        mailbox: String,
        uids: Vec<u32>,
    },
    EmailUpdated {
        account: String,
        mailbox: String,
        uids: Vec<u32>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "frame", rename_all = "snake_case")]
pub enum ServerFrame {
    Response(Response),
    Event(Event),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountSummary {
    pub address: String,
    pub provider: String,
    pub syncing: bool,
    pub last_sync: Option<i64>,
    pub email_count: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountStatus {
    pub account: String,
    pub syncing: Vec<String>,
    pub last_sync: Option<i64>,
    pub last_error: Option<String>,
    pub pending_ops: i64,
    pub failing_ops: i64,
    pub connection: Liveness,
}

/// List view of a record: everything but the body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmailSummary {
    pub uid: u32,
    pub mailbox: String,
    pub message_id: String,
    pub internal_date: i64,
    pub from: String,
    pub to: String,
    pub cc: String,
    pub subject: String,
    pub date: Option<i64>,
    pub unread: bool,
    pub snippet: String,
    pub has_body: bool,
    pub attachment_count: usize,
}

impl From<&EmailRecord> for EmailSummary {
    fn from(record: &EmailRecord) -> Self {
        Self {
            uid: record.uid,
            mailbox: record.mailbox.clone(),
            message_id: record.message_id.clone(),
            internal_date: record.internal_date,
            from: record.from.clone(),
            to: record.to.clone(),
            cc: record.cc.clone(),
            subject: record.subject.clone(),
            date: record.date,
            unread: record.unread,
            snippet: record.snippet.clone(),
            has_body: record.has_body(),
            attachment_count: record.attachments.len(),
        }
    }
}
