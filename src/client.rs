use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::UnixStream;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::time::timeout;
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec};
use tracing::{debug, warn};

use crate::errors::{AppError, AppResult};
use crate::protocol::{
    self, AccountStatus, AccountSummary, EmailSummary, Event, Request, RequestBody, ResponseBody,
    ServerFrame, PROTOCOL_VERSION,
};
use crate::types::{EmailRecord, PendingOp};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);
const EVENT_BUFFER: usize = 256;

type PendingMap = Arc<StdMutex<HashMap<u64, oneshot::Sender<ResponseBody>>>>;

fn take_pending(pending: &PendingMap, id: u64) -> Option<oneshot::Sender<ResponseBody>> {
    pending
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .remove(&id)
}

/// Presentation-side handle: correlates responses with requests and hands
/// out server events.
pub struct Client {
    writer: Mutex<FramedWrite<OwnedWriteHalf, LinesCodec>>,
    pending: PendingMap,
    events: Mutex<mpsc::Receiver<Event>>,
    next_id: AtomicU64,
    request_timeout: Duration,
    server_version: String,
}

impl Client {
    pub async fn connect(path: &Path) -> AppResult<Self> {
        Self::connect_with_version(path, PROTOCOL_VERSION, DEFAULT_TIMEOUT).await
    }

    /// Connects and performs the `hello` exchange. A version mismatch is a
    /// hard failure.
    pub async fn connect_with_version(
        path: &Path,
        version: &str,
        request_timeout: Duration,
    ) -> AppResult<Self> {
        let stream = UnixStream::connect(path)
            .await
            .map_err(|e| AppError::Io(format!("connecting to {}: {e}", path.display())))?;
        let (read, write) = stream.into_split();
        let mut lines = FramedRead::new(read, protocol::codec());
        let mut writer = FramedWrite::new(write, protocol::codec());

        let hello = Request {
            id: 0,
            body: RequestBody::Hello {
                client_version: version.to_string(),
            },
        };
        send_line(&mut writer, &hello).await?;

        let first = timeout(request_timeout, lines.next())
            .await
            .map_err(|_| AppError::Io("timed out waiting for hello".to_string()))?
            .ok_or_else(|| AppError::Io("server closed the connection".to_string()))?
            .map_err(|e| AppError::Io(e.to_string()))?;

        let server_version = match serde_json::from_str::<ServerFrame>(&first) {
            Ok(ServerFrame::Response(resp)) => match resp.body {
                ResponseBody::Hello { server_version } => server_version,
                ResponseBody::VersionMismatch { server_version } => {
                    return Err(AppError::ProtocolVersion {
                        server: server_version,
                        client: version.to_string(),
                    })
                }
                ResponseBody::Error { message } => return Err(AppError::Server(message)),
                other => return Err(AppError::Server(format!("unexpected hello reply: {other:?}"))),
            },
            Ok(ServerFrame::Event(_)) => {
                return Err(AppError::Server("event before handshake".to_string()))
            }
            Err(err) => return Err(AppError::Server(format!("malformed hello reply: {err}"))),
        };
        if server_version != version {
            return Err(AppError::ProtocolVersion {
                server: server_version,
                client: version.to_string(),
            });
        }
        debug!(server = %server_version, "Handshake complete");

        let pending: PendingMap = Arc::new(StdMutex::new(HashMap::new()));
        let (events_tx, events_rx) = mpsc::channel(EVENT_BUFFER);
        tokio::spawn(read_loop(lines, pending.clone(), events_tx));

        Ok(Self {
            writer: Mutex::new(writer),
            pending,
            events: Mutex::new(events_rx),
            next_id: AtomicU64::new(1),
            request_timeout,
            server_version,
        })
    }

    pub fn server_version(&self) -> &str {
        &self.server_version
    }

    /// Sends one request and waits for the response with the same id.
    pub async fn request(&self, body: RequestBody) -> AppResult<ResponseBody> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(id, tx);

        let request = Request { id, body };
        let sent = {
            let mut writer = self.writer.lock().await;
            send_line(&mut writer, &request).await
        };
        if let Err(err) = sent {
            take_pending(&self.pending, id);
            return Err(err);
        }

        match timeout(self.request_timeout, rx).await {
            Ok(Ok(ResponseBody::Error { message })) => Err(AppError::Server(message)),
            Ok(Ok(body)) => Ok(body),
            Ok(Err(_)) => Err(AppError::Io("connection closed".to_string())),
            Err(_) => {
                take_pending(&self.pending, id);
                Err(AppError::Io(format!("request {id} timed out")))
            }
        }
    }

    /// Next broadcast event, `None` once the connection is gone.
    pub async fn next_event(&self) -> Option<Event> {
        self.events.lock().await.recv().await
    }

    pub async fn ping(&self) -> AppResult<()> {
        match self.request(RequestBody::Ping).await? {
            ResponseBody::Pong => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    pub async fn get_accounts(&self) -> AppResult<Vec<AccountSummary>> {
        match self.request(RequestBody::GetAccounts).await? {
            ResponseBody::Accounts { accounts } => Ok(accounts),
            other => Err(unexpected(other)),
        }
    }

    pub async fn get_emails(
        &self,
        account: &str,
        mailbox: &str,
        offset: u32,
        limit: u32,
    ) -> AppResult<(Vec<EmailSummary>, i64)> {
        let body = RequestBody::GetEmails {
            account: account.to_string(),
            mailbox: mailbox.to_string(),
            offset,
            limit,
        };
        match self.request(body).await? {
            ResponseBody::Emails { emails, total } => Ok((emails, total)),
            other => Err(unexpected(other)),
        }
    }

    pub async fn get_email(&self, account: &str, mailbox: &str, uid: u32) -> AppResult<EmailRecord> {
        let body = RequestBody::GetEmail {
            account: account.to_string(),
            mailbox: mailbox.to_string(),
            uid,
        };
        match self.request(body).await? {
            ResponseBody::Email { email } => Ok(email),
            other => Err(unexpected(other)),
        }
    }

    /// Returns whether a sync for the mailbox was already running.
    pub async fn sync(&self, account: &str, mailbox: &str) -> AppResult<bool> {
        let body = RequestBody::Sync {
            account: account.to_string(),
            mailbox: mailbox.to_string(),
        };
        match self.request(body).await? {
            ResponseBody::SyncAccepted { already_syncing } => Ok(already_syncing),
            other => Err(unexpected(other)),
        }
    }

    pub async fn queue_delete(&self, account: &str, mailbox: &str, uids: &[u32]) -> AppResult<usize> {
        let body = RequestBody::QueueDelete {
            account: account.to_string(),
            mailbox: mailbox.to_string(),
            uids: uids.to_vec(),
        };
        match self.request(body).await? {
            ResponseBody::Queued { count } => Ok(count),
            other => Err(unexpected(other)),
        }
    }

    pub async fn sync_status(&self, account: Option<&str>) -> AppResult<Vec<AccountStatus>> {
        let body = RequestBody::GetSyncStatus {
            account: account.map(str::to_string),
        };
        match self.request(body).await? {
            ResponseBody::SyncStatus { accounts } => Ok(accounts),
            other => Err(unexpected(other)),
        }
    }

    pub async fn pending_ops(&self, account: Option<&str>) -> AppResult<Vec<PendingOp>> {
        let body = RequestBody::GetPendingOps {
            account: account.map(str::to_string),
        };
        match self.request(body).await? {
            ResponseBody::PendingOps { ops } => Ok(ops),
            other => Err(unexpected(other)),
        }
    }

    pub async fn search(&self, account: &str, mailbox: &str, query: &str) -> AppResult<Vec<EmailSummary>> {
        let body = RequestBody::Search {
            account: account.to_string(),
            mailbox: mailbox.to_string(),
            query: query.to_string(),
        };
        match self.request(body).await? {
            ResponseBody::SearchResults { emails } => Ok(emails),
            other => Err(unexpected(other)),
        }
    }

    pub async fn shutdown(&self) -> AppResult<()> {
        match self.request(RequestBody::Shutdown).await? {
            ResponseBody::ShuttingDown => Ok(()),
            other => Err(unexpected(other)),
        }
    }
}

fn unexpected(body: ResponseBody) -> AppError {
    AppError::Server(format!("unexpected response: {body:?}"))
}

async fn send_line(
    writer: &mut FramedWrite<OwnedWriteHalf, LinesCodec>,
    request: &Request,
) -> AppResult<()> {
    let line = serde_json::to_string(request).map_err(|e| AppError::Io(e.to_string()))?;
    writer
        .send(line)
        .await
        .map_err(|e| AppError::Io(e.to_string()))
}

async fn read_loop(
    mut lines: FramedRead<tokio::net::unix::OwnedReadHalf, LinesCodec>,
    pending: PendingMap,
    events: mpsc::Sender<Event>,
) {
    while let Some(line) = lines.next().await {
        let line = match line {
            Ok(line) => line,
            Err(err) => {
                warn!(error = %err, "Read from server failed");
                break;
            }
        };
        match serde_json::from_str::<ServerFrame>(&line) {
            Ok(ServerFrame::Response(resp)) => match take_pending(&pending, resp.id) {
                Some(waiter) => {
                    let _ = waiter.send(resp.body);
                }
                None => debug!(id = resp.id, "Response for an abandoned request"),
            },
            Ok(ServerFrame::Event(event)) => {
                if events.try_send(event).is_err() {
                    debug!("Event buffer full or closed, dropping event");
                }
            }
            Err(err) => warn!(error = %err, "Malformed frame from server"),
        }
    }
    // Dropping the waiters fails every outstanding request.
    pending
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .clear();
}
