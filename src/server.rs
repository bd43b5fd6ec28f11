use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use futures::{SinkExt, StreamExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{broadcast, mpsc};
use tokio::time::{interval, interval_at, timeout, Instant, MissedTickBehavior};
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::config::{AppDefaults, PoolSettings, SyncSettings};
use crate::coordinator::AccountCoordinator;
use crate::errors::{AppError, AppResult};
use crate::pool::ConnectionPool;
use crate::protocol::{
    self, EmailSummary, Event, Request, RequestBody, Response, ResponseBody, ServerFrame,
    PROTOCOL_VERSION,
};
use crate::queue::{DrainReport, OperationQueue};
use crate::remote::Connector;
use crate::storage::CacheStore;
use crate::types::{Account, OpKind};

const EVENT_BUFFER: usize = 256;
const OUTGOING_BUFFER: usize = 256;
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub socket_path: PathBuf,
    pub downloads_dir: PathBuf,
    pub request_timeout: Duration,
    pub sync: SyncSettings,
    pub pool: PoolSettings,
    /// Sync stale mailboxes right after start.
    pub initial_sync: bool,
    /// Run the periodic sync/drain poller.
    pub background: bool,
}

impl ServerConfig {
    pub fn from_defaults(defaults: &AppDefaults) -> Self {
        Self {
            socket_path: defaults.socket_path.clone(),
            downloads_dir: defaults.data_dir.join("downloads"),
            request_timeout: defaults.request_timeout,
            sync: defaults.sync.clone(),
            pool: defaults.pool,
            initial_sync: true,
            background: true,
        }
    }
}

/// Owns every account coordinator and serves presentation clients over a
/// Unix socket.
pub struct Server {
    coordinators: BTreeMap<String, Arc<AccountCoordinator>>,
    store: Arc<CacheStore>,
    queue: Arc<OperationQueue>,
    events: broadcast::Sender<Event>,
    config: ServerConfig,
    shutdown: CancellationToken,
    tracker: TaskTracker,
}

impl Server {
    pub fn new(
        accounts: Vec<Account>,
        connector: Arc<dyn Connector>,
        store: Arc<CacheStore>,
        config: ServerConfig,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        let queue = Arc::new(OperationQueue::new(store.clone()));

        let coordinators = accounts
            .into_iter()
            .map(|account| {
                let address = account.address.clone();
                let pool = Arc::new(ConnectionPool::new(account, connector.clone(), config.pool));
                let coordinator = AccountCoordinator::new(
                    pool,
                    store.clone(),
                    queue.clone(),
                    events.clone(),
                    config.sync.clone(),
                    config.downloads_dir.clone(),
                );
                (address, Arc::new(coordinator))
            })
            .collect();

        Arc::new(Self {
            coordinators,
            store,
            queue,
            events,
            config,
            shutdown: CancellationToken::new(),
            tracker: TaskTracker::new(),
        })
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.events.subscribe()
    }

    pub fn store(&self) -> &Arc<CacheStore> {
        &self.store
    }

    pub fn coordinator(&self, account: &str) -> AppResult<Arc<AccountCoordinator>> {
        self.coordinators
            .get(account)
            .cloned()
            .ok_or_else(|| AppError::UnknownAccount(account.to_string()))
    }

    pub async fn drain_queue(&self) -> AppResult<DrainReport> {
        self.queue
            .drain(|account| self.coordinators.get(account).map(|c| c.pool()))
            .await
    }

    /// Binds the configured socket and serves until shutdown.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let listener = bind_socket(&self.config.socket_path).await?;
        info!(socket = %self.config.socket_path.display(), version = PROTOCOL_VERSION, "Server listening");
        let result = self.clone().serve(listener).await;
        let _ = std::fs::remove_file(&self.config.socket_path);
        result
    }

    /// Accept loop. On shutdown it stops accepting, lets in-flight requests
    /// finish and closes the remote sessions.
    pub async fn serve(self: Arc<Self>, listener: UnixListener) -> Result<()> {
        if self.config.background {
            let poller = self.clone();
            self.tracker.spawn(async move { poller.poll_loop().await });
        }

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, _)) => {
                        let server = self.clone();
                        self.tracker.spawn(async move { server.handle_connection(stream).await });
                    }
                    Err(err) => warn!(error = %err, "Accept failed"),
                },
            }
        }

        info!("Shutting down, waiting for in-flight requests");
        drop(listener);
        self.tracker.close();
        self.tracker.wait().await;

        for coordinator in self.coordinators.values() {
            coordinator.pool().close().await;
        }
        info!("Server stopped");
        Ok(())
    }

    async fn handle_connection(self: Arc<Self>, stream: UnixStream) {
        let (read, write) = stream.into_split();
        let mut lines = FramedRead::new(read, protocol::codec());
        let mut sink = FramedWrite::new(write, protocol::codec());

        let first = match timeout(HANDSHAKE_TIMEOUT, lines.next()).await {
            Ok(Some(Ok(line))) => line,
            _ => {
                debug!("Client went away before the handshake");
                return;
            }
        };

        let (id, reply, accepted) = match serde_json::from_str::<Request>(&first) {
            Ok(Request {
                id,
                body: RequestBody::Hello { client_version },
            }) => {
                if client_version == PROTOCOL_VERSION {
                    let reply = ResponseBody::Hello {
                        server_version: PROTOCOL_VERSION.to_string(),
                    };
                    (id, reply, true)
                } else {
                    warn!(client = %client_version, server = PROTOCOL_VERSION, "Rejecting client with mismatched version");
                    let reply = ResponseBody::VersionMismatch {
                        server_version: PROTOCOL_VERSION.to_string(),
                    };
                    (id, reply, false)
                }
            }
            Ok(other) => (
                other.id,
                ResponseBody::error("hello must be the first request"),
                false,
            ),
            Err(err) => (0, ResponseBody::error(format!("malformed request: {err}")), false),
        };

        // Subscribe before answering so no event is missed after the hello.
        let mut events = self.events.subscribe();
        if send_frame(&mut sink, ServerFrame::Response(Response { id, body: reply }))
            .await
            .is_err()
            || !accepted
        {
            return;
        }
        info!("Client connected");

        let (tx, mut rx) = mpsc::channel::<ServerFrame>(OUTGOING_BUFFER);
        let writer = tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                if send_frame(&mut sink, frame).await.is_err() {
                    break;
                }
            }
        });

        // Cancelled when this client goes away; aborts its in-flight requests.
        let disconnected = CancellationToken::new();

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                line = lines.next() => match line {
                    Some(Ok(line)) => self.dispatch(line, tx.clone(), disconnected.clone()),
                    Some(Err(err)) => {
                        warn!(error = %err, "Dropping client after read error");
                        disconnected.cancel();
                        break;
                    }
                    None => {
                        disconnected.cancel();
                        break;
                    }
                },
                event = events.recv() => match event {
                    Ok(event) => {
                        if tx.send(ServerFrame::Event(event)).await.is_err() {
                            disconnected.cancel();
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(missed, "Client fell behind, events dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
        }

        drop(tx);
        let _ = writer.await;
        info!("Client disconnected");
    }

    fn dispatch(
        self: &Arc<Self>,
        line: String,
        tx: mpsc::Sender<ServerFrame>,
        disconnected: CancellationToken,
    ) {
        let request = match serde_json::from_str::<Request>(&line) {
            Ok(request) => request,
            Err(err) => {
                let id = serde_json::from_str::<serde_json::Value>(&line)
                    .ok()
                    .and_then(|v| v.get("id").and_then(|id| id.as_u64()))
                    .unwrap_or(0);
                let body = ResponseBody::error(format!("malformed request: {err}"));
                self.tracker.spawn(async move {
                    let _ = tx.send(ServerFrame::Response(Response { id, body })).await;
                });
                return;
            }
        };

        let server = self.clone();
        let limit = self.config.request_timeout;
        self.tracker.spawn(async move {
            let Request { id, body } = request;
            let name = body.name();
            let shutting_down = matches!(body, RequestBody::Shutdown);
            debug!(id, request = name, "Handling request");

            let reply = tokio::select! {
                _ = disconnected.cancelled() => {
                    debug!(id, request = name, "Client gone, request abandoned");
                    return;
                }
                outcome = timeout(limit, server.handle(body)) => match outcome {
                    Ok(reply) => reply,
                    Err(_) => ResponseBody::error(format!("{name} timed out after {}s", limit.as_secs())),
                },
            };

            let _ = tx.send(ServerFrame::Response(Response { id, body: reply })).await;
            if shutting_down {
                server.shutdown.cancel();
            }
        });
    }

    async fn handle(self: &Arc<Self>, body: RequestBody) -> ResponseBody {
        match self.handle_request(body).await {
            Ok(reply) => reply,
            Err(err) => ResponseBody::error(err.to_string()),
        }
    }

    async fn handle_request(self: &Arc<Self>, body: RequestBody) -> AppResult<ResponseBody> {
        let reply = match body {
            RequestBody::Hello { .. } => ResponseBody::Hello {
                server_version: PROTOCOL_VERSION.to_string(),
            },
            RequestBody::Ping => ResponseBody::Pong,
            RequestBody::GetAccounts => {
                let mut accounts = Vec::with_capacity(self.coordinators.len());
                for coordinator in self.coordinators.values() {
                    accounts.push(coordinator.summary().await?);
                }
                ResponseBody::Accounts { accounts }
            }
            RequestBody::GetEmails {
                account,
                mailbox,
                offset,
                limit,
            } => {
                let (emails, total) = self
                    .coordinator(&account)?
                    .get_emails(&mailbox, offset, limit)
                    .await?;
                ResponseBody::Emails {
                    emails: emails.iter().map(EmailSummary::from).collect(),
                    total,
                }
            }
            RequestBody::GetEmail { account, mailbox, uid } => ResponseBody::Email {
                email: self
                    .coordinator(&account)?
                    .get_email_with_body(&mailbox, uid)
                    .await?,
            },
            RequestBody::GetLabels { account } => ResponseBody::Labels {
                labels: self.coordinator(&account)?.labels().await?,
            },
            RequestBody::GetSyncStatus { account } => {
                let mut accounts = Vec::new();
                match account {
                    Some(account) => accounts.push(self.coordinator(&account)?.status().await?),
                    None => {
                        for coordinator in self.coordinators.values() {
                            accounts.push(coordinator.status().await?);
                        }
                    }
                }
                ResponseBody::SyncStatus { accounts }
            }
            RequestBody::GetPendingOps { account } => ResponseBody::PendingOps {
                ops: self.queue.pending(account.as_deref()).await?,
            },
            RequestBody::Sync { account, mailbox } => {
                let coordinator = self.coordinator(&account)?;
                let already_syncing = match coordinator.begin_background_sync(&mailbox) {
                    Some(job) => {
                        self.tracker.spawn(job);
                        false
                    }
                    None => true,
                };
                ResponseBody::SyncAccepted { already_syncing }
            }
            RequestBody::MarkRead { account, mailbox, uids } => {
                self.apply_now(&account, &mailbox, OpKind::MarkRead, &uids).await?
            }
            RequestBody::MarkUnread { account, mailbox, uids } => {
                self.apply_now(&account, &mailbox, OpKind::MarkUnread, &uids).await?
            }
            RequestBody::DeleteEmail { account, mailbox, uids } => {
                self.apply_now(&account, &mailbox, OpKind::Delete, &uids).await?
            }
            RequestBody::MoveToTrash { account, mailbox, uids } => {
                self.apply_now(&account, &mailbox, OpKind::MoveTrash, &uids).await?
            }
            RequestBody::QueueDelete { account, mailbox, uids } => {
                self.queue_op(&account, &mailbox, OpKind::Delete, &uids).await?
            }
            RequestBody::QueueMoveTrash { account, mailbox, uids } => {
                self.queue_op(&account, &mailbox, OpKind::MoveTrash, &uids).await?
            }
            RequestBody::QueueMarkRead {
                account,
                mailbox,
                uids,
                unread,
            } => {
                let kind = if unread {
                    OpKind::MarkUnread
                } else {
                    OpKind::MarkRead
                };
                self.queue_op(&account, &mailbox, kind, &uids).await?
            }
            RequestBody::Search {
                account,
                mailbox,
                query,
            } => {
                let found = self.coordinator(&account)?.search(&mailbox, &query).await?;
                ResponseBody::SearchResults {
                    emails: found.iter().map(EmailSummary::from).collect(),
                }
            }
            RequestBody::SaveDraft {
                account,
                to,
                subject,
                body,
            } => {
                self.coordinator(&account)?
                    .save_draft(&to, &subject, &body)
                    .await?;
                ResponseBody::Done
            }
            RequestBody::DownloadAttachment {
                account,
                mailbox,
                uid,
                part_id,
            } => {
                let path = self
                    .coordinator(&account)?
                    .download_attachment(&mailbox, uid, &part_id)
                    .await?;
                ResponseBody::AttachmentSaved {
                    path: path.display().to_string(),
                }
            }
            RequestBody::Shutdown => ResponseBody::ShuttingDown,
        };
        Ok(reply)
    }

    async fn apply_now(
        &self,
        account: &str,
        mailbox: &str,
        kind: OpKind,
        uids: &[u32],
    ) -> AppResult<ResponseBody> {
        self.coordinator(account)?
            .apply_now(mailbox, kind, uids)
            .await?;
        Ok(ResponseBody::Done)
    }

    async fn queue_op(
        &self,
        account: &str,
        mailbox: &str,
        kind: OpKind,
        uids: &[u32],
    ) -> AppResult<ResponseBody> {
        let count = self.coordinator(account)?.queue_op(mailbox, kind, uids).await?;
        Ok(ResponseBody::Queued { count })
    }

    fn trigger_syncs(&self, only_stale: Option<&[(String, String)]>) {
        for coordinator in self.coordinators.values() {
            for mailbox in &self.config.sync.mailboxes {
                if let Some(stale) = only_stale {
                    let wanted = stale
                        .iter()
                        .any(|(a, m)| a == coordinator.address() && m == mailbox);
                    if !wanted {
                        continue;
                    }
                }
                match coordinator.begin_background_sync(mailbox) {
                    Some(job) => {
                        self.tracker.spawn(job);
                    }
                    None => debug!(account = %coordinator.address(), mailbox = %mailbox, "Skipping tick, sync in flight"),
                }
            }
        }
    }

    async fn stale_mailboxes(&self) -> Vec<(String, String)> {
        let mut stale = Vec::new();
        for coordinator in self.coordinators.values() {
            for mailbox in &self.config.sync.mailboxes {
                let fresh = self
                    .store
                    .is_fresh(coordinator.address(), mailbox, self.config.sync.freshness)
                    .await
                    .unwrap_or(false);
                if !fresh {
                    stale.push((coordinator.address().to_string(), mailbox.clone()));
                }
            }
        }
        stale
    }

    async fn poll_loop(self: Arc<Self>) {
        if self.config.initial_sync {
            let stale = self.stale_mailboxes().await;
            info!(count = stale.len(), "Initial sync for stale mailboxes");
            self.trigger_syncs(Some(&stale));
        }

        let sync_every = self.config.sync.sync_interval;
        let mut sync_tick = interval_at(Instant::now() + sync_every, sync_every);
        sync_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut drain_tick = interval(self.config.sync.drain_interval);
        drain_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = sync_tick.tick() => self.trigger_syncs(None),
                _ = drain_tick.tick() => {
                    match self.drain_queue().await {
                        Ok(report) if report.succeeded + report.failed > 0 => {
                            debug!(succeeded = report.succeeded, failed = report.failed, "Drain tick");
                        }
                        Ok(_) => {}
                        Err(err) => warn!(error = %err, "Queue drain failed"),
                    }
                }
            }
        }
        debug!("Poller stopped");
    }
}

async fn send_frame<S>(sink: &mut S, frame: ServerFrame) -> Result<()>
where
    S: futures::Sink<String, Error = tokio_util::codec::LinesCodecError> + Unpin,
{
    let line = serde_json::to_string(&frame).context("encoding frame")?;
    sink.send(line).await.context("writing frame")?;
    Ok(())
}

/// Binds the socket, clearing a stale file left by a crashed server.
pub async fn bind_socket(path: &Path) -> Result<UnixListener> {
    if path.exists() {
        if UnixStream::connect(path).await.is_ok() {
            bail!("a server is already listening on {}", path.display());
        }
        std::fs::remove_file(path)
            .with_context(|| format!("removing stale socket {}", path.display()))?;
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating socket directory {}", parent.display()))?;
    }
    UnixListener::bind(path).with_context(|| format!("binding {}", path.display()))
}
