use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::config::PoolSettings;
use crate::errors::{RemoteError, RemoteResult};
use crate::remote::{Connector, SessionBox};
use crate::types::Account;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Liveness {
    Absent,
    Fresh,
    Stale,
    Broken,
}

#[derive(Default)]
struct Slot {
    session: Option<SessionBox>,
    last_used: Option<Instant>,
    broken: bool,
}

impl Slot {
    fn liveness(&self, idle: std::time::Duration) -> Liveness {
        if self.broken {
            return Liveness::Broken;
        }
        match (&self.session, self.last_used) {
            (None, _) => Liveness::Absent,
            (Some(_), Some(at)) if at.elapsed() < idle => Liveness::Fresh,
            (Some(_), _) => Liveness::Stale,
        }
    }
}

/// Zero or one live session for a single account. Calls are serialized: the
/// slot stays locked for the whole remote round trip.
pub struct ConnectionPool {
    account: Account,
    connector: Arc<dyn Connector>,
    settings: PoolSettings,
    slot: Mutex<Slot>,
    connects: AtomicU64,
}

impl ConnectionPool {
    pub fn new(account: Account, connector: Arc<dyn Connector>, settings: PoolSettings) -> Self {
        Self {
            account,
            connector,
            settings,
            slot: Mutex::new(Slot::default()),
            connects: AtomicU64::new(0),
        }
    }

    pub fn account(&self) -> &Account {
        &self.account
    }

    pub async fn liveness(&self) -> Liveness {
        self.slot.lock().await.liveness(self.settings.idle)
    }

    /// Number of sessions opened so far.
    pub fn connect_count(&self) -> u64 {
        self.connects.load(Ordering::Relaxed)
    }

    /// Runs `f` against a live session, connecting first when needed.
    ///
    /// Every call is bounded by the configured timeout. A connection-level
    /// failure (including a timeout) drops the session so the next call
    /// reconnects; operation-level failures keep it.
    pub async fn with_connection<T, F>(&self, mailbox: &str, f: F) -> RemoteResult<T>
    where
        T: Send,
        F: for<'s> FnOnce(&'s mut SessionBox) -> BoxFuture<'s, RemoteResult<T>> + Send,
    {
        let limit = self.settings.call_timeout;
        let mut slot = self.slot.lock().await;

        match slot.liveness(self.settings.idle) {
            Liveness::Fresh => {
                debug!(account = %self.account.address, mailbox = %mailbox, "Reusing cached remote session");
            }
            Liveness::Stale => {
                debug!(account = %self.account.address, "Cached session expired, reconnecting");
                if let Some(mut old) = slot.session.take() {
                    let _ = timeout(limit, old.close()).await;
                }
            }
            Liveness::Broken => {
                debug!(account = %self.account.address, "Previous session broke, reconnecting");
                slot.session = None;
            }
            Liveness::Absent => {}
        }

        if slot.session.is_none() {
            let connect_start = Instant::now();
            let session = match timeout(limit, self.connector.connect(&self.account)).await {
                Ok(Ok(session)) => session,
                Ok(Err(err)) => {
                    warn!(account = %self.account.address, error = %err, "Connect failed");
                    slot.broken = err.is_connection_level();
                    return Err(err);
                }
                Err(_) => {
                    warn!(account = %self.account.address, "Connect timed out");
                    slot.broken = true;
                    return Err(RemoteError::Timeout(limit.as_secs()));
                }
            };
            self.connects.fetch_add(1, Ordering::Relaxed);
            info!(
                account = %self.account.address,
                elapsed_ms = ?connect_start.elapsed().as_millis(),
                "Remote session opened"
            );
            slot.session = Some(session);
            slot.broken = false;
        }

        let Some(session) = slot.session.as_mut() else {
            return Err(RemoteError::Connection("no session available".to_string()));
        };

        let result = match timeout(limit, f(session)).await {
            Ok(result) => result,
            Err(_) => Err(RemoteError::Timeout(limit.as_secs())),
        };

        match &result {
            Err(err) if err.is_connection_level() => {
                warn!(account = %self.account.address, mailbox = %mailbox, error = %err, "Discarding remote session");
                slot.session = None;
                slot.last_used = None;
                slot.broken = true;
            }
            _ => slot.last_used = Some(Instant::now()),
        }

        result
    }

    /// Drops the current session; the next call reconnects.
    pub async fn invalidate(&self) {
        let mut slot = self.slot.lock().await;
        slot.session = None;
        slot.last_used = None;
    }

    pub async fn close(&self) {
        let mut slot = self.slot.lock().await;
        if let Some(mut session) = slot.session.take() {
            let _ = timeout(self.settings.call_timeout, session.close()).await;
            debug!(account = %self.account.address, "Remote session closed");
        }
        slot.last_used = None;
    }
}
