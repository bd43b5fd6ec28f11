use anyhow::{Context, Result};
use dirs::home_dir;
use serde::Deserialize;
use std::env;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, warn};

use crate::types::{Account, Endpoint, Provider};

const ACCOUNTS_FILE_NAME: &str = "accounts.toml";
const SOCKET_FILE_NAME: &str = "mailmirror.sock";
const KEYRING_SERVICE: &str = "mailmirror";

/// Knobs of the sync algorithm and the background cadence.
#[derive(Debug, Clone)]
pub struct SyncSettings {
    /// Most recent messages sampled by sequence (N).
    pub recent_count: u32,
    /// Date window that is always mirrored completely (D).
    pub recent_days: u32,
    /// Bodies prefetched after each sync (P).
    pub prefetch_bodies: u32,
    pub sync_interval: Duration,
    pub drain_interval: Duration,
    pub freshness: Duration,
    pub mailboxes: Vec<String>,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            recent_count: 100,
            recent_days: 14,
            prefetch_bodies: 10,
            sync_interval: Duration::from_secs(600),
            drain_interval: Duration::from_secs(10),
            freshness: Duration::from_secs(600),
            mailboxes: vec!["INBOX".to_string()],
        }
    }
}

/// Pool timing. `idle` is the window in which a session is reused.
#[derive(Debug, Clone, Copy)]
pub struct PoolSettings {
    pub idle: Duration,
    pub call_timeout: Duration,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            idle: Duration::from_secs(300),
            call_timeout: Duration::from_secs(30),
        }
    }
}

/// Application-wide defaults. These can be overridden by env vars but do not
/// require any user-authored config files.
#[derive(Debug, Clone)]
pub struct AppDefaults {
    pub data_dir: PathBuf,
    pub socket_path: PathBuf,
    pub accounts_file: PathBuf,
    pub sync: SyncSettings,
    pub pool: PoolSettings,
    pub request_timeout: Duration,
}

impl AppDefaults {
    pub fn load() -> Result<Self> {
        Self::load_with_data_dir(None)
    }

    /// Like `load`, with an explicit data directory taking precedence over
    /// `MAILMIRROR_DATA_DIR`.
    pub fn load_with_data_dir(data_dir: Option<PathBuf>) -> Result<Self> {
        let data_dir = match data_dir {
            Some(path) => {
                std::fs::create_dir_all(&path)
                    .with_context(|| format!("creating data directory {}", path.display()))?;
                path
            }
            None => default_data_dir()?,
        };
        let socket_path = env::var("MAILMIRROR_SOCKET")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join(SOCKET_FILE_NAME));
        let accounts_file = env::var("MAILMIRROR_ACCOUNTS_FILE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join(ACCOUNTS_FILE_NAME));

        let base = SyncSettings::default();
        let mailboxes = env::var("MAILMIRROR_MAILBOXES")
            .ok()
            .map(|raw| {
                raw.split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect::<Vec<_>>()
            })
            .filter(|list| !list.is_empty())
            .unwrap_or(base.mailboxes);

        let sync = SyncSettings {
            recent_count: env_number("MAILMIRROR_RECENT_COUNT").unwrap_or(base.recent_count),
            recent_days: env_number("MAILMIRROR_RECENT_DAYS").unwrap_or(base.recent_days),
            prefetch_bodies: env_number("MAILMIRROR_PREFETCH_BODIES")
                .unwrap_or(base.prefetch_bodies),
            sync_interval: env_secs("MAILMIRROR_SYNC_INTERVAL_SECS").unwrap_or(base.sync_interval),
            drain_interval: env_secs("MAILMIRROR_DRAIN_INTERVAL_SECS")
                .unwrap_or(base.drain_interval),
            freshness: env_secs("MAILMIRROR_FRESHNESS_SECS").unwrap_or(base.freshness),
            mailboxes,
        };

        let pool_base = PoolSettings::default();
        let pool = PoolSettings {
            idle: env_secs("MAILMIRROR_POOL_IDLE_SECS").unwrap_or(pool_base.idle),
            call_timeout: env_secs("MAILMIRROR_REMOTE_TIMEOUT_SECS")
                .unwrap_or(pool_base.call_timeout),
        };

        Ok(Self {
            data_dir,
            socket_path,
            accounts_file,
            sync,
            pool,
            request_timeout: env_secs("MAILMIRROR_REQUEST_TIMEOUT_SECS")
                .unwrap_or(Duration::from_secs(120)),
        })
    }
}

/// Parses a numeric setting. Values that do not fit `T` are rejected with a
/// warning and the caller keeps its default.
pub fn parse_number<T: FromStr>(key: &str, raw: &str) -> Option<T> {
    match raw.trim().parse::<T>() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(key = %key, value = %raw, "Ignoring invalid numeric setting");
            None
        }
    }
}

fn env_number<T: FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|raw| parse_number(key, &raw))
}

fn env_secs(key: &str) -> Option<Duration> {
    env_number::<u64>(key).filter(|v| *v > 0).map(Duration::from_secs)
}

pub fn default_data_dir() -> Result<PathBuf> {
    if let Ok(custom) = env::var("MAILMIRROR_DATA_DIR") {
        let path = PathBuf::from(custom);
        std::fs::create_dir_all(&path)
            .with_context(|| format!("creating MAILMIRROR_DATA_DIR at {}", path.display()))?;
        return Ok(path);
    }

    if let Some(home) = home_dir() {
        let path = home.join(".mailmirror");
        if std::fs::create_dir_all(&path).is_ok() {
            return Ok(path);
        } else {
            warn!(
                "Unable to create {}/.mailmirror; falling back to workspace-local storage",
                home.display()
            );
        }
    }

    let cwd = env::current_dir().context("determining current directory")?;
    let path = cwd.join("mailmirror-data");
    std::fs::create_dir_all(&path)
        .with_context(|| format!("creating fallback data directory {}", path.display()))?;
    Ok(path)
}

#[derive(Debug, Deserialize)]
struct AccountsFile {
    #[serde(default)]
    accounts: Vec<AccountEntry>,
}

#[derive(Debug, Deserialize)]
struct AccountEntry {
    address: String,
    #[serde(default)]
    provider: Provider,
    host: String,
    #[serde(default = "default_imap_port")]
    port: u16,
    username: Option<String>,
    password: Option<String>,
    trash_mailbox: Option<String>,
    drafts_mailbox: Option<String>,
}

fn default_imap_port() -> u16 {
    993
}

/// Parses an accounts file. Secrets missing from the file are resolved with
/// `lookup_secret`.
pub fn parse_accounts<F>(raw: &str, mut lookup_secret: F) -> Result<Vec<Account>>
where
    F: FnMut(&str) -> Result<String>,
{
    let file: AccountsFile = toml::from_str(raw).context("parsing accounts file")?;
    let mut out = Vec::with_capacity(file.accounts.len());
    for entry in file.accounts {
        let secret = match entry.password {
            Some(password) => password,
            None => lookup_secret(&entry.address)
                .with_context(|| format!("no secret available for {}", entry.address))?,
        };
        out.push(Account {
            username: entry.username.unwrap_or_else(|| entry.address.clone()),
            trash_mailbox: entry
                .trash_mailbox
                .unwrap_or_else(|| entry.provider.default_trash().to_string()),
            drafts_mailbox: entry
                .drafts_mailbox
                .unwrap_or_else(|| entry.provider.default_drafts().to_string()),
            provider: entry.provider,
            endpoint: Endpoint {
                host: entry.host,
                port: entry.port,
            },
            secret,
            address: entry.address,
        });
    }
    Ok(out)
}

pub fn load_accounts(path: &Path) -> Result<Vec<Account>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading accounts file {}", path.display()))?;
    let accounts = parse_accounts(&raw, keyring_secret)?;
    debug!(path = %path.display(), count = accounts.len(), "Loaded accounts");
    Ok(accounts)
}

fn keyring_secret(address: &str) -> Result<String> {
    let entry = keyring::Entry::new(KEYRING_SERVICE, address).context("opening keyring entry")?;
    entry.get_password().context("reading secret from keyring")
}
