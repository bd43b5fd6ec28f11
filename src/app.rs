use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::cli::Cli;
use crate::config::{self, AppDefaults};
use crate::remote::imap::ImapConnector;
use crate::server::{Server, ServerConfig};
use crate::storage::{CacheStore, DB_FILE_NAME};

pub async fn run(cli: Cli) -> Result<()> {
    let mut defaults = AppDefaults::load_with_data_dir(cli.data_dir)?;
    if let Some(socket) = cli.socket {
        defaults.socket_path = socket;
    }
    if let Some(accounts) = cli.accounts {
        defaults.accounts_file = accounts;
    }

    let accounts = config::load_accounts(&defaults.accounts_file)?;
    if accounts.is_empty() {
        warn!(path = %defaults.accounts_file.display(), "No accounts configured; serving an empty cache");
    }

    let db_path = defaults.data_dir.join(DB_FILE_NAME);
    let store = Arc::new(CacheStore::open(&db_path).await?);
    info!(path = %db_path.display(), accounts = accounts.len(), "Using SQLite store");

    let connector = Arc::new(ImapConnector::new().context("building IMAP connector")?);

    let mut server_config = ServerConfig::from_defaults(&defaults);
    server_config.initial_sync = !cli.no_initial_sync;
    tokio::fs::create_dir_all(&server_config.downloads_dir)
        .await
        .with_context(|| format!("creating {}", server_config.downloads_dir.display()))?;

    let server = Server::new(accounts, connector, store, server_config);

    let token = server.shutdown_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupt received, shutting down");
            token.cancel();
        }
    });

    server.run().await
}
