use clap::Parser;
use std::path::PathBuf;

/// Command-line options for the mailmirror server.
#[derive(Parser, Debug)]
#[command(author, version, about)]
pub struct Cli {
    /// Directory holding the cache database, socket and downloads.
    #[arg(long)]
    pub data_dir: Option<PathBuf>,

    /// Unix socket presentation clients connect to.
    #[arg(long)]
    pub socket: Option<PathBuf>,

    /// Accounts file (TOML).
    #[arg(long)]
    pub accounts: Option<PathBuf>,

    /// Serve from cache only until the first scheduled sync.
    #[arg(long)]
    pub no_initial_sync: bool,
}
