use thiserror::Error;

pub type AppResult<T> = Result<T, AppError>;
pub type RemoteResult<T> = Result<T, RemoteError>;

/// Failures reported by the remote mail source.
///
/// The first three variants are connection-level: the pooled session is
/// discarded before the error is returned. The rest are operation-level and
/// leave the session in place.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RemoteError {
    #[error("Connection error: {0}")]
    Connection(String),
    #[error("Remote call timed out after {0}s")]
    Timeout(u64),
    #[error("Auth expired for account")]
    AuthExpired,
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Rejected by server: {0}")]
    Rejected(String),
    #[error("uidValidity changed: queued under {expected}, mailbox is now {found}")]
    EpochChanged { expected: u32, found: u32 },
}

impl RemoteError {
    pub fn is_connection_level(&self) -> bool {
        matches!(
            self,
            RemoteError::Connection(_) | RemoteError::Timeout(_) | RemoteError::AuthExpired
        )
    }
}

#[derive(Error, Debug)]
pub enum AppError {
    #[error(transparent)]
    Remote(#[from] RemoteError),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("version mismatch: server={server}, client={client} - please restart the server")]
    ProtocolVersion { server: String, client: String },
    #[error("Could not record pending operation: {0}")]
    QueuePersistence(String),
    #[error("Database error: {0}")]
    Database(String),
    #[error("Account not found: {0}")]
    UnknownAccount(String),
    #[error("Config error: {0}")]
    Config(String),
    #[error("I/O error: {0}")]
    Io(String),
    #[error("Server error: {0}")]
    Server(String),
}

impl AppError {
    pub fn database(err: anyhow::Error) -> Self {
        AppError::Database(format!("{err:#}"))
    }
}
