use thiserror::Error;

#[derive(Error, Debug)]
pub enum FolioError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("storage is not open")]
    NotOpen,

    #[error("storage is already open: {0}")]
    AlreadyOpen(String),

    #[error("entity not found: {0}")]
    NotFound(String),

    #[error("entity already exists: {0}")]
    AlreadyExists(String),

    #[error("data corruption: {0}")]
    Corrupted(String),

    #[error("unsupported file version {found} (supported {min}..={max})")]
    VersionMismatch { found: u32, min: u32, max: u32 },

    #[error("storage is read-only")]
    ReadOnly,

    #[error("out of range: {0}")]
    OutOfRange(String),

    #[error("entity too large: {size} bytes exceeds limit of {limit}")]
    EntityTooLarge { size: usize, limit: usize },

    #[error("authentication failed: payload cannot be decrypted with this key")]
    AuthenticationFailed,

    #[error("a transaction is already active")]
    TransactionActive,

    #[error("no active transaction")]
    NoActiveTransaction,

    #[error("transactions are disabled for this storage")]
    TransactionsDisabled,

    #[error("buffer pool exhausted: all frames are pinned")]
    CacheExhausted,

    #[error("catalog does not fit in a single page")]
    CatalogOverflow,

    #[error("invalid page size {0}: must be 4096, 8192, 16384 or 32768")]
    InvalidPageSize(u32),

    #[error("recovery failed: {0}")]
    RecoveryFailed(String),

    #[error("WAL error: {0}")]
    Wal(String),

    #[error("{storage}: {op}: {source}")]
    Context {
        storage: String,
        op: &'static str,
        #[source]
        source: Box<FolioError>,
    },
}

impl FolioError {
    /// Wrap a lower-layer error with the storage name and the operation that
    /// observed it. Used at the storage API boundary.
    pub fn context(self, storage: &str, op: &'static str) -> Self {
        FolioError::Context {
            storage: storage.to_string(),
            op,
            source: Box::new(self),
        }
    }

    /// Strip `Context` wrappers and return the underlying error kind.
    pub fn root_cause(&self) -> &FolioError {
        match self {
            FolioError::Context { source, .. } => source.root_cause(),
            other => other,
        }
    }
}

pub type Result<T> = std::result::Result<T, FolioError>;
