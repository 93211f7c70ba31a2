use std::error::Error as StdError;
use std::fmt;
use thiserror::Error;

pub type BoxError = Box<dyn StdError + Send + Sync + 'static>;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorKind {
    Cache,
    Queue,
    Token,
    Session,
    Connection,
    Orchestrator,
    Inference,
    Persist,
    Orm,
    Config,
    RateLimit,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::Cache => write!(f, "cache"),
            ErrorKind::Queue => write!(f, "queue"),
            ErrorKind::Token => write!(f, "token"),
            ErrorKind::Session => write!(f, "session"),
            ErrorKind::Connection => write!(f, "connection"),
            ErrorKind::Orchestrator => write!(f, "orchestrator"),
            ErrorKind::Inference => write!(f, "inference"),
            ErrorKind::Persist => write!(f, "persist"),
            ErrorKind::Orm => write!(f, "orm"),
            ErrorKind::Config => write!(f, "config"),
            ErrorKind::RateLimit => write!(f, "rate limit"),
        }
    }
}

pub struct ErrorInner {
    pub kind: ErrorKind,
    pub source: Option<BoxError>,
    pub message: Option<String>,
}

pub struct Error {
    pub inner: Box<ErrorInner>,
}

impl Error {
    pub fn new<E>(kind: ErrorKind, source: Option<E>) -> Error
    where
        E: Into<BoxError>,
    {
        Error {
            inner: Box::new(ErrorInner {
                kind,
                source: source.map(Into::into),
                message: None,
            }),
        }
    }

    pub fn with_message<E>(kind: ErrorKind, message: String, source: Option<E>) -> Error
    where
        E: Into<BoxError>,
    {
        Error {
            inner: Box::new(ErrorInner {
                kind,
                source: source.map(Into::into),
                message: Some(message),
            }),
        }
    }

    pub fn kind(&self) -> &ErrorKind {
        &self.inner.kind
    }

    pub fn is_cache(&self) -> bool {
        matches!(self.inner.kind, ErrorKind::Cache)
    }

    pub fn is_queue(&self) -> bool {
        matches!(self.inner.kind, ErrorKind::Queue)
    }

    pub fn is_token(&self) -> bool {
        matches!(self.inner.kind, ErrorKind::Token)
    }

    pub fn is_session(&self) -> bool {
        matches!(self.inner.kind, ErrorKind::Session)
    }

    pub fn is_connection(&self) -> bool {
        matches!(self.inner.kind, ErrorKind::Connection)
    }

    pub fn is_inference(&self) -> bool {
        matches!(self.inner.kind, ErrorKind::Inference)
    }

    pub fn is_persist(&self) -> bool {
        matches!(self.inner.kind, ErrorKind::Persist)
    }

    pub fn is_orm(&self) -> bool {
        matches!(self.inner.kind, ErrorKind::Orm)
    }

    pub fn is_timeout(&self) -> bool {
        if let Some(source) = &self.inner.source {
            source.to_string().to_lowercase().contains("timeout")
        } else {
            false
        }
    }

    pub fn is_connect(&self) -> bool {
        if let Some(source) = &self.inner.source {
            let msg = source.to_string().to_lowercase();
            msg.contains("connect") || msg.contains("connection")
        } else {
            false
        }
    }

    /// Transient failures are safe to retry; everything else is final for the
    /// current attempt.
    pub fn is_transient(&self) -> bool {
        if let Some(source) = &self.inner.source {
            if let Some(orm) = source.downcast_ref::<OrmError>() {
                return matches!(
                    orm,
                    OrmError::ConnectionError(_) | OrmError::TransactionError(_)
                );
            }
            if let Some(persist) = source.downcast_ref::<PersistError>() {
                return matches!(persist, PersistError::Transient(_));
            }
        }
        self.is_timeout() || self.is_connect()
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut f = f.debug_struct("tandem::Error");
        f.field("kind", &self.inner.kind);
        if let Some(ref message) = self.inner.message {
            f.field("message", message);
        }
        if let Some(ref source) = self.inner.source {
            f.field("source", source);
        }
        f.finish()
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(ref message) = self.inner.message {
            write!(f, "{} error: {}", self.inner.kind, message)?;
        } else {
            write!(f, "{} error", self.inner.kind)?;
        }

        if let Some(ref source) = self.inner.source {
            write!(f, ": {source}")?;
        }

        Ok(())
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.inner
            .source
            .as_ref()
            .map(|e| &**e as &(dyn StdError + 'static))
    }
}

impl From<CacheError> for Error {
    fn from(err: CacheError) -> Self {
        Error::new(ErrorKind::Cache, Some(err))
    }
}

impl From<QueueError> for Error {
    fn from(err: QueueError) -> Self {
        Error::new(ErrorKind::Queue, Some(err))
    }
}

impl From<TokenError> for Error {
    fn from(err: TokenError) -> Self {
        Error::new(ErrorKind::Token, Some(err))
    }
}

impl From<SessionError> for Error {
    fn from(err: SessionError) -> Self {
        Error::new(ErrorKind::Session, Some(err))
    }
}

impl From<ConnectionError> for Error {
    fn from(err: ConnectionError) -> Self {
        Error::new(ErrorKind::Connection, Some(err))
    }
}

impl From<OrchestratorError> for Error {
    fn from(err: OrchestratorError) -> Self {
        Error::new(ErrorKind::Orchestrator, Some(err))
    }
}

impl From<InferenceError> for Error {
    fn from(err: InferenceError) -> Self {
        Error::new(ErrorKind::Inference, Some(err))
    }
}

impl From<PersistError> for Error {
    fn from(err: PersistError) -> Self {
        Error::new(ErrorKind::Persist, Some(err))
    }
}

impl From<OrmError> for Error {
    fn from(err: OrmError) -> Self {
        Error::new(ErrorKind::Orm, Some(err))
    }
}

impl From<ConfigError> for Error {
    fn from(err: ConfigError) -> Self {
        Error::new(ErrorKind::Config, Some(err))
    }
}

impl From<RateLimitError> for Error {
    fn from(err: RateLimitError) -> Self {
        Error::new(ErrorKind::RateLimit, Some(err))
    }
}

/// Cache backend failures. Referenced directly by the cache service, the
/// session store, and the reaper, so it lives at the crate root.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("redis error: {0}")]
    Redis(#[from] deadpool_redis::redis::RedisError),
    #[error("pool error: {0}")]
    Pool(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("encode error: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("compare-and-swap conflict on {0}")]
    Conflict(String),
    #[error("notifications unavailable: {0}")]
    Notify(String),
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("serialization failed: {0}")]
    SerializationFailed(BoxError),
    #[error("deserialization failed: {0}")]
    DeserializationFailed(BoxError),
    #[error("connection failed")]
    ConnectionFailed,
    #[error("channel not found: {0}")]
    ChannelNotFound(BoxError),
    #[error("push to queue failed: {0}")]
    PushFailed(BoxError),
    #[error("pop from queue failed: {0}")]
    PopFailed(BoxError),
    #[error("queue operation failed: {0}")]
    OperationFailed(#[source] BoxError),
}

#[derive(Debug, Error)]
pub enum TokenError {
    #[error("token missing")]
    Missing,
    #[error("token unknown or expired")]
    Unknown,
    #[error("parent token no longer exists")]
    OrphanedParent,
    #[error("token not bound to this session")]
    MismatchedParent,
    #[error("token already consumed")]
    Consumed,
    #[error("malformed token record: {0}")]
    Malformed(#[source] BoxError),
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session cascade incomplete: {0}")]
    CascadeIncomplete(String),
    #[error("context flush failed: {0}")]
    FlushFailed(#[source] BoxError),
    #[error("user not found")]
    UserNotFound,
}

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("connection not found: {0}")]
    NotFound(String),
    #[error("outbound sink full")]
    SinkFull,
    #[error("outbound sink closed")]
    SinkClosed,
}

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("unknown request: {0}")]
    UnknownRequest(String),
    #[error("inference queue saturated")]
    Saturated,
    #[error("invalid frame: {0}")]
    InvalidFrame(String),
    #[error("not the owner of the referenced request")]
    NotOwner,
    #[error("shutting down")]
    Draining,
}

#[derive(Debug, Error)]
pub enum InferenceError {
    #[error("model not found: {0}")]
    ModelNotFound(i64),
    #[error("model invocation failed: {0}")]
    InvocationFailed(#[source] BoxError),
    #[error("model timeout after {0} ms")]
    Timeout(u64),
    #[error("warm-up failed: {0}")]
    WarmupFailed(#[source] BoxError),
}

#[derive(Debug, Error)]
pub enum PersistError {
    #[error("transient store failure: {0}")]
    Transient(#[source] BoxError),
    #[error("schema or referential failure: {0}")]
    Fatal(#[source] BoxError),
    #[error("retry budget exhausted after {0} attempts")]
    RetriesExhausted(u32),
}

#[derive(Debug, Error)]
pub enum OrmError {
    #[error("database connection error: {0}")]
    ConnectionError(#[source] BoxError),
    #[error("query execution error: {0}")]
    QueryExecutionError(#[source] BoxError),
    #[error("transaction error: {0}")]
    TransactionError(#[source] BoxError),
    #[error("row not found")]
    NotFound,
    #[error("row already exists")]
    AlreadyExists,
    #[error("invalid data: {0}")]
    InvalidData(String),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("read failed: {0}")]
    ReadFailed(#[source] BoxError),
    #[error("parse failed: {0}")]
    ParseFailed(#[source] BoxError),
    #[error("invalid value for {0}: {1}")]
    InvalidValue(String, String),
}

#[derive(Debug, Error)]
pub enum RateLimitError {
    #[error("{0}")]
    Backend(#[source] BoxError),
    #[error("wait time: {0} ms")]
    WaitTime(u64),
}

impl Error {
    pub fn token_missing() -> Self {
        Error::from(TokenError::Missing)
    }

    pub fn token_unknown() -> Self {
        Error::from(TokenError::Unknown)
    }

    pub fn mismatched_parent() -> Self {
        Error::from(TokenError::MismatchedParent)
    }

    pub fn saturated() -> Self {
        Error::from(OrchestratorError::Saturated)
    }

    pub fn invalid_frame(msg: impl Into<String>) -> Self {
        Error::from(OrchestratorError::InvalidFrame(msg.into()))
    }

    pub fn model_timeout(ms: u64) -> Self {
        Error::from(InferenceError::Timeout(ms))
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::from(QueueError::SerializationFailed(err.to_string().into()))
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::TimedOut => {
                Error::with_message(ErrorKind::Connection, "timeout".to_string(), Some(err))
            }
            std::io::ErrorKind::ConnectionRefused => Error::new(ErrorKind::Connection, Some(err)),
            _ => Error::new(ErrorKind::Config, Some(err)),
        }
    }
}
