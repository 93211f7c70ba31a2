pub mod error;

pub use error::{
    BoxError, CacheError, ConfigError, ConnectionError, Error, ErrorKind, InferenceError,
    OrchestratorError, OrmError, PersistError, QueueError, RateLimitError, Result, SessionError,
    TokenError,
};
