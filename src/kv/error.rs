use thiserror::Error;

pub type KvResult<T> = Result<T, KvError>;

#[derive(Debug, Error)]
pub enum KvError {
    #[cfg(feature = "redis")]
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("KV command timed out")]
    Timeout,

    #[error("KV store not connected")]
    NotConnected,

    #[error("Unexpected reply type: {0}")]
    Type(String),
}

impl KvError {
    /// Whether this error indicates the connection itself is unhealthy, as
    /// opposed to a per-command problem.
    pub fn is_connection_error(&self) -> bool {
        match self {
            #[cfg(feature = "redis")]
            KvError::Redis(e) => e.is_connection_dropped() || e.is_io_error(),
            KvError::Timeout | KvError::NotConnected => true,
            KvError::Type(_) => false,
        }
    }
}
