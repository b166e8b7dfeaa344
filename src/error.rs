use thiserror::Error;

/// Custom error type for the database core operations.
#[derive(Error, Debug)]
pub enum DbError {
    #[error("I/O Error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Corruption detected: {details}")]
    Corruption {
        details: String,
        metric: Option<String>,
        timestamp: Option<u64>,
    },

    #[error("Lock acquisition failed: {0}")]
    LockError(String),

    #[error("Configuration Error: {0}")]
    ConfigError(String),

    #[error("Background task error: {0}")]
    BackgroundTaskError(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

// Implement conversion from lock poison errors for convenience
impl<T> From<std::sync::PoisonError<T>> for DbError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        DbError::LockError(format!("Mutex/RwLock poisoned: {}", err))
    }
}
