use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum DbError {
    /// Pool construction or the initial connectivity check failed.
    #[error("failed to connect to database: {0}")]
    Connect(#[source] sqlx::Error),
    /// A session was requested before the connection manager existed.
    #[error("database connection not properly initialized")]
    SessionNotReady,
    /// No pooled connection became available.
    #[error("failed to acquire database connection: {0}")]
    Acquire(#[source] sqlx::Error),
    #[error("database error: {0}")]
    Query(#[from] sqlx::Error),
    #[error("{operation} timed out after {after:?}")]
    Timeout { operation: &'static str, after: Duration },
    /// The session was used after being released.
    #[error("session already closed")]
    Closed,
}
