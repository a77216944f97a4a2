//! Connection manager: the process-wide `PostgreSQL` pool.
//!
//! SYSTEM CONTEXT
//! ==============
//! Startup builds exactly one pool per process. Callers either hold the
//! `ConnectionManager` handle directly or reach the shared instance through
//! [`ConnectionManager::instance`]. Every session comes from this pool.
//!
//! TIMEZONE
//! ========
//! Each pooled connection is opened with the startup option
//! `-c timezone=UTC`, so the server itself renders and interprets timestamps
//! in UTC for the whole connection lifetime. The timezone verifier checks that
//! this took effect.

mod error;
pub mod session;

use std::future::Future;
use std::time::Duration;

use sqlx::PgPool;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use tokio::sync::OnceCell;
use tracing::{error, info};

use crate::config::ConnectionConfig;

pub use error::DbError;
pub use session::{PgSession, Session, SessionSource, transaction};

const APPLICATION_NAME: &str = "roleseed";
const IDLE_TIMEOUT_SECS: u64 = 600;

static INSTANCE: OnceCell<ConnectionManager> = OnceCell::const_new();

/// Owner of the pooled connection factory. Cloning shares the same pool.
#[derive(Debug, Clone)]
pub struct ConnectionManager {
    pool: PgPool,
}

impl ConnectionManager {
    /// Build the pool and open one connection to prove the server is reachable.
    ///
    /// # Errors
    ///
    /// Returns `DbError::Connect` if the host is unreachable, authentication
    /// fails, or the first connection cannot be established in time.
    pub async fn connect(config: &ConnectionConfig) -> Result<Self, DbError> {
        let pool = pool_options(config)
            .connect_with(connect_options(config))
            .await
            .map_err(|e| {
                error!(
                    severity = "critical",
                    host = config.host(),
                    port = config.port(),
                    database = config.database(),
                    error = %e,
                    "failed to connect to database"
                );
                DbError::Connect(e)
            })?;

        info!(
            host = config.host(),
            database = config.database(),
            max_connections = config.max_connections(),
            timezone = config.timezone(),
            "database connection pool created"
        );
        Ok(Self { pool })
    }

    /// Build the pool without opening any connection yet.
    #[must_use]
    pub fn lazy(config: &ConnectionConfig) -> Self {
        let pool = pool_options(config).connect_lazy_with(connect_options(config));
        Self { pool }
    }

    /// The shared manager, connecting on first use.
    ///
    /// Concurrent first callers wait on a single connection attempt. A failed
    /// attempt leaves nothing behind, so the next call starts over.
    ///
    /// # Errors
    ///
    /// Returns `DbError::Connect` if the first construction fails.
    pub async fn instance(config: &ConnectionConfig) -> Result<&'static Self, DbError> {
        init_once(&INSTANCE, || Self::connect(config)).await
    }

    /// The shared manager if it has been initialized.
    #[must_use]
    pub fn get() -> Option<&'static Self> {
        INSTANCE.get()
    }

    /// Acquire a session from the shared manager.
    ///
    /// # Errors
    ///
    /// Returns `DbError::SessionNotReady` if [`ConnectionManager::instance`]
    /// has not completed successfully, or `DbError::Acquire` if the pool is
    /// exhausted.
    pub async fn global_session() -> Result<PgSession, DbError> {
        let Some(manager) = Self::get() else {
            error!(severity = "critical", "session requested before database initialization");
            return Err(DbError::SessionNotReady);
        };
        manager.acquire().await
    }

    #[must_use]
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Take a connection from the pool as a new session.
    ///
    /// # Errors
    ///
    /// Returns `DbError::Acquire` if no connection frees up within the
    /// configured acquire timeout.
    pub async fn acquire(&self) -> Result<PgSession, DbError> {
        let conn = self.pool.acquire().await.map_err(DbError::Acquire)?;
        Ok(PgSession::new(conn))
    }

    /// Run `work` in a transactional session scope on this pool.
    ///
    /// # Errors
    ///
    /// Returns the error produced by `work` unchanged, or a `DbError`
    /// converted into `E` if acquiring or committing fails.
    pub async fn transaction<F, T, E>(&self, work: F) -> Result<T, E>
    where
        F: AsyncFnOnce(&mut PgSession) -> Result<T, E>,
        E: From<DbError> + std::fmt::Display,
    {
        session::transaction(self, work).await
    }
}

#[async_trait::async_trait]
impl SessionSource for ConnectionManager {
    type Session = PgSession;

    async fn session(&self) -> Result<PgSession, DbError> {
        self.acquire().await
    }
}

async fn init_once<F, Fut>(cell: &'static OnceCell<ConnectionManager>, init: F) -> Result<&'static ConnectionManager, DbError>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<ConnectionManager, DbError>>,
{
    cell.get_or_try_init(init).await
}

fn connect_options(config: &ConnectionConfig) -> PgConnectOptions {
    PgConnectOptions::new()
        .host(config.host())
        .port(config.port())
        .database(config.database())
        .username(config.user())
        .password(config.password())
        .application_name(APPLICATION_NAME)
        .options([("timezone", config.timezone())])
}

fn pool_options(config: &ConnectionConfig) -> PgPoolOptions {
    PgPoolOptions::new()
        .max_connections(config.max_connections())
        .min_connections(0)
        .acquire_timeout(config.acquire_timeout())
        .idle_timeout(Duration::from_secs(IDLE_TIMEOUT_SECS))
}

#[cfg(test)]
#[path = "mod_test.rs"]
mod tests;
