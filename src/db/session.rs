//! Sessions and the transactional session scope.
//!
//! DESIGN
//! ======
//! A session is one pooled connection owned by a single call path. The first
//! statement opens a transaction (`BEGIN`); `commit`/`rollback` end it and are
//! no-ops when nothing is open. `close` rolls back whatever is still open and
//! hands the connection back to the pool.
//!
//! [`transaction`] is the scoped form: commit on success, rollback on error,
//! release on every path. If the scope is abandoned mid-flight (panic, future
//! dropped), `PgSession`'s `Drop` discards a connection that still has an
//! open transaction instead of returning it to the pool.
//!
//! A statement abandoned by a timeout may still be running on the server, and
//! anything sent after it would queue behind it. Such a session is
//! [`Session::discard`]ed: no further statement is sent, `rollback` and
//! `close` return at once, and the connection is closed instead of pooled.

use std::fmt;

use sqlx::pool::PoolConnection;
use sqlx::{PgConnection, Postgres};
use tracing::{debug, error, warn};

use super::DbError;

/// A unit-of-work handle bound to one connection.
#[async_trait::async_trait]
pub trait Session: Send {
    /// Commit the open transaction, if any.
    async fn commit(&mut self) -> Result<(), DbError>;

    /// Roll back the open transaction, if any.
    async fn rollback(&mut self) -> Result<(), DbError>;

    /// Release the session. Failures are logged, never returned.
    async fn close(self);

    /// Give up on the connection after an abandoned statement. The server
    /// aborts the open transaction when the connection closes.
    fn discard(&mut self);
}

/// Anything that hands out sessions.
#[async_trait::async_trait]
pub trait SessionSource: Sync {
    type Session: Session;

    async fn session(&self) -> Result<Self::Session, DbError>;
}

/// Run `work` against a fresh session from `source`.
///
/// On `Ok` the session is committed; on `Err` it is rolled back and the error
/// is returned unchanged. The session is closed before this returns, whether
/// `work`, the commit or the rollback failed.
///
/// # Errors
///
/// Returns the error from `work`, or a `DbError` converted into `E` when the
/// session cannot be acquired or the commit fails.
pub async fn transaction<Src, F, T, E>(source: &Src, work: F) -> Result<T, E>
where
    Src: SessionSource + ?Sized,
    F: AsyncFnOnce(&mut Src::Session) -> Result<T, E>,
    E: From<DbError> + fmt::Display,
{
    let mut session = source.session().await?;
    let outcome = settle(&mut session, work).await;
    session.close().await;
    outcome
}

async fn settle<S, F, T, E>(session: &mut S, work: F) -> Result<T, E>
where
    S: Session,
    F: AsyncFnOnce(&mut S) -> Result<T, E>,
    E: From<DbError> + fmt::Display,
{
    match work(&mut *session).await {
        Ok(value) => {
            if let Err(err) = session.commit().await {
                error!(error = %err, "commit failed; rolling back");
                if let Err(rollback_err) = session.rollback().await {
                    warn!(error = %rollback_err, "rollback after failed commit also failed");
                }
                return Err(err.into());
            }
            Ok(value)
        }
        Err(err) => {
            warn!(error = %err, "unit of work failed; rolling back");
            if let Err(rollback_err) = session.rollback().await {
                error!(error = %rollback_err, "rollback failed");
            }
            Err(err)
        }
    }
}

/// Postgres session over a pooled connection.
pub struct PgSession {
    conn: Option<PoolConnection<Postgres>>,
    in_transaction: bool,
    discarded: bool,
}

impl PgSession {
    pub(crate) fn new(conn: PoolConnection<Postgres>) -> Self {
        Self { conn: Some(conn), in_transaction: false, discarded: false }
    }

    /// Whether a transaction is currently open on this session.
    #[must_use]
    pub fn in_transaction(&self) -> bool {
        self.in_transaction
    }

    #[must_use]
    pub fn is_discarded(&self) -> bool {
        self.discarded
    }

    /// The underlying connection, opening a transaction first if none is open.
    ///
    /// # Errors
    ///
    /// Returns `DbError::Query` if `BEGIN` fails, or `DbError::Closed` once the
    /// session has been discarded.
    pub async fn connection(&mut self) -> Result<&mut PgConnection, DbError> {
        if self.discarded {
            return Err(DbError::Closed);
        }
        let conn = self.conn.as_mut().ok_or(DbError::Closed)?;
        if !self.in_transaction {
            sqlx::query("BEGIN").execute(&mut **conn).await?;
            self.in_transaction = true;
        }
        Ok(&mut **conn)
    }

    async fn finish(&mut self, statement: &'static str) -> Result<(), DbError> {
        if !self.in_transaction {
            return Ok(());
        }
        let conn = self.conn.as_mut().ok_or(DbError::Closed)?;
        sqlx::query(statement).execute(&mut **conn).await?;
        self.in_transaction = false;
        Ok(())
    }
}

#[async_trait::async_trait]
impl Session for PgSession {
    async fn commit(&mut self) -> Result<(), DbError> {
        if self.discarded {
            return Err(DbError::Closed);
        }
        self.finish("COMMIT").await
    }

    async fn rollback(&mut self) -> Result<(), DbError> {
        if self.discarded {
            return Ok(());
        }
        self.finish("ROLLBACK").await
    }

    async fn close(mut self) {
        if self.discarded {
            drop(self.conn.take());
            debug!("discarded session released");
            return;
        }
        if let Err(err) = self.finish("ROLLBACK").await {
            warn!(error = %err, "rollback on close failed; discarding connection");
            if let Some(conn) = self.conn.as_mut() {
                conn.close_on_drop();
            }
            self.in_transaction = false;
        }
        drop(self.conn.take());
        debug!("session released");
    }

    fn discard(&mut self) {
        if self.discarded {
            return;
        }
        warn!(in_transaction = self.in_transaction, "discarding session after an abandoned statement");
        if let Some(conn) = self.conn.as_mut() {
            conn.close_on_drop();
        }
        self.discarded = true;
        self.in_transaction = false;
    }
}

impl Drop for PgSession {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.as_mut() {
            if self.in_transaction {
                warn!("session dropped with an open transaction; discarding connection");
                conn.close_on_drop();
            }
        }
    }
}

impl fmt::Debug for PgSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PgSession")
            .field("open", &self.conn.is_some())
            .field("in_transaction", &self.in_transaction)
            .field("discarded", &self.discarded)
            .finish()
    }
}

#[cfg(test)]
#[path = "session_test.rs"]
mod tests;
