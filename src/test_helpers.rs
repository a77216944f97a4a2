//! In-memory session double shared by the unit tests.
//!
//! `MemoryDatabase` hands out `MemorySession`s that implement the same traits
//! as `PgSession`. Inserts stay pending on the session until `commit`, and the
//! shared state counts opened/closed sessions, commits and rollbacks so tests
//! can check that every scope released what it acquired.
//!
//! `LogCapture` records formatted tracing output for the current thread so
//! tests can assert on the exact lines an operation logs.

use std::collections::BTreeMap;
use std::io;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use time::macros::datetime;
use time::{OffsetDateTime, PrimitiveDateTime};
use tracing::Subscriber;
use tracing::subscriber::DefaultGuard;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::fmt::{self, MakeWriter};
use tracing_subscriber::layer::{Layer, SubscriberExt};
use tracing_subscriber::registry::LookupSpan;

use crate::db::{DbError, Session, SessionSource};
use crate::seed::{RoleRecord, RoleStore};
use crate::timezone::{ServerTimezone, TimezoneProbe};

pub const SAMPLE_NOW: OffsetDateTime = datetime!(2026-01-02 03:04:05.678 UTC);

#[derive(Debug, Clone, PartialEq)]
pub struct StoredRole {
    pub role: String,
    pub permissions: serde_json::Value,
}

#[derive(Debug)]
pub struct MemoryState {
    pub roles: BTreeMap<i32, StoredRole>,
    pub opened: usize,
    pub closed: usize,
    pub commits: usize,
    pub rollbacks: usize,
    pub discarded: usize,
    pub session_timezone: Option<String>,
    pub server_timezone_privileged: bool,
    pub probe_delay: Option<Duration>,
    pub fail_acquire: bool,
    pub fail_commit: bool,
    pub fail_insert_rank: Option<i32>,
}

impl Default for MemoryState {
    fn default() -> Self {
        Self {
            roles: BTreeMap::new(),
            opened: 0,
            closed: 0,
            commits: 0,
            rollbacks: 0,
            discarded: 0,
            session_timezone: Some("UTC".into()),
            server_timezone_privileged: true,
            probe_delay: None,
            fail_acquire: false,
            fail_commit: false,
            fail_insert_rank: None,
        }
    }
}

#[derive(Clone, Default)]
pub struct MemoryDatabase {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryDatabase {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_timezone(timezone: Option<&str>) -> Self {
        let db = Self::new();
        db.state().session_timezone = timezone.map(str::to_owned);
        db
    }

    pub fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap()
    }

    #[must_use]
    pub fn roles(&self) -> BTreeMap<i32, StoredRole> {
        self.state().roles.clone()
    }

    pub fn insert_committed(&self, rank: i32, role: &str, permissions: serde_json::Value) {
        self.state().roles.insert(rank, StoredRole { role: role.into(), permissions });
    }

    /// Every session handed out has been closed exactly once.
    pub fn assert_all_released(&self) {
        let state = self.state();
        assert_eq!(state.opened, state.closed, "opened {} sessions but closed {}", state.opened, state.closed);
    }
}

#[async_trait::async_trait]
impl SessionSource for MemoryDatabase {
    type Session = MemorySession;

    async fn session(&self) -> Result<MemorySession, DbError> {
        let mut state = self.state();
        if state.fail_acquire {
            return Err(DbError::Acquire(sqlx::Error::PoolTimedOut));
        }
        state.opened += 1;
        Ok(MemorySession { db: self.clone(), pending: Vec::new() })
    }
}

pub struct MemorySession {
    db: MemoryDatabase,
    pending: Vec<RoleRecord>,
}

impl MemorySession {
    #[must_use]
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    async fn probe_delay(&self) {
        let delay = self.db.state().probe_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }
}

#[async_trait::async_trait]
impl Session for MemorySession {
    async fn commit(&mut self) -> Result<(), DbError> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let mut state = self.db.state();
        if state.fail_commit {
            return Err(DbError::Query(sqlx::Error::Protocol("commit failed".into())));
        }
        for role in self.pending.drain(..) {
            state
                .roles
                .insert(role.rank, StoredRole { role: role.role, permissions: role.permissions });
        }
        state.commits += 1;
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), DbError> {
        self.pending.clear();
        self.db.state().rollbacks += 1;
        Ok(())
    }

    async fn close(self) {
        self.db.state().closed += 1;
    }

    fn discard(&mut self) {
        self.pending.clear();
        self.db.state().discarded += 1;
    }
}

#[async_trait::async_trait]
impl RoleStore for MemorySession {
    async fn rank_exists(&mut self, rank: i32) -> Result<bool, DbError> {
        let committed = self.db.state().roles.contains_key(&rank);
        Ok(committed || self.pending.iter().any(|r| r.rank == rank))
    }

    async fn insert_role(&mut self, role: &RoleRecord) -> Result<bool, DbError> {
        if self.db.state().fail_insert_rank == Some(role.rank) {
            return Err(DbError::Query(sqlx::Error::Protocol(format!(
                "duplicate key value violates unique constraint (rank={})",
                role.rank
            ))));
        }
        if self.rank_exists(role.rank).await? {
            return Ok(false);
        }
        self.pending.push(role.clone());
        Ok(true)
    }
}

#[async_trait::async_trait]
impl TimezoneProbe for MemorySession {
    async fn session_timezone(&mut self) -> Result<Option<String>, DbError> {
        self.probe_delay().await;
        Ok(self.db.state().session_timezone.clone())
    }

    async fn server_timezone(&mut self) -> Result<ServerTimezone, DbError> {
        if self.db.state().server_timezone_privileged {
            Ok(ServerTimezone::Known("Etc/UTC".into()))
        } else {
            Ok(ServerTimezone::Unknown)
        }
    }

    async fn current_timestamps(&mut self) -> Result<(OffsetDateTime, PrimitiveDateTime), DbError> {
        Ok((SAMPLE_NOW, PrimitiveDateTime::new(SAMPLE_NOW.date(), SAMPLE_NOW.time())))
    }
}

// =============================================================================
// log capture
// =============================================================================

#[derive(Clone, Default)]
pub struct LogCapture {
    buf: Arc<Mutex<Vec<u8>>>,
}

impl LogCapture {
    /// Plain fmt layer writing into this capture: no time, target or colour.
    pub fn layer<S>(&self) -> impl Layer<S> + use<S>
    where
        S: Subscriber + for<'a> LookupSpan<'a>,
    {
        fmt::layer().with_writer(self.clone()).with_ansi(false).without_time().with_target(false)
    }

    /// Capture everything down to DEBUG on this thread until the guard drops.
    #[must_use]
    pub fn install(&self) -> DefaultGuard {
        let subscriber = tracing_subscriber::registry().with(LevelFilter::DEBUG).with(self.layer());
        tracing::subscriber::set_default(subscriber)
    }

    #[must_use]
    pub fn lines(&self) -> Vec<String> {
        String::from_utf8_lossy(&self.buf.lock().unwrap()).lines().map(|l| l.trim().to_owned()).collect()
    }

    /// Whether some line is exactly `level` followed by `message`.
    #[must_use]
    pub fn has_line(&self, level: &str, message: &str) -> bool {
        let expected = format!("{level} {message}");
        self.lines().iter().any(|line| *line == expected)
    }
}

impl<'a> MakeWriter<'a> for LogCapture {
    type Writer = LogCaptureWriter;

    fn make_writer(&'a self) -> Self::Writer {
        LogCaptureWriter(Arc::clone(&self.buf))
    }
}

pub struct LogCaptureWriter(Arc<Mutex<Vec<u8>>>);

impl io::Write for LogCaptureWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
