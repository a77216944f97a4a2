//! Timezone security verification.
//!
//! SYSTEM CONTEXT
//! ==============
//! Audit records are correlated by timestamp, so a connection rendering
//! `now()` in anything but UTC silently skews them. Startup runs
//! [`startup_check`] as a hard gate; [`audit`] is the non-fatal variant that
//! only reports.
//!
//! The probe issues three read-only diagnostics: the session `timezone`
//! setting, the server setting (best effort, `unknown` when the role lacks
//! privilege), and `now()` both native and converted to UTC. Each is bounded
//! by the configured query timeout; a probe that times out is discarded.

use std::fmt;
use std::time::Duration;

use sqlx::PgConnection;
use time::{OffsetDateTime, PrimitiveDateTime};
use tokio::time::{error::Elapsed, timeout};
use tracing::{error, info};

use crate::db::{DbError, PgSession, Session};
use crate::utc;

pub const EXPECTED_TIMEZONE: &str = "UTC";
pub const UNKNOWN_SERVER_TIMEZONE: &str = "unknown (non-privileged)";
const INSUFFICIENT_PRIVILEGE: &str = "42501";
const PROBE_SAVEPOINT: &str = "server_timezone_probe";

#[derive(Debug, thiserror::Error)]
pub enum TimezoneError {
    /// The connection is not running in UTC.
    #[error(
        "connection timezone is {}, expected UTC; this could lead to timezone-related security vulnerabilities",
        .session_timezone.as_deref().unwrap_or("<unset>")
    )]
    Unsafe { session_timezone: Option<String> },
    #[error(transparent)]
    Database(#[from] DbError),
}

/// Server-level timezone, or a sentinel when the role may not read it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerTimezone {
    Known(String),
    Unknown,
}

impl fmt::Display for ServerTimezone {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Known(tz) => f.write_str(tz),
            Self::Unknown => f.write_str(UNKNOWN_SERVER_TIMEZONE),
        }
    }
}

/// Read-only timezone diagnostics against an open session.
#[async_trait::async_trait]
pub trait TimezoneProbe: Session {
    async fn session_timezone(&mut self) -> Result<Option<String>, DbError>;

    /// Only an insufficient-privilege failure maps to `ServerTimezone::Unknown`.
    async fn server_timezone(&mut self) -> Result<ServerTimezone, DbError>;

    /// `now()` as reported natively, and converted to UTC.
    async fn current_timestamps(&mut self) -> Result<(OffsetDateTime, PrimitiveDateTime), DbError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimezoneReport {
    pub session_timezone: Option<String>,
    pub server_timezone: ServerTimezone,
    pub current_timestamp: OffsetDateTime,
    pub current_timestamp_utc: PrimitiveDateTime,
    pub timezone_safe: bool,
    /// Whether the per-connection UTC directive took effect.
    pub connection_override_working: bool,
    pub checked_at: OffsetDateTime,
}

impl TimezoneReport {
    #[must_use]
    pub fn verdict(&self) -> &'static str {
        if self.timezone_safe { "SECURE" } else { "VULNERABLE" }
    }
}

#[must_use]
pub fn is_utc(timezone: Option<&str>) -> bool {
    timezone.is_some_and(|tz| tz.trim().eq_ignore_ascii_case(EXPECTED_TIMEZONE))
}

/// Resolve a timed diagnostic. On expiry the probe is discarded so nothing
/// else queues behind the abandoned statement.
///
/// # Errors
///
/// Returns `DbError::Timeout` when `outcome` elapsed, otherwise the query's
/// own error.
pub fn bounded<P, T>(
    probe: &mut P,
    operation: &'static str,
    limit: Duration,
    outcome: Result<Result<T, DbError>, Elapsed>,
) -> Result<T, DbError>
where
    P: Session + ?Sized,
{
    outcome.unwrap_or_else(|_| {
        error!(operation, after = ?limit, "diagnostic query timed out");
        probe.discard();
        Err(DbError::Timeout { operation, after: limit })
    })
}

/// Collect the diagnostics without judging them.
///
/// # Errors
///
/// Returns `DbError` if a diagnostic query fails or exceeds `limit`.
pub async fn inspect<P>(probe: &mut P, limit: Duration) -> Result<TimezoneReport, DbError>
where
    P: TimezoneProbe + ?Sized,
{
    let outcome = timeout(limit, probe.session_timezone()).await;
    let session_timezone = bounded(probe, "session timezone query", limit, outcome)?;
    let outcome = timeout(limit, probe.server_timezone()).await;
    let server_timezone = bounded(probe, "server timezone query", limit, outcome)?;
    let outcome = timeout(limit, probe.current_timestamps()).await;
    let (current_timestamp, current_timestamp_utc) = bounded(probe, "current timestamp query", limit, outcome)?;

    let safe = is_utc(session_timezone.as_deref());
    Ok(TimezoneReport {
        session_timezone,
        server_timezone,
        current_timestamp,
        current_timestamp_utc,
        timezone_safe: safe,
        connection_override_working: safe,
        checked_at: utc::now(),
    })
}

/// Reject a report whose session timezone is not UTC.
///
/// # Errors
///
/// Returns `TimezoneError::Unsafe` naming the offending timezone.
pub fn check(report: &TimezoneReport) -> Result<(), TimezoneError> {
    if report.timezone_safe {
        Ok(())
    } else {
        Err(TimezoneError::Unsafe { session_timezone: report.session_timezone.clone() })
    }
}

/// Inspect and require UTC.
///
/// # Errors
///
/// Returns `TimezoneError::Unsafe` if the session timezone is absent or not
/// UTC, or `TimezoneError::Database` if a diagnostic fails.
pub async fn verify<P>(probe: &mut P, limit: Duration) -> Result<TimezoneReport, TimezoneError>
where
    P: TimezoneProbe + ?Sized,
{
    let outcome = match inspect(probe, limit).await {
        Ok(report) => check(&report).map(|()| report),
        Err(err) => Err(err.into()),
    };
    match &outcome {
        Ok(report) => info!(session_timezone = ?report.session_timezone, "timezone verification passed"),
        Err(err) => error!(error = %err, "timezone verification failed"),
    }
    outcome
}

/// Log every field of `report` plus the verdict.
pub fn log_audit(report: &TimezoneReport) {
    info!("=== TIMEZONE SECURITY AUDIT ===");
    info!("Session Timezone: {}", report.session_timezone.as_deref().unwrap_or("<unset>"));
    info!("Server Timezone: {}", report.server_timezone);
    info!("Current Timestamp: {}", report.current_timestamp);
    info!("Current Timestamp (UTC): {}", report.current_timestamp_utc);
    info!("Connection Override Working: {}", report.connection_override_working);
    info!("Checked At: {}", utc::normalize(Some(report.checked_at)));
    info!("Security Status: {}", report.verdict());
    info!("===============================");
}

/// Inspect and log the audit report. Failures are logged, not returned.
pub async fn audit<P>(probe: &mut P, limit: Duration) -> Option<TimezoneReport>
where
    P: TimezoneProbe + ?Sized,
{
    match inspect(probe, limit).await {
        Ok(report) => {
            log_audit(&report);
            Some(report)
        }
        Err(err) => {
            error!(error = %err, "timezone audit logging failed");
            None
        }
    }
}

/// Startup gate: inspect, log the audit, and fail on anything but UTC.
///
/// # Errors
///
/// Returns `TimezoneError` on an unsafe timezone or a failed diagnostic;
/// both are logged at critical severity.
pub async fn startup_check<P>(probe: &mut P, limit: Duration) -> Result<TimezoneReport, TimezoneError>
where
    P: TimezoneProbe + ?Sized,
{
    let report = match inspect(probe, limit).await {
        Ok(report) => report,
        Err(err) => {
            error!(severity = "critical", error = %err, "timezone security check FAILED during startup");
            return Err(err.into());
        }
    };
    log_audit(&report);

    if let Err(err) = check(&report) {
        error!(
            severity = "critical",
            error = %err,
            "application startup failed: unsafe timezone configuration detected, check database connection settings"
        );
        return Err(err);
    }

    info!("timezone security check passed; application startup safe");
    Ok(report)
}

fn is_insufficient_privilege(err: &sqlx::Error) -> bool {
    err.as_database_error()
        .and_then(|db_err| db_err.code())
        .is_some_and(|code| code == INSUFFICIENT_PRIVILEGE)
}

async fn run(conn: &mut PgConnection, statement: &str) -> Result<(), DbError> {
    sqlx::query(statement).execute(conn).await?;
    Ok(())
}

#[async_trait::async_trait]
impl TimezoneProbe for PgSession {
    async fn session_timezone(&mut self) -> Result<Option<String>, DbError> {
        let conn = self.connection().await?;
        let tz = sqlx::query_scalar::<_, Option<String>>("SELECT current_setting('timezone')")
            .fetch_one(conn)
            .await?;
        Ok(tz)
    }

    async fn server_timezone(&mut self) -> Result<ServerTimezone, DbError> {
        let conn = self.connection().await?;
        // A failed statement aborts the enclosing transaction; the savepoint
        // keeps the session usable after a privilege error.
        run(&mut *conn, &format!("SAVEPOINT {PROBE_SAVEPOINT}")).await?;
        match sqlx::query_scalar::<_, String>("SHOW timezone").fetch_one(&mut *conn).await {
            Ok(tz) => {
                run(&mut *conn, &format!("RELEASE SAVEPOINT {PROBE_SAVEPOINT}")).await?;
                Ok(ServerTimezone::Known(tz))
            }
            Err(err) if is_insufficient_privilege(&err) => {
                run(&mut *conn, &format!("ROLLBACK TO SAVEPOINT {PROBE_SAVEPOINT}")).await?;
                Ok(ServerTimezone::Unknown)
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn current_timestamps(&mut self) -> Result<(OffsetDateTime, PrimitiveDateTime), DbError> {
        let conn = self.connection().await?;
        let row = sqlx::query_as::<_, (OffsetDateTime, PrimitiveDateTime)>(
            "SELECT now(), now() AT TIME ZONE 'UTC'",
        )
        .fetch_one(conn)
        .await?;
        Ok(row)
    }
}

#[cfg(test)]
#[path = "timezone_test.rs"]
mod tests;
