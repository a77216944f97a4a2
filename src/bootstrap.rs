//! Startup flows wired from the CLI.
//!
//! Each flow runs in its own transactional scope against a `SessionSource`,
//! so the Postgres pool and the in-memory test double go through the same
//! commit/rollback/release path.

use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::info;

use crate::config::ConfigError;
use crate::db::{DbError, SessionSource, transaction};
use crate::logging::LoggingError;
use crate::seed::{self, RoleSeed, RoleStore, SeedError, SeedSummary};
use crate::timezone::{self, TimezoneError, TimezoneProbe, TimezoneReport};

#[derive(Debug, thiserror::Error)]
pub enum BootstrapError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("logging setup failed: {0}")]
    Logging(#[from] LoggingError),
    #[error("database error: {0}")]
    Database(#[from] DbError),
    #[error("timezone security check failed: {0}")]
    Timezone(#[from] TimezoneError),
    #[error("seed data error: {0}")]
    Seed(#[from] SeedError),
}

/// Seed file to load: `file` if given, otherwise the default under `seed_dir`.
#[must_use]
pub fn seed_path(seed_dir: &Path, file: Option<&Path>) -> PathBuf {
    file.map_or_else(|| seed_dir.join(seed::ROLE_SEED_FILE), Path::to_path_buf)
}

/// Run the timezone startup gate, then seed roles, in one scope.
///
/// # Errors
///
/// Returns `BootstrapError::Timezone` if the connection is not UTC (nothing is
/// written), or `BootstrapError::Database` if seeding fails (the batch is
/// rolled back).
pub async fn seed_database<Src>(
    source: &Src,
    seed: &RoleSeed,
    query_timeout: Duration,
) -> Result<SeedSummary, BootstrapError>
where
    Src: SessionSource + ?Sized,
    Src::Session: TimezoneProbe + RoleStore,
{
    info!(roles = seed.len(), "starting database seeding");
    let summary = transaction(source, async |session: &mut Src::Session| {
        timezone::startup_check(session, query_timeout).await?;
        Ok::<_, BootstrapError>(seed::seed_roles(session, seed).await?)
    })
    .await?;
    info!(inserted = summary.inserted, skipped = summary.skipped, "database seeding complete");
    Ok(summary)
}

/// Run only the timezone startup gate.
///
/// # Errors
///
/// Returns `BootstrapError::Timezone` on an unsafe timezone or a failed
/// diagnostic, or `BootstrapError::Database` if no session is available.
pub async fn verify_timezone<Src>(source: &Src, query_timeout: Duration) -> Result<TimezoneReport, BootstrapError>
where
    Src: SessionSource + ?Sized,
    Src::Session: TimezoneProbe,
{
    transaction(source, async |session: &mut Src::Session| {
        Ok::<_, BootstrapError>(timezone::startup_check(session, query_timeout).await?)
    })
    .await
}

/// Log the timezone audit report. An unsafe timezone is reported, not raised.
///
/// # Errors
///
/// Returns `BootstrapError::Database` only if no session is available.
pub async fn audit_timezone<Src>(
    source: &Src,
    query_timeout: Duration,
) -> Result<Option<TimezoneReport>, BootstrapError>
where
    Src: SessionSource + ?Sized,
    Src::Session: TimezoneProbe,
{
    transaction(source, async |session: &mut Src::Session| {
        Ok::<_, BootstrapError>(timezone::audit(session, query_timeout).await)
    })
    .await
}

#[cfg(test)]
#[path = "bootstrap_test.rs"]
mod tests;
