//! Idempotent role seeding.
//!
//! Each entry is checked, then inserted only if its rank is absent; the batch
//! is committed once at the end. A rerun against a fully seeded table is a
//! no-op, and a batch that fails midway leaves nothing committed because the
//! enclosing scope rolls it back. Existing rows are never updated, so the
//! first write for a rank wins.

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::{debug, info};

use crate::db::{DbError, PgSession, Session};

/// File name looked up under the configured seed directory.
pub const ROLE_SEED_FILE: &str = "role_seed.json";

#[derive(Debug, thiserror::Error)]
pub enum SeedError {
    #[error("failed to read seed file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("seed data is not valid JSON: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid rank {0:?}: expected an integer")]
    InvalidRank(String),
    #[error("invalid seed entry for rank {rank}: {reason}")]
    InvalidEntry { rank: String, reason: &'static str },
}

/// One row of `user_roles`.
#[derive(Debug, Clone, PartialEq)]
pub struct RoleRecord {
    pub rank: i32,
    pub role: String,
    pub permissions: Value,
}

/// Role records in document order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RoleSeed {
    records: Vec<RoleRecord>,
}

impl RoleSeed {
    #[must_use]
    pub fn new(records: Vec<RoleRecord>) -> Self {
        Self { records }
    }

    /// Parse `{"<rank>": ["<role>", <permissions>], ...}`.
    ///
    /// # Errors
    ///
    /// Returns `SeedError::Parse` for malformed JSON or a non-object document,
    /// `InvalidRank` for a key that is not an integer, and `InvalidEntry` for
    /// a value that is not a `[name, permissions]` pair.
    pub fn from_json_str(raw: &str) -> Result<Self, SeedError> {
        let document: serde_json::Map<String, Value> = serde_json::from_str(raw)?;
        let records = document
            .into_iter()
            .map(|(key, value)| parse_entry(&key, value))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { records })
    }

    #[must_use]
    pub fn records(&self) -> &[RoleRecord] {
        &self.records
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Read and parse a seed file.
///
/// # Errors
///
/// Returns `SeedError::Io` if the file cannot be read, otherwise the errors of
/// [`RoleSeed::from_json_str`].
pub fn load_seed_file(path: &Path) -> Result<RoleSeed, SeedError> {
    let raw = std::fs::read_to_string(path).map_err(|source| SeedError::Io { path: path.to_path_buf(), source })?;
    let seed = RoleSeed::from_json_str(&raw)?;
    debug!(path = %path.display(), roles = seed.len(), "loaded seed file");
    Ok(seed)
}

/// Normalize a rank key to an integer.
///
/// # Errors
///
/// Returns `SeedError::InvalidRank` when `raw` is not an `i32`.
pub fn parse_rank(raw: &str) -> Result<i32, SeedError> {
    raw.trim().parse().map_err(|_| SeedError::InvalidRank(raw.to_owned()))
}

fn parse_entry(key: &str, value: Value) -> Result<RoleRecord, SeedError> {
    let rank = parse_rank(key)?;
    let invalid = |reason| SeedError::InvalidEntry { rank: key.to_owned(), reason };

    let Value::Array(pair) = value else {
        return Err(invalid("expected a [name, permissions] array"));
    };
    let [role, permissions]: [Value; 2] = pair
        .try_into()
        .map_err(|_| invalid("expected exactly two elements"))?;
    let Value::String(role) = role else {
        return Err(invalid("role name must be a string"));
    };
    Ok(RoleRecord { rank, role, permissions })
}

/// Row-level access to `user_roles`.
#[async_trait::async_trait]
pub trait RoleStore: Session {
    async fn rank_exists(&mut self, rank: i32) -> Result<bool, DbError>;

    /// Insert unless the rank already exists. Returns whether a row was written.
    async fn insert_role(&mut self, role: &RoleRecord) -> Result<bool, DbError>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SeedSummary {
    pub inserted: usize,
    pub skipped: usize,
}

/// Insert every record whose rank is absent, then commit once.
///
/// Errors are not caught here; the enclosing scope rolls back the batch.
///
/// # Errors
///
/// Returns `DbError` from any lookup, insert or the final commit.
pub async fn seed_roles<S>(session: &mut S, seed: &RoleSeed) -> Result<SeedSummary, DbError>
where
    S: RoleStore + ?Sized,
{
    let mut summary = SeedSummary::default();

    for record in seed.records() {
        if session.rank_exists(record.rank).await? {
            info!(rank = record.rank, role = %record.role, "role already exists, skipping");
            summary.skipped += 1;
            continue;
        }
        if session.insert_role(record).await? {
            debug!(rank = record.rank, role = %record.role, "inserted role");
            summary.inserted += 1;
        } else {
            info!(rank = record.rank, role = %record.role, "role inserted concurrently, skipping");
            summary.skipped += 1;
        }
    }

    if summary.inserted > 0 {
        session.commit().await?;
        info!("Seeded {} new role(s)", summary.inserted);
    } else {
        info!("No new roles inserted. All roles already exist.");
    }
    Ok(summary)
}

#[async_trait::async_trait]
impl RoleStore for PgSession {
    async fn rank_exists(&mut self, rank: i32) -> Result<bool, DbError> {
        let conn = self.connection().await?;
        let row = sqlx::query_scalar::<_, i32>("SELECT 1 FROM user_roles WHERE rank = $1")
            .bind(rank)
            .fetch_optional(conn)
            .await?;
        Ok(row.is_some())
    }

    async fn insert_role(&mut self, role: &RoleRecord) -> Result<bool, DbError> {
        let conn = self.connection().await?;
        let result = sqlx::query(
            "INSERT INTO user_roles (rank, role, permissions) VALUES ($1, $2, $3) \
             ON CONFLICT (rank) DO NOTHING",
        )
        .bind(role.rank)
        .bind(&role.role)
        .bind(sqlx::types::Json(&role.permissions))
        .execute(conn)
        .await?;
        Ok(result.rows_affected() == 1)
    }
}

#[cfg(test)]
#[path = "seed_test.rs"]
mod tests;
