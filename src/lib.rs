//! Database bootstrap: a UTC-pinned Postgres pool, a timezone security gate,
//! and idempotent seeding of baseline role records.

pub mod bootstrap;
pub mod config;
pub mod db;
pub mod logging;
pub mod seed;
pub mod timezone;
pub mod utc;

#[cfg(test)]
pub mod test_helpers;
