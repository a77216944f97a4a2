//! UTC timestamp normalization.
//!
//! Every timestamp leaving this module is offset-aware, in UTC (except
//! [`add_delta`], which keeps the base offset) and truncated to whole seconds.

use time::{Duration, OffsetDateTime, PrimitiveDateTime, Time, UtcOffset};

/// Timestamps that can be interpreted as a UTC instant.
pub trait IntoUtc {
    fn into_utc(self) -> OffsetDateTime;
}

impl IntoUtc for OffsetDateTime {
    fn into_utc(self) -> OffsetDateTime {
        self.to_offset(UtcOffset::UTC)
    }
}

/// A timestamp without an offset is taken to already be UTC.
impl IntoUtc for PrimitiveDateTime {
    fn into_utc(self) -> OffsetDateTime {
        self.assume_utc()
    }
}

fn truncate(ts: OffsetDateTime) -> OffsetDateTime {
    ts - Duration::nanoseconds(i64::from(ts.nanosecond()))
}

/// Current UTC time with the sub-second part dropped.
#[must_use]
pub fn now() -> OffsetDateTime {
    truncate(OffsetDateTime::now_utc())
}

/// Convert `ts` to UTC and truncate to seconds; `None` yields [`now`].
#[must_use]
pub fn normalize<T: IntoUtc>(ts: Option<T>) -> OffsetDateTime {
    ts.map_or_else(now, |ts| truncate(ts.into_utc()))
}

/// UTC timestamp for a Unix epoch value in seconds.
///
/// Fractional seconds are floored. Returns `None` for NaN, infinities and
/// values outside the representable date range.
#[must_use]
#[allow(clippy::cast_possible_truncation, clippy::cast_precision_loss)]
pub fn from_epoch(seconds: f64) -> Option<OffsetDateTime> {
    if !seconds.is_finite() {
        return None;
    }
    let whole = seconds.floor();
    if whole < i64::MIN as f64 || whole > i64::MAX as f64 {
        return None;
    }
    OffsetDateTime::from_unix_timestamp(whole as i64).ok()
}

/// `base + delta`, truncated to seconds. Saturates at the supported range.
#[must_use]
pub fn add_delta(base: OffsetDateTime, delta: Duration) -> OffsetDateTime {
    truncate(base.saturating_add(delta))
}

/// Midnight UTC of the normalized date; `None` uses today.
#[must_use]
pub fn date_only<T: IntoUtc>(ts: Option<T>) -> OffsetDateTime {
    normalize(ts).replace_time(Time::MIDNIGHT)
}

#[cfg(test)]
#[path = "utc_test.rs"]
mod tests;
