//! Per-profile rate-limit configuration snapshot.
//!
//! Settings are loaded lazily from the record store and memoised for the
//! lifetime of the process. With no TTL configured a changed profile row is
//! only picked up after [`ProfileConfigCache::invalidate`] or a restart; the
//! optional TTL bounds that staleness window.
//!
//! Invalid rows fail closed: nothing is cached and every lookup for the
//! profile errors until the row is corrected.

mod cache;

pub use cache::ProfileConfigCache;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::records::{ProfileRow, RecordError};

/// Milliseconds per minute.
const MS_PER_MINUTE: i64 = 60_000;

/// Profile configuration error.
#[derive(Debug, Error)]
pub enum ProfileConfigError {
    /// Throughput interval is not a positive whole number of minutes.
    #[error("profile {profile_id}: throughput interval of {raw_secs}s is not a whole number of minutes")]
    InvalidInterval { profile_id: String, raw_secs: f64 },

    /// Throughput limit is zero, negative or out of range.
    #[error("profile {profile_id}: invalid throughput limit {raw}")]
    InvalidThroughputLimit { profile_id: String, raw: i64 },

    /// Daily contact limit is negative or out of range.
    #[error("profile {profile_id}: invalid daily contact limit {raw}")]
    InvalidDailyContactLimit { profile_id: String, raw: i64 },

    /// The row could not be read.
    #[error(transparent)]
    Record(#[from] RecordError),
}

impl ProfileConfigError {
    /// Errors caused by the stored configuration itself, not by the read.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::Record(_))
    }
}

/// Validated rate-limit settings for one profile.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileSettings {
    pub profile_id: String,
    /// Max message segments per throughput interval
    pub throughput_limit: u32,
    /// Throughput interval in whole minutes
    pub throughput_interval_minutes: u32,
    /// Max distinct recipients per number per local day
    pub daily_contact_limit: u32,
}

impl ProfileSettings {
    /// Validate a raw profile row.
    pub fn from_row(row: &ProfileRow) -> Result<Self, ProfileConfigError> {
        let minutes = row.throughput_interval_secs / 60.0;
        if !minutes.is_finite() || minutes.fract() != 0.0 || minutes < 1.0 || minutes > u32::MAX as f64
        {
            return Err(ProfileConfigError::InvalidInterval {
                profile_id: row.id.clone(),
                raw_secs: row.throughput_interval_secs,
            });
        }

        let throughput_limit = u32::try_from(row.throughput_limit)
            .ok()
            .filter(|limit| *limit > 0)
            .ok_or_else(|| ProfileConfigError::InvalidThroughputLimit {
                profile_id: row.id.clone(),
                raw: row.throughput_limit,
            })?;

        let daily_contact_limit = u32::try_from(row.daily_contact_limit).map_err(|_| {
            ProfileConfigError::InvalidDailyContactLimit {
                profile_id: row.id.clone(),
                raw: row.daily_contact_limit,
            }
        })?;

        Ok(Self {
            profile_id: row.id.clone(),
            throughput_limit,
            throughput_interval_minutes: minutes as u32,
            daily_contact_limit,
        })
    }

    /// Minimum spacing between consecutive sends from one number.
    pub fn increment_per_segment_ms(&self) -> i64 {
        self.throughput_interval_minutes as i64 * MS_PER_MINUTE / self.throughput_limit as i64
    }

    /// The throughput interval as a duration.
    pub fn throughput_window(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.throughput_interval_minutes as i64)
    }
}
