//! Cold-start cache builder.
//!
//! A hydration run reads everything the selector needs for one profile and
//! writes it to the cache as one [`HydrationBatch`]:
//!
//! - **Usage pass**: distinct recipients per eligible number since the start
//!   of the local day
//! - **Config pass**: the profile's rate-limit settings, re-read and seeded
//!   into the [`ProfileConfigCache`]
//! - **Recent pass**: segments per number inside the throughput window
//!
//! The usage pass runs concurrently with the config pass. The recent pass
//! needs the throughput interval, so it follows the config read on the same
//! branch. Nothing is written unless all three succeed.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, TimeZone, Utc};
use chrono_tz::Tz;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::cache::{CacheError, HydrationBatch, LocationSnapshot, SharedCache};
use crate::profile::{ProfileConfigCache, ProfileConfigError, ProfileSettings};
use crate::records::{RecordError, SegmentRow, SharedRecordStore, UsageRow};
use crate::telemetry::counters;

/// Hydration error.
#[derive(Debug, Error)]
pub enum HydrateError {
    #[error("profile configuration: {0}")]
    Config(#[from] ProfileConfigError),

    #[error("record store: {0}")]
    Record(#[from] RecordError),

    #[error("cache: {0}")]
    Cache(#[from] CacheError),
}

/// Summary of one hydration run.
#[derive(Debug, Clone, PartialEq)]
pub struct HydrationReport {
    pub profile_id: String,
    /// Sending locations written
    pub locations: usize,
    /// Numbers in the usage index
    pub numbers: usize,
    /// Segments inside the throughput window, all locations
    pub recent_segments: u64,
    /// Start of the local day the usage pass counted from
    pub day_start: DateTime<Utc>,
    pub duration: Duration,
}

/// Start of the local day containing `now`, in UTC.
///
/// When local midnight does not exist (a DST gap at midnight) the day starts
/// at the first valid local instant after it.
pub fn local_day_start(tz: Tz, now: DateTime<Utc>) -> DateTime<Utc> {
    let midnight = now.with_timezone(&tz).date_naive().and_time(chrono::NaiveTime::default());

    (0..=180)
        .find_map(|minutes| {
            tz.from_local_datetime(&(midnight + chrono::Duration::minutes(minutes)))
                .earliest()
        })
        .map(|local| local.with_timezone(&Utc))
        .unwrap_or(now)
}

/// Builds and applies hydration batches.
pub struct Hydrator {
    records: SharedRecordStore,
    cache: SharedCache,
    profiles: Arc<ProfileConfigCache>,
    tz: Tz,
}

impl Hydrator {
    pub fn new(
        records: SharedRecordStore,
        cache: SharedCache,
        profiles: Arc<ProfileConfigCache>,
        tz: Tz,
    ) -> Self {
        Self {
            records,
            cache,
            profiles,
            tz,
        }
    }

    /// Hydrate a profile as of now.
    pub async fn hydrate(&self, profile_id: &str) -> Result<HydrationReport, HydrateError> {
        self.hydrate_at(profile_id, Utc::now()).await
    }

    /// Hydrate a profile as of `now`.
    #[instrument(skip(self), fields(tz = %self.tz))]
    pub async fn hydrate_at(
        &self,
        profile_id: &str,
        now: DateTime<Utc>,
    ) -> Result<HydrationReport, HydrateError> {
        let started = Instant::now();
        let day_start = local_day_start(self.tz, now);

        let result = self.run(profile_id, now, day_start).await;
        let duration = started.elapsed();

        match result {
            Ok((batch, recent_total)) => {
                counters::hydration(profile_id, "ok", duration.as_secs_f64());
                counters::hydrated_numbers(profile_id, batch.number_count());

                let report = HydrationReport {
                    profile_id: profile_id.to_string(),
                    locations: batch.locations.len(),
                    numbers: batch.number_count(),
                    recent_segments: recent_total,
                    day_start,
                    duration,
                };

                info!(
                    profile_id,
                    backend = self.cache.name(),
                    locations = report.locations,
                    numbers = report.numbers,
                    recent_segments = report.recent_segments,
                    %day_start,
                    duration_ms = duration.as_millis() as u64,
                    "profile hydrated"
                );
                Ok(report)
            }
            Err(e) => {
                counters::hydration(profile_id, "error", duration.as_secs_f64());
                warn!(profile_id, error = %e, "hydration failed, cache left unchanged");
                Err(e)
            }
        }
    }

    async fn run(
        &self,
        profile_id: &str,
        now: DateTime<Utc>,
        day_start: DateTime<Utc>,
    ) -> Result<(HydrationBatch, u64), HydrateError> {
        let usage_pass = async {
            self.records
                .todays_usage(profile_id, day_start)
                .await
                .map_err(HydrateError::from)
        };

        let config_and_recent_pass = async {
            let settings = self.profiles.reload(profile_id).await?;
            let window_start = now - settings.throughput_window();
            let segments = self
                .records
                .recent_segments(profile_id, window_start)
                .await?;
            Ok::<_, HydrateError>((settings, segments))
        };

        let (usage, (settings, segments)) = tokio::try_join!(usage_pass, config_and_recent_pass)?;

        let (batch, recent_total) = build_batch(settings, usage, segments, now);
        self.cache.apply_hydration(&batch)?;

        for (location_id, snapshot) in &batch.locations {
            let total: u64 = snapshot.recent_segments.values().sum();
            counters::recent_segments(profile_id, location_id, total);
            debug!(
                profile_id,
                location_id = %location_id,
                numbers = snapshot.usage.len(),
                recent_segments = total,
                "location hydrated"
            );
        }

        Ok((batch, recent_total))
    }
}

/// Merge pass outputs into one batch. Returns the batch and total segments.
fn build_batch(
    settings: ProfileSettings,
    usage: Vec<UsageRow>,
    segments: Vec<SegmentRow>,
    now: DateTime<Utc>,
) -> (HydrationBatch, u64) {
    let mut locations: BTreeMap<String, LocationSnapshot> = BTreeMap::new();

    for row in usage {
        locations
            .entry(row.location_id)
            .or_default()
            .usage
            .insert(row.phone_number, row.recipients);
    }

    let mut recent_total = 0;
    for row in segments {
        recent_total += row.segments;
        locations
            .entry(row.location_id)
            .or_default()
            .recent_segments
            .insert(row.phone_number, row.segments);
    }

    let mut batch = HydrationBatch::new(settings, now.timestamp_millis());
    batch.locations = locations;
    (batch, recent_total)
}
