//! Atomic number selection.
//!
//! Selection is a pure read: it never reserves the number it returns, so two
//! callers may receive the same number until a send is recorded for it.

use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{debug, instrument};

use crate::cache::{CacheError, LocationKey, SharedCache};
use crate::profile::{ProfileConfigCache, ProfileConfigError};
use crate::telemetry::counters;

/// Selection error.
#[derive(Debug, Error)]
pub enum SelectError {
    /// The profile's configuration could not be loaded or is invalid.
    #[error("profile configuration: {0}")]
    Config(#[from] ProfileConfigError),

    #[error("cache: {0}")]
    Cache(#[from] CacheError),
}

/// Picks the next number for a (profile, location) pair.
pub struct NumberSelector {
    cache: SharedCache,
    profiles: Arc<ProfileConfigCache>,
}

impl NumberSelector {
    pub fn new(cache: SharedCache, profiles: Arc<ProfileConfigCache>) -> Self {
        Self { cache, profiles }
    }

    /// Least-used number under the daily cap and free to send now.
    ///
    /// `None` means every number is capped or paced out, or the location has
    /// not been hydrated.
    pub async fn select_available_number(
        &self,
        profile_id: &str,
        location_id: &str,
    ) -> Result<Option<String>, SelectError> {
        self.select_available_number_at(profile_id, location_id, Utc::now())
            .await
    }

    #[instrument(skip(self, now), level = "debug")]
    pub async fn select_available_number_at(
        &self,
        profile_id: &str,
        location_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<String>, SelectError> {
        let started = Instant::now();
        let result = self.select(profile_id, location_id, now).await;
        let elapsed = started.elapsed().as_secs_f64();

        let outcome = match &result {
            Ok(Some(_)) => "selected",
            Ok(None) => "exhausted",
            Err(_) => "error",
        };
        counters::selection(profile_id, outcome, elapsed);

        result
    }

    async fn select(
        &self,
        profile_id: &str,
        location_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<String>, SelectError> {
        let settings = self.profiles.settings(profile_id).await?;
        let key = LocationKey::new(profile_id, location_id);

        let number =
            self.cache
                .select_available(&key, settings.daily_contact_limit, now.timestamp_millis())?;

        debug!(
            profile_id,
            location_id,
            daily_contact_limit = settings.daily_contact_limit,
            number = number.as_deref().unwrap_or("-"),
            "selection"
        );
        Ok(number)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{MemoryNumberCache, NumberCache, SendPatch};
    use crate::records::{MemoryRecordStore, ProfileRow};

    fn selector(interval_secs: f64) -> (NumberSelector, Arc<MemoryNumberCache>) {
        let records = Arc::new(MemoryRecordStore::new());
        records.insert_profile(ProfileRow {
            id: "p1".to_string(),
            throughput_limit: 12,
            throughput_interval_secs: interval_secs,
            daily_contact_limit: 2,
        });
        let cache = Arc::new(MemoryNumberCache::new());
        let profiles = Arc::new(ProfileConfigCache::new(records, None));
        (NumberSelector::new(cache.clone(), profiles), cache)
    }

    fn key() -> LocationKey {
        LocationKey::new("p1", "loc-a")
    }

    fn send(cache: &MemoryNumberCache, number: &str, now: DateTime<Utc>) {
        cache
            .record_send(
                &key(),
                number,
                SendPatch {
                    first_contact: true,
                    increment_ms: 5_000,
                    now_ms: now.timestamp_millis(),
                },
            )
            .unwrap();
    }

    #[tokio::test]
    async fn test_least_used_number_selected() {
        let (selector, cache) = selector(60.0);
        cache.seed_usage(&key(), "+15550001", 0).unwrap();
        cache.seed_usage(&key(), "+15550002", 2).unwrap();

        let picked = selector.select_available_number("p1", "loc-a").await.unwrap();
        assert_eq!(picked.as_deref(), Some("+15550001"));
    }

    #[tokio::test]
    async fn test_daily_cap_excludes_numbers() {
        let (selector, cache) = selector(60.0);
        let now = Utc::now();
        cache.seed_usage(&key(), "+15550001", 0).unwrap();

        send(&cache, "+15550001", now - chrono::Duration::minutes(10));
        let picked = selector.select_available_number_at("p1", "loc-a", now).await.unwrap();
        assert_eq!(picked.as_deref(), Some("+15550001"));

        send(&cache, "+15550001", now - chrono::Duration::minutes(9));
        assert!(selector
            .select_available_number_at("p1", "loc-a", now)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_paced_number_skipped_until_due() {
        let (selector, cache) = selector(60.0);
        let t = Utc::now();
        cache.seed_usage(&key(), "+15550001", 0).unwrap();
        cache.seed_usage(&key(), "+15550002", 1).unwrap();

        send(&cache, "+15550001", t);
        // Both now at score 1; +15550001 paced until t + 5s
        let picked = selector
            .select_available_number_at("p1", "loc-a", t + chrono::Duration::seconds(2))
            .await
            .unwrap();
        assert_eq!(picked.as_deref(), Some("+15550002"));

        let picked = selector
            .select_available_number_at("p1", "loc-a", t + chrono::Duration::seconds(5))
            .await
            .unwrap();
        assert_eq!(picked.as_deref(), Some("+15550001"));
    }

    #[tokio::test]
    async fn test_selection_does_not_mutate() {
        let (selector, cache) = selector(60.0);
        cache.seed_usage(&key(), "+15550001", 0).unwrap();

        for _ in 0..3 {
            let picked = selector.select_available_number("p1", "loc-a").await.unwrap();
            assert_eq!(picked.as_deref(), Some("+15550001"));
        }
        assert_eq!(cache.usage(&key()).unwrap(), vec![("+15550001".to_string(), 0)]);
        assert!(cache.pacing(&key()).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unhydrated_location_returns_none() {
        let (selector, _cache) = selector(60.0);
        assert!(selector
            .select_available_number("p1", "loc-z")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_invalid_config_refuses_to_serve() {
        let (selector, cache) = selector(90.0);
        cache.seed_usage(&key(), "+15550001", 0).unwrap();

        let err = selector
            .select_available_number("p1", "loc-a")
            .await
            .unwrap_err();
        assert!(matches!(err, SelectError::Config(ref e) if e.is_fatal()));
    }
}
