use std::collections::HashMap;
use std::sync::RwLock;
use std::time::{Duration, Instant};

use tracing::{debug, error};

use crate::records::SharedRecordStore;
use crate::telemetry::counters;

use super::{ProfileConfigError, ProfileSettings};

struct CachedSettings {
    settings: ProfileSettings,
    loaded_at: Instant,
}

/// Memoised profile settings with optional TTL and explicit invalidation.
pub struct ProfileConfigCache {
    records: SharedRecordStore,
    ttl: Option<Duration>,
    entries: RwLock<HashMap<String, CachedSettings>>,
}

impl ProfileConfigCache {
    /// Create a cache. `ttl = None` memoises for the process lifetime.
    pub fn new(records: SharedRecordStore, ttl: Option<Duration>) -> Self {
        Self {
            records,
            ttl,
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Settings for a profile, loading them on a miss or after TTL expiry.
    pub async fn settings(&self, profile_id: &str) -> Result<ProfileSettings, ProfileConfigError> {
        if let Some(settings) = self.cached(profile_id) {
            return Ok(settings);
        }
        self.reload(profile_id).await
    }

    /// Read the profile row regardless of the memoised value.
    ///
    /// Valid settings replace the memoised entry. An invalid row drops it, so
    /// the profile fails closed until corrected.
    pub async fn reload(&self, profile_id: &str) -> Result<ProfileSettings, ProfileConfigError> {
        let row = self.records.profile_config(profile_id).await?;
        let settings = match ProfileSettings::from_row(&row) {
            Ok(settings) => settings,
            Err(e) => {
                error!(
                    profile_id,
                    throughput_limit = row.throughput_limit,
                    throughput_interval_secs = row.throughput_interval_secs,
                    daily_contact_limit = row.daily_contact_limit,
                    error = %e,
                    "invalid profile configuration, refusing to serve"
                );
                counters::profile_config_error(profile_id);
                self.invalidate(profile_id);
                return Err(e);
            }
        };

        debug!(
            profile_id,
            throughput_limit = settings.throughput_limit,
            interval_minutes = settings.throughput_interval_minutes,
            daily_contact_limit = settings.daily_contact_limit,
            "profile settings loaded"
        );

        self.seed(settings.clone());
        Ok(settings)
    }

    /// Max segments per throughput interval.
    pub async fn throughput_limit(&self, profile_id: &str) -> Result<u32, ProfileConfigError> {
        Ok(self.settings(profile_id).await?.throughput_limit)
    }

    /// Throughput interval in whole minutes.
    pub async fn throughput_interval_minutes(
        &self,
        profile_id: &str,
    ) -> Result<u32, ProfileConfigError> {
        Ok(self.settings(profile_id).await?.throughput_interval_minutes)
    }

    /// Max distinct recipients per number per day.
    pub async fn daily_contact_limit(&self, profile_id: &str) -> Result<u32, ProfileConfigError> {
        Ok(self.settings(profile_id).await?.daily_contact_limit)
    }

    /// Store already-validated settings (hydration config pass).
    pub fn seed(&self, settings: ProfileSettings) {
        let mut entries = self.entries.write().unwrap();
        entries.insert(
            settings.profile_id.clone(),
            CachedSettings {
                settings,
                loaded_at: Instant::now(),
            },
        );
    }

    /// Drop the memoised settings for one profile.
    pub fn invalidate(&self, profile_id: &str) -> bool {
        let removed = self.entries.write().unwrap().remove(profile_id).is_some();
        if removed {
            debug!(profile_id, "profile settings invalidated");
        }
        removed
    }

    /// Drop all memoised settings.
    pub fn invalidate_all(&self) {
        let mut entries = self.entries.write().unwrap();
        debug!(profiles = entries.len(), "all profile settings invalidated");
        entries.clear();
    }

    /// Number of memoised profiles.
    pub fn len(&self) -> usize {
        self.entries.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn cached(&self, profile_id: &str) -> Option<ProfileSettings> {
        let entries = self.entries.read().unwrap();
        let entry = entries.get(profile_id)?;
        if let Some(ttl) = self.ttl {
            if entry.loaded_at.elapsed() >= ttl {
                return None;
            }
        }
        Some(entry.settings.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::{
        MemoryRecordStore, ProfileRow, RecordError, RecordStore, SegmentRow, UsageRow,
    };
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    /// Record store that counts profile loads.
    struct CountingStore {
        inner: MemoryRecordStore,
        loads: AtomicUsize,
    }

    #[async_trait]
    impl RecordStore for CountingStore {
        async fn profile_config(&self, profile_id: &str) -> Result<ProfileRow, RecordError> {
            self.loads.fetch_add(1, Ordering::SeqCst);
            self.inner.profile_config(profile_id).await
        }

        async fn todays_usage(
            &self,
            profile_id: &str,
            since: DateTime<Utc>,
        ) -> Result<Vec<UsageRow>, RecordError> {
            self.inner.todays_usage(profile_id, since).await
        }

        async fn recent_segments(
            &self,
            profile_id: &str,
            since: DateTime<Utc>,
        ) -> Result<Vec<SegmentRow>, RecordError> {
            self.inner.recent_segments(profile_id, since).await
        }

        async fn queued_count(&self, phone_number: &str) -> Result<u64, RecordError> {
            self.inner.queued_count(phone_number).await
        }

        async fn sent_since(
            &self,
            phone_number: &str,
            since: DateTime<Utc>,
        ) -> Result<u64, RecordError> {
            self.inner.sent_since(phone_number, since).await
        }

        fn name(&self) -> &'static str {
            "counting"
        }
    }

    fn profile(id: &str, interval_secs: f64, daily: i64) -> ProfileRow {
        ProfileRow {
            id: id.to_string(),
            throughput_limit: 12,
            throughput_interval_secs: interval_secs,
            daily_contact_limit: daily,
        }
    }

    fn counting_store() -> Arc<CountingStore> {
        let inner = MemoryRecordStore::new();
        inner.insert_profile(profile("p1", 60.0, 200));
        inner.insert_profile(profile("bad", 90.0, 200));
        Arc::new(CountingStore {
            inner,
            loads: AtomicUsize::new(0),
        })
    }

    #[tokio::test]
    async fn test_settings_memoised() {
        let store = counting_store();
        let cache = ProfileConfigCache::new(store.clone(), None);

        assert_eq!(cache.throughput_limit("p1").await.unwrap(), 12);
        assert_eq!(cache.throughput_interval_minutes("p1").await.unwrap(), 1);
        assert_eq!(cache.daily_contact_limit("p1").await.unwrap(), 200);
        assert_eq!(store.loads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_invalidate_reloads() {
        let store = counting_store();
        let cache = ProfileConfigCache::new(store.clone(), None);

        assert_eq!(cache.daily_contact_limit("p1").await.unwrap(), 200);
        store.inner.insert_profile(profile("p1", 60.0, 50));

        // Stale until invalidated
        assert_eq!(cache.daily_contact_limit("p1").await.unwrap(), 200);

        assert!(cache.invalidate("p1"));
        assert_eq!(cache.daily_contact_limit("p1").await.unwrap(), 50);
        assert_eq!(store.loads.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_ttl_expiry_reloads() {
        let store = counting_store();
        let cache = ProfileConfigCache::new(store.clone(), Some(Duration::from_millis(20)));

        cache.settings("p1").await.unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;
        cache.settings("p1").await.unwrap();

        assert_eq!(store.loads.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_invalid_config_not_cached() {
        let store = counting_store();
        let cache = ProfileConfigCache::new(store.clone(), None);

        let err = cache.settings("bad").await.unwrap_err();
        assert!(err.is_fatal());
        assert!(cache.settings("bad").await.is_err());
        assert_eq!(store.loads.load(Ordering::SeqCst), 2);
        assert!(cache.is_empty());

        // Corrected row is served after the fix
        store.inner.insert_profile(profile("bad", 120.0, 200));
        assert_eq!(cache.throughput_interval_minutes("bad").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_reload_bypasses_memo_and_fails_closed() {
        let store = counting_store();
        let cache = ProfileConfigCache::new(store.clone(), None);

        assert_eq!(cache.daily_contact_limit("p1").await.unwrap(), 200);
        store.inner.insert_profile(profile("p1", 60.0, 75));
        assert_eq!(cache.reload("p1").await.unwrap().daily_contact_limit, 75);
        assert_eq!(cache.daily_contact_limit("p1").await.unwrap(), 75);

        // A row that turns invalid evicts the memoised settings
        store.inner.insert_profile(profile("p1", 30.0, 75));
        assert!(cache.reload("p1").await.is_err());
        assert!(cache.settings("p1").await.is_err());
        assert_eq!(store.loads.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_seed_skips_load() {
        let store = counting_store();
        let cache = ProfileConfigCache::new(store.clone(), None);

        cache.seed(ProfileSettings {
            profile_id: "p1".to_string(),
            throughput_limit: 30,
            throughput_interval_minutes: 1,
            daily_contact_limit: 5,
        });

        assert_eq!(cache.throughput_limit("p1").await.unwrap(), 30);
        assert_eq!(store.loads.load(Ordering::SeqCst), 0);

        cache.invalidate_all();
        assert!(cache.is_empty());
    }
}
