//! Event-driven cache maintenance.
//!
//! Changes in the system of record reach the cache as [`CacheEvent`]s on the
//! [`EventBus`]. Each attached profile gets one [`Subscription`]: a task that
//! consumes the bus, keeps events for its profile and patches the cache.
//!
//! ```text
//!   PostgreSQL NOTIFY ──▶ PgNotificationListener ──publish──▶ EventBus
//!                                                              │
//!                          ┌───────────────────────────────────┤
//!                          ▼                                   ▼
//!                  Subscription(p1)                    Subscription(p2)
//!                          │                                   │
//!                          └──────▶ EventSync::handle_event ◀──┘
//!                                           │
//!                                           ▼
//!                                      NumberCache
//! ```
//!
//! A failed event is logged and counted; the subscription keeps running.

mod events;
mod listener;

pub use events::{CacheEvent, EventBus, EventKind};
pub use listener::{decode_notification, PgNotificationListener};

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};
use thiserror::Error;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::cache::{CacheError, LocationKey, SendPatch, SharedCache};
use crate::profile::{ProfileConfigCache, ProfileConfigError};
use crate::records::{RecordError, SharedRecordStore};
use crate::telemetry::counters;

/// Lookback used to seed a newly provisioned number.
const SEED_LOOKBACK_HOURS: i64 = 24;

/// Event sync error.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("profile configuration: {0}")]
    Config(#[from] ProfileConfigError),

    #[error("record store: {0}")]
    Record(#[from] RecordError),

    #[error("cache: {0}")]
    Cache(#[from] CacheError),

    #[error("unknown notification channel: {0}")]
    UnknownChannel(String),

    #[error("malformed {channel} payload: {source}")]
    Decode {
        channel: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("notification listener: {0}")]
    Listener(#[from] sqlx::Error),
}

/// Applies cache events.
pub struct EventSync {
    bus: Arc<EventBus>,
    cache: SharedCache,
    records: SharedRecordStore,
    profiles: Arc<ProfileConfigCache>,
}

impl EventSync {
    pub fn new(
        bus: Arc<EventBus>,
        cache: SharedCache,
        records: SharedRecordStore,
        profiles: Arc<ProfileConfigCache>,
    ) -> Arc<Self> {
        Arc::new(Self {
            bus,
            cache,
            records,
            profiles,
        })
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    /// Apply one event as of now.
    pub async fn handle_event(&self, event: &CacheEvent) -> Result<(), SyncError> {
        self.handle_event_at(event, Utc::now()).await
    }

    /// Apply one event as of `now`.
    pub async fn handle_event_at(
        &self,
        event: &CacheEvent,
        now: DateTime<Utc>,
    ) -> Result<(), SyncError> {
        let profile_id = event.profile_id.as_str();

        match &event.kind {
            EventKind::SendRecorded {
                location_id,
                from_number,
                is_first_contact_today,
            } => {
                let settings = self.profiles.settings(profile_id).await?;
                let key = LocationKey::new(profile_id, location_id.as_str());
                let outcome = self.cache.record_send(
                    &key,
                    from_number,
                    SendPatch {
                        first_contact: *is_first_contact_today,
                        increment_ms: settings.increment_per_segment_ms(),
                        now_ms: now.timestamp_millis(),
                    },
                )?;

                debug!(
                    profile_id,
                    location_id = %location_id,
                    from_number = %from_number,
                    score = outcome.score,
                    next_send_at_ms = outcome.next_send_at_ms,
                    "send recorded"
                );
            }
            EventKind::NumberRequestFulfilled {
                request_id,
                location_id,
                phone_number,
            } => {
                let since = now - Duration::hours(SEED_LOOKBACK_HOURS);
                let (queued, sent) = tokio::try_join!(
                    self.records.queued_count(phone_number),
                    self.records.sent_since(phone_number, since),
                )?;

                let key = LocationKey::new(profile_id, location_id.as_str());
                self.cache.seed_usage(&key, phone_number, queued + sent)?;

                info!(
                    profile_id,
                    request_id = %request_id,
                    location_id = %location_id,
                    phone_number = %phone_number,
                    queued,
                    sent,
                    "provisioned number seeded"
                );
            }
        }

        counters::sync_event(event.kind.name(), "ok");
        Ok(())
    }

    /// Start consuming the bus for one profile.
    ///
    /// The receiver is registered before this returns, so every event
    /// published afterwards reaches the subscription.
    pub fn subscribe(self: &Arc<Self>, profile_id: &str) -> Subscription {
        let mut rx = self.bus.subscribe();
        let (stop_tx, mut stop_rx) = watch::channel(false);
        let sync = self.clone();
        let profile = profile_id.to_string();

        let handle = tokio::spawn(async move {
            debug!(profile_id = %profile, "subscription started");
            loop {
                tokio::select! {
                    biased;
                    _ = stop_rx.changed() => break,
                    received = rx.recv() => match received {
                        Ok(event) if event.profile_id == profile => {
                            if let Err(e) = sync.handle_event(&event).await {
                                counters::sync_event(event.kind.name(), "error");
                                error!(
                                    profile_id = %profile,
                                    event = ?event,
                                    error = %e,
                                    "failed to apply cache event"
                                );
                            }
                        }
                        Ok(_) => {}
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            counters::sync_events_dropped(&profile, skipped);
                            warn!(profile_id = %profile, skipped, "subscription lagged, events dropped");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
            debug!(profile_id = %profile, "subscription stopped");
        });

        Subscription {
            profile_id: profile_id.to_string(),
            stop: stop_tx,
            handle: Some(handle),
        }
    }
}

/// Handle for one profile's event subscription.
///
/// Dropping it stops the task; [`Subscription::unsubscribe`] also waits for
/// the task to finish.
pub struct Subscription {
    profile_id: String,
    stop: watch::Sender<bool>,
    handle: Option<JoinHandle<()>>,
}

impl Subscription {
    pub fn profile_id(&self) -> &str {
        &self.profile_id
    }

    /// Stop the subscription and wait for its task.
    pub async fn unsubscribe(mut self) {
        let _ = self.stop.send(true);
        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle.await {
                warn!(profile_id = %self.profile_id, error = %e, "subscription task failed");
            }
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let _ = self.stop.send(true);
    }
}

/// Per-profile subscription lifecycle.
pub struct SyncRegistry {
    sync: Arc<EventSync>,
    subscriptions: Mutex<HashMap<String, Subscription>>,
}

impl SyncRegistry {
    pub fn new(sync: Arc<EventSync>) -> Self {
        Self {
            sync,
            subscriptions: Mutex::new(HashMap::new()),
        }
    }

    /// Attach a profile. Returns false if it was already attached.
    pub fn attach(&self, profile_id: &str) -> bool {
        let mut subscriptions = self.subscriptions.lock().unwrap();
        if subscriptions.contains_key(profile_id) {
            return false;
        }
        subscriptions.insert(profile_id.to_string(), self.sync.subscribe(profile_id));
        info!(profile_id, "event sync attached");
        true
    }

    /// Detach a profile. Returns false if it was not attached.
    pub fn detach(&self, profile_id: &str) -> bool {
        let removed = self.subscriptions.lock().unwrap().remove(profile_id);
        match removed {
            Some(_) => {
                info!(profile_id, "event sync detached");
                true
            }
            None => false,
        }
    }

    pub fn is_attached(&self, profile_id: &str) -> bool {
        self.subscriptions.lock().unwrap().contains_key(profile_id)
    }

    /// Attached profile IDs, sorted.
    pub fn attached(&self) -> Vec<String> {
        let mut ids: Vec<_> = self.subscriptions.lock().unwrap().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Detach every profile and wait for the tasks to stop.
    pub async fn detach_all(&self) {
        let subscriptions: Vec<_> = self
            .subscriptions
            .lock()
            .unwrap()
            .drain()
            .map(|(_, s)| s)
            .collect();

        let count = subscriptions.len();
        for subscription in subscriptions {
            subscription.unsubscribe().await;
        }
        info!(count, "event sync detached from all profiles");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{MemoryNumberCache, NumberCache};
    use crate::records::{
        MemoryRecordStore, ProfileRow, QueuedMessage, RecordStore, SegmentRow, SendRecord,
        UsageRow,
    };
    use async_trait::async_trait;
    use std::time::Duration as StdDuration;

    /// Record store whose seeding queries fail for one number.
    struct FlakyStore {
        inner: MemoryRecordStore,
        failing_number: String,
    }

    #[async_trait]
    impl RecordStore for FlakyStore {
        async fn profile_config(&self, profile_id: &str) -> Result<ProfileRow, RecordError> {
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
            if phone_number == self.failing_number {
                return Err(RecordError::Malformed("queued count".to_string()));
            }
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
            "flaky"
        }
    }

    struct Fixture {
        store: Arc<FlakyStore>,
        cache: Arc<MemoryNumberCache>,
        sync: Arc<EventSync>,
    }

    fn fixture() -> Fixture {
        let inner = MemoryRecordStore::new();
        for id in ["p1", "p2"] {
            inner.insert_profile(ProfileRow {
                id: id.to_string(),
                throughput_limit: 12,
                throughput_interval_secs: 60.0,
                daily_contact_limit: 2,
            });
        }
        let store = Arc::new(FlakyStore {
            inner,
            failing_number: "+1555bad".to_string(),
        });
        // Send events only score numbers already in the index
        let cache = Arc::new(MemoryNumberCache::new());
        for n in 1..=5 {
            cache
                .seed_usage(&key("p1"), &format!("+155500{n:02}"), 0)
                .unwrap();
        }
        let profiles = Arc::new(ProfileConfigCache::new(store.clone(), None));
        let sync = EventSync::new(EventBus::new(64), cache.clone(), store.clone(), profiles);

        Fixture { store, cache, sync }
    }

    fn key(profile_id: &str) -> LocationKey {
        LocationKey::new(profile_id, "loc-a")
    }

    fn score(cache: &MemoryNumberCache, key: &LocationKey, number: &str) -> Option<u64> {
        cache
            .usage(key)
            .unwrap()
            .into_iter()
            .find(|(n, _)| n == number)
            .map(|(_, s)| s)
    }

    /// Poll until `check` holds, failing after one second.
    async fn eventually<F: Fn() -> bool>(check: F) {
        for _ in 0..100 {
            if check() {
                return;
            }
            tokio::time::sleep(StdDuration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn test_send_recorded_first_contact() {
        let f = fixture();
        f.cache.seed_usage(&key("p1"), "+15550001", 0).unwrap();
        let now = Utc::now();

        let event = CacheEvent::send_recorded("p1", "loc-a", "+15550001", true);
        f.sync.handle_event_at(&event, now).await.unwrap();

        assert_eq!(score(&f.cache, &key("p1"), "+15550001"), Some(1));
        assert_eq!(
            f.cache.pacing(&key("p1")).unwrap().get("+15550001"),
            Some(&(now.timestamp_millis() + 5_000))
        );
    }

    #[tokio::test]
    async fn test_send_recorded_repeat_contact_only_paces() {
        let f = fixture();
        f.cache.seed_usage(&key("p1"), "+15550001", 1).unwrap();
        let now = Utc::now();

        let event = CacheEvent::send_recorded("p1", "loc-a", "+15550001", false);
        f.sync.handle_event_at(&event, now).await.unwrap();
        f.sync.handle_event_at(&event, now).await.unwrap();

        assert_eq!(score(&f.cache, &key("p1"), "+15550001"), Some(1));
        assert_eq!(
            f.cache.pacing(&key("p1")).unwrap().get("+15550001"),
            Some(&(now.timestamp_millis() + 10_000))
        );
    }

    #[tokio::test]
    async fn test_send_recorded_for_unindexed_number_only_paces() {
        let f = fixture();
        let now = Utc::now();

        let event = CacheEvent::send_recorded("p1", "loc-a", "+15559999", true);
        f.sync.handle_event_at(&event, now).await.unwrap();

        assert_eq!(score(&f.cache, &key("p1"), "+15559999"), None);
        assert_eq!(
            f.cache.pacing(&key("p1")).unwrap().get("+15559999"),
            Some(&(now.timestamp_millis() + 5_000))
        );
    }

    #[tokio::test]
    async fn test_number_request_fulfilled_seeds_queued_and_sent() {
        let f = fixture();
        let now = Utc::now();
        for to in ["+1999001", "+1999002", "+1999003"] {
            f.store.inner.enqueue(QueuedMessage {
                from_number: "+15550010".to_string(),
                to_number: to.to_string(),
                location_id: "loc-a".to_string(),
                queued_at: now,
            });
        }

        let event = CacheEvent::number_request_fulfilled("p1", "req-1", "loc-a", "+15550010");
        f.sync.handle_event_at(&event, now).await.unwrap();
        assert_eq!(score(&f.cache, &key("p1"), "+15550010"), Some(3));

        // Sends older than a day do not count
        f.store.inner.record_send(SendRecord {
            from_number: "+15550011".to_string(),
            to_number: "+1999001".to_string(),
            location_id: "loc-a".to_string(),
            profile_id: "p1".to_string(),
            estimated_segments: 1,
            created_at: now - Duration::hours(30),
            is_first_contact_today: true,
        });
        f.store.inner.record_send(SendRecord {
            from_number: "+15550011".to_string(),
            to_number: "+1999002".to_string(),
            location_id: "loc-a".to_string(),
            profile_id: "p1".to_string(),
            estimated_segments: 1,
            created_at: now - Duration::hours(2),
            is_first_contact_today: true,
        });
        let event = CacheEvent::number_request_fulfilled("p1", "req-2", "loc-a", "+15550011");
        f.sync.handle_event_at(&event, now).await.unwrap();
        assert_eq!(score(&f.cache, &key("p1"), "+15550011"), Some(1));
    }

    #[tokio::test]
    async fn test_subscription_ignores_other_profiles() {
        let f = fixture();
        let subscription = f.sync.subscribe("p1");

        f.sync
            .bus()
            .publish(CacheEvent::send_recorded("p2", "loc-a", "+15550002", true));
        f.sync
            .bus()
            .publish(CacheEvent::send_recorded("p1", "loc-a", "+15550001", true));

        let cache = f.cache.clone();
        eventually(move || score(&cache, &key("p1"), "+15550001") == Some(1)).await;
        assert!(f.cache.usage(&key("p2")).unwrap().is_empty());

        subscription.unsubscribe().await;
    }

    #[tokio::test]
    async fn test_failing_event_does_not_stop_subscription() {
        let f = fixture();
        let subscription = f.sync.subscribe("p1");

        f.sync
            .bus()
            .publish(CacheEvent::number_request_fulfilled("p1", "req-1", "loc-a", "+1555bad"));
        f.sync
            .bus()
            .publish(CacheEvent::send_recorded("p1", "loc-a", "+15550001", true));

        let cache = f.cache.clone();
        eventually(move || score(&cache, &key("p1"), "+15550001") == Some(1)).await;
        assert_eq!(score(&f.cache, &key("p1"), "+1555bad"), None);

        subscription.unsubscribe().await;
    }

    #[tokio::test]
    async fn test_unsubscribe_stops_processing() {
        let f = fixture();
        let subscription = f.sync.subscribe("p1");
        assert_eq!(subscription.profile_id(), "p1");

        f.sync
            .bus()
            .publish(CacheEvent::send_recorded("p1", "loc-a", "+15550001", true));
        let cache = f.cache.clone();
        eventually(move || score(&cache, &key("p1"), "+15550001") == Some(1)).await;

        subscription.unsubscribe().await;

        f.sync
            .bus()
            .publish(CacheEvent::send_recorded("p1", "loc-a", "+15550001", true));
        tokio::time::sleep(StdDuration::from_millis(50)).await;
        assert_eq!(score(&f.cache, &key("p1"), "+15550001"), Some(1));
    }

    #[tokio::test]
    async fn test_lagged_subscription_keeps_processing() {
        let f = fixture();
        let profiles = Arc::new(ProfileConfigCache::new(f.store.clone(), None));
        let sync = EventSync::new(EventBus::new(2), f.cache.clone(), f.store.clone(), profiles);
        let subscription = sync.subscribe("p1");

        // The subscription task cannot run until this test yields
        for n in 1..=5 {
            sync.bus().publish(CacheEvent::send_recorded(
                "p1",
                "loc-a",
                format!("+155500{n:02}"),
                true,
            ));
        }

        let cache = f.cache.clone();
        eventually(move || score(&cache, &key("p1"), "+15550005") == Some(1)).await;
        assert_eq!(score(&f.cache, &key("p1"), "+15550004"), Some(1));
        assert_eq!(score(&f.cache, &key("p1"), "+15550001"), Some(0));

        subscription.unsubscribe().await;
    }

    #[tokio::test]
    async fn test_registry_attach_is_idempotent() {
        let f = fixture();
        let registry = SyncRegistry::new(f.sync.clone());

        assert!(registry.attach("p1"));
        assert!(!registry.attach("p1"));
        assert!(registry.attach("p2"));
        assert_eq!(registry.attached(), vec!["p1", "p2"]);
        assert_eq!(f.sync.bus().subscriber_count(), 2);

        assert!(registry.detach("p2"));
        assert!(!registry.detach("p2"));
        assert!(!registry.is_attached("p2"));

        registry.detach_all().await;
        assert!(registry.attached().is_empty());
        let sync = f.sync.clone();
        eventually(move || sync.bus().subscriber_count() == 0).await;
    }
}
