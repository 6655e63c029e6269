//! Service facade.
//!
//! [`NumberService`] wires the admission-cache components together:
//! - Profile config cache (rate-limit settings)
//! - Hydrator (cold-start builder)
//! - Selector (atomic number selection)
//! - Sync registry (per-profile event subscriptions)
//!
//! It also remembers which profiles have been hydrated, which the selector
//! itself cannot tell apart from exhaustion.

use std::collections::BTreeSet;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono_tz::Tz;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::cache::{CacheError, SharedCache};
use crate::config::Config;
use crate::hydrator::{HydrateError, HydrationReport, Hydrator};
use crate::profile::ProfileConfigCache;
use crate::records::SharedRecordStore;
use crate::scheduler::RolloverTarget;
use crate::selector::{NumberSelector, SelectError};
use crate::sync::{EventBus, EventSync, SyncRegistry};
use crate::telemetry::AdminState;

/// Settings for [`NumberService`].
#[derive(Debug, Clone)]
pub struct ServiceOptions {
    /// Timezone defining the local day
    pub timezone: Tz,
    /// Profile settings TTL (None = memoise for the process lifetime)
    pub profile_config_ttl: Option<Duration>,
}

impl Default for ServiceOptions {
    fn default() -> Self {
        Self {
            timezone: chrono_tz::America::New_York,
            profile_config_ttl: None,
        }
    }
}

impl ServiceOptions {
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        Ok(Self {
            timezone: config.tz()?,
            profile_config_ttl: config.profile_config_ttl,
        })
    }
}

/// Outbound-number admission service.
pub struct NumberService {
    cache: SharedCache,
    profiles: Arc<ProfileConfigCache>,
    hydrator: Hydrator,
    selector: NumberSelector,
    sync: Arc<EventSync>,
    registry: SyncRegistry,
    hydrated: RwLock<BTreeSet<String>>,
    /// Serialises lazy hydrations
    hydrating: Mutex<()>,
    admin: Option<Arc<AdminState>>,
}

impl NumberService {
    pub fn new(
        records: SharedRecordStore,
        cache: SharedCache,
        bus: Arc<EventBus>,
        options: ServiceOptions,
    ) -> Self {
        let profiles = Arc::new(ProfileConfigCache::new(
            records.clone(),
            options.profile_config_ttl,
        ));
        let hydrator = Hydrator::new(
            records.clone(),
            cache.clone(),
            profiles.clone(),
            options.timezone,
        );
        let selector = NumberSelector::new(cache.clone(), profiles.clone());
        let sync = EventSync::new(bus, cache.clone(), records, profiles.clone());
        let registry = SyncRegistry::new(sync.clone());

        Self {
            cache,
            profiles,
            hydrator,
            selector,
            sync,
            registry,
            hydrated: RwLock::new(BTreeSet::new()),
            hydrating: Mutex::new(()),
            admin: None,
        }
    }

    /// Report hydration and selection stats to the admin API.
    pub fn with_admin(mut self, admin: Arc<AdminState>) -> Self {
        self.admin = Some(admin);
        self
    }

    pub fn cache(&self) -> &SharedCache {
        &self.cache
    }

    pub fn profiles(&self) -> &Arc<ProfileConfigCache> {
        &self.profiles
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        self.sync.bus()
    }

    /// Hydrate a profile now, replacing its cache state.
    pub async fn hydrate(&self, profile_id: &str) -> Result<HydrationReport, HydrateError> {
        let report = self.hydrator.hydrate(profile_id).await?;

        let count = {
            let mut hydrated = self.hydrated.write().unwrap();
            hydrated.insert(profile_id.to_string());
            hydrated.len()
        };
        if let Some(admin) = &self.admin {
            admin.inc_hydrations();
            admin.set_hydrated_profiles(count);
        }

        Ok(report)
    }

    /// Hydrate a profile unless it already was. Returns the report if a
    /// hydration ran.
    pub async fn ensure_hydrated(
        &self,
        profile_id: &str,
    ) -> Result<Option<HydrationReport>, HydrateError> {
        if self.is_hydrated(profile_id) {
            return Ok(None);
        }

        let _guard = self.hydrating.lock().await;
        if self.is_hydrated(profile_id) {
            return Ok(None);
        }

        debug!(profile_id, "lazy hydration");
        self.hydrate(profile_id).await.map(Some)
    }

    /// Whether the profile has been hydrated by this process.
    pub fn is_hydrated(&self, profile_id: &str) -> bool {
        self.hydrated.read().unwrap().contains(profile_id)
    }

    /// Hydrated profile IDs, sorted.
    pub fn hydrated_profiles(&self) -> Vec<String> {
        self.hydrated.read().unwrap().iter().cloned().collect()
    }

    /// Least-used number for a (profile, location) pair.
    ///
    /// Call [`ensure_hydrated`](Self::ensure_hydrated) first; on an
    /// unhydrated profile this returns `None`.
    pub async fn select_available_number(
        &self,
        profile_id: &str,
        location_id: &str,
    ) -> Result<Option<String>, SelectError> {
        if !self.is_hydrated(profile_id) {
            debug!(profile_id, location_id, "selection on unhydrated profile");
        }

        let number = self
            .selector
            .select_available_number(profile_id, location_id)
            .await?;

        if let Some(admin) = &self.admin {
            admin.inc_selections(number.is_none());
        }
        Ok(number)
    }

    /// Start event sync for a profile. Returns false if already attached.
    pub fn attach_sync(&self, profile_id: &str) -> bool {
        self.registry.attach(profile_id)
    }

    /// Stop event sync for a profile. Returns false if not attached.
    pub fn detach_sync(&self, profile_id: &str) -> bool {
        self.registry.detach(profile_id)
    }

    /// Profiles with event sync attached.
    pub fn attached_profiles(&self) -> Vec<String> {
        self.registry.attached()
    }

    /// Attach event sync, then hydrate.
    ///
    /// Attaching first means no event between the hydration reads and the
    /// attach is missed; events applied before the batch are superseded by it.
    pub async fn track(&self, profile_id: &str) -> Result<HydrationReport, HydrateError> {
        self.attach_sync(profile_id);
        self.hydrate(profile_id).await
    }

    /// Detach all subscriptions and flush the cache.
    pub async fn shutdown(&self) -> Result<(), CacheError> {
        self.registry.detach_all().await;
        self.cache.flush()?;
        info!(backend = self.cache.name(), "number service stopped");
        Ok(())
    }
}

#[async_trait]
impl RolloverTarget for NumberService {
    fn tracked_profiles(&self) -> Vec<String> {
        self.hydrated_profiles()
    }

    async fn rehydrate(&self, profile_id: &str) -> Result<(), HydrateError> {
        self.hydrate(profile_id).await.map(|report| {
            if report.numbers == 0 {
                warn!(profile_id, "rollover hydrated a profile with no eligible numbers");
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryNumberCache;
    use crate::records::{MemoryRecordStore, NumberStatus, ProfileRow};

    fn service() -> (NumberService, Arc<MemoryRecordStore>, Arc<AdminState>) {
        let records = Arc::new(MemoryRecordStore::new());
        records.insert_profile(ProfileRow {
            id: "p1".to_string(),
            throughput_limit: 12,
            throughput_interval_secs: 60.0,
            daily_contact_limit: 2,
        });
        records.insert_location("p1", "loc-a");
        records.insert_number("loc-a", "+15550001", NumberStatus::Active);

        let admin = Arc::new(AdminState::new());
        let service = NumberService::new(
            records.clone(),
            Arc::new(MemoryNumberCache::new()),
            EventBus::new(16),
            ServiceOptions::default(),
        )
        .with_admin(admin.clone());
        (service, records, admin)
    }

    #[tokio::test]
    async fn test_ensure_hydrated_runs_once() {
        let (service, _records, _admin) = service();
        assert!(!service.is_hydrated("p1"));

        let report = service.ensure_hydrated("p1").await.unwrap();
        assert_eq!(report.unwrap().numbers, 1);
        assert!(service.is_hydrated("p1"));
        assert!(service.ensure_hydrated("p1").await.unwrap().is_none());
        assert_eq!(service.hydrated_profiles(), vec!["p1"]);
    }

    #[tokio::test]
    async fn test_select_after_hydration() {
        let (service, _records, _admin) = service();
        assert!(service
            .select_available_number("p1", "loc-a")
            .await
            .unwrap()
            .is_none());

        service.hydrate("p1").await.unwrap();
        assert_eq!(
            service
                .select_available_number("p1", "loc-a")
                .await
                .unwrap()
                .as_deref(),
            Some("+15550001")
        );
    }

    #[tokio::test]
    async fn test_failed_hydration_not_tracked() {
        let (service, _records, _admin) = service();
        assert!(service.ensure_hydrated("missing").await.is_err());
        assert!(!service.is_hydrated("missing"));
    }

    #[tokio::test]
    async fn test_attach_detach_sync() {
        let (service, _records, _admin) = service();
        assert!(service.attach_sync("p1"));
        assert!(!service.attach_sync("p1"));
        assert_eq!(service.attached_profiles(), vec!["p1"]);

        assert!(service.detach_sync("p1"));
        assert!(service.attached_profiles().is_empty());
    }

    #[tokio::test]
    async fn test_rollover_target_rehydrates_tracked() {
        let (service, _records, _admin) = service();
        service.track("p1").await.unwrap();

        assert_eq!(service.tracked_profiles(), vec!["p1"]);
        service.rehydrate("p1").await.unwrap();

        service.shutdown().await.unwrap();
        assert!(service.attached_profiles().is_empty());
    }
}
