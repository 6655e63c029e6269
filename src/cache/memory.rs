//! In-memory number cache.
//!
//! Volatile cache for development, tests and single-process deployments.
//! A single RwLock guards all state, so each trait operation is atomic.

use std::collections::{BTreeMap, HashMap};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use tracing::debug;

use crate::profile::ProfileSettings;

use super::types::*;
use super::{first_eligible, next_pacing, scan_order, CacheError, NumberCache};

#[derive(Default)]
struct LocationState {
    usage: BTreeMap<String, u64>,
    pacing: BTreeMap<String, i64>,
    recent_segments: BTreeMap<String, u64>,
}

#[derive(Default)]
struct CacheState {
    settings: HashMap<String, ProfileSettings>,
    locations: HashMap<LocationKey, LocationState>,
}

/// In-memory cache implementation.
#[derive(Default)]
pub struct MemoryNumberCache {
    state: RwLock<CacheState>,
}

impl MemoryNumberCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, CacheState>, CacheError> {
        self.state.read().map_err(|_| CacheError::LockPoisoned)
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, CacheState>, CacheError> {
        self.state.write().map_err(|_| CacheError::LockPoisoned)
    }
}

impl NumberCache for MemoryNumberCache {
    fn apply_hydration(&self, batch: &HydrationBatch) -> Result<(), CacheError> {
        let profile_id = batch.profile_id();
        let mut state = self.write()?;

        state
            .settings
            .insert(profile_id.to_string(), batch.settings.clone());

        let empty = LocationSnapshot::default();
        for (key, location) in state.locations.iter_mut() {
            if key.profile_id != profile_id {
                continue;
            }
            let snapshot = batch.locations.get(&key.location_id).unwrap_or(&empty);
            location.usage = snapshot.usage.clone();
            location.recent_segments = snapshot.recent_segments.clone();
            location
                .pacing
                .retain(|number, at| *at > batch.now_ms || snapshot.usage.contains_key(number));
        }

        for (location_id, snapshot) in &batch.locations {
            state
                .locations
                .entry(LocationKey::new(profile_id, location_id.as_str()))
                .or_insert_with(|| LocationState {
                    usage: snapshot.usage.clone(),
                    recent_segments: snapshot.recent_segments.clone(),
                    ..Default::default()
                });
        }

        debug!(
            profile_id,
            locations = batch.locations.len(),
            numbers = batch.number_count(),
            "hydration batch applied"
        );
        Ok(())
    }

    fn select_available(
        &self,
        key: &LocationKey,
        daily_limit: u32,
        now_ms: i64,
    ) -> Result<Option<String>, CacheError> {
        let state = self.read()?;
        let Some(location) = state.locations.get(key) else {
            return Ok(None);
        };

        let ordered = scan_order(location.usage.iter().map(|(n, s)| (n.clone(), *s)));
        first_eligible(&ordered, daily_limit, now_ms, |number| {
            Ok(location.pacing.get(number).copied())
        })
    }

    fn record_send(
        &self,
        key: &LocationKey,
        number: &str,
        patch: SendPatch,
    ) -> Result<SendOutcome, CacheError> {
        let mut state = self.write()?;
        let location = state.locations.entry(key.clone()).or_default();

        // Only numbers hydrated as eligible are scored
        let score = match location.usage.get_mut(number) {
            Some(score) => {
                if patch.first_contact {
                    *score += 1;
                }
                *score
            }
            None => 0,
        };

        let next = next_pacing(
            location.pacing.get(number).copied(),
            patch.now_ms,
            patch.increment_ms,
        );
        location.pacing.insert(number.to_string(), next);

        Ok(SendOutcome {
            score,
            next_send_at_ms: next,
        })
    }

    fn seed_usage(&self, key: &LocationKey, number: &str, score: u64) -> Result<(), CacheError> {
        let mut state = self.write()?;
        state
            .locations
            .entry(key.clone())
            .or_default()
            .usage
            .insert(number.to_string(), score);
        Ok(())
    }

    fn usage(&self, key: &LocationKey) -> Result<Vec<(String, u64)>, CacheError> {
        let state = self.read()?;
        Ok(state
            .locations
            .get(key)
            .map(|l| scan_order(l.usage.iter().map(|(n, s)| (n.clone(), *s))))
            .unwrap_or_default())
    }

    fn pacing(&self, key: &LocationKey) -> Result<BTreeMap<String, i64>, CacheError> {
        let state = self.read()?;
        Ok(state
            .locations
            .get(key)
            .map(|l| l.pacing.clone())
            .unwrap_or_default())
    }

    fn recent_segments(&self, key: &LocationKey) -> Result<BTreeMap<String, u64>, CacheError> {
        let state = self.read()?;
        Ok(state
            .locations
            .get(key)
            .map(|l| l.recent_segments.clone())
            .unwrap_or_default())
    }

    fn settings(&self, profile_id: &str) -> Result<Option<ProfileSettings>, CacheError> {
        Ok(self.read()?.settings.get(profile_id).cloned())
    }

    fn locations(&self, profile_id: &str) -> Result<Vec<String>, CacheError> {
        let state = self.read()?;
        let mut ids: Vec<_> = state
            .locations
            .iter()
            .filter(|(k, l)| k.profile_id == profile_id && !l.usage.is_empty())
            .map(|(k, _)| k.location_id.clone())
            .collect();
        ids.sort();
        Ok(ids)
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}
