//! Persistent number cache using fjall (pure Rust LSM-tree).
//!
//! Survives restarts, so a warm process can serve selection before its first
//! re-hydration completes.
//!
//! # Key layout
//!
//! | Partition | Key | Value |
//! |-----------|-----|-------|
//! | `usage` | `{len(p)}:{p}/{len(l)}:{l}/{number}` | u64 BE score |
//! | `pacing` | `{len(p)}:{p}/{len(l)}:{l}/{number}` | i64 BE epoch ms |
//! | `recent_segments` | `{len(p)}:{p}/{len(l)}:{l}/{number}` | u64 BE segments |
//! | `settings` | `profile:{p}` | JSON [`ProfileSettings`] |
//!
//! Length-prefixed ID segments keep the prefixes of distinct profiles and
//! locations disjoint whatever characters the IDs contain.
//!
//! Multi-key operations hold `script_lock` and write through one atomic
//! keyspace batch.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fmt::Display;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use fjall::{Config, Keyspace, PartitionCreateOptions, PartitionHandle, PersistMode};
use tracing::{debug, info};

use crate::profile::ProfileSettings;

use super::types::*;
use super::{first_eligible, next_pacing, scan_order, CacheError, NumberCache};

/// Persistent cache backed by fjall.
pub struct PersistentNumberCache {
    keyspace: Keyspace,
    usage: PartitionHandle,
    pacing: PartitionHandle,
    recent_segments: PartitionHandle,
    settings: PartitionHandle,
    script_lock: Mutex<()>,
}

fn backend<E: Display>(e: E) -> CacheError {
    CacheError::Backend(e.to_string())
}

fn id_segment(id: &str) -> String {
    format!("{}:{}/", id.len(), id)
}

/// Split a leading `{len}:{id}/` segment off `s`.
fn split_segment(s: &str) -> Option<(&str, &str)> {
    let (len, rest) = s.split_once(':')?;
    let len: usize = len.parse().ok()?;
    let id = rest.get(..len)?;
    let rest = rest.get(len..)?.strip_prefix('/')?;
    Some((id, rest))
}

fn profile_prefix(profile_id: &str) -> String {
    id_segment(profile_id)
}

fn location_prefix(key: &LocationKey) -> String {
    format!("{}{}", id_segment(&key.profile_id), id_segment(&key.location_id))
}

fn entry_key(key: &LocationKey, number: &str) -> String {
    format!("{}{}", location_prefix(key), number)
}

fn corrupt(key: &[u8]) -> CacheError {
    CacheError::Corrupt {
        key: String::from_utf8_lossy(key).into_owned(),
    }
}

fn decode_u64(key: &[u8], value: &[u8]) -> Result<u64, CacheError> {
    <[u8; 8]>::try_from(value)
        .map(u64::from_be_bytes)
        .map_err(|_| corrupt(key))
}

fn decode_i64(key: &[u8], value: &[u8]) -> Result<i64, CacheError> {
    <[u8; 8]>::try_from(value)
        .map(i64::from_be_bytes)
        .map_err(|_| corrupt(key))
}

impl PersistentNumberCache {
    /// Open or create the cache at the given path.
    pub fn open(path: &Path) -> Result<Arc<Self>, CacheError> {
        std::fs::create_dir_all(path).map_err(backend)?;

        let keyspace = Config::new(path).open()?;
        let usage = keyspace.open_partition("usage", PartitionCreateOptions::default())?;
        let pacing = keyspace.open_partition("pacing", PartitionCreateOptions::default())?;
        let recent_segments =
            keyspace.open_partition("recent_segments", PartitionCreateOptions::default())?;
        let settings = keyspace.open_partition("settings", PartitionCreateOptions::default())?;

        let cache = Arc::new(Self {
            keyspace,
            usage,
            pacing,
            recent_segments,
            settings,
            script_lock: Mutex::new(()),
        });

        info!(path = %path.display(), "persistent number cache opened");
        Ok(cache)
    }

    fn lock(&self) -> Result<MutexGuard<'_, ()>, CacheError> {
        self.script_lock.lock().map_err(|_| CacheError::LockPoisoned)
    }

    /// Scan `partition` under `prefix`, returning (suffix, raw value) pairs.
    fn scan(
        &self,
        partition: &PartitionHandle,
        prefix: &str,
    ) -> Result<Vec<(String, Vec<u8>, Vec<u8>)>, CacheError> {
        let mut entries = Vec::new();
        for item in partition.prefix(prefix.as_bytes()) {
            let (key, value) = item.map_err(backend)?;
            let suffix = std::str::from_utf8(&key[prefix.len()..])
                .map_err(|_| corrupt(&key))?
                .to_string();
            entries.push((suffix, key.to_vec(), value.to_vec()));
        }
        Ok(entries)
    }

    fn scan_u64(
        &self,
        partition: &PartitionHandle,
        prefix: &str,
    ) -> Result<Vec<(String, u64)>, CacheError> {
        self.scan(partition, prefix)?
            .into_iter()
            .map(|(suffix, key, value)| Ok((suffix, decode_u64(&key, &value)?)))
            .collect()
    }

    fn get_i64(&self, partition: &PartitionHandle, key: &str) -> Result<Option<i64>, CacheError> {
        match partition.get(key.as_bytes())? {
            Some(value) => Ok(Some(decode_i64(key.as_bytes(), &value)?)),
            None => Ok(None),
        }
    }

    fn get_u64(&self, partition: &PartitionHandle, key: &str) -> Result<Option<u64>, CacheError> {
        match partition.get(key.as_bytes())? {
            Some(value) => Ok(Some(decode_u64(key.as_bytes(), &value)?)),
            None => Ok(None),
        }
    }
}

impl NumberCache for PersistentNumberCache {
    fn apply_hydration(&self, batch: &HydrationBatch) -> Result<(), CacheError> {
        let profile_id = batch.profile_id();
        let prefix = profile_prefix(profile_id);
        let _guard = self.lock()?;

        let mut write = self.keyspace.batch();
        let mut fresh_usage = HashSet::new();
        let mut fresh_recent = HashSet::new();

        for (location_id, snapshot) in &batch.locations {
            let key = LocationKey::new(profile_id, location_id.as_str());
            for (number, score) in &snapshot.usage {
                let entry = entry_key(&key, number);
                write.insert(&self.usage, entry.as_bytes(), score.to_be_bytes().as_slice());
                fresh_usage.insert(entry);
            }
            for (number, segments) in &snapshot.recent_segments {
                let entry = entry_key(&key, number);
                write.insert(
                    &self.recent_segments,
                    entry.as_bytes(),
                    segments.to_be_bytes().as_slice(),
                );
                fresh_recent.insert(entry);
            }
        }

        // Drop entries of this profile that the new snapshot no longer has
        for (suffix, key, _) in self.scan(&self.usage, &prefix)? {
            if !fresh_usage.contains(&format!("{prefix}{suffix}")) {
                write.remove(&self.usage, key.as_slice());
            }
        }
        for (suffix, key, _) in self.scan(&self.recent_segments, &prefix)? {
            if !fresh_recent.contains(&format!("{prefix}{suffix}")) {
                write.remove(&self.recent_segments, key.as_slice());
            }
        }
        // Expired pacing of numbers no longer in the index
        for (suffix, key, value) in self.scan(&self.pacing, &prefix)? {
            let expired = decode_i64(&key, &value)? <= batch.now_ms;
            if expired && !fresh_usage.contains(&format!("{prefix}{suffix}")) {
                write.remove(&self.pacing, key.as_slice());
            }
        }

        let settings = serde_json::to_vec(&batch.settings)?;
        write.insert(
            &self.settings,
            profile_namespace(profile_id).as_bytes(),
            settings.as_slice(),
        );

        write.commit()?;

        debug!(
            profile_id,
            locations = batch.locations.len(),
            numbers = batch.number_count(),
            "hydration batch committed"
        );
        Ok(())
    }

    fn select_available(
        &self,
        key: &LocationKey,
        daily_limit: u32,
        now_ms: i64,
    ) -> Result<Option<String>, CacheError> {
        let _guard = self.lock()?;

        let ordered = scan_order(self.scan_u64(&self.usage, &location_prefix(key))?);
        first_eligible(&ordered, daily_limit, now_ms, |number| {
            self.get_i64(&self.pacing, &entry_key(key, number))
        })
    }

    fn record_send(
        &self,
        key: &LocationKey,
        number: &str,
        patch: SendPatch,
    ) -> Result<SendOutcome, CacheError> {
        let entry = entry_key(key, number);
        let _guard = self.lock()?;

        // Only numbers hydrated as eligible are scored
        let stored = self.get_u64(&self.usage, &entry)?;
        let score = match stored {
            Some(score) if patch.first_contact => score + 1,
            Some(score) => score,
            None => 0,
        };
        let next = next_pacing(
            self.get_i64(&self.pacing, &entry)?,
            patch.now_ms,
            patch.increment_ms,
        );

        let mut write = self.keyspace.batch();
        if stored.is_some() && patch.first_contact {
            write.insert(&self.usage, entry.as_bytes(), score.to_be_bytes().as_slice());
        }
        write.insert(&self.pacing, entry.as_bytes(), next.to_be_bytes().as_slice());
        write.commit()?;

        Ok(SendOutcome {
            score,
            next_send_at_ms: next,
        })
    }

    fn seed_usage(&self, key: &LocationKey, number: &str, score: u64) -> Result<(), CacheError> {
        let entry = entry_key(key, number);
        let _guard = self.lock()?;
        self.usage
            .insert(entry.as_bytes(), score.to_be_bytes().as_slice())?;
        Ok(())
    }

    fn usage(&self, key: &LocationKey) -> Result<Vec<(String, u64)>, CacheError> {
        let _guard = self.lock()?;
        Ok(scan_order(self.scan_u64(&self.usage, &location_prefix(key))?))
    }

    fn pacing(&self, key: &LocationKey) -> Result<BTreeMap<String, i64>, CacheError> {
        let _guard = self.lock()?;
        self.scan(&self.pacing, &location_prefix(key))?
            .into_iter()
            .map(|(number, key, value)| Ok((number, decode_i64(&key, &value)?)))
            .collect()
    }

    fn recent_segments(&self, key: &LocationKey) -> Result<BTreeMap<String, u64>, CacheError> {
        let _guard = self.lock()?;
        Ok(self
            .scan_u64(&self.recent_segments, &location_prefix(key))?
            .into_iter()
            .collect())
    }

    fn settings(&self, profile_id: &str) -> Result<Option<ProfileSettings>, CacheError> {
        match self.settings.get(profile_namespace(profile_id).as_bytes())? {
            Some(value) => Ok(Some(serde_json::from_slice(&value)?)),
            None => Ok(None),
        }
    }

    fn locations(&self, profile_id: &str) -> Result<Vec<String>, CacheError> {
        let _guard = self.lock()?;
        let prefix = profile_prefix(profile_id);
        let ids: BTreeSet<String> = self
            .scan(&self.usage, &prefix)?
            .into_iter()
            .filter_map(|(suffix, _, _)| {
                split_segment(&suffix).map(|(location_id, _)| location_id.to_string())
            })
            .collect();
        Ok(ids.into_iter().collect())
    }

    fn name(&self) -> &'static str {
        "fjall"
    }

    fn flush(&self) -> Result<(), CacheError> {
        self.keyspace.persist(PersistMode::SyncAll)?;
        Ok(())
    }
}
