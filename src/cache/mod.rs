//! Derived cache state for outbound-number admission.
//!
//! Everything the selector reads lives behind the [`NumberCache`] trait:
//! - **Usage Index**: number -> distinct recipients contacted today
//! - **Pacing Table**: number -> earliest instant it may send again
//! - **Recent segments**: number -> segments sent inside the throughput window
//! - **Settings**: the profile configuration seeded by hydration
//!
//! # Architecture
//!
//! ```text
//!   Hydrator ──apply_hydration──┐
//!                               ▼
//!   EventSync ──record_send──▶ NumberCache ◀──select_available── Selector
//!             ──seed_usage───▶     │
//!                    ┌─────────────┴─────────────┐
//!                    ▼                           ▼
//!              ┌──────────┐                ┌──────────┐
//!              │  Memory  │                │  Fjall   │
//!              │  (dev)   │                │ (prod)   │
//!              └──────────┘                └──────────┘
//! ```
//!
//! Every operation is atomic with respect to every other operation on the
//! same cache: selection never observes half of a hydration batch or half of
//! a send patch.
//!
//! # Selection order
//!
//! Numbers are scanned by ascending score. Equal scores are ordered by
//! ascending phone number (byte order), which is the native key order of
//! both backends.

mod factory;
mod memory;
mod persistent;
pub mod types;

pub use factory::create_cache;
pub use memory::MemoryNumberCache;
pub use persistent::PersistentNumberCache;
pub use types::*;

use std::collections::BTreeMap;
use std::sync::Arc;

use thiserror::Error;

use crate::profile::ProfileSettings;

/// Number cache error.
#[derive(Debug, Error)]
pub enum CacheError {
    /// Storage backend failure.
    #[error("cache backend error: {0}")]
    Backend(String),

    /// A stored value could not be decoded.
    #[error("corrupt cache entry at {key}")]
    Corrupt { key: String },

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A lock was poisoned by a panicking writer.
    #[error("cache lock poisoned")]
    LockPoisoned,
}

impl From<fjall::Error> for CacheError {
    fn from(e: fjall::Error) -> Self {
        Self::Backend(e.to_string())
    }
}

/// Derived cache store.
///
/// All implementations must be thread-safe and must run each operation as
/// one indivisible step.
pub trait NumberCache: Send + Sync {
    /// Replace a profile's hydrated state with `batch`.
    ///
    /// Usage Index and recent segments are replaced for every location in the
    /// batch and cleared for the profile's locations absent from it. Pacing
    /// entries are kept.
    fn apply_hydration(&self, batch: &HydrationBatch) -> Result<(), CacheError>;

    /// Pick the least-used number under `daily_limit` whose pacing allows a
    /// send at `now_ms`. Read-only.
    fn select_available(
        &self,
        key: &LocationKey,
        daily_limit: u32,
        now_ms: i64,
    ) -> Result<Option<String>, CacheError>;

    /// Apply a send-recorded patch to one number.
    fn record_send(
        &self,
        key: &LocationKey,
        number: &str,
        patch: SendPatch,
    ) -> Result<SendOutcome, CacheError>;

    /// Set a number's usage score.
    fn seed_usage(&self, key: &LocationKey, number: &str, score: u64) -> Result<(), CacheError>;

    /// Usage Index in selection scan order.
    fn usage(&self, key: &LocationKey) -> Result<Vec<(String, u64)>, CacheError>;

    /// Pacing Table.
    fn pacing(&self, key: &LocationKey) -> Result<BTreeMap<String, i64>, CacheError>;

    /// Recent-segment index.
    fn recent_segments(&self, key: &LocationKey) -> Result<BTreeMap<String, u64>, CacheError>;

    /// Settings seeded by the last hydration.
    fn settings(&self, profile_id: &str) -> Result<Option<ProfileSettings>, CacheError>;

    /// Location IDs holding usage state for a profile.
    fn locations(&self, profile_id: &str) -> Result<Vec<String>, CacheError>;

    /// Backend name for logging.
    fn name(&self) -> &'static str;

    /// Flush pending writes to disk (no-op for in-memory).
    fn flush(&self) -> Result<(), CacheError> {
        Ok(())
    }
}

/// Shared cache handle.
pub type SharedCache = Arc<dyn NumberCache>;

/// Order usage entries for scanning: ascending score, then ascending number.
pub(crate) fn scan_order<I>(usage: I) -> Vec<(String, u64)>
where
    I: IntoIterator<Item = (String, u64)>,
{
    let mut ordered: Vec<_> = usage.into_iter().collect();
    ordered.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
    ordered
}

/// First number in scan order that is under the cap and not paced out.
pub(crate) fn first_eligible<F>(
    ordered: &[(String, u64)],
    daily_limit: u32,
    now_ms: i64,
    mut next_send_at: F,
) -> Result<Option<String>, CacheError>
where
    F: FnMut(&str) -> Result<Option<i64>, CacheError>,
{
    for (number, score) in ordered {
        // Sorted by score: nothing further can be under the cap
        if *score >= daily_limit as u64 {
            return Ok(None);
        }
        match next_send_at(number)? {
            Some(at) if at > now_ms => continue,
            _ => return Ok(Some(number.clone())),
        }
    }
    Ok(None)
}

/// Pacing value after a send: never earlier than the stored value.
pub(crate) fn next_pacing(stored: Option<i64>, now_ms: i64, increment_ms: i64) -> i64 {
    stored.unwrap_or(now_ms).max(now_ms) + increment_ms
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ordered(entries: &[(&str, u64)]) -> Vec<(String, u64)> {
        scan_order(entries.iter().map(|(n, s)| (n.to_string(), *s)))
    }

    #[test]
    fn test_scan_order_breaks_ties_by_number() {
        let order = ordered(&[("+3", 1), ("+2", 0), ("+1", 1), ("+0", 0)]);
        let numbers: Vec<_> = order.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(numbers, vec!["+0", "+2", "+1", "+3"]);
    }

    #[test]
    fn test_first_eligible_skips_capped_and_paced() {
        let order = ordered(&[("+1", 0), ("+2", 1), ("+3", 2)]);
        let picked = first_eligible(&order, 2, 1_000, |n| {
            Ok(if n == "+1" { Some(5_000) } else { None })
        })
        .unwrap();
        assert_eq!(picked.as_deref(), Some("+2"));
    }

    #[test]
    fn test_first_eligible_pacing_boundary_is_inclusive() {
        let order = ordered(&[("+1", 0)]);
        let picked = first_eligible(&order, 2, 5_000, |_| Ok(Some(5_000))).unwrap();
        assert_eq!(picked.as_deref(), Some("+1"));
    }

    #[test]
    fn test_first_eligible_none_when_all_capped() {
        let order = ordered(&[("+1", 2), ("+2", 3)]);
        assert!(first_eligible(&order, 2, 0, |_| Ok(None)).unwrap().is_none());
    }

    #[test]
    fn test_next_pacing_never_moves_backward() {
        assert_eq!(next_pacing(None, 1_000, 500), 1_500);
        assert_eq!(next_pacing(Some(10_000), 1_000, 500), 10_500);
        assert_eq!(next_pacing(Some(100), 1_000, 500), 1_500);
    }
}
