//! Types for the number cache.

use std::collections::BTreeMap;
use std::fmt;

use crate::profile::ProfileSettings;

/// Namespace prefix shared by every per-profile key.
pub fn profile_namespace(profile_id: &str) -> String {
    format!("profile:{}", profile_id)
}

/// Cache partition for one (profile, sending location) pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LocationKey {
    pub profile_id: String,
    pub location_id: String,
}

impl LocationKey {
    pub fn new(profile_id: impl Into<String>, location_id: impl Into<String>) -> Self {
        Self {
            profile_id: profile_id.into(),
            location_id: location_id.into(),
        }
    }

    /// Key prefix for this partition, e.g. `profile:42:location:7`.
    pub fn namespace(&self) -> String {
        format!("{}:location:{}", profile_namespace(&self.profile_id), self.location_id)
    }
}

impl fmt::Display for LocationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.namespace())
    }
}

/// Hydrated state for one sending location.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LocationSnapshot {
    /// Number -> distinct recipients contacted today
    pub usage: BTreeMap<String, u64>,
    /// Number -> segments sent inside the throughput window
    pub recent_segments: BTreeMap<String, u64>,
}

/// Output of one hydration run, applied to the cache as a single unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HydrationBatch {
    pub settings: ProfileSettings,
    /// Location ID -> snapshot
    pub locations: BTreeMap<String, LocationSnapshot>,
    /// Build time, epoch milliseconds. Expired pacing entries of numbers
    /// missing from the batch are pruned against it.
    pub now_ms: i64,
}

impl HydrationBatch {
    pub fn new(settings: ProfileSettings, now_ms: i64) -> Self {
        Self {
            settings,
            locations: BTreeMap::new(),
            now_ms,
        }
    }

    pub fn profile_id(&self) -> &str {
        &self.settings.profile_id
    }

    /// Total numbers across all locations.
    pub fn number_count(&self) -> usize {
        self.locations.values().map(|l| l.usage.len()).sum()
    }
}

/// Patch applied when a send is recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendPatch {
    /// Increment the usage score by one
    pub first_contact: bool,
    /// Spacing added after `max(stored, now)`
    pub increment_ms: i64,
    /// Current time, epoch milliseconds
    pub now_ms: i64,
}

/// State of one number after a send patch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendOutcome {
    pub score: u64,
    pub next_send_at_ms: i64,
}
