//! In-memory record store.
//!
//! Volatile rows for development and testing. Queries mirror the SQL issued
//! by [`super::PgRecordStore`].

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::debug;

use super::types::*;
use super::{RecordError, RecordStore};

#[derive(Default)]
struct Rows {
    profiles: HashMap<String, ProfileRow>,
    locations: HashMap<String, LocationRow>,
    numbers: Vec<PhoneNumberRow>,
    sends: Vec<SendRecord>,
    queued: Vec<QueuedMessage>,
    requests: HashMap<String, NumberRequestRow>,
}

impl Rows {
    fn location_ids(&self, profile_id: &str) -> BTreeSet<String> {
        self.locations
            .values()
            .filter(|l| l.profile_id == profile_id)
            .map(|l| l.id.clone())
            .collect()
    }
}

/// In-memory record store.
///
/// Thread-safe using RwLock. All data is lost on process restart.
#[derive(Default)]
pub struct MemoryRecordStore {
    rows: RwLock<Rows>,
}

impl MemoryRecordStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a profile row.
    pub fn insert_profile(&self, row: ProfileRow) {
        self.rows.write().unwrap().profiles.insert(row.id.clone(), row);
    }

    /// Insert a sending location under a profile.
    pub fn insert_location(&self, profile_id: &str, location_id: &str) {
        self.rows.write().unwrap().locations.insert(
            location_id.to_string(),
            LocationRow {
                id: location_id.to_string(),
                profile_id: profile_id.to_string(),
            },
        );
    }

    /// Insert a phone number in a location.
    pub fn insert_number(&self, location_id: &str, phone_number: &str, status: NumberStatus) {
        let mut rows = self.rows.write().unwrap();
        rows.numbers.retain(|n| n.phone_number != phone_number);
        rows.numbers.push(PhoneNumberRow {
            phone_number: phone_number.to_string(),
            location_id: location_id.to_string(),
            status,
        });
    }

    /// Change the lifecycle state of a number.
    pub fn set_number_status(&self, phone_number: &str, status: NumberStatus) -> bool {
        let mut rows = self.rows.write().unwrap();
        match rows.numbers.iter_mut().find(|n| n.phone_number == phone_number) {
            Some(row) => {
                row.status = status;
                true
            }
            None => false,
        }
    }

    /// Append a send record.
    pub fn record_send(&self, record: SendRecord) {
        self.rows.write().unwrap().sends.push(record);
    }

    /// Append a queued message.
    pub fn enqueue(&self, message: QueuedMessage) {
        self.rows.write().unwrap().queued.push(message);
    }

    /// Insert a pending number request.
    pub fn insert_request(&self, request_id: &str, location_id: &str) {
        self.rows.write().unwrap().requests.insert(
            request_id.to_string(),
            NumberRequestRow {
                id: request_id.to_string(),
                location_id: location_id.to_string(),
                phone_number: None,
                fulfilled: false,
            },
        );
    }

    /// Fulfil a pending request with a newly provisioned number.
    ///
    /// The number is inserted as active. Returns the updated request row, or
    /// `None` if the request is unknown or already fulfilled.
    pub fn fulfill_request(&self, request_id: &str, phone_number: &str) -> Option<NumberRequestRow> {
        let mut rows = self.rows.write().unwrap();
        let request = rows.requests.get_mut(request_id)?;
        if request.fulfilled {
            return None;
        }
        request.fulfilled = true;
        request.phone_number = Some(phone_number.to_string());
        let request = request.clone();

        rows.numbers.push(PhoneNumberRow {
            phone_number: phone_number.to_string(),
            location_id: request.location_id.clone(),
            status: NumberStatus::Active,
        });

        debug!(request_id, phone_number, "number request fulfilled");
        Some(request)
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn profile_config(&self, profile_id: &str) -> Result<ProfileRow, RecordError> {
        self.rows
            .read()
            .unwrap()
            .profiles
            .get(profile_id)
            .cloned()
            .ok_or_else(|| RecordError::ProfileNotFound(profile_id.to_string()))
    }

    async fn todays_usage(
        &self,
        profile_id: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<UsageRow>, RecordError> {
        let rows = self.rows.read().unwrap();
        let locations = rows.location_ids(profile_id);

        // (location, number) -> distinct recipients
        let mut recipients: BTreeMap<(String, String), BTreeSet<&str>> = BTreeMap::new();

        for number in rows
            .numbers
            .iter()
            .filter(|n| n.status.is_eligible() && locations.contains(&n.location_id))
        {
            recipients
                .entry((number.location_id.clone(), number.phone_number.clone()))
                .or_default();
        }

        for send in rows.sends.iter().filter(|s| s.created_at >= since) {
            let key = (send.location_id.clone(), send.from_number.clone());
            if let Some(set) = recipients.get_mut(&key) {
                set.insert(send.to_number.as_str());
            }
        }

        Ok(recipients
            .into_iter()
            .map(|((location_id, phone_number), set)| UsageRow {
                location_id,
                phone_number,
                recipients: set.len() as u64,
            })
            .collect())
    }

    async fn recent_segments(
        &self,
        profile_id: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<SegmentRow>, RecordError> {
        let rows = self.rows.read().unwrap();
        let locations = rows.location_ids(profile_id);

        let mut segments: BTreeMap<(String, String), u64> = BTreeMap::new();
        for send in rows
            .sends
            .iter()
            .filter(|s| s.created_at >= since && locations.contains(&s.location_id))
        {
            *segments
                .entry((send.location_id.clone(), send.from_number.clone()))
                .or_default() += send.estimated_segments as u64;
        }

        Ok(segments
            .into_iter()
            .map(|((location_id, phone_number), segments)| SegmentRow {
                location_id,
                phone_number,
                segments,
            })
            .collect())
    }

    async fn queued_count(&self, phone_number: &str) -> Result<u64, RecordError> {
        let rows = self.rows.read().unwrap();
        Ok(rows
            .queued
            .iter()
            .filter(|m| m.from_number == phone_number)
            .count() as u64)
    }

    async fn sent_since(
        &self,
        phone_number: &str,
        since: DateTime<Utc>,
    ) -> Result<u64, RecordError> {
        let rows = self.rows.read().unwrap();
        Ok(rows
            .sends
            .iter()
            .filter(|s| s.from_number == phone_number && s.created_at >= since)
            .count() as u64)
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}
