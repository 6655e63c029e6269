//! Row types read from the system of record.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Profile (account) configuration row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProfileRow {
    /// Profile ID
    pub id: String,
    /// Max message segments per throughput interval
    pub throughput_limit: i64,
    /// Raw throughput interval in seconds, exactly as stored
    pub throughput_interval_secs: f64,
    /// Max distinct recipients per number per local day
    pub daily_contact_limit: i64,
}

/// Sending location (location group) row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocationRow {
    /// Location ID
    pub id: String,
    /// Owning profile
    pub profile_id: String,
}

/// Phone number lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NumberStatus {
    /// Available for sending
    #[default]
    Active,
    /// Administratively excluded from new sends
    Cordoned,
    /// Returned to the carrier
    Released,
}

impl NumberStatus {
    /// Only active numbers may be selected.
    pub fn is_eligible(&self) -> bool {
        matches!(self, Self::Active)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Cordoned => "cordoned",
            Self::Released => "released",
        }
    }
}

/// Phone number row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhoneNumberRow {
    /// E.164 phone number
    pub phone_number: String,
    /// Sending location it belongs to
    pub location_id: String,
    /// Lifecycle state
    pub status: NumberStatus,
}

/// Immutable record of one outbound send.
#[derive(Debug, Clone, PartialEq)]
pub struct SendRecord {
    pub from_number: String,
    pub to_number: String,
    pub location_id: String,
    pub profile_id: String,
    pub estimated_segments: u32,
    pub created_at: DateTime<Utc>,
    /// First send from `from_number` to `to_number` in the current local day
    pub is_first_contact_today: bool,
}

/// Outbound message accepted but not yet sent.
#[derive(Debug, Clone, PartialEq)]
pub struct QueuedMessage {
    pub from_number: String,
    pub to_number: String,
    pub location_id: String,
    pub queued_at: DateTime<Utc>,
}

/// Number provisioning request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NumberRequestRow {
    pub id: String,
    pub location_id: String,
    /// Assigned number (set on fulfilment)
    pub phone_number: Option<String>,
    pub fulfilled: bool,
}

/// Distinct recipients contacted by one number.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsageRow {
    pub location_id: String,
    pub phone_number: String,
    pub recipients: u64,
}

/// Estimated segments sent by one number.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentRow {
    pub location_id: String,
    pub phone_number: String,
    pub segments: u64,
}
