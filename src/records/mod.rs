//! Read-only access to the relational system of record.
//!
//! The admission cache never writes to the relational store. Everything it
//! needs is expressed by the [`RecordStore`] trait:
//!
//! - **Profiles**: per-account rate-limit configuration rows
//! - **Usage**: distinct recipients per number since the local day start
//! - **Segments**: estimated segments per number inside the throughput window
//! - **Seeding counts**: queued and recently-sent messages for one number
//!
//! # Implementations
//!
//! - [`MemoryRecordStore`]: rows held in memory, for development and tests
//! - [`PgRecordStore`]: PostgreSQL via sqlx runtime queries

mod memory;
mod postgres;
mod types;

pub use memory::MemoryRecordStore;
pub use postgres::PgRecordStore;
pub use types::*;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

/// Record store error.
#[derive(Debug, Error)]
pub enum RecordError {
    /// The requested profile does not exist.
    #[error("profile not found: {0}")]
    ProfileNotFound(String),

    /// A row could not be decoded into the expected shape.
    #[error("malformed row: {0}")]
    Malformed(String),

    /// Database error.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Read queries against the system of record.
///
/// All queries are scoped to one profile, or to one phone number, so the
/// cache never reads another account's rows.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Load the rate-limit configuration row for a profile.
    async fn profile_config(&self, profile_id: &str) -> Result<ProfileRow, RecordError>;

    /// Distinct recipients per eligible number since `since`.
    ///
    /// Every active, non-cordoned number of every sending location under the
    /// profile appears exactly once, with `recipients = 0` when it has not
    /// sent since `since`.
    async fn todays_usage(
        &self,
        profile_id: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<UsageRow>, RecordError>;

    /// Sum of estimated segments per number sent since `since`.
    async fn recent_segments(
        &self,
        profile_id: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<SegmentRow>, RecordError>;

    /// Messages queued for `phone_number` but not yet sent.
    async fn queued_count(&self, phone_number: &str) -> Result<u64, RecordError>;

    /// Messages sent from `phone_number` since `since`.
    async fn sent_since(&self, phone_number: &str, since: DateTime<Utc>)
        -> Result<u64, RecordError>;

    /// Backend name for logging.
    fn name(&self) -> &'static str;
}

/// Shared record store handle.
pub type SharedRecordStore = Arc<dyn RecordStore>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_error_display() {
        let err = RecordError::ProfileNotFound("p-1".to_string());
        assert!(err.to_string().contains("p-1"));

        let err = RecordError::Malformed("bad count".to_string());
        assert!(err.to_string().contains("bad count"));
    }
}
