//! PostgreSQL record store.
//!
//! Uses runtime queries (`sqlx::query`) so the crate builds without a
//! `DATABASE_URL`. Tables read:
//!
//! | Table | Columns used |
//! |-------|--------------|
//! | `profiles` | `id`, `throughput_limit`, `throughput_interval`, `daily_contact_limit` |
//! | `sending_locations` | `id`, `profile_id` |
//! | `phone_numbers` | `phone_number`, `sending_location_id`, `cordoned`, `released` |
//! | `outbound_messages` | `from_number`, `to_number`, `sending_location_id`, `estimated_segments`, `stage`, `created_at` |

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::Row;
use tracing::info;

use super::types::*;
use super::{RecordError, RecordStore};

const PROFILE_CONFIG_SQL: &str = r#"
    select id::text as id,
           throughput_limit::bigint as throughput_limit,
           extract(epoch from throughput_interval)::float8 as throughput_interval_secs,
           daily_contact_limit::bigint as daily_contact_limit
    from profiles
    where id::text = $1
"#;

// Left join keeps zero-usage numbers in the result with a count of 0.
const TODAYS_USAGE_SQL: &str = r#"
    select sl.id::text as location_id,
           pn.phone_number as phone_number,
           count(distinct om.to_number)::bigint as recipients
    from sending_locations sl
    join phone_numbers pn
      on pn.sending_location_id = sl.id
    left join outbound_messages om
      on om.from_number = pn.phone_number
     and om.sending_location_id = sl.id
     and om.stage = 'sent'
     and om.created_at >= $2
    where sl.profile_id::text = $1
      and not pn.cordoned
      and not pn.released
    group by sl.id, pn.phone_number
    order by sl.id, pn.phone_number
"#;

const RECENT_SEGMENTS_SQL: &str = r#"
    select om.sending_location_id::text as location_id,
           om.from_number as phone_number,
           coalesce(sum(om.estimated_segments), 0)::bigint as segments
    from outbound_messages om
    join sending_locations sl
      on sl.id = om.sending_location_id
    where sl.profile_id::text = $1
      and om.stage = 'sent'
      and om.created_at >= $2
    group by om.sending_location_id, om.from_number
    order by om.sending_location_id, om.from_number
"#;

const QUEUED_COUNT_SQL: &str = r#"
    select count(*)::bigint as count
    from outbound_messages
    where from_number = $1
      and stage = 'queued'
"#;

const SENT_SINCE_SQL: &str = r#"
    select count(*)::bigint as count
    from outbound_messages
    where from_number = $1
      and stage = 'sent'
      and created_at >= $2
"#;

/// PostgreSQL-backed record store.
#[derive(Clone)]
pub struct PgRecordStore {
    pool: PgPool,
}

impl PgRecordStore {
    /// Connect with a pool of at most `max_connections`.
    pub async fn connect(
        url: &str,
        max_connections: u32,
        acquire_timeout: Duration,
    ) -> Result<Self, RecordError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(acquire_timeout)
            .connect(url)
            .await?;

        info!(max_connections, "connected to record store");
        Ok(Self { pool })
    }

    /// Underlying pool (shared with the notification listener).
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn non_negative(value: i64, column: &str) -> Result<u64, RecordError> {
    u64::try_from(value).map_err(|_| RecordError::Malformed(format!("{column} = {value}")))
}

#[async_trait]
impl RecordStore for PgRecordStore {
    async fn profile_config(&self, profile_id: &str) -> Result<ProfileRow, RecordError> {
        let row = sqlx::query(PROFILE_CONFIG_SQL)
            .bind(profile_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| RecordError::ProfileNotFound(profile_id.to_string()))?;

        Ok(ProfileRow {
            id: row.try_get("id")?,
            throughput_limit: row.try_get("throughput_limit")?,
            throughput_interval_secs: row.try_get("throughput_interval_secs")?,
            daily_contact_limit: row.try_get("daily_contact_limit")?,
        })
    }

    async fn todays_usage(
        &self,
        profile_id: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<UsageRow>, RecordError> {
        let rows = sqlx::query(TODAYS_USAGE_SQL)
            .bind(profile_id)
            .bind(since)
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter()
            .map(|row| -> Result<UsageRow, RecordError> {
                Ok(UsageRow {
                    location_id: row.try_get("location_id")?,
                    phone_number: row.try_get("phone_number")?,
                    recipients: non_negative(row.try_get("recipients")?, "recipients")?,
                })
            })
            .collect()
    }

    async fn recent_segments(
        &self,
        profile_id: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<SegmentRow>, RecordError> {
        let rows = sqlx::query(RECENT_SEGMENTS_SQL)
            .bind(profile_id)
            .bind(since)
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter()
            .map(|row| -> Result<SegmentRow, RecordError> {
                Ok(SegmentRow {
                    location_id: row.try_get("location_id")?,
                    phone_number: row.try_get("phone_number")?,
                    segments: non_negative(row.try_get("segments")?, "segments")?,
                })
            })
            .collect()
    }

    async fn queued_count(&self, phone_number: &str) -> Result<u64, RecordError> {
        let row = sqlx::query(QUEUED_COUNT_SQL)
            .bind(phone_number)
            .fetch_one(&self.pool)
            .await?;
        non_negative(row.try_get("count")?, "count")
    }

    async fn sent_since(
        &self,
        phone_number: &str,
        since: DateTime<Utc>,
    ) -> Result<u64, RecordError> {
        let row = sqlx::query(SENT_SINCE_SQL)
            .bind(phone_number)
            .bind(since)
            .fetch_one(&self.pool)
            .await?;
        non_negative(row.try_get("count")?, "count")
    }

    fn name(&self) -> &'static str {
        "postgres"
    }
}
