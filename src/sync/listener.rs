//! PostgreSQL LISTEN/NOTIFY ingress for cache events.

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use sqlx::postgres::PgListener;
use sqlx::PgPool;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::config::ChannelConfig;
use crate::telemetry::counters;

use super::{CacheEvent, EventBus, EventKind, SyncError};

/// Delay before retrying after a listener error.
const RETRY_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, Deserialize)]
struct SendRecordedPayload {
    profile_id: String,
    location_id: String,
    from_number: String,
    #[serde(default)]
    is_first_contact_today: bool,
}

#[derive(Debug, Deserialize)]
struct NumberRequestFulfilledPayload {
    profile_id: String,
    request_id: String,
    location_id: String,
    phone_number: String,
}

fn parse<'a, T: Deserialize<'a>>(channel: &str, payload: &'a str) -> Result<T, SyncError> {
    serde_json::from_str(payload).map_err(|source| SyncError::Decode {
        channel: channel.to_string(),
        source,
    })
}

/// Decode a notification payload received on `channel`.
pub fn decode_notification(
    channels: &ChannelConfig,
    channel: &str,
    payload: &str,
) -> Result<CacheEvent, SyncError> {
    if channel == channels.send_recorded {
        let p: SendRecordedPayload = parse(channel, payload)?;
        Ok(CacheEvent {
            profile_id: p.profile_id,
            kind: EventKind::SendRecorded {
                location_id: p.location_id,
                from_number: p.from_number,
                is_first_contact_today: p.is_first_contact_today,
            },
        })
    } else if channel == channels.number_request_fulfilled {
        let p: NumberRequestFulfilledPayload = parse(channel, payload)?;
        Ok(CacheEvent {
            profile_id: p.profile_id,
            kind: EventKind::NumberRequestFulfilled {
                request_id: p.request_id,
                location_id: p.location_id,
                phone_number: p.phone_number,
            },
        })
    } else {
        Err(SyncError::UnknownChannel(channel.to_string()))
    }
}

/// Forwards database notifications to the event bus.
pub struct PgNotificationListener {
    pool: PgPool,
    bus: Arc<EventBus>,
    channels: ChannelConfig,
}

impl PgNotificationListener {
    pub fn new(pool: PgPool, bus: Arc<EventBus>, channels: ChannelConfig) -> Self {
        Self {
            pool,
            bus,
            channels,
        }
    }

    /// Listen until `shutdown` flips to true.
    ///
    /// Connection errors are retried; malformed payloads are skipped.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<(), SyncError> {
        let mut listener = PgListener::connect_with(&self.pool).await?;
        listener
            .listen_all([
                self.channels.send_recorded.as_str(),
                self.channels.number_request_fulfilled.as_str(),
            ])
            .await?;

        info!(
            send_recorded = %self.channels.send_recorded,
            number_request_fulfilled = %self.channels.number_request_fulfilled,
            "notification listener started"
        );

        loop {
            tokio::select! {
                biased;
                _ = async { let _ = shutdown.wait_for(|stop| *stop).await; } => break,
                received = listener.recv() => match received {
                    Ok(notification) => self.forward(notification.channel(), notification.payload()),
                    Err(e) => {
                        error!(error = %e, "notification listener error, retrying");
                        tokio::time::sleep(RETRY_DELAY).await;
                    }
                },
            }
        }

        info!("notification listener stopped");
        Ok(())
    }

    fn forward(&self, channel: &str, payload: &str) {
        match decode_notification(&self.channels, channel, payload) {
            Ok(event) => {
                counters::notification(channel, "ok");
                let receivers = self.bus.publish(event);
                debug!(channel, receivers, "notification forwarded");
            }
            Err(e) => {
                counters::notification(channel, "malformed");
                warn!(channel, payload, error = %e, "skipping notification");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_send_recorded() {
        let channels = ChannelConfig::default();
        let event = decode_notification(
            &channels,
            "send_recorded",
            r#"{"profile_id":"p1","location_id":"loc-a","from_number":"+15550001","is_first_contact_today":true,"to_number":"+1999"}"#,
        )
        .unwrap();
        assert_eq!(
            event,
            CacheEvent::send_recorded("p1", "loc-a", "+15550001", true)
        );
    }

    #[test]
    fn test_decode_number_request_fulfilled() {
        let channels = ChannelConfig::default();
        let event = decode_notification(
            &channels,
            "number_request_fulfilled",
            r#"{"profile_id":"p1","request_id":"r1","location_id":"loc-a","phone_number":"+15550010"}"#,
        )
        .unwrap();
        assert_eq!(
            event,
            CacheEvent::number_request_fulfilled("p1", "r1", "loc-a", "+15550010")
        );
    }

    #[test]
    fn test_decode_malformed_payload() {
        let channels = ChannelConfig::default();
        let err = decode_notification(&channels, "send_recorded", r#"{"profile_id":"p1"}"#)
            .unwrap_err();
        assert!(matches!(err, SyncError::Decode { .. }));

        let err = decode_notification(&channels, "other", "{}").unwrap_err();
        assert!(matches!(err, SyncError::UnknownChannel(_)));
    }

    #[test]
    fn test_decode_custom_channel_names() {
        let channels = ChannelConfig {
            send_recorded: "sends".to_string(),
            number_request_fulfilled: "numbers".to_string(),
        };
        assert!(decode_notification(
            &channels,
            "sends",
            r#"{"profile_id":"p1","location_id":"l","from_number":"+1"}"#
        )
        .is_ok());
        assert!(matches!(
            decode_notification(&channels, "send_recorded", "{}").unwrap_err(),
            SyncError::UnknownChannel(_)
        ));
    }
}
