//! Day-rollover re-hydration.
//!
//! Usage scores count distinct recipients per local day and are never
//! decremented by events. At each local midnight every tracked profile is
//! re-hydrated so the scores restart from the new day's sends.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::hydrator::{local_day_start, HydrateError};
use crate::telemetry::counters;

/// Slack added after midnight so the new local day has begun on wake-up.
const WAKE_GRACE: Duration = Duration::from_secs(1);

/// Something that owns tracked profiles and can re-hydrate them.
#[async_trait]
pub trait RolloverTarget: Send + Sync {
    /// Profiles to re-hydrate at rollover.
    fn tracked_profiles(&self) -> Vec<String>;

    async fn rehydrate(&self, profile_id: &str) -> Result<(), HydrateError>;
}

/// Result of one rollover pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RolloverStats {
    pub hydrated: usize,
    pub failed: usize,
}

/// First instant of the next local day after `now`, in UTC.
pub fn next_local_midnight(tz: Tz, now: DateTime<Utc>) -> DateTime<Utc> {
    // Local days last 23 to 25 hours, so +26h always lands in the next one
    let today = local_day_start(tz, now);
    local_day_start(tz, today + chrono::Duration::hours(26))
}

/// Re-hydrates tracked profiles at local midnight.
pub struct RolloverScheduler {
    target: Arc<dyn RolloverTarget>,
    tz: Tz,
}

impl RolloverScheduler {
    pub fn new(target: Arc<dyn RolloverTarget>, tz: Tz) -> Self {
        Self { target, tz }
    }

    /// Re-hydrate every tracked profile once.
    ///
    /// A failed profile is logged and counted; the rest still run.
    pub async fn run_once(&self) -> RolloverStats {
        let mut stats = RolloverStats::default();

        for profile_id in self.target.tracked_profiles() {
            match self.target.rehydrate(&profile_id).await {
                Ok(()) => {
                    stats.hydrated += 1;
                    counters::rollover(&profile_id, "ok");
                }
                Err(e) => {
                    stats.failed += 1;
                    counters::rollover(&profile_id, "error");
                    error!(profile_id = %profile_id, error = %e, "rollover hydration failed");
                }
            }
        }

        info!(
            hydrated = stats.hydrated,
            failed = stats.failed,
            "day rollover complete"
        );
        stats
    }

    /// Run until `shutdown` flips to true.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        loop {
            let now = Utc::now();
            let next = next_local_midnight(self.tz, now);
            let wait = (next - now).to_std().unwrap_or_default() + WAKE_GRACE;

            info!(next_rollover = %next, tz = %self.tz, "rollover scheduled");

            tokio::select! {
                _ = async { let _ = shutdown.wait_for(|stop| *stop).await; } => break,
                _ = tokio::time::sleep(wait) => {
                    self.run_once().await;
                }
            }
        }

        info!("rollover scheduler stopped");
    }

    /// Spawn the scheduler loop.
    pub fn start(self, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }
}
