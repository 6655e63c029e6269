use anyhow::Result;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, span, warn, Level};

use crate::cache::create_cache;
use crate::config::Config;
use crate::records::{MemoryRecordStore, PgRecordStore, SharedRecordStore};
use crate::scheduler::RolloverScheduler;
use crate::sync::{EventBus, PgNotificationListener};
use crate::telemetry::{counters, Metrics, MetricsConfig};

use super::shutdown::ShutdownManager;
use super::state::{NumberService, ServiceOptions};

/// Main numberd server
///
/// Components:
/// - Record store: PostgreSQL when configured, in-memory otherwise
/// - Number cache: memory or fjall backend
/// - Notification listener: LISTEN/NOTIFY to event bus
/// - Rollover scheduler: re-hydration at local midnight
/// - Admin server: Prometheus metrics and health endpoints
/// - Shutdown manager: graceful drain with configurable timeout
pub struct Server {
    config: Arc<Config>,
    shutdown: ShutdownManager,
}

impl Server {
    /// Create a new server instance
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;
        let shutdown = ShutdownManager::new(config.shutdown.drain_timeout);

        Ok(Self {
            config: Arc::new(config),
            shutdown,
        })
    }

    /// Run the server until shutdown
    pub async fn run(self) -> Result<()> {
        let span = span!(Level::INFO, "numberd", version = env!("CARGO_PKG_VERSION"));
        let _enter = span.enter();

        let tz = self.config.tz()?;
        info!(
            timezone = %tz,
            cache = ?self.config.cache.backend,
            profiles = self.config.hydrate_on_start.len(),
            "starting numberd server"
        );

        let metrics = Metrics::new(&MetricsConfig {
            address: self.config.admin.address,
        })?;
        counters::init(&metrics.meter("numberd"));
        let admin = metrics.admin_state();

        // Record store
        let (records, pool) = match &self.config.database.url {
            Some(url) => {
                let store = PgRecordStore::connect(
                    url,
                    self.config.database.max_connections,
                    self.config.database.acquire_timeout,
                )
                .await?;
                admin.set_dependency("database", true);
                let pool = store.pool().clone();
                let records: SharedRecordStore = Arc::new(store);
                (records, Some(pool))
            }
            None => {
                warn!("no database configured, using in-memory record store");
                let records: SharedRecordStore = Arc::new(MemoryRecordStore::new());
                (records, None)
            }
        };

        info!(backend = records.name(), "record store ready");

        let cache = create_cache(&self.config.cache)?;
        let bus = EventBus::new(self.config.event_bus_capacity);

        let service = Arc::new(
            NumberService::new(
                records,
                cache,
                bus.clone(),
                ServiceOptions::from_config(&self.config)?,
            )
            .with_admin(admin.clone()),
        );

        // Admin server
        if self.config.admin.enabled {
            let metrics = metrics.clone();
            self.shutdown.spawn("admin", move |stop| async move {
                if let Err(e) = metrics.serve(stop).await {
                    error!(error = %e, "admin server failed");
                }
            });
        }

        // Notifications feed the bus before the first hydration
        match pool {
            Some(pool) if self.config.database.listen => {
                let listener =
                    PgNotificationListener::new(pool, bus, self.config.database.channels.clone());
                let admin = admin.clone();
                self.shutdown.spawn("listener", move |stop| async move {
                    if let Err(e) = listener.run(stop).await {
                        error!(error = %e, "notification listener failed");
                        admin.set_dependency("database", false);
                    }
                });
            }
            _ => info!("notification listener disabled"),
        }

        for profile_id in &self.config.hydrate_on_start {
            match service.track(profile_id).await {
                Ok(report) => info!(
                    profile_id = %profile_id,
                    locations = report.locations,
                    numbers = report.numbers,
                    "profile tracked"
                ),
                Err(e) => error!(profile_id = %profile_id, error = %e, "startup hydration failed"),
            }
        }

        if self.config.rollover.enabled {
            let scheduler = RolloverScheduler::new(service.clone(), tz);
            self.shutdown
                .spawn("rollover", move |stop| scheduler.run(stop));
        }

        admin.mark_ready();
        info!(
            admin_address = %self.config.admin.address,
            tasks = self.shutdown.task_count(),
            drain_timeout_secs = self.config.shutdown.drain_timeout.as_secs(),
            "numberd server started"
        );

        // Wait for shutdown signal
        self.wait_for_shutdown().await;

        info!("shutdown signal received, starting graceful shutdown");

        admin.set_ready(false);
        self.shutdown.start_drain();
        self.shutdown.drain().await;

        if let Err(e) = service.shutdown().await {
            error!(error = %e, "failed to flush cache");
        }

        self.shutdown.terminate();

        // Flush tracing
        crate::telemetry::shutdown_tracing();

        info!("numberd server stopped");

        Ok(())
    }

    /// Wait for shutdown signal (SIGTERM or SIGINT)
    async fn wait_for_shutdown(&self) {
        let ctrl_c = async {
            if let Err(e) = signal::ctrl_c().await {
                error!(error = %e, "failed to install Ctrl+C handler");
                std::future::pending::<()>().await;
            }
        };

        #[cfg(unix)]
        let terminate = async {
            match signal::unix::signal(signal::unix::SignalKind::terminate()) {
                Ok(mut sig) => {
                    sig.recv().await;
                }
                Err(e) => {
                    error!(error = %e, "failed to install SIGTERM handler");
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {
                info!("received SIGINT");
            }
            _ = terminate => {
                info!("received SIGTERM");
            }
        }
    }
}
