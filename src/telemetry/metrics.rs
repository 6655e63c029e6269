use anyhow::Result;
use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Json, Router};
use opentelemetry::metrics::MeterProvider;
use opentelemetry_prometheus::exporter;
use opentelemetry_sdk::metrics::SdkMeterProvider;
use prometheus::{Encoder, Registry, TextEncoder};
use serde::Serialize;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Instant;
use tokio::sync::watch;
use tracing::{info, warn};

/// Metrics configuration
#[derive(Debug, Clone)]
pub struct MetricsConfig {
    /// HTTP endpoint address
    pub address: SocketAddr,
}

/// Dependency status for readiness checks
#[derive(Debug, Clone, Serialize)]
pub struct DependencyStatus {
    pub name: String,
    pub healthy: bool,
    pub message: Option<String>,
}

/// Admin state for health/stats endpoints
#[derive(Debug)]
pub struct AdminState {
    start_time: Instant,
    healthy: AtomicBool,
    ready: AtomicBool,
    selections: AtomicU64,
    selections_exhausted: AtomicU64,
    hydrations: AtomicU64,
    hydrated_profiles: AtomicU64,
    /// Dependency name -> healthy
    dependencies: RwLock<HashMap<String, bool>>,
}

impl AdminState {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            healthy: AtomicBool::new(true),
            ready: AtomicBool::new(false),
            selections: AtomicU64::new(0),
            selections_exhausted: AtomicU64::new(0),
            hydrations: AtomicU64::new(0),
            hydrated_profiles: AtomicU64::new(0),
            dependencies: RwLock::new(HashMap::new()),
        }
    }

    pub fn uptime_secs(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Relaxed)
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::Relaxed);
    }

    /// Ready once startup completed and every dependency is healthy.
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Relaxed)
            && self.dependencies.read().unwrap().values().all(|h| *h)
    }

    /// Mark startup as complete.
    pub fn mark_ready(&self) {
        self.ready.store(true, Ordering::Relaxed);
    }

    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::Relaxed);
    }

    /// Update (or register) a dependency's health.
    pub fn set_dependency(&self, name: &str, healthy: bool) {
        self.dependencies
            .write()
            .unwrap()
            .insert(name.to_string(), healthy);
    }

    /// Get dependency status for readiness response
    pub fn get_dependency_status(&self) -> Vec<DependencyStatus> {
        let dependencies = self.dependencies.read().unwrap();
        let mut status: Vec<_> = dependencies
            .iter()
            .map(|(name, healthy)| DependencyStatus {
                name: name.clone(),
                healthy: *healthy,
                message: if *healthy {
                    None
                } else {
                    Some("dependency unhealthy or unreachable".to_string())
                },
            })
            .collect();
        status.sort_by(|a, b| a.name.cmp(&b.name));
        status
    }

    pub fn inc_selections(&self, exhausted: bool) {
        self.selections.fetch_add(1, Ordering::Relaxed);
        if exhausted {
            self.selections_exhausted.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn inc_hydrations(&self) {
        self.hydrations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_hydrated_profiles(&self, count: usize) {
        self.hydrated_profiles.store(count as u64, Ordering::Relaxed);
    }
}

impl Default for AdminState {
    fn default() -> Self {
        Self::new()
    }
}

/// OTEL Metrics with Prometheus exporter
pub struct Metrics {
    registry: Registry,
    meter_provider: SdkMeterProvider,
    address: SocketAddr,
    admin_state: Arc<AdminState>,
}

impl Metrics {
    /// Create metrics with OTEL → Prometheus pipeline
    pub fn new(config: &MetricsConfig) -> Result<Arc<Self>> {
        let registry = Registry::new();

        let exporter = exporter().with_registry(registry.clone()).build()?;

        let meter_provider = SdkMeterProvider::builder().with_reader(exporter).build();

        // Register as global meter provider
        opentelemetry::global::set_meter_provider(meter_provider.clone());

        info!(
            address = %config.address,
            "OTEL metrics configured with Prometheus exporter"
        );

        Ok(Arc::new(Self {
            registry,
            meter_provider,
            address: config.address,
            admin_state: Arc::new(AdminState::new()),
        }))
    }

    /// Get admin state for updating metrics from other components
    pub fn admin_state(&self) -> Arc<AdminState> {
        self.admin_state.clone()
    }

    /// Get a meter for recording metrics
    pub fn meter(&self, name: &'static str) -> opentelemetry::metrics::Meter {
        self.meter_provider.meter(name)
    }

    /// Render metrics in Prometheus format
    pub fn render(&self) -> String {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();

        let mut buffer = Vec::new();
        if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
            warn!(error = %e, "failed to encode metrics");
        }

        String::from_utf8_lossy(&buffer).into_owned()
    }

    /// Admin router: metrics, health and stats endpoints.
    pub fn router(self: &Arc<Self>) -> Router {
        let metrics = self.clone();

        Router::new()
            // Prometheus metrics
            .route(
                "/metrics",
                get(move || {
                    let m = metrics.clone();
                    async move { m.render() }
                }),
            )
            // Kubernetes-style health endpoints
            .route("/healthz", get(healthz_handler))
            .route("/livez", get(livez_handler))
            .route("/readyz", get(readyz_handler))
            .route("/stats", get(stats_handler))
            .with_state(self.admin_state.clone())
    }

    /// Start the admin HTTP server, stopping when `shutdown` flips to true.
    pub async fn serve(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let app = self.router();
        let listener = tokio::net::TcpListener::bind(self.address).await?;

        info!(address = %self.address, "admin server started");

        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown.wait_for(|stop| *stop).await;
            })
            .await?;

        Ok(())
    }
}

// ============================================================================
// Admin API Response Types
// ============================================================================

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

#[derive(Debug, Serialize)]
struct ReadinessResponse {
    ready: bool,
    dependencies: Vec<DependencyStatus>,
}

#[derive(Debug, Serialize)]
struct StatsResponse {
    uptime_seconds: u64,
    hydrated_profiles: u64,
    hydrations: u64,
    selections: SelectionStats,
}

#[derive(Debug, Serialize)]
struct SelectionStats {
    total: u64,
    exhausted: u64,
}

// ============================================================================
// Admin API Handlers
// ============================================================================

async fn healthz_handler(State(state): State<Arc<AdminState>>) -> impl IntoResponse {
    let response = HealthResponse {
        status: if state.is_healthy() {
            "healthy".to_string()
        } else {
            "unhealthy".to_string()
        },
        version: env!("CARGO_PKG_VERSION").to_string(),
    };

    if state.is_healthy() {
        (StatusCode::OK, Json(response))
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, Json(response))
    }
}

async fn livez_handler() -> impl IntoResponse {
    StatusCode::OK
}

async fn readyz_handler(State(state): State<Arc<AdminState>>) -> impl IntoResponse {
    let ready = state.is_ready();
    let response = ReadinessResponse {
        ready,
        dependencies: state.get_dependency_status(),
    };

    if ready {
        (StatusCode::OK, Json(response))
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, Json(response))
    }
}

async fn stats_handler(State(state): State<Arc<AdminState>>) -> impl IntoResponse {
    Json(StatsResponse {
        uptime_seconds: state.uptime_secs(),
        hydrated_profiles: state.hydrated_profiles.load(Ordering::Relaxed),
        hydrations: state.hydrations.load(Ordering::Relaxed),
        selections: SelectionStats {
            total: state.selections.load(Ordering::Relaxed),
            exhausted: state.selections_exhausted.load(Ordering::Relaxed),
        },
    })
}

impl Drop for Metrics {
    fn drop(&mut self) {
        if let Err(e) = self.meter_provider.shutdown() {
            tracing::warn!(error = %e, "failed to shutdown meter provider");
        }
    }
}

/// Admission-cache metrics with numberd_* prefix.
///
/// Recording functions are no-ops until [`init`] has been called, so library
/// code and tests can record unconditionally.
pub mod counters {
    use opentelemetry::metrics::{Counter, Gauge, Histogram};
    use opentelemetry::KeyValue;
    use std::sync::OnceLock;

    // ============================================================================
    // SELECTION METRICS
    // ============================================================================

    static SELECTIONS_TOTAL: OnceLock<Counter<u64>> = OnceLock::new();
    static SELECTION_DURATION: OnceLock<Histogram<f64>> = OnceLock::new();

    // ============================================================================
    // HYDRATION METRICS
    // ============================================================================

    static HYDRATIONS_TOTAL: OnceLock<Counter<u64>> = OnceLock::new();
    static HYDRATION_DURATION: OnceLock<Histogram<f64>> = OnceLock::new();
    static HYDRATED_NUMBERS: OnceLock<Gauge<i64>> = OnceLock::new();
    static RECENT_SEGMENTS: OnceLock<Gauge<i64>> = OnceLock::new();
    static ROLLOVERS_TOTAL: OnceLock<Counter<u64>> = OnceLock::new();

    // ============================================================================
    // SYNC METRICS
    // ============================================================================

    static SYNC_EVENTS_TOTAL: OnceLock<Counter<u64>> = OnceLock::new();
    static SYNC_EVENTS_DROPPED_TOTAL: OnceLock<Counter<u64>> = OnceLock::new();
    static NOTIFICATIONS_TOTAL: OnceLock<Counter<u64>> = OnceLock::new();

    // ============================================================================
    // CONFIG METRICS
    // ============================================================================

    static PROFILE_CONFIG_ERRORS_TOTAL: OnceLock<Counter<u64>> = OnceLock::new();

    /// Initialize all metrics
    pub fn init(meter: &opentelemetry::metrics::Meter) {
        let _ = SELECTIONS_TOTAL.set(
            meter
                .u64_counter("numberd_selections_total")
                .with_description("Number selections by result")
                .build(),
        );
        let _ = SELECTION_DURATION.set(
            meter
                .f64_histogram("numberd_selection_duration_seconds")
                .with_description("Atomic selection latency")
                .build(),
        );

        let _ = HYDRATIONS_TOTAL.set(
            meter
                .u64_counter("numberd_hydrations_total")
                .with_description("Hydration runs by result")
                .build(),
        );
        let _ = HYDRATION_DURATION.set(
            meter
                .f64_histogram("numberd_hydration_duration_seconds")
                .with_description("Hydration duration")
                .build(),
        );
        let _ = HYDRATED_NUMBERS.set(
            meter
                .i64_gauge("numberd_hydrated_numbers")
                .with_description("Numbers in the usage index after the last hydration")
                .build(),
        );
        let _ = RECENT_SEGMENTS.set(
            meter
                .i64_gauge("numberd_recent_segments")
                .with_description("Segments sent inside the throughput window at last hydration")
                .build(),
        );
        let _ = ROLLOVERS_TOTAL.set(
            meter
                .u64_counter("numberd_rollovers_total")
                .with_description("Day-rollover re-hydrations by result")
                .build(),
        );

        let _ = SYNC_EVENTS_TOTAL.set(
            meter
                .u64_counter("numberd_sync_events_total")
                .with_description("Cache events handled by kind and result")
                .build(),
        );
        let _ = SYNC_EVENTS_DROPPED_TOTAL.set(
            meter
                .u64_counter("numberd_sync_events_dropped_total")
                .with_description("Cache events lost by lagging subscribers")
                .build(),
        );
        let _ = NOTIFICATIONS_TOTAL.set(
            meter
                .u64_counter("numberd_notifications_total")
                .with_description("Database notifications by channel and result")
                .build(),
        );

        let _ = PROFILE_CONFIG_ERRORS_TOTAL.set(
            meter
                .u64_counter("numberd_profile_config_errors_total")
                .with_description("Invalid profile configurations refused")
                .build(),
        );
    }

    /// Record a selection outcome (`selected`, `exhausted` or `error`)
    pub fn selection(profile_id: &str, result: &str, duration_secs: f64) {
        if let Some(c) = SELECTIONS_TOTAL.get() {
            c.add(1, &[kv("profile", profile_id), kv("result", result)]);
        }
        if let Some(h) = SELECTION_DURATION.get() {
            h.record(duration_secs, &[kv("result", result)]);
        }
    }

    /// Record a completed or failed hydration
    pub fn hydration(profile_id: &str, result: &str, duration_secs: f64) {
        if let Some(c) = HYDRATIONS_TOTAL.get() {
            c.add(1, &[kv("profile", profile_id), kv("result", result)]);
        }
        if let Some(h) = HYDRATION_DURATION.get() {
            h.record(duration_secs, &[kv("profile", profile_id)]);
        }
    }

    /// Record the number count of a hydrated profile
    pub fn hydrated_numbers(profile_id: &str, numbers: usize) {
        if let Some(g) = HYDRATED_NUMBERS.get() {
            g.record(numbers as i64, &[kv("profile", profile_id)]);
        }
    }

    /// Record total recent segments for one location
    pub fn recent_segments(profile_id: &str, location_id: &str, segments: u64) {
        if let Some(g) = RECENT_SEGMENTS.get() {
            g.record(
                segments as i64,
                &[kv("profile", profile_id), kv("location", location_id)],
            );
        }
    }

    /// Record a day-rollover re-hydration
    pub fn rollover(profile_id: &str, result: &str) {
        if let Some(c) = ROLLOVERS_TOTAL.get() {
            c.add(1, &[kv("profile", profile_id), kv("result", result)]);
        }
    }

    /// Record a handled cache event
    pub fn sync_event(kind: &str, result: &str) {
        if let Some(c) = SYNC_EVENTS_TOTAL.get() {
            c.add(1, &[kv("kind", kind), kv("result", result)]);
        }
    }

    /// Record events skipped by a lagging subscriber
    pub fn sync_events_dropped(profile_id: &str, count: u64) {
        if let Some(c) = SYNC_EVENTS_DROPPED_TOTAL.get() {
            c.add(count, &[kv("profile", profile_id)]);
        }
    }

    /// Record a database notification
    pub fn notification(channel: &str, result: &str) {
        if let Some(c) = NOTIFICATIONS_TOTAL.get() {
            c.add(1, &[kv("channel", channel), kv("result", result)]);
        }
    }

    /// Record an invalid profile configuration
    pub fn profile_config_error(profile_id: &str) {
        if let Some(c) = PROFILE_CONFIG_ERRORS_TOTAL.get() {
            c.add(1, &[kv("profile", profile_id)]);
        }
    }

    // Helper function to create KeyValue
    #[inline]
    fn kv(key: &'static str, value: &str) -> KeyValue {
        KeyValue::new(key, value.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_readiness_requires_dependencies() {
        let state = AdminState::new();
        assert!(!state.is_ready());

        state.mark_ready();
        assert!(state.is_ready());

        state.set_dependency("database", false);
        assert!(!state.is_ready());
        let status = state.get_dependency_status();
        assert_eq!(status.len(), 1);
        assert!(status[0].message.is_some());

        state.set_dependency("database", true);
        assert!(state.is_ready());
    }

    #[test]
    fn test_selection_counts() {
        let state = AdminState::new();
        state.inc_selections(false);
        state.inc_selections(true);
        assert_eq!(state.selections.load(Ordering::Relaxed), 2);
        assert_eq!(state.selections_exhausted.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_counters_are_noops_before_init() {
        counters::selection("p1", "selected", 0.001);
        counters::sync_event("send_recorded", "ok");
        counters::sync_events_dropped("p1", 3);
    }
}
