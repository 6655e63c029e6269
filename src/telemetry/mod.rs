mod metrics;
mod tracing;

pub use self::metrics::{counters, AdminState, DependencyStatus, Metrics, MetricsConfig};
pub use self::tracing::{init_tracing, shutdown_tracing, TracingConfig};
