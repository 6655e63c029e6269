use serde::Deserialize;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Root configuration for numberd
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Relational system of record
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Derived cache backend
    #[serde(default)]
    pub cache: CacheConfig,

    /// IANA timezone that defines the local day
    #[serde(default = "default_timezone")]
    pub timezone: String,

    /// Profile settings TTL (absent = memoise for the process lifetime)
    #[serde(default, with = "humantime_serde::option")]
    pub profile_config_ttl: Option<Duration>,

    /// Profiles hydrated and attached at startup
    #[serde(default)]
    pub hydrate_on_start: Vec<String>,

    /// Local-midnight re-hydration
    #[serde(default)]
    pub rollover: RolloverConfig,

    /// Capacity of the cache event bus
    #[serde(default = "default_event_bus_capacity")]
    pub event_bus_capacity: usize,

    /// Admin API configuration
    #[serde(default)]
    pub admin: AdminConfig,

    /// Logging and tracing
    #[serde(default)]
    pub telemetry: TelemetryConfig,

    /// Shutdown configuration
    #[serde(default)]
    pub shutdown: ShutdownConfig,
}

fn default_timezone() -> String {
    "America/New_York".to_string()
}

fn default_event_bus_capacity() -> usize {
    1024
}

/// Database configuration
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// PostgreSQL URL. Absent = in-memory record store.
    pub url: Option<String>,

    /// Maximum pool connections
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// Connection acquire timeout
    #[serde(default = "default_acquire_timeout", with = "humantime_serde")]
    pub acquire_timeout: Duration,

    /// Subscribe to change notifications
    #[serde(default = "default_true")]
    pub listen: bool,

    /// Notification channel names
    #[serde(default)]
    pub channels: ChannelConfig,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: None,
            max_connections: default_max_connections(),
            acquire_timeout: default_acquire_timeout(),
            listen: true,
            channels: ChannelConfig::default(),
        }
    }
}

fn default_max_connections() -> u32 {
    10
}

fn default_acquire_timeout() -> Duration {
    Duration::from_secs(5)
}

/// LISTEN channel names
#[derive(Debug, Clone, Deserialize)]
pub struct ChannelConfig {
    #[serde(default = "default_send_recorded_channel")]
    pub send_recorded: String,

    #[serde(default = "default_number_request_fulfilled_channel")]
    pub number_request_fulfilled: String,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            send_recorded: default_send_recorded_channel(),
            number_request_fulfilled: default_number_request_fulfilled_channel(),
        }
    }
}

fn default_send_recorded_channel() -> String {
    "send_recorded".to_string()
}

fn default_number_request_fulfilled_channel() -> String {
    "number_request_fulfilled".to_string()
}

/// Cache backend type
#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CacheBackend {
    #[default]
    Memory,
    Fjall,
}

/// Cache configuration
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CacheConfig {
    #[serde(default)]
    pub backend: CacheBackend,

    /// Data directory for the fjall backend
    pub path: Option<PathBuf>,
}

impl CacheConfig {
    pub fn memory() -> Self {
        Self::default()
    }

    pub fn fjall(path: impl Into<PathBuf>) -> Self {
        Self {
            backend: CacheBackend::Fjall,
            path: Some(path.into()),
        }
    }
}

/// Rollover configuration
#[derive(Debug, Clone, Deserialize)]
pub struct RolloverConfig {
    /// Re-hydrate tracked profiles at local midnight
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl Default for RolloverConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

/// Admin API configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AdminConfig {
    /// HTTP API address
    #[serde(default = "default_admin_address")]
    pub address: SocketAddr,

    /// Serve the admin API
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            address: default_admin_address(),
            enabled: true,
        }
    }
}

fn default_admin_address() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 9090))
}

fn default_true() -> bool {
    true
}

/// Telemetry settings
#[derive(Debug, Clone, Deserialize)]
pub struct TelemetryConfig {
    /// Enable structured JSON logging
    #[serde(default)]
    pub json_logs: bool,

    /// Log level
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// OTLP endpoint for distributed tracing
    pub otlp_endpoint: Option<String>,

    /// Trace sample rate (0.0 - 1.0)
    #[serde(default = "default_sample_rate")]
    pub trace_sample_rate: f64,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            json_logs: false,
            log_level: default_log_level(),
            otlp_endpoint: None,
            trace_sample_rate: default_sample_rate(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_sample_rate() -> f64 {
    1.0
}

/// Shutdown configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ShutdownConfig {
    /// How long to wait for background tasks to stop
    #[serde(default = "default_drain_timeout", with = "humantime_serde")]
    pub drain_timeout: Duration,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            drain_timeout: default_drain_timeout(),
        }
    }
}

fn default_drain_timeout() -> Duration {
    Duration::from_secs(10)
}

/// Humantime serde support module
mod humantime_serde {
    use serde::{self, Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }

    pub mod option {
        use super::*;

        pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
        where
            D: Deserializer<'de>,
        {
            match Option::<String>::deserialize(deserializer)? {
                Some(s) => humantime::parse_duration(&s)
                    .map(Some)
                    .map_err(serde::de::Error::custom),
                None => Ok(None),
            }
        }
    }
}
