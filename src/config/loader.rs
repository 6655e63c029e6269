use anyhow::{Context, Result};
use chrono_tz::Tz;
use std::fs;
use std::path::Path;
use tracing::{debug, info};

use super::types::Config;

impl Config {
    /// Load configuration from a YAML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        debug!(path = %path.display(), "loading configuration");

        let contents = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;

        Self::from_yaml(&contents)
            .with_context(|| format!("failed to parse config file: {}", path.display()))
    }

    /// Parse configuration from YAML string
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: Config =
            serde_yaml::from_str(yaml).context("failed to parse YAML configuration")?;

        config.validate()?;

        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        self.tz()?;

        if self.event_bus_capacity == 0 {
            anyhow::bail!("event_bus_capacity must be greater than zero");
        }

        if self.database.max_connections == 0 {
            anyhow::bail!("database.max_connections must be greater than zero");
        }

        if !(0.0..=1.0).contains(&self.telemetry.trace_sample_rate) {
            anyhow::bail!(
                "telemetry.trace_sample_rate must be between 0.0 and 1.0, got {}",
                self.telemetry.trace_sample_rate
            );
        }

        let mut profiles = std::collections::HashSet::new();
        for profile_id in &self.hydrate_on_start {
            if !profiles.insert(profile_id) {
                anyhow::bail!("duplicate profile in hydrate_on_start: {}", profile_id);
            }
        }

        info!("configuration validated successfully");
        Ok(())
    }

    /// Parsed local-day timezone
    pub fn tz(&self) -> Result<Tz> {
        self.timezone
            .parse::<Tz>()
            .map_err(|e| anyhow::anyhow!("invalid timezone '{}': {}", self.timezone, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CacheBackend;
    use std::time::Duration;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = Config::from_yaml("{}").unwrap();
        assert_eq!(config.timezone, "America/New_York");
        assert_eq!(config.cache.backend, CacheBackend::Memory);
        assert!(config.database.url.is_none());
        assert!(config.profile_config_ttl.is_none());
        assert!(config.rollover.enabled);
        assert_eq!(config.event_bus_capacity, 1024);
        assert_eq!(config.database.channels.send_recorded, "send_recorded");
    }

    #[test]
    fn test_full_config() {
        let yaml = r#"
database:
  url: "postgres://numberd@localhost/gateway"
  max_connections: 4
  acquire_timeout: 2s
  channels:
    send_recorded: sends

cache:
  backend: fjall
  path: /var/lib/numberd

timezone: Europe/London
profile_config_ttl: 5m
hydrate_on_start: [p1, p2]

admin:
  address: "127.0.0.1:9191"

telemetry:
  log_level: debug
  json_logs: true

shutdown:
  drain_timeout: 3s
"#;

        let config = Config::from_yaml(yaml).unwrap();
        assert_eq!(config.database.max_connections, 4);
        assert_eq!(config.database.acquire_timeout, Duration::from_secs(2));
        assert_eq!(config.database.channels.send_recorded, "sends");
        assert_eq!(
            config.database.channels.number_request_fulfilled,
            "number_request_fulfilled"
        );
        assert_eq!(config.cache.backend, CacheBackend::Fjall);
        assert_eq!(config.tz().unwrap(), chrono_tz::Europe::London);
        assert_eq!(config.profile_config_ttl, Some(Duration::from_secs(300)));
        assert_eq!(config.hydrate_on_start, vec!["p1", "p2"]);
        assert_eq!(config.admin.address.port(), 9191);
        assert!(config.telemetry.json_logs);
        assert_eq!(config.shutdown.drain_timeout, Duration::from_secs(3));
    }

    #[test]
    fn test_invalid_timezone() {
        let result = Config::from_yaml("timezone: Mars/Olympus_Mons");
        assert!(result.is_err());
        assert!(format!("{:#}", result.unwrap_err()).contains("invalid timezone"));
    }

    #[test]
    fn test_fjall_without_path_uses_default_dir() {
        let config = Config::from_yaml("cache:\n  backend: fjall\n").unwrap();
        assert_eq!(config.cache.backend, CacheBackend::Fjall);
        assert!(config.cache.path.is_none());
    }

    #[test]
    fn test_example_config_is_valid() {
        let config = Config::from_yaml(include_str!("../../config/numberd.yaml")).unwrap();
        assert!(config.database.url.is_some());
        assert_eq!(config.tz().unwrap(), chrono_tz::America::New_York);
        assert_eq!(config.hydrate_on_start, vec!["1", "2"]);
    }

    #[test]
    fn test_duplicate_hydrate_on_start() {
        let result = Config::from_yaml("hydrate_on_start: [p1, p1]");
        assert!(result.unwrap_err().to_string().contains("duplicate profile"));
    }
}
