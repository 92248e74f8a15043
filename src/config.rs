use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::strategy::ALL_STRATEGY_KINDS;

/// Top-level configuration for the probewire agent.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Logging verbosity (debug, info, warn, error). Default: "info".
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Identifies this agent instance at the collector.
    #[serde(default)]
    pub agent_name: String,

    /// Collector connection configuration.
    #[serde(default)]
    pub collector: CollectorConfig,

    /// Record delivery configuration.
    #[serde(default)]
    pub delivery: DeliveryConfig,

    /// Identifier registration configuration.
    #[serde(default)]
    pub registration: RegistrationConfig,

    /// Platform data provider configuration.
    #[serde(default)]
    pub platform: PlatformConfig,
}

/// Collector connection configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct CollectorConfig {
    /// Collector host name or address.
    #[serde(default)]
    pub host: String,

    /// Collector TCP port. Default: 9070.
    #[serde(default = "default_collector_port")]
    pub port: u16,
}

/// Record delivery configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DeliveryConfig {
    /// Interval between delivery cycles. Default: 5s.
    #[serde(default = "default_send_interval", with = "humantime_serde")]
    pub send_interval: Duration,

    /// Interval between platform data refreshes. Default: 30s.
    #[serde(default = "default_refresh_interval", with = "humantime_serde")]
    pub refresh_interval: Duration,

    /// Batch shaping strategy ("direct" or "size"). Default: "size".
    #[serde(default = "default_strategy")]
    pub strategy: String,

    /// Maximum records per batch for the "size" strategy. Default: 500.
    #[serde(default = "default_max_records")]
    pub max_records: usize,
}

/// Identifier registration configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct RegistrationConfig {
    /// Fixed wait between registration retries. Default: 10s.
    #[serde(default = "default_registration_backoff", with = "humantime_serde")]
    pub backoff: Duration,
}

/// Platform data provider configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct PlatformConfig {
    /// Sample process memory usage. Default: true.
    #[serde(default = "default_true")]
    pub memory: bool,

    /// Sample process CPU time. Default: true.
    #[serde(default = "default_true")]
    pub cpu: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_collector_port() -> u16 {
    9070
}

fn default_send_interval() -> Duration {
    Duration::from_secs(5)
}

fn default_refresh_interval() -> Duration {
    Duration::from_secs(30)
}

fn default_strategy() -> String {
    "size".to_string()
}

fn default_max_records() -> usize {
    500
}

fn default_registration_backoff() -> Duration {
    Duration::from_secs(10)
}

fn default_true() -> bool {
    true
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: default_collector_port(),
        }
    }
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            send_interval: default_send_interval(),
            refresh_interval: default_refresh_interval(),
            strategy: default_strategy(),
            max_records: default_max_records(),
        }
    }
}

impl Default for RegistrationConfig {
    fn default() -> Self {
        Self {
            backoff: default_registration_backoff(),
        }
    }
}

impl Default for PlatformConfig {
    fn default() -> Self {
        Self {
            memory: true,
            cpu: true,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            agent_name: String::new(),
            collector: CollectorConfig::default(),
            delivery: DeliveryConfig::default(),
            registration: RegistrationConfig::default(),
            platform: PlatformConfig::default(),
        }
    }
}

// --- Validation and loading ---

impl Config {
    /// Load configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        let cfg: Config = serde_yaml::from_str(&data)
            .with_context(|| format!("parsing config file {}", path.display()))?;

        cfg.validate()?;

        Ok(cfg)
    }

    /// Validate the configuration for required fields and consistency.
    pub fn validate(&self) -> Result<()> {
        if self.agent_name.is_empty() {
            bail!("agent_name is required");
        }

        if self.collector.host.is_empty() {
            bail!("collector.host is required");
        }

        if self.collector.port == 0 {
            bail!("collector.port must be positive");
        }

        if self.delivery.send_interval.is_zero() {
            bail!("delivery.send_interval must be positive");
        }

        if self.delivery.refresh_interval.is_zero() {
            bail!("delivery.refresh_interval must be positive");
        }

        if !ALL_STRATEGY_KINDS.contains(&self.delivery.strategy.as_str()) {
            bail!(
                "unknown delivery.strategy: {} (expected one of {:?})",
                self.delivery.strategy,
                ALL_STRATEGY_KINDS
            );
        }

        if self.delivery.strategy == "size" && self.delivery.max_records == 0 {
            bail!("delivery.max_records must be positive for the size strategy");
        }

        if self.registration.backoff.is_zero() {
            bail!("registration.backoff must be positive");
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_yaml() -> &'static str {
        r#"
agent_name: checkout-service
collector:
  host: apm.internal
  port: 9070
delivery:
  send_interval: 5s
  refresh_interval: 30s
  strategy: size
  max_records: 250
registration:
  backoff: 10s
"#
    }

    #[test]
    fn test_full_config_parses() {
        let cfg: Config = serde_yaml::from_str(valid_yaml()).expect("parses");
        cfg.validate().expect("valid");
        assert_eq!(cfg.agent_name, "checkout-service");
        assert_eq!(cfg.collector.port, 9070);
        assert_eq!(cfg.delivery.send_interval, Duration::from_secs(5));
        assert_eq!(cfg.delivery.max_records, 250);
        assert_eq!(cfg.registration.backoff, Duration::from_secs(10));
        assert!(cfg.platform.memory);
        assert!(cfg.platform.cpu);
    }

    #[test]
    fn test_defaults_applied() {
        let cfg: Config =
            serde_yaml::from_str("agent_name: a\ncollector:\n  host: h\n").expect("parses");
        cfg.validate().expect("valid");
        assert_eq!(cfg.log_level, "info");
        assert_eq!(cfg.delivery.strategy, "size");
        assert_eq!(cfg.delivery.max_records, 500);
        assert_eq!(cfg.registration.backoff, Duration::from_secs(10));
    }

    #[test]
    fn test_missing_agent_name_rejected() {
        let cfg: Config = serde_yaml::from_str("collector:\n  host: h\n").expect("parses");
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_missing_host_rejected() {
        let cfg: Config = serde_yaml::from_str("agent_name: a\n").expect("parses");
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_unknown_strategy_rejected() {
        let mut cfg: Config =
            serde_yaml::from_str("agent_name: a\ncollector:\n  host: h\n").expect("parses");
        cfg.delivery.strategy = "reflective".to_string();
        let err = cfg.validate().expect_err("rejected");
        assert!(err.to_string().contains("unknown delivery.strategy"));
    }

    #[test]
    fn test_zero_backoff_rejected() {
        let mut cfg: Config =
            serde_yaml::from_str("agent_name: a\ncollector:\n  host: h\n").expect("parses");
        cfg.registration.backoff = Duration::ZERO;
        assert!(cfg.validate().is_err());
    }
}
