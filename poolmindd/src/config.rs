//! Layered configuration: built-in defaults, then `pool-minder.toml`
//! (or the file named by `POOLMIND_CONFIG`), then `POOLMIND_` prefixed
//! environment variables, with `__` separating nested keys (e.g.
//! `POOLMIND_MONITOR__POLL_INTERVAL_SECS=15`).
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::Duration;

use poolmind_broker::{
    CorrelatorConfig, DiscoveryConfig, Endpoint, RetryConfig, TransportKind, DEFAULT_WS_PORT,
};

pub const CONFIG_PATH_ENV: &str = "POOLMIND_CONFIG";
pub const DEFAULT_CONFIG_FILE: &str = "pool-minder.toml";
const ENV_PREFIX: &str = "POOLMIND_";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Figment Error")]
    Figment(#[from] figment::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    /// Discovered over mDNS when unset
    pub host: Option<String>,
    pub port: u16,
    pub transport: TransportKind,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            host: None,
            port: DEFAULT_WS_PORT,
            transport: TransportKind::WebSocket,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoverySettings {
    pub hostname: String,
    pub timeout_secs: u64,
    pub retry_interval_secs: u64,
    pub auto_rediscovery: bool,
    /// Consecutive poll failures before looking for the controller again
    pub failure_threshold: u32,
}

impl Default for DiscoverySettings {
    fn default() -> Self {
        Self {
            hostname: "pentair.local".to_string(),
            timeout_secs: 60,
            retry_interval_secs: 2,
            auto_rediscovery: true,
            failure_threshold: 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_factor: f64,
    pub health_check_interval_secs: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay_ms: 1000,
            max_delay_ms: 30_000,
            backoff_factor: 2.0,
            health_check_interval_secs: 30,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorSettings {
    pub poll_interval_secs: u64,
    pub reconnect_delay_secs: u64,
    /// Idle time on the push connection before a health check
    pub listen_timeout_secs: u64,
    pub max_skips: usize,
    pub read_deadline_secs: u64,
    pub stale_request_secs: u64,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            poll_interval_secs: 60,
            reconnect_delay_secs: 5,
            listen_timeout_secs: 120,
            max_skips: 10,
            read_deadline_secs: 10,
            stale_request_secs: 120,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    pub dir: String,
    pub prefix: String,
    pub level: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            dir: "./logs".to_string(),
            prefix: "pool-minder".to_string(),
            level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub controller: ControllerConfig,
    pub discovery: DiscoverySettings,
    pub retry: RetrySettings,
    pub monitor: MonitorSettings,
    pub logging: LoggingSettings,
}

impl Config {
    pub fn figment() -> Figment {
        let path =
            std::env::var(CONFIG_PATH_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_FILE.to_string());
        Figment::from(Serialized::defaults(Config::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).ignore(&["config"]).split("__"))
    }

    pub fn load() -> Result<Self, ConfigError> {
        let config: Config = Self::figment().extract()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::Invalid(msg.to_string()));

        if self.controller.host.as_deref().map(str::is_empty).unwrap_or(false) {
            return invalid("controller.host is empty");
        }
        if self.controller.host.is_none() && self.discovery.hostname.trim().is_empty() {
            return invalid("no controller.host and no discovery.hostname");
        }
        if self.discovery.timeout_secs == 0 || self.discovery.retry_interval_secs == 0 {
            return invalid("discovery timeouts must be non-zero");
        }
        if self.discovery.failure_threshold == 0 {
            return invalid("discovery.failure_threshold must be at least 1");
        }
        if !(self.retry.backoff_factor >= 1.0 && self.retry.backoff_factor.is_finite()) {
            return invalid("retry.backoff_factor must be >= 1");
        }
        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            return invalid("retry.base_delay_ms exceeds retry.max_delay_ms");
        }
        if self.monitor.poll_interval_secs == 0
            || self.monitor.listen_timeout_secs == 0
            || self.monitor.read_deadline_secs == 0
        {
            return invalid("monitor intervals must be non-zero");
        }
        Ok(())
    }

    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_retries: self.retry.max_retries,
            base_delay: Duration::from_millis(self.retry.base_delay_ms),
            max_delay: Duration::from_millis(self.retry.max_delay_ms),
            backoff_factor: self.retry.backoff_factor,
            health_check_interval: Duration::from_secs(self.retry.health_check_interval_secs),
        }
    }

    pub fn discovery_config(&self) -> DiscoveryConfig {
        DiscoveryConfig {
            hostname: self.discovery.hostname.clone(),
            timeout: Duration::from_secs(self.discovery.timeout_secs),
            retry_interval: Duration::from_secs(self.discovery.retry_interval_secs),
            ..Default::default()
        }
    }

    pub fn correlator_config(&self) -> CorrelatorConfig {
        CorrelatorConfig {
            max_skips: self.monitor.max_skips,
            read_deadline: Duration::from_secs(self.monitor.read_deadline_secs),
        }
    }

    pub fn endpoint(&self, host: &str) -> Endpoint {
        Endpoint::new(host, self.controller.port, self.controller.transport)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.monitor.poll_interval_secs)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.monitor.reconnect_delay_secs)
    }

    pub fn listen_timeout(&self) -> Duration {
        Duration::from_secs(self.monitor.listen_timeout_secs)
    }

    pub fn stale_request_age(&self) -> Duration {
        Duration::from_secs(self.monitor.stale_request_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;

    #[test]
    fn defaults_without_file_or_env() {
        Jail::expect_with(|_jail| {
            let config = Config::load().map_err(|e| e.to_string())?;
            assert_eq!(config, Config::default());
            assert_eq!(config.retry_config(), RetryConfig::default());
            assert_eq!(config.correlator_config(), CorrelatorConfig::default());
            Ok(())
        });
    }

    #[test]
    fn file_then_env_layering() {
        Jail::expect_with(|jail| {
            jail.create_file(
                DEFAULT_CONFIG_FILE,
                r#"
                [controller]
                host = "192.168.50.118"
                transport = "tcp"
                port = 6681

                [monitor]
                poll_interval_secs = 30
                "#,
            )?;
            jail.set_env("POOLMIND_MONITOR__POLL_INTERVAL_SECS", "15");
            jail.set_env("POOLMIND_DISCOVERY__AUTO_REDISCOVERY", "false");

            let config = Config::load().map_err(|e| e.to_string())?;
            assert_eq!(config.controller.host.as_deref(), Some("192.168.50.118"));
            assert_eq!(config.controller.transport, TransportKind::Tcp);
            assert_eq!(config.monitor.poll_interval_secs, 15);
            assert!(!config.discovery.auto_rediscovery);
            assert_eq!(config.monitor.listen_timeout_secs, 120);
            assert_eq!(
                config.endpoint("192.168.50.118").to_string(),
                "tcp://192.168.50.118:6681"
            );
            Ok(())
        });
    }

    #[test]
    fn config_path_from_env() {
        Jail::expect_with(|jail| {
            jail.create_file("other.toml", "[discovery]\nhostname = \"controller.local\"\n")?;
            jail.set_env(CONFIG_PATH_ENV, "other.toml");
            let config = Config::load().map_err(|e| e.to_string())?;
            assert_eq!(config.discovery.hostname, "controller.local");
            Ok(())
        });
    }

    #[test]
    fn invalid_values_are_rejected() {
        Jail::expect_with(|jail| {
            jail.set_env("POOLMIND_RETRY__BACKOFF_FACTOR", "0.5");
            assert!(matches!(Config::load(), Err(ConfigError::Invalid(_))));
            Ok(())
        });

        let mut config = Config::default();
        config.monitor.poll_interval_secs = 0;
        assert!(config.validate().is_err());
    }
}
