use std::net::SocketAddr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::topology::RestartDefaults;

/// Main configuration for the admin node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdminConfig {
    /// Admin HTTP API configuration
    pub api: ApiConfig,
    /// Broker management API access
    pub broker: BrokerConfig,
    /// SSH control channel access
    pub ssh: SshConfig,
    /// Rolling restart policy and budgets
    pub restart: RestartSettings,
    /// Cluster topology source
    pub cluster: ClusterConfig,
    /// Metrics and monitoring
    pub metrics: MetricsConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Admin HTTP API configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// Listen address for the admin API
    pub listen_addr: String,
    /// API key required on write endpoints; bypassed with a warning when unset
    pub api_key: Option<String>,
}

/// Broker management API access
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    /// Cluster-wide management API base URL (any reachable node)
    pub management_base_url: String,
    /// HTTP Basic auth username
    pub username: String,
    /// HTTP Basic auth password
    pub password: String,
    /// systemd unit controlled over SSH
    pub service_name: String,
}

/// SSH control channel access
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SshConfig {
    /// Login user on the broker hosts
    pub user: String,
    /// Private key path; takes precedence over password
    pub key_path: Option<String>,
    /// Password auth fallback
    pub password: Option<String>,
    /// Session dial timeout in seconds
    pub connect_timeout_seconds: u64,
    /// Transport keepalive interval in seconds
    pub keepalive_interval_seconds: u64,
}

/// Rolling restart policy and budgets
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestartSettings {
    /// Feature gate: rolling restarts refuse to start when false
    pub enable_rolling_restart: bool,
    /// Admission requires every node healthy when true
    pub require_all_nodes_healthy: bool,
    /// Admission tolerates reported partitions when true
    pub allow_restart_with_partitions: bool,
    /// Close leftover connections after the drain budget elapses
    pub force_close_connections_after_drain: bool,
    /// Hard cap on force-closed connections per node
    pub force_close_max_connections: u64,
    /// All loop budgets and intervals
    pub timeouts: TimeoutSettings,
}

/// Restart loop budgets and intervals, all in milliseconds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutSettings {
    pub connection_drain_ms: u64,
    pub connection_drain_check_ms: u64,
    pub post_restart_validation_ms: u64,
    pub inter_node_ms: u64,
    pub node_startup_ms: u64,
    pub health_check_interval_ms: u64,
    pub api_timeout_ms: u64,
}

/// Cluster topology source
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Path to the YAML topology file
    pub topology_path: String,
}

/// Metrics configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Enable the Prometheus listener
    pub enabled: bool,
    /// Metrics server address
    pub listen_addr: String,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
}

impl TimeoutSettings {
    pub fn connection_drain(&self) -> Duration {
        Duration::from_millis(self.connection_drain_ms)
    }

    pub fn connection_drain_check(&self) -> Duration {
        Duration::from_millis(self.connection_drain_check_ms)
    }

    pub fn post_restart_validation(&self) -> Duration {
        Duration::from_millis(self.post_restart_validation_ms)
    }

    pub fn inter_node(&self) -> Duration {
        Duration::from_millis(self.inter_node_ms)
    }

    pub fn node_startup(&self) -> Duration {
        Duration::from_millis(self.node_startup_ms)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms)
    }

    pub fn api_timeout(&self) -> Duration {
        Duration::from_millis(self.api_timeout_ms)
    }

    /// Apply the topology file's restart defaults over this record.
    pub fn apply_topology_defaults(&mut self, defaults: &RestartDefaults) {
        if let Some(seconds) = defaults.node_startup_timeout {
            self.node_startup_ms = seconds * 1000;
        }
        if let Some(seconds) = defaults.health_check_interval {
            self.health_check_interval_ms = seconds * 1000;
        }
    }
}

impl Default for TimeoutSettings {
    fn default() -> Self {
        Self {
            connection_drain_ms: 60_000,
            connection_drain_check_ms: 5_000,
            post_restart_validation_ms: 30_000,
            inter_node_ms: 30_000,
            node_startup_ms: 60_000,
            health_check_interval_ms: 5_000,
            api_timeout_ms: 10_000,
        }
    }
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            api: ApiConfig {
                listen_addr: "127.0.0.1:8080".to_string(),
                api_key: None,
            },
            broker: BrokerConfig {
                management_base_url: "http://127.0.0.1:15672".to_string(),
                username: "guest".to_string(),
                password: "guest".to_string(),
                service_name: "rabbitmq-server".to_string(),
            },
            ssh: SshConfig {
                user: "rabbitmq-admin".to_string(),
                key_path: None,
                password: None,
                connect_timeout_seconds: 30,
                keepalive_interval_seconds: 5,
            },
            restart: RestartSettings {
                enable_rolling_restart: false,
                require_all_nodes_healthy: true,
                allow_restart_with_partitions: false,
                force_close_connections_after_drain: false,
                force_close_max_connections: 10,
                timeouts: TimeoutSettings::default(),
            },
            cluster: ClusterConfig {
                topology_path: "config/topology.yaml".to_string(),
            },
            metrics: MetricsConfig {
                enabled: true,
                listen_addr: "127.0.0.1:9091".to_string(),
            },
            logging: LoggingConfig {
                level: "info".to_string(),
            },
        }
    }
}

impl AdminConfig {
    /// Load configuration from file, with `ADMIN_*` environment overlays
    pub fn from_file(path: &str) -> Result<Self, config::ConfigError> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name(path))
            .add_source(config::Environment::with_prefix("ADMIN").separator("__"))
            .build()?;

        settings.try_deserialize()
    }

    /// Apply the operator environment variables this deployment already uses.
    ///
    /// These predate the config file and keep working; a set variable wins
    /// over the file value.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(user) = std::env::var("RABBITMQ_ADMIN_USER") {
            self.broker.username = user;
        }
        if let Ok(password) = std::env::var("RABBITMQ_ADMIN_PASSWORD") {
            self.broker.password = password;
        }
        if let Ok(base) = std::env::var("RABBITMQ_MANAGEMENT_API_BASE") {
            self.broker.management_base_url = base;
        }
        if let Ok(key) = std::env::var("API_KEY") {
            self.api.api_key = Some(key);
        }
        if let Ok(user) = std::env::var("SSH_USER") {
            self.ssh.user = user;
        }
        if let Ok(path) = std::env::var("SSH_KEY_PATH") {
            self.ssh.key_path = Some(path);
        }
        if let Ok(password) = std::env::var("SSH_PASSWORD") {
            self.ssh.password = Some(password);
        }
        if let Ok(value) = std::env::var("ENABLE_ROLLING_RESTART") {
            self.restart.enable_rolling_restart = parse_bool(&value);
        }
        if let Ok(value) = std::env::var("REQUIRE_ALL_NODES_HEALTHY") {
            self.restart.require_all_nodes_healthy = parse_bool(&value);
        }
        if let Ok(value) = std::env::var("ALLOW_RESTART_WITH_PARTITIONS") {
            self.restart.allow_restart_with_partitions = parse_bool(&value);
        }
        if let Ok(value) = std::env::var("FORCE_CLOSE_CONNECTIONS_AFTER_DRAIN") {
            self.restart.force_close_connections_after_drain = parse_bool(&value);
        }

        let timeouts = &mut self.restart.timeouts;
        for (var, slot) in [
            ("CONNECTION_DRAIN_TIMEOUT_MS", &mut timeouts.connection_drain_ms),
            (
                "CONNECTION_DRAIN_CHECK_INTERVAL_MS",
                &mut timeouts.connection_drain_check_ms,
            ),
            (
                "POST_RESTART_VALIDATION_MS",
                &mut timeouts.post_restart_validation_ms,
            ),
            ("INTER_NODE_DELAY_MS", &mut timeouts.inter_node_ms),
            ("NODE_STARTUP_TIMEOUT_MS", &mut timeouts.node_startup_ms),
            (
                "HEALTH_CHECK_INTERVAL_MS",
                &mut timeouts.health_check_interval_ms,
            ),
            ("API_TIMEOUT_MS", &mut timeouts.api_timeout_ms),
        ] {
            if let Ok(value) = std::env::var(var) {
                if let Ok(parsed) = value.parse::<u64>() {
                    *slot = parsed;
                }
            }
        }

        info!("Applied environment variable overrides");
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        self.api
            .listen_addr
            .parse::<SocketAddr>()
            .map_err(|e| format!("Invalid api.listen_addr: {}", e))?;

        if self.broker.management_base_url.is_empty() {
            return Err("broker.management_base_url cannot be empty".to_string());
        }
        if self.broker.username.is_empty() || self.broker.password.is_empty() {
            return Err("broker credentials are required".to_string());
        }
        if self.broker.service_name.is_empty() {
            return Err("broker.service_name cannot be empty".to_string());
        }
        if self.ssh.user.is_empty() {
            return Err("ssh.user cannot be empty".to_string());
        }
        if self.restart.force_close_max_connections == 0 {
            return Err("restart.force_close_max_connections must be at least 1".to_string());
        }

        let t = &self.restart.timeouts;
        for (label, value) in [
            ("connection_drain_check_ms", t.connection_drain_check_ms),
            ("health_check_interval_ms", t.health_check_interval_ms),
            ("node_startup_ms", t.node_startup_ms),
            ("api_timeout_ms", t.api_timeout_ms),
        ] {
            if value == 0 {
                return Err(format!("restart.timeouts.{} cannot be 0", label));
            }
        }

        if self.metrics.enabled {
            self.metrics
                .listen_addr
                .parse::<SocketAddr>()
                .map_err(|e| format!("Invalid metrics.listen_addr: {}", e))?;
        }

        Ok(())
    }
}

fn parse_bool(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let config = AdminConfig::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_shipped_config_loads() {
        // The sample config in the repo must always deserialize and validate
        let config = AdminConfig::from_file("../config/admin.toml").unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.broker.service_name, "rabbitmq-server");
        assert_eq!(config.restart.timeouts.connection_drain_ms, 60_000);
    }

    #[test]
    fn test_invalid_listen_addr_rejected() {
        let mut config = AdminConfig::default();
        config.api.listen_addr = "not-an-address".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_poll_interval_rejected() {
        let mut config = AdminConfig::default();
        config.restart.timeouts.connection_drain_check_ms = 0;
        let err = config.validate().unwrap_err();
        assert!(err.contains("connection_drain_check_ms"));
    }

    #[test]
    fn test_env_overrides() {
        std::env::set_var("RABBITMQ_ADMIN_USER", "ops");
        std::env::set_var("ENABLE_ROLLING_RESTART", "true");
        std::env::set_var("NODE_STARTUP_TIMEOUT_MS", "120000");

        let mut config = AdminConfig::default();
        config.apply_env_overrides();

        assert_eq!(config.broker.username, "ops");
        assert!(config.restart.enable_rolling_restart);
        assert_eq!(config.restart.timeouts.node_startup_ms, 120_000);

        std::env::remove_var("RABBITMQ_ADMIN_USER");
        std::env::remove_var("ENABLE_ROLLING_RESTART");
        std::env::remove_var("NODE_STARTUP_TIMEOUT_MS");
    }

    #[test]
    fn test_topology_defaults_apply() {
        let mut timeouts = TimeoutSettings::default();
        timeouts.apply_topology_defaults(&RestartDefaults {
            node_startup_timeout: Some(90),
            health_check_interval: None,
        });
        assert_eq!(timeouts.node_startup_ms, 90_000);
        assert_eq!(timeouts.health_check_interval_ms, 5_000);
    }
}
