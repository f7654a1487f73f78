use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub replay: ReplayConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

// ============================================================================
// Listener
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,
}

fn default_listen_addr() -> String {
    "127.0.0.1".to_string()
}

fn default_listen_port() -> u16 {
    3307
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            listen_port: default_listen_port(),
        }
    }
}

impl ServerConfig {
    /// Get the address string (host:port)
    pub fn addr(&self) -> String {
        format!("{}:{}", self.listen_addr, self.listen_port)
    }
}

// ============================================================================
// Replay
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
pub struct ReplayConfig {
    /// JSON array of recorded mocks loaded at startup
    #[serde(default)]
    pub mocks_path: Option<PathBuf>,
    /// How often the remaining-mock count is logged (seconds, 0 disables)
    #[serde(default = "default_report_interval_secs")]
    pub report_interval_secs: u64,
    /// How long shutdown waits for sessions before aborting them (milliseconds)
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,
}

fn default_report_interval_secs() -> u64 {
    30
}

fn default_shutdown_grace_ms() -> u64 {
    5000
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            mocks_path: None,
            report_interval_secs: default_report_interval_secs(),
            shutdown_grace_ms: default_shutdown_grace_ms(),
        }
    }
}

impl ReplayConfig {
    pub fn report_interval(&self) -> Option<Duration> {
        (self.report_interval_secs > 0).then(|| Duration::from_secs(self.report_interval_secs))
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

// ============================================================================
// Metrics
// ============================================================================

#[derive(Debug, Clone, Default, Deserialize)]
pub struct MetricsConfig {
    /// Address for the Prometheus endpoint, e.g. "127.0.0.1:9307"; disabled if unset
    #[serde(default)]
    pub listen_addr: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_minimal_config() {
        let toml = r#"
[server]
listen_addr = "0.0.0.0"
"#;
        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.server.listen_addr, "0.0.0.0");
        assert_eq!(config.server.listen_port, 3307); // default
        assert!(config.replay.mocks_path.is_none());
        assert!(config.metrics.listen_addr.is_none());
    }

    #[test]
    fn test_parse_full_config() {
        let toml = r#"
[server]
listen_addr = "127.0.0.1"
listen_port = 13306

[replay]
mocks_path = "mocks/login.json"
report_interval_secs = 0
shutdown_grace_ms = 250

[metrics]
listen_addr = "127.0.0.1:9307"
"#;
        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.server.addr(), "127.0.0.1:13306");
        assert_eq!(
            config.replay.mocks_path.as_deref(),
            Some(std::path::Path::new("mocks/login.json"))
        );
        assert_eq!(config.replay.report_interval(), None);
        assert_eq!(config.replay.shutdown_grace(), Duration::from_millis(250));
        assert_eq!(config.metrics.listen_addr.as_deref(), Some("127.0.0.1:9307"));
    }

    #[test]
    fn test_empty_document_uses_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.server.addr(), "127.0.0.1:3307");
        assert_eq!(config.replay.report_interval(), Some(Duration::from_secs(30)));
    }

    #[test]
    fn test_config_default() {
        let config = Config::default();
        assert_eq!(config.server.listen_addr, "127.0.0.1");
        assert_eq!(config.server.listen_port, 3307);
        assert_eq!(config.replay.shutdown_grace_ms, 5000);
    }
}
