mod schema;

pub use schema::*;

use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    ParseError(#[from] toml::de::Error),
}

/// Files tried in order by [`load_or_default`].
pub const CONFIG_PATHS: [&str; 2] = ["config/replay.toml", "replay.toml"];

pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config, ConfigError> {
    let content = std::fs::read_to_string(path)?;
    let config: Config = toml::from_str(&content)?;
    Ok(config)
}

/// First readable file from [`CONFIG_PATHS`], else defaults.
pub fn load_or_default() -> Config {
    for path in CONFIG_PATHS {
        match load_config(path) {
            Ok(config) => {
                tracing::info!(path = path, "Loaded configuration");
                return config;
            }
            Err(ConfigError::IoError(e)) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                tracing::warn!(path = path, error = %e, "Failed to load config");
            }
        }
    }

    tracing::info!("Using default configuration");
    Config::default()
}
