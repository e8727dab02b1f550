//! Configuration for endpoint sizing and logging.
//!
//! Supports both command-line arguments and a TOML configuration file.
//! CLI arguments take precedence over config file values.

use clap::Parser;
use serde::Deserialize;
use std::path::PathBuf;

/// Command-line arguments for the demo binary.
#[derive(Parser, Debug)]
#[command(name = "evio")]
#[command(about = "A callback-driven, reactor-based TCP networking core", long_about = None)]
pub struct CliArgs {
    /// Path to a TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Port to listen on
    #[arg(short = 'p', long)]
    pub port: Option<u16>,

    /// Per-endpoint user buffer size, in bytes
    #[arg(long)]
    pub endpoint_buf_size: Option<usize>,

    /// Per-connection user buffer size, in bytes
    #[arg(long)]
    pub conn_buf_size: Option<usize>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

/// TOML configuration file structure.
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub endpoint: EndpointConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize)]
pub struct EndpointConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_endpoint_buf_size")]
    pub endpoint_buf_size: usize,
    #[serde(default = "default_conn_buf_size")]
    pub conn_buf_size: usize,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            endpoint_buf_size: default_endpoint_buf_size(),
            conn_buf_size: default_conn_buf_size(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_port() -> u16 {
    7000
}

fn default_endpoint_buf_size() -> usize {
    65536
}

fn default_conn_buf_size() -> usize {
    65536
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final, resolved configuration: CLI overrides TOML, TOML overrides the
/// built-in defaults above.
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub endpoint_buf_size: usize,
    pub conn_buf_size: usize,
    pub log_level: String,
}

impl Config {
    pub fn load() -> Result<Self, ConfigError> {
        let cli = CliArgs::parse();

        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        Ok(Config {
            port: cli.port.unwrap_or(toml_config.endpoint.port),
            endpoint_buf_size: cli
                .endpoint_buf_size
                .unwrap_or(toml_config.endpoint.endpoint_buf_size),
            conn_buf_size: cli
                .conn_buf_size
                .unwrap_or(toml_config.endpoint.conn_buf_size),
            log_level: if cli.log_level != "info" {
                cli.log_level
            } else {
                toml_config.logging.level
            },
        })
    }
}

#[derive(Debug)]
pub enum ConfigError {
    FileRead(PathBuf, std::io::Error),
    TomlParse(PathBuf, toml::de::Error),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::FileRead(path, e) => {
                write!(f, "failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::TomlParse(path, e) => {
                write!(f, "failed to parse config file '{}': {}", path.display(), e)
            }
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_matches_documented_values() {
        let config = TomlConfig::default();
        assert_eq!(config.endpoint.port, 7000);
        assert_eq!(config.endpoint.endpoint_buf_size, 65536);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn toml_parsing_overrides_defaults() {
        let toml_str = r#"
            [endpoint]
            port = 9000
            conn_buf_size = 131072

            [logging]
            level = "debug"
        "#;
        let config: TomlConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.endpoint.port, 9000);
        assert_eq!(config.endpoint.conn_buf_size, 131072);
        assert_eq!(config.logging.level, "debug");
    }
}
