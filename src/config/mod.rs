//! # Configuration Management Module
//!
//! TOML configuration for the `meshscope` binary. The ingestion core never reads
//! configuration itself; the binary loads a [`Config`] and hands the relevant pieces to the
//! connection manager ([`Config::tuning`], [`Config::connect_params`]) and the in-memory view.
//!
//! ## Configuration Structure
//!
//! - [`ConnectionConfig`] - Which link to open and how long shutdown may take
//! - [`MonitorConfig`] - Retention caps of the in-memory mesh view
//! - [`LoggingConfig`] - Log level and optional log file
//!
//! ## Usage
//!
//! ```rust,no_run
//! use meshscope::config::Config;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     Config::create_default("config.toml").await?;
//!     let config = Config::load("config.toml").await?;
//!     println!("Link: {} {:?}", config.connection.kind, config.connection.port);
//!     Ok(())
//! }
//! ```
//!
//! ## Configuration File Format
//!
//! ```toml
//! [connection]
//! kind = "serial"
//! port = "/dev/ttyUSB0"
//! shutdown_timeout_ms = 200
//!
//! [monitor]
//! max_packets = 1000
//! max_log_lines = 500
//!
//! [logging]
//! level = "info"
//! ```
//!
//! Every section and key is optional; missing values take the defaults shown above.

use crate::connection::ManagerTuning;
use crate::transport::ConnectParams;
use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::fs;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub connection: ConnectionConfig,
    #[serde(default)]
    pub monitor: MonitorConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// `serial`, `network` or `ble` (aliases accepted at connect time).
    #[serde(default = "default_kind")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(default = "default_shutdown_timeout_ms")]
    pub shutdown_timeout_ms: u64,
}

fn default_kind() -> String {
    "serial".to_string()
}

fn default_shutdown_timeout_ms() -> u64 {
    200
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            kind: default_kind(),
            port: Some("/dev/ttyUSB0".to_string()),
            host: None,
            address: None,
            shutdown_timeout_ms: default_shutdown_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// Most recent packets kept by the view.
    #[serde(default = "default_max_packets")]
    pub max_packets: usize,
    #[serde(default = "default_max_log_lines")]
    pub max_log_lines: usize,
}

fn default_max_packets() -> usize {
    1000
}

fn default_max_log_lines() -> usize {
    500
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            max_packets: default_max_packets(),
            max_log_lines: default_max_log_lines(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_level")]
    pub level: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
}

fn default_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
            file: None,
        }
    }
}

impl Config {
    /// Load configuration from a file
    pub async fn load(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)
            .await
            .map_err(|e| anyhow!("Failed to read config file {}: {}", path, e))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| anyhow!("Failed to parse config file {}: {}", path, e))?;

        Ok(config)
    }

    /// Create a default configuration file
    pub async fn create_default(path: &str) -> Result<()> {
        let config = Config::default();
        let content = toml::to_string_pretty(&config)
            .map_err(|e| anyhow!("Failed to serialize default config: {}", e))?;

        fs::write(path, content)
            .await
            .map_err(|e| anyhow!("Failed to write config file {}: {}", path, e))?;

        Ok(())
    }

    pub fn tuning(&self) -> ManagerTuning {
        ManagerTuning {
            shutdown_timeout: Duration::from_millis(self.connection.shutdown_timeout_ms),
        }
    }

    pub fn connect_params(&self) -> ConnectParams {
        ConnectParams {
            port: self.connection.port.clone(),
            host: self.connection.host.clone(),
            address: self.connection.address.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.connection.kind, "serial");
        assert_eq!(config.connection.port.as_deref(), Some("/dev/ttyUSB0"));
        assert_eq!(config.monitor.max_packets, 1000);
        assert_eq!(config.monitor.max_log_lines, 500);
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.tuning().shutdown_timeout, Duration::from_millis(200));
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let config: Config = toml::from_str(
            r#"
            [connection]
            kind = "network"
            host = "10.0.0.5"
            "#,
        )
        .unwrap();
        assert_eq!(config.connection.kind, "network");
        assert_eq!(config.connection.shutdown_timeout_ms, 200);
        assert_eq!(config.connect_params(), ConnectParams::network("10.0.0.5"));
        assert_eq!(config.monitor.max_packets, 1000);
        assert!(config.logging.file.is_none());
    }

    #[test]
    fn test_empty_file_is_valid() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.connection.port.as_deref(), Some("/dev/ttyUSB0"));
    }

    #[tokio::test]
    async fn test_create_default_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let path = path.to_str().unwrap();

        Config::create_default(path).await.unwrap();
        let loaded = Config::load(path).await.unwrap();
        assert_eq!(loaded.connection.kind, "serial");
        assert_eq!(loaded.monitor.max_log_lines, 500);
    }

    #[test]
    fn test_load_reports_path() {
        let result = tokio_test::block_on(Config::load("/nonexistent/meshscope.toml"));
        let err = tokio_test::assert_err!(result);
        assert!(err.to_string().contains("/nonexistent/meshscope.toml"));
    }
}
