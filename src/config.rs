//! ==============================================================================
//! config.rs - hub configuration loader
//! ==============================================================================
//!
//! purpose:
//!     defines the schema for `airgradient.toml`.
//!     loads configuration from file or falls back to defaults.
//!
//! structure:
//!     - ServerConfig: where the ingestion endpoint listens.
//!     - LoggingConfig: default log level and whether readings are echoed.
//!
//! environment:
//!     AIRGRADIENT_HOST / AIRGRADIENT_PORT override the listen address.
//!
//! ==============================================================================

use anyhow::Context;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::info;

pub const DEFAULT_HOST: &str = "0.0.0.0";
pub const DEFAULT_PORT: u16 = 8088;

/// Root configuration structure
#[derive(Debug, Deserialize, Clone, Default)]
pub struct HubConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    /// file the config came from, if any
    #[serde(skip)]
    pub source: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct LoggingConfig {
    /// used when RUST_LOG is not set
    pub level: String,
    pub show_sensor_data: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            show_sensor_data: true,
        }
    }
}

impl HubConfig {
    /// Parse configuration from TOML text
    pub fn from_toml(content: &str) -> anyhow::Result<Self> {
        toml::from_str(content).context("failed to parse config")
    }

    /// Load configuration from file
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;

        let mut config = Self::from_toml(&content)?;
        config.source = Some(path.to_path_buf());
        Ok(config)
    }

    /// Load with default fallback, then apply environment overrides.
    ///
    /// runs before logging is set up, so problems go to stderr.
    pub fn load_or_default() -> Self {
        let paths = [
            PathBuf::from("config").join("airgradient.toml"),
            PathBuf::from("..").join("config").join("airgradient.toml"),
        ];

        let mut config = paths
            .iter()
            .filter(|path| path.exists())
            .find_map(|path| match Self::load(path) {
                Ok(config) => Some(config),
                Err(e) => {
                    eprintln!("[CONFIG] Warning: {:#}", e);
                    None
                }
            })
            .unwrap_or_default();

        config.apply_overrides(
            std::env::var("AIRGRADIENT_HOST").ok(),
            std::env::var("AIRGRADIENT_PORT").ok(),
        );
        config
    }

    /// host/port overrides; an unparsable port is ignored
    pub fn apply_overrides(&mut self, host: Option<String>, port: Option<String>) {
        if let Some(host) = host.filter(|h| !h.trim().is_empty()) {
            self.server.host = host.trim().to_string();
        }
        if let Some(port) = port {
            match port.trim().parse() {
                Ok(port) => self.server.port = port,
                Err(_) => eprintln!("[CONFIG] Warning: ignoring invalid port {:?}", port),
            }
        }
    }

    /// Log configuration summary
    pub fn log_summary(&self) {
        match &self.source {
            Some(path) => info!("config loaded from {}", path.display()),
            None => info!("no config file found, using defaults"),
        }
        info!("  listen: {}:{}", self.server.host, self.server.port);
        info!("  log level: {}", self.logging.level);
        info!("  echo readings: {}", self.logging.show_sensor_data);
    }
}
