//! ==============================================================================
//! config.rs - runtime configuration loader
//! ==============================================================================
//!
//! purpose:
//!     defines the schema for `guardian.toml`.
//!     loads configuration from file or falls back to defaults.
//!
//! structure:
//!     - BrokerConfig: where the sensor publishes (host, port, topic filter).
//!     - MoistureConfig: alive/dead threshold and adc range.
//!     - ServerConfig: http bind address, asset directory, viewer page.
//!     - LoggingConfig: default log level and whether readings are echoed.
//!
//! every field has a default, so a partial file only overrides what it names.
//!
//! ==============================================================================

use anyhow::Context;
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::domain::{ADC_MAX, MOISTURE_THRESHOLD};

/// Root configuration structure
#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct GuardianConfig {
    pub broker: BrokerConfig,
    pub moisture: MoistureConfig,
    pub server: ServerConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct BrokerConfig {
    pub host: String,
    pub port: u16,
    /// topic filter subscribed to, usually a `#` wildcard
    pub topic: String,
    /// mqtt client id; generated from the pid when unset
    pub client_id: Option<String>,
    pub keepalive_seconds: u64,
    /// capacity of the outgoing request queue in the mqtt client
    pub request_capacity: usize,
    /// largest mqtt packet accepted, in bytes; bigger publishes are discarded
    pub max_packet_size: usize,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct MoistureConfig {
    pub threshold: i64,
    pub adc_max: i64,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// directory of exported .glb files served under /web_assets
    pub assets_dir: PathBuf,
    /// viewer page; the embedded page is used when this file is missing
    pub index_page: PathBuf,
    /// per-client outbound queue length before messages are dropped
    pub client_queue: usize,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub show_sensor_data: bool,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: "broker.hivemq.com".to_string(),
            port: 1883,
            topic: "murad/vase/#".to_string(),
            client_id: None,
            keepalive_seconds: 60,
            request_capacity: 10,
            max_packet_size: 1024 * 1024,
        }
    }
}

impl Default for MoistureConfig {
    fn default() -> Self {
        Self { threshold: MOISTURE_THRESHOLD, adc_max: ADC_MAX }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 5000,
            assets_dir: PathBuf::from("web_assets"),
            index_page: PathBuf::from("templates").join("index.html"),
            client_queue: 64,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: "info".to_string(), show_sensor_data: true }
    }
}

impl BrokerConfig {
    pub fn client_id(&self) -> String {
        self.client_id
            .clone()
            .unwrap_or_else(|| format!("plant-guardian-{}", std::process::id()))
    }
}

impl ServerConfig {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl GuardianConfig {
    /// Load configuration from file
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;

        Self::parse(&content).with_context(|| format!("failed to parse {}", path.display()))
    }

    pub fn parse(content: &str) -> anyhow::Result<Self> {
        let config: GuardianConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(self.moisture.adc_max > 0, "moisture.adc_max must be positive");
        anyhow::ensure!(self.server.client_queue > 0, "server.client_queue must be at least 1");
        anyhow::ensure!(!self.broker.topic.is_empty(), "broker.topic must not be empty");
        anyhow::ensure!(self.broker.max_packet_size > 0, "broker.max_packet_size must be positive");
        Ok(())
    }

    /// Load with default fallback.
    ///
    /// runs before logging is initialised, so it reports on stdout/stderr.
    pub fn load_or_default() -> Self {
        let paths = [
            PathBuf::from("config").join("guardian.toml"),
            PathBuf::from("..").join("config").join("guardian.toml"),
        ];

        for path in &paths {
            if path.exists() {
                match Self::load(path) {
                    Ok(config) => {
                        println!("[CONFIG] Loaded from {}", path.display());
                        return config;
                    }
                    Err(e) => {
                        eprintln!("[CONFIG] Warning: {:#}", e);
                    }
                }
            }
        }

        println!("[CONFIG] No config file found - using defaults");
        Self::default()
    }

    /// Print configuration summary
    pub fn print_summary(&self) {
        let threshold_pct = self.moisture.threshold as f64 / self.moisture.adc_max as f64 * 100.0;
        println!("┌─────────────────────────────────────────┐");
        println!("│         GUARDIAN CONFIGURATION          │");
        println!("├─────────────────────────────────────────┤");
        println!("│ Web: http://{}", self.server.bind_addr());
        println!("│ MQTT Broker: {}:{}", self.broker.host, self.broker.port);
        println!("│ MQTT Topic: {}", self.broker.topic);
        println!("│ Moisture Threshold: {} ({:.1}%)", self.moisture.threshold, threshold_pct);
        println!("│ Assets: {}", self.server.assets_dir.display());
        println!("│ Log Level: {}", self.logging.level);
        println!("└─────────────────────────────────────────┘");
    }
}
