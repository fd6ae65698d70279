//! Configuration for the PacePulse API.

use serde::{Deserialize, Serialize};

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

fn default_db_path() -> String {
    "data/pacepulse.db".to_string()
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

/// Scraper configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScraperConfig {
    /// Minimum gap between page requests to one organiser, in ms
    #[serde(default = "default_politeness_delay_ms")]
    pub politeness_delay_ms: u64,
    /// Retries a job gets before it fails permanently
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Field-population percentage below which the validator warns
    #[serde(default = "default_validation_floor")]
    pub validation_floor: f64,
}

fn default_politeness_delay_ms() -> u64 {
    500
}

fn default_max_retries() -> u32 {
    3
}

fn default_validation_floor() -> f64 {
    50.0
}

impl Default for ScraperConfig {
    fn default() -> Self {
        Self {
            politeness_delay_ms: default_politeness_delay_ms(),
            max_retries: default_max_retries(),
            validation_floor: default_validation_floor(),
        }
    }
}

/// Endpoint monitor configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// Whether the background monitor loop runs
    #[serde(default = "default_monitor_enabled")]
    pub enabled: bool,
}

fn default_monitor_enabled() -> bool {
    true
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            enabled: default_monitor_enabled(),
        }
    }
}

/// Notifier configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NotifierConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Webhook receiving the plain-text payloads
    #[serde(default)]
    pub webhook_url: Option<String>,
}

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub scraper: ScraperConfig,
    #[serde(default)]
    pub monitor: MonitorConfig,
    #[serde(default)]
    pub notifier: NotifierConfig,
    /// Pre-shared key required on admin endpoints; unset disables the check
    #[serde(default)]
    pub admin_key: Option<String>,
}

impl AppConfig {
    /// Load configuration from environment and config file
    pub fn load() -> anyhow::Result<Self> {
        let config = config::Config::builder()
            // Start with defaults
            .add_source(config::Config::try_from(&AppConfig::default())?)
            // Add config file if exists
            .add_source(config::File::with_name("config").required(false))
            // Override with environment variables (PACEPULSE_SERVER_PORT, etc.)
            .add_source(
                config::Environment::with_prefix("PACEPULSE")
                    .separator("_")
                    .try_parsing(true),
            )
            .build()?;

        Ok(config.try_deserialize()?)
    }
}
