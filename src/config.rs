use serde::Deserialize;
use std::time::Duration;

/// Main configuration for the zonewatch service
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Service configuration
    #[serde(default)]
    pub service: ServiceConfig,
    /// Database configuration
    #[serde(default)]
    pub database: DatabaseConfig,
    /// API configuration
    #[serde(default)]
    pub api: ApiConfig,
    /// Live streaming configuration
    #[serde(default)]
    pub stream: StreamConfig,
    /// Counting engine configuration
    #[serde(default)]
    pub counting: CountingConfig,
    /// Batch processing configuration
    #[serde(default)]
    pub batch: BatchConfig,
}

/// Service-level configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// Service name for logging/metrics
    #[serde(default = "default_service_name")]
    pub name: String,
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Metrics port
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
}

/// Database configuration
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Path to the SQLite database file
    #[serde(default = "default_database_path")]
    pub path: String,
    /// Maximum number of connections in the pool
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    /// Connection acquire timeout in seconds
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// Run migrations on startup
    #[serde(default = "default_true")]
    pub run_migrations: bool,
}

/// API configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    /// API listen address
    #[serde(default = "default_api_host")]
    pub host: String,
    /// API listen port
    #[serde(default = "default_api_port")]
    pub port: u16,
    /// Enable CORS
    #[serde(default = "default_true")]
    pub cors_enabled: bool,
    /// Allowed CORS origins (empty = any)
    #[serde(default)]
    pub cors_origins: Vec<String>,
}

/// Live streaming configuration
#[derive(Debug, Clone, Deserialize)]
pub struct StreamConfig {
    /// Frame queue capacity; overflow drops the oldest queued frame
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// Keepalive timeout in seconds when no frame is available
    #[serde(default = "default_keepalive_secs")]
    pub keepalive_secs: u64,
}

/// Counting engine configuration
#[derive(Debug, Clone, Deserialize)]
pub struct CountingConfig {
    /// Frames a track may go unseen before its state is evicted
    #[serde(default = "default_track_grace_frames")]
    pub track_grace_frames: u64,
}

/// Batch processing configuration
#[derive(Debug, Clone, Deserialize)]
pub struct BatchConfig {
    /// Minimum interval between persisted progress updates, in milliseconds
    #[serde(default = "default_progress_interval_ms")]
    pub progress_interval_ms: u64,
}

// Default value functions
fn default_service_name() -> String {
    "zonewatch".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_database_path() -> String {
    "data/zonewatch.db".to_string()
}

fn default_max_connections() -> u32 {
    10
}

fn default_connect_timeout_secs() -> u64 {
    30
}

fn default_api_host() -> String {
    "0.0.0.0".to_string()
}

fn default_api_port() -> u16 {
    8080
}

fn default_queue_capacity() -> usize {
    2
}

fn default_keepalive_secs() -> u64 {
    5
}

fn default_track_grace_frames() -> u64 {
    30
}

fn default_progress_interval_ms() -> u64 {
    500
}

fn default_true() -> bool {
    true
}

impl Config {
    /// Load configuration from environment and config files
    pub fn load() -> anyhow::Result<Self> {
        let config = config::Config::builder()
            // Start with default values
            .set_default("service.name", "zonewatch")?
            .set_default("service.log_level", "info")?
            .set_default("service.metrics_port", 9090)?
            // Add config file if present
            .add_source(config::File::with_name("config/zonewatch").required(false))
            .add_source(config::File::with_name("/etc/zonewatch/config").required(false))
            // Override with environment variables
            // ZONEWATCH__STREAM__KEEPALIVE_SECS -> stream.keepalive_secs
            .add_source(
                config::Environment::with_prefix("ZONEWATCH")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize().map_err(Into::into)
    }

    /// Get database acquire timeout as Duration
    pub fn db_connect_timeout(&self) -> Duration {
        Duration::from_secs(self.database.connect_timeout_secs)
    }

    /// Get streaming keepalive timeout as Duration
    pub fn keepalive(&self) -> Duration {
        Duration::from_secs(self.stream.keepalive_secs)
    }

    /// Get batch progress write interval as Duration
    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.batch.progress_interval_ms)
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            log_level: default_log_level(),
            metrics_port: default_metrics_port(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_database_path(),
            max_connections: default_max_connections(),
            connect_timeout_secs: default_connect_timeout_secs(),
            run_migrations: true,
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: default_api_host(),
            port: default_api_port(),
            cors_enabled: true,
            cors_origins: Vec::new(),
        }
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
            keepalive_secs: default_keepalive_secs(),
        }
    }
}

impl Default for CountingConfig {
    fn default() -> Self {
        Self {
            track_grace_frames: default_track_grace_frames(),
        }
    }
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            progress_interval_ms: default_progress_interval_ms(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.service.name, "zonewatch");
        assert_eq!(config.stream.queue_capacity, 2);
        assert_eq!(config.stream.keepalive_secs, 5);
        assert_eq!(config.counting.track_grace_frames, 30);
        assert_eq!(config.batch.progress_interval_ms, 500);
    }

    #[test]
    fn test_duration_accessors() {
        let config = Config::default();
        assert_eq!(config.keepalive(), Duration::from_secs(5));
        assert_eq!(config.progress_interval(), Duration::from_millis(500));
    }
}
