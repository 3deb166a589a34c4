use crate::error::{IngestError, IngestResult};
use serde::Deserialize;
use std::time::Duration;

/// Root application configuration. Loaded from environment variables
/// with the prefix `FAST_INGEST__`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub query: QueryConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_http_port")]
    pub http_port: u16,
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
    #[serde(default = "default_max_bulk_events")]
    pub max_bulk_events: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_database_url")]
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,
    #[serde(default = "default_max_lifetime_secs")]
    pub max_lifetime_secs: u64,
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

/// Admission queue and batch writer tuning.
#[derive(Debug, Clone, Deserialize)]
pub struct PipelineConfig {
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,
    #[serde(default = "default_store_timeout_ms")]
    pub store_timeout_ms: u64,
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct QueryConfig {
    #[serde(default = "default_max_lookback_days")]
    pub max_lookback_days: i64,
    #[serde(default = "default_query_timeout_ms")]
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

// Default functions
fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_http_port() -> u16 {
    8080
}
fn default_max_body_bytes() -> usize {
    20 * 1024 * 1024
}
fn default_max_bulk_events() -> usize {
    1000
}
fn default_database_url() -> String {
    "postgres://localhost:5432/fast_ingest".to_string()
}
fn default_max_connections() -> u32 {
    10
}
fn default_min_connections() -> u32 {
    2
}
fn default_max_lifetime_secs() -> u64 {
    3600
}
fn default_idle_timeout_secs() -> u64 {
    1800
}
fn default_connect_timeout_ms() -> u64 {
    5000
}
fn default_queue_capacity() -> usize {
    20_000
}
fn default_batch_size() -> usize {
    500
}
fn default_flush_interval_ms() -> u64 {
    1000
}
fn default_store_timeout_ms() -> u64 {
    5000
}
fn default_shutdown_grace_secs() -> u64 {
    30
}
fn default_max_lookback_days() -> i64 {
    30
}
fn default_query_timeout_ms() -> u64 {
    5000
}
fn default_metrics_port() -> u16 {
    9091
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            http_port: default_http_port(),
            max_body_bytes: default_max_body_bytes(),
            max_bulk_events: default_max_bulk_events(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: default_database_url(),
            max_connections: default_max_connections(),
            min_connections: default_min_connections(),
            max_lifetime_secs: default_max_lifetime_secs(),
            idle_timeout_secs: default_idle_timeout_secs(),
            connect_timeout_ms: default_connect_timeout_ms(),
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
            batch_size: default_batch_size(),
            flush_interval_ms: default_flush_interval_ms(),
            store_timeout_ms: default_store_timeout_ms(),
            shutdown_grace_secs: default_shutdown_grace_secs(),
        }
    }
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            max_lookback_days: default_max_lookback_days(),
            timeout_ms: default_query_timeout_ms(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            port: default_metrics_port(),
        }
    }
}

impl PipelineConfig {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

impl QueryConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl AppConfig {
    /// Load configuration from environment variables.
    pub fn load() -> Result<Self, config::ConfigError> {
        let builder = config::Config::builder().add_source(
            config::Environment::with_prefix("FAST_INGEST")
                .separator("__")
                .try_parsing(true)
                .list_separator(","),
        );

        let config = builder.build()?;
        config.try_deserialize()
    }

    /// Reject values that would stall or panic the pipeline at startup.
    pub fn validate(&self) -> IngestResult<()> {
        let p = &self.pipeline;
        if p.queue_capacity == 0 {
            return Err(IngestError::Config("pipeline.queue_capacity must be > 0".into()));
        }
        if p.batch_size == 0 {
            return Err(IngestError::Config("pipeline.batch_size must be > 0".into()));
        }
        if p.flush_interval_ms == 0 {
            return Err(IngestError::Config("pipeline.flush_interval_ms must be > 0".into()));
        }
        if p.store_timeout_ms == 0 || self.query.timeout_ms == 0 {
            return Err(IngestError::Config("store and query timeouts must be > 0".into()));
        }
        if self.query.max_lookback_days <= 0 {
            return Err(IngestError::Config("query.max_lookback_days must be > 0".into()));
        }
        if self.api.max_bulk_events == 0 {
            return Err(IngestError::Config("api.max_bulk_events must be > 0".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.pipeline.queue_capacity, 20_000);
        assert_eq!(config.api.max_bulk_events, 1000);
        assert_eq!(config.query.max_lookback_days, 30);
        assert_eq!(config.pipeline.flush_interval(), Duration::from_secs(1));
    }

    #[test]
    fn test_zero_batch_size_rejected() {
        let mut config = AppConfig::default();
        config.pipeline.batch_size = 0;
        let err = config.validate().unwrap_err();
        assert!(matches!(err, IngestError::Config(_)));
    }

    #[test]
    fn test_zero_queue_capacity_rejected() {
        let mut config = AppConfig::default();
        config.pipeline.queue_capacity = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_section_keeps_defaults() {
        let json = r#"{"pipeline": {"batch_size": 42}}"#;
        let config: AppConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.pipeline.batch_size, 42);
        assert_eq!(config.pipeline.queue_capacity, 20_000);
        assert_eq!(config.api.http_port, 8080);
    }
}
