//! Pipeline configuration from environment variables

use super::aggregator::AggregatorSettings;
use std::env;
use std::str::FromStr;
use tokio::time::Duration;

/// Configuration for pipeline runtime
///
/// Loaded from environment variables with sensible defaults.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Path to SQLite database file
    pub db_path: String,

    /// Directory holding the `*.sql` schema files
    pub schema_dir: String,

    /// Channel buffer size for ping ingestion
    pub channel_buffer: usize,

    /// Trip aggregator interval in milliseconds
    pub aggregate_interval_ms: u64,

    /// Time after a trip's last boundary event before it may be finalized
    pub quiescence_window_ms: i64,

    /// Gap between consecutive trip points counted as an SLA violation
    pub max_ping_distance_m: f64,

    /// Deadline for each persistence / publish call
    pub side_effect_timeout_ms: u64,

    /// Optional GeoJSON FeatureCollection of districts
    pub geography_path: Option<String>,

    /// Optional JSONL file of pings tailed by the runtime
    pub ping_source_path: Option<String>,
}

impl PipelineConfig {
    /// Load configuration from environment variables
    ///
    /// Environment variables:
    /// - `TRIPFLOW_DB_PATH` (default: tripflow.db)
    /// - `TRIPFLOW_SCHEMA_DIR` (default: sql)
    /// - `PING_CHANNEL_BUFFER` (default: 10000)
    /// - `AGGREGATE_INTERVAL_MS` (default: 60000)
    /// - `QUIESCENCE_WINDOW_MS` (default: 86400000, 24h)
    /// - `MAX_PING_DISTANCE_M` (default: 1609.34, one mile)
    /// - `SIDE_EFFECT_TIMEOUT_MS` (default: 5000)
    /// - `GEOGRAPHY_PATH` (optional)
    /// - `PING_SOURCE_PATH` (optional)
    pub fn from_env() -> Self {
        Self {
            db_path: env::var("TRIPFLOW_DB_PATH").unwrap_or_else(|_| "tripflow.db".to_string()),

            schema_dir: env::var("TRIPFLOW_SCHEMA_DIR").unwrap_or_else(|_| "sql".to_string()),

            channel_buffer: parse_or("PING_CHANNEL_BUFFER", 10_000),

            aggregate_interval_ms: parse_or("AGGREGATE_INTERVAL_MS", 60_000),

            quiescence_window_ms: parse_or("QUIESCENCE_WINDOW_MS", 24 * 60 * 60 * 1000),

            max_ping_distance_m: parse_or("MAX_PING_DISTANCE_M", 1609.34),

            side_effect_timeout_ms: parse_or("SIDE_EFFECT_TIMEOUT_MS", 5_000),

            geography_path: non_empty("GEOGRAPHY_PATH"),

            ping_source_path: non_empty("PING_SOURCE_PATH"),
        }
    }

    pub fn side_effect_timeout(&self) -> Duration {
        Duration::from_millis(self.side_effect_timeout_ms)
    }

    pub fn aggregator_settings(&self) -> AggregatorSettings {
        AggregatorSettings {
            quiescence_window_ms: self.quiescence_window_ms,
            max_ping_distance_m: self.max_ping_distance_m,
            side_effect_timeout: self.side_effect_timeout(),
        }
    }
}

fn parse_or<T: FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(default)
}

fn non_empty(name: &str) -> Option<String> {
    env::var(name).ok().filter(|s| !s.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    const VARS: [&str; 9] = [
        "TRIPFLOW_DB_PATH",
        "TRIPFLOW_SCHEMA_DIR",
        "PING_CHANNEL_BUFFER",
        "AGGREGATE_INTERVAL_MS",
        "QUIESCENCE_WINDOW_MS",
        "MAX_PING_DISTANCE_M",
        "SIDE_EFFECT_TIMEOUT_MS",
        "GEOGRAPHY_PATH",
        "PING_SOURCE_PATH",
    ];

    // Both cases share one test: env vars are process-global and tests run
    // in parallel.
    #[test]
    fn test_config_from_env() {
        for var in VARS {
            env::remove_var(var);
        }

        let config = PipelineConfig::from_env();
        assert_eq!(config.db_path, "tripflow.db");
        assert_eq!(config.schema_dir, "sql");
        assert_eq!(config.channel_buffer, 10_000);
        assert_eq!(config.aggregate_interval_ms, 60_000);
        assert_eq!(config.quiescence_window_ms, 86_400_000);
        assert_eq!(config.max_ping_distance_m, 1609.34);
        assert_eq!(config.side_effect_timeout(), Duration::from_secs(5));
        assert_eq!(config.geography_path, None);
        assert_eq!(config.ping_source_path, None);

        env::set_var("TRIPFLOW_DB_PATH", "/tmp/test.db");
        env::set_var("PING_CHANNEL_BUFFER", "500");
        env::set_var("QUIESCENCE_WINDOW_MS", "1000");
        env::set_var("MAX_PING_DISTANCE_M", "not-a-number");
        env::set_var("GEOGRAPHY_PATH", "districts.geojson");
        env::set_var("PING_SOURCE_PATH", "  ");

        let config = PipelineConfig::from_env();
        assert_eq!(config.db_path, "/tmp/test.db");
        assert_eq!(config.channel_buffer, 500);
        assert_eq!(config.aggregator_settings().quiescence_window_ms, 1_000);
        assert_eq!(config.max_ping_distance_m, 1609.34);
        assert_eq!(config.geography_path.as_deref(), Some("districts.geojson"));
        assert_eq!(config.ping_source_path, None);

        for var in VARS {
            env::remove_var(var);
        }
    }
}
