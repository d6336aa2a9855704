//! Configuration module for the scout dashboard collector.
//!
//! Loads configuration from environment variables with sensible defaults.

use std::env;
use std::str::FromStr;
use std::time::Duration;

/// Retention limits shared by the ingestion and aggregation services.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionConfig {
    /// Seconds a current snapshot stays visible without a refresh (default: 300)
    pub current_ttl_secs: i64,
    /// Maximum history entries kept per machine (default: 288)
    pub history_max: usize,
    /// Maximum entries in the shared alert log (default: 50)
    pub alerts_max: usize,
    /// A history sample is taken on every Nth push per machine (default: 5)
    pub sample_every: i64,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            current_ttl_secs: 300,
            history_max: 288,
            alerts_max: 50,
            sample_every: 5,
        }
    }
}

/// Server configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// HTTP port for the web server (default: 8080)
    pub http_port: u16,
    /// Path to the SQLite database file (default: "scout.db")
    pub db_path: String,
    /// Shared bearer secret scouts must present. `None` rejects every push.
    pub api_key: Option<String>,
    /// Deadline for assembling the aggregate view (default: 5s)
    pub read_timeout: Duration,
    pub retention: RetentionConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_port: 8080,
            db_path: "scout.db".to_string(),
            api_key: None,
            read_timeout: Duration::from_millis(5000),
            retention: RetentionConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables.
    ///
    /// Environment variables:
    /// - `SCOUT_HTTP_PORT`: HTTP port (default: 8080)
    /// - `SCOUT_DB_PATH`: Database file path (default: "scout.db")
    /// - `SCOUT_API_KEY`: Shared bearer secret (no default)
    /// - `SCOUT_CURRENT_TTL_SECS`: Current snapshot expiry (default: 300)
    /// - `SCOUT_HISTORY_MAX`: History cap per machine (default: 288)
    /// - `SCOUT_ALERTS_MAX`: Shared alert cap (default: 50)
    /// - `SCOUT_SAMPLE_EVERY`: History sampling interval in pushes (default: 5)
    /// - `SCOUT_READ_TIMEOUT_MS`: Aggregation deadline (default: 5000)
    pub fn load() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut cfg = Self::default();

        if let Some(port) = parse_positive(&lookup, "SCOUT_HTTP_PORT") {
            cfg.http_port = port;
        }

        if let Some(db_path) = lookup("SCOUT_DB_PATH") {
            cfg.db_path = db_path;
        }

        cfg.api_key = lookup("SCOUT_API_KEY").filter(|key| !key.is_empty());

        if let Some(ms) = parse_positive::<u64, _>(&lookup, "SCOUT_READ_TIMEOUT_MS") {
            cfg.read_timeout = Duration::from_millis(ms);
        }

        let retention = &mut cfg.retention;
        if let Some(ttl) = parse_positive(&lookup, "SCOUT_CURRENT_TTL_SECS") {
            retention.current_ttl_secs = ttl;
        }
        if let Some(max) = parse_positive(&lookup, "SCOUT_HISTORY_MAX") {
            retention.history_max = max;
        }
        if let Some(max) = parse_positive(&lookup, "SCOUT_ALERTS_MAX") {
            retention.alerts_max = max;
        }
        if let Some(every) = parse_positive(&lookup, "SCOUT_SAMPLE_EVERY") {
            retention.sample_every = every;
        }

        cfg
    }
}

/// Parse a numeric variable, ignoring values that don't parse or are zero.
fn parse_positive<T, F>(lookup: &F, key: &str) -> Option<T>
where
    T: FromStr + PartialOrd + Default,
    F: Fn(&str) -> Option<String>,
{
    lookup(key)
        .and_then(|raw| raw.trim().parse::<T>().ok())
        .filter(|value| *value > T::default())
}
