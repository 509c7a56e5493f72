//! Configuration module for statusboard.
//!
//! Loads configuration from environment variables with sensible defaults.

use std::env;
use std::str::FromStr;
use std::time::Duration;

/// Development key, 32 bytes for AES-256. Override in production.
const DEFAULT_ENCRYPTION_KEY: &str = "v0v8y9z1a2b3c4d5e6f7g8h9i0j1k2l3";

/// Server configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// HTTP port for the web server (default: 4000)
    pub http_port: u16,
    /// Path to the SQLite database file (default: "statusboard.db")
    pub db_path: String,
    /// Key used to encrypt target secrets at rest. Must be exactly 32 bytes.
    pub encryption_key: String,
    /// Validity window of cached remote lookups (default: 600s)
    pub cache_ttl: Duration,
    /// Interval of the background cache sweeper (default: 900s)
    pub cache_sweep_interval: Duration,
    /// Upper bound on concurrent probes within one refresh; 0 means unlimited
    pub max_concurrent_probes: usize,
    /// Overall deadline of a reachability probe (default: 5s)
    pub ping_timeout: Duration,
    /// Echo requests sent per reachability probe (default: 4)
    pub ping_count: u16,
    /// TCP port of remote SQL Server instances (default: 1433)
    pub sql_port: u16,
    /// Connect + login deadline for remote SQL Server instances (default: 5s)
    pub sql_connect_timeout: Duration,
    /// Deadline of one whole scheduler call, connect included (default: 30s)
    pub sql_query_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_port: 4000,
            db_path: "statusboard.db".to_string(),
            encryption_key: DEFAULT_ENCRYPTION_KEY.to_string(),
            cache_ttl: Duration::from_secs(600),
            cache_sweep_interval: Duration::from_secs(900),
            max_concurrent_probes: 0,
            ping_timeout: Duration::from_secs(5),
            ping_count: 4,
            sql_port: 1433,
            sql_connect_timeout: Duration::from_secs(5),
            sql_query_timeout: Duration::from_secs(30),
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables.
    ///
    /// Environment variables:
    /// - `STATUSBOARD_HTTP_PORT`: HTTP port (default: 4000)
    /// - `STATUSBOARD_DB_PATH`: Database file path (default: "statusboard.db")
    /// - `STATUSBOARD_ENCRYPTION_KEY`: 32-byte secret key
    /// - `STATUSBOARD_CACHE_TTL_SECS`: cache TTL in seconds (default: 600)
    /// - `STATUSBOARD_CACHE_SWEEP_SECS`: sweep interval in seconds (default: 900)
    /// - `STATUSBOARD_MAX_CONCURRENT_PROBES`: probe cap per refresh (default: 0, unlimited)
    /// - `STATUSBOARD_PING_TIMEOUT_SECS`: ping deadline in seconds (default: 5)
    /// - `STATUSBOARD_PING_COUNT`: echo requests per ping (default: 4)
    /// - `STATUSBOARD_SQL_PORT`: SQL Server port (default: 1433)
    /// - `STATUSBOARD_SQL_CONNECT_TIMEOUT_SECS`: SQL connect deadline (default: 5)
    /// - `STATUSBOARD_SQL_QUERY_TIMEOUT_SECS`: whole scheduler call deadline (default: 30)
    pub fn load() -> Self {
        let mut cfg = Self::default();

        if let Some(port) = parse_var("STATUSBOARD_HTTP_PORT") {
            cfg.http_port = port;
        }

        if let Ok(db_path) = env::var("STATUSBOARD_DB_PATH") {
            cfg.db_path = db_path;
        }

        if let Ok(key) = env::var("STATUSBOARD_ENCRYPTION_KEY") {
            cfg.encryption_key = key;
        }

        if let Some(secs) = parse_var::<u64>("STATUSBOARD_CACHE_TTL_SECS") {
            cfg.cache_ttl = Duration::from_secs(secs.max(1));
        }

        if let Some(secs) = parse_var::<u64>("STATUSBOARD_CACHE_SWEEP_SECS") {
            cfg.cache_sweep_interval = Duration::from_secs(secs.max(1));
        }

        if let Some(limit) = parse_var("STATUSBOARD_MAX_CONCURRENT_PROBES") {
            cfg.max_concurrent_probes = limit;
        }

        if let Some(secs) = parse_var::<u64>("STATUSBOARD_PING_TIMEOUT_SECS") {
            cfg.ping_timeout = Duration::from_secs(secs.max(1));
        }

        if let Some(count) = parse_var::<u16>("STATUSBOARD_PING_COUNT") {
            cfg.ping_count = count.max(1);
        }

        if let Some(port) = parse_var("STATUSBOARD_SQL_PORT") {
            cfg.sql_port = port;
        }

        if let Some(secs) = parse_var::<u64>("STATUSBOARD_SQL_CONNECT_TIMEOUT_SECS") {
            cfg.sql_connect_timeout = Duration::from_secs(secs.max(1));
        }

        if let Some(secs) = parse_var::<u64>("STATUSBOARD_SQL_QUERY_TIMEOUT_SECS") {
            cfg.sql_query_timeout = Duration::from_secs(secs.max(1));
        }

        cfg
    }
}

fn parse_var<T: FromStr>(name: &str) -> Option<T> {
    let raw = env::var(name).ok()?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!("Ignoring invalid value for {}: {:?}", name, raw);
            None
        }
    }
}
