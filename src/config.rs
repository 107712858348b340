//! Configuration Module
//!
//! Handles loading engine and server configuration from environment variables.

use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::kind::{CollectionKind, TtlTable};
use crate::retry::RetryConfig;

/// Engine and server configuration parameters.
///
/// All values can be configured via environment variables with sensible defaults.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// HTTP server port
    pub server_port: u16,
    /// Directory for on-disk cache records; in-memory when unset
    pub cache_dir: Option<PathBuf>,
    /// Delay before opening or closing a push channel, in milliseconds
    pub subscribe_debounce_ms: u64,
    /// Remote fetch attempts, the first one included
    pub fetch_max_attempts: u32,
    pub retry_initial_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    pub tables_ttl_secs: u64,
    pub categories_ttl_secs: u64,
    pub staff_ttl_secs: u64,
    pub menu_items_ttl_secs: u64,
}

impl Config {
    /// Creates a new Config by loading values from environment variables.
    ///
    /// # Environment Variables
    /// - `SERVER_PORT` - HTTP server port (default: 3000)
    /// - `CACHE_DIR` - on-disk cache directory (default: unset, in-memory)
    /// - `SUBSCRIBE_DEBOUNCE_MS` - channel open/close debounce (default: 50)
    /// - `FETCH_MAX_ATTEMPTS` - fetch attempts per read (default: 3)
    /// - `RETRY_INITIAL_DELAY_MS` - first backoff delay (default: 100)
    /// - `RETRY_MAX_DELAY_MS` - backoff ceiling (default: 2000)
    /// - `TABLES_TTL_SECS` (default: 86400), `CATEGORIES_TTL_SECS` (43200),
    ///   `STAFF_TTL_SECS` (21600), `MENU_ITEMS_TTL_SECS` (1800)
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            server_port: env_or("SERVER_PORT", defaults.server_port),
            cache_dir: env::var("CACHE_DIR")
                .ok()
                .filter(|dir| !dir.trim().is_empty())
                .map(PathBuf::from),
            subscribe_debounce_ms: env_or("SUBSCRIBE_DEBOUNCE_MS", defaults.subscribe_debounce_ms),
            fetch_max_attempts: env_or("FETCH_MAX_ATTEMPTS", defaults.fetch_max_attempts),
            retry_initial_delay_ms: env_or("RETRY_INITIAL_DELAY_MS", defaults.retry_initial_delay_ms),
            retry_max_delay_ms: env_or("RETRY_MAX_DELAY_MS", defaults.retry_max_delay_ms),
            tables_ttl_secs: env_or("TABLES_TTL_SECS", defaults.tables_ttl_secs),
            categories_ttl_secs: env_or("CATEGORIES_TTL_SECS", defaults.categories_ttl_secs),
            staff_ttl_secs: env_or("STAFF_TTL_SECS", defaults.staff_ttl_secs),
            menu_items_ttl_secs: env_or("MENU_ITEMS_TTL_SECS", defaults.menu_items_ttl_secs),
        }
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.subscribe_debounce_ms)
    }

    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig {
            initial_delay: Duration::from_millis(self.retry_initial_delay_ms),
            max_delay: Duration::from_millis(self.retry_max_delay_ms),
            factor: 2.0,
            max_attempts: self.fetch_max_attempts.max(1),
        }
    }

    /// Per-kind TTLs. A zero value keeps the kind's default.
    pub fn ttl_table(&self) -> TtlTable {
        [
            (CollectionKind::Tables, self.tables_ttl_secs),
            (CollectionKind::Categories, self.categories_ttl_secs),
            (CollectionKind::Staff, self.staff_ttl_secs),
            (CollectionKind::MenuItems, self.menu_items_ttl_secs),
        ]
        .into_iter()
        .filter(|(_, secs)| *secs > 0)
        .fold(TtlTable::new(), |table, (kind, secs)| {
            table.with_ttl(kind, Duration::from_secs(secs))
        })
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server_port: 3000,
            cache_dir: None,
            subscribe_debounce_ms: 50,
            fetch_max_attempts: 3,
            retry_initial_delay_ms: 100,
            retry_max_delay_ms: 2000,
            tables_ttl_secs: CollectionKind::Tables.default_ttl().as_secs(),
            categories_ttl_secs: CollectionKind::Categories.default_ttl().as_secs(),
            staff_ttl_secs: CollectionKind::Staff.default_ttl().as_secs(),
            menu_items_ttl_secs: CollectionKind::MenuItems.default_ttl().as_secs(),
        }
    }
}

/// Parses `key`, falling back to `default` when unset or unparsable.
fn env_or<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}
