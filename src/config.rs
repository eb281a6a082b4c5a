//! Runtime configuration for the sync engine.
//!
//! Values come from the environment with sensible defaults; nothing here
//! is fatal. A malformed override is logged and the default kept.

use std::path::PathBuf;
use std::time::Duration;

use tracing::warn;

/// Default backend poll interval (drift detection + queue drain).
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(7_000);

/// Default timeout for backend CRUD requests.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Timeout used specifically for the lightweight health probe.
pub const DEFAULT_HEALTH_TIMEOUT: Duration = Duration::from_secs(10);

/// Capacity of the in-process push bus before slow receivers start lagging.
pub const DEFAULT_PUSH_BUFFER: usize = 256;

const DEFAULT_API_URL: &str = "http://localhost:3000/api";

#[derive(Debug, Clone, PartialEq)]
pub struct SyncConfig {
    /// Base URL of the orders backend, e.g. `https://example.com/api`.
    pub api_url: String,
    /// Directory holding `orders.db` and `logs/`.
    pub data_dir: PathBuf,
    pub poll_interval: Duration,
    pub request_timeout: Duration,
    pub health_timeout: Duration,
    pub push_buffer: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            api_url: DEFAULT_API_URL.to_string(),
            data_dir: default_data_dir(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            health_timeout: DEFAULT_HEALTH_TIMEOUT,
            push_buffer: DEFAULT_PUSH_BUFFER,
        }
    }
}

impl SyncConfig {
    /// Read overrides from `ORDERS_*` environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(url) = lookup("ORDERS_API_URL").filter(|s| !s.trim().is_empty()) {
            config.api_url = url;
        }
        config.api_url = normalize_api_url(&config.api_url);

        if let Some(dir) = lookup("ORDERS_DATA_DIR").filter(|s| !s.trim().is_empty()) {
            config.data_dir = PathBuf::from(dir);
        }
        if let Some(ms) = millis_override(&lookup, "ORDERS_POLL_INTERVAL_MS") {
            config.poll_interval = ms;
        }
        if let Some(ms) = millis_override(&lookup, "ORDERS_REQUEST_TIMEOUT_MS") {
            config.request_timeout = ms;
        }

        config
    }

    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("orders.db")
    }

    pub fn log_dir(&self) -> PathBuf {
        self.data_dir.join("logs")
    }
}

fn millis_override(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<Duration> {
    let raw = lookup(key)?;
    match raw.trim().parse::<u64>() {
        Ok(0) | Err(_) => {
            warn!(key, value = %raw, "ignoring invalid duration override");
            None
        }
        Ok(ms) => Some(Duration::from_millis(ms)),
    }
}

fn default_data_dir() -> PathBuf {
    let base = std::env::var("LOCALAPPDATA")
        .or_else(|_| std::env::var("XDG_DATA_HOME"))
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            #[cfg(target_os = "windows")]
            {
                PathBuf::from(std::env::var("USERPROFILE").unwrap_or_else(|_| ".".into()))
                    .join("AppData")
                    .join("Local")
            }
            #[cfg(not(target_os = "windows"))]
            {
                PathBuf::from(std::env::var("HOME").unwrap_or_else(|_| ".".into()))
                    .join(".local")
                    .join("share")
            }
        });
    base.join("orders-sync")
}

/// Normalise the backend URL:
/// - ensure a scheme is present (https, or http for localhost)
/// - strip trailing slashes
pub fn normalize_api_url(url: &str) -> String {
    let mut url = url.trim().to_string();

    if !url.starts_with("http://") && !url.starts_with("https://") {
        if url.starts_with("localhost") || url.starts_with("127.0.0.1") {
            url = format!("http://{url}");
        } else {
            url = format!("https://{url}");
        }
    }

    while url.ends_with('/') {
        url.pop();
    }

    url
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_normalize_api_url() {
        assert_eq!(normalize_api_url("myapp.com/api/"), "https://myapp.com/api");
        assert_eq!(normalize_api_url("localhost:3000//"), "http://localhost:3000");
        assert_eq!(
            normalize_api_url(" http://10.0.0.2:8080/api "),
            "http://10.0.0.2:8080/api"
        );
    }

    #[test]
    fn test_env_overrides() {
        let config = SyncConfig::from_lookup(lookup_from(&[
            ("ORDERS_API_URL", "orders.example.com/api/"),
            ("ORDERS_DATA_DIR", "/tmp/orders-test"),
            ("ORDERS_POLL_INTERVAL_MS", "2500"),
        ]));
        assert_eq!(config.api_url, "https://orders.example.com/api");
        assert_eq!(config.db_path(), PathBuf::from("/tmp/orders-test/orders.db"));
        assert_eq!(config.poll_interval, Duration::from_millis(2500));
        assert_eq!(config.request_timeout, DEFAULT_REQUEST_TIMEOUT);
    }

    #[test]
    fn test_invalid_overrides_keep_defaults() {
        let config = SyncConfig::from_lookup(lookup_from(&[
            ("ORDERS_POLL_INTERVAL_MS", "soon"),
            ("ORDERS_REQUEST_TIMEOUT_MS", "0"),
        ]));
        assert_eq!(config.poll_interval, DEFAULT_POLL_INTERVAL);
        assert_eq!(config.request_timeout, DEFAULT_REQUEST_TIMEOUT);
        assert_eq!(config.api_url, DEFAULT_API_URL);
    }
}
