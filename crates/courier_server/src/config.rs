use courier_core::DeliveryConfig;
use std::env;
use std::time::Duration;
use thiserror::Error;

/// Node configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    /// Bind host (default: 0.0.0.0)
    pub host: String,
    /// Bind port (default: 10186)
    pub port: u16,
    /// Address peers use to reach this node, `host:port`.
    /// Defaults to `HOST:PORT`, or `127.0.0.1:PORT` when bound to 0.0.0.0.
    pub node_addr: String,
    /// Redis connection URL; unset runs single-node on the in-memory store
    pub redis_url: Option<String>,
    /// Liveness probe interval in ms (default: 1000)
    pub heartbeat_interval_ms: u64,
    /// Idle sleep of the push and ack-retry loops in ms (default: 1000)
    pub queue_backoff_ms: u64,
    /// Delay before an unacknowledged message is retried, in ms (default: 3000)
    pub retry_delay_ms: u64,
    /// Concurrent lookups during the startup sweep (default: 16)
    pub sweep_concurrency: usize,
    /// Timeout for requests to peer nodes in seconds (default: 5)
    pub forward_timeout_secs: u64,
    /// Bound on one socket write, ping or close, in ms (default: 5000)
    pub transport_timeout_ms: u64,
    /// CORS allowed origins (comma-separated, empty allows any)
    pub cors_origins: Vec<String>,
}

impl Config {
    /// Load configuration from `.env` and the environment
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Build configuration from an arbitrary variable source.
    pub fn from_lookup(var: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let host = var("HOST").unwrap_or_else(|| "0.0.0.0".to_string());
        let port = parse_var(&var, "PORT", 10186)?;

        let node_addr = var("NODE_ADDR")
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| default_node_addr(&host, port));

        let redis_url = var("REDIS_URL")
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty());

        let cors_origins = var("CORS_ORIGINS")
            .unwrap_or_default()
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        Ok(Config {
            host,
            port,
            node_addr,
            redis_url,
            heartbeat_interval_ms: parse_var(&var, "HEARTBEAT_INTERVAL_MS", 1000)?,
            queue_backoff_ms: parse_var(&var, "QUEUE_BACKOFF_MS", 1000)?,
            retry_delay_ms: parse_var(&var, "RETRY_DELAY_MS", 3000)?,
            sweep_concurrency: parse_var(&var, "SWEEP_CONCURRENCY", 16)?,
            forward_timeout_secs: parse_var(&var, "FORWARD_TIMEOUT_SECS", 5)?,
            transport_timeout_ms: parse_var(&var, "TRANSPORT_TIMEOUT_MS", 5000)?,
            cors_origins,
        })
    }

    /// Get the bind address
    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn forward_timeout(&self) -> Duration {
        Duration::from_secs(self.forward_timeout_secs)
    }

    /// Timing knobs for the delivery core.
    pub fn delivery(&self) -> DeliveryConfig {
        DeliveryConfig {
            heartbeat_interval: Duration::from_millis(self.heartbeat_interval_ms),
            queue_backoff: Duration::from_millis(self.queue_backoff_ms),
            retry_delay: Duration::from_millis(self.retry_delay_ms),
            sweep_concurrency: self.sweep_concurrency.max(1),
            transport_timeout: Duration::from_millis(self.transport_timeout_ms),
            ..DeliveryConfig::default()
        }
    }
}

fn default_node_addr(host: &str, port: u16) -> String {
    match host {
        "0.0.0.0" | "::" | "[::]" | "" => format!("127.0.0.1:{}", port),
        _ => format!("{}:{}", host, port),
    }
}

fn parse_var<T: std::str::FromStr>(
    var: &impl Fn(&str) -> Option<String>,
    name: &'static str,
    default: T,
) -> Result<T, ConfigError> {
    match var(name) {
        None => Ok(default),
        Some(raw) => raw.trim().parse().map_err(|_| ConfigError::Invalid {
            name,
            value: raw.clone(),
        }),
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid {name} environment variable: {value:?}")]
    Invalid { name: &'static str, value: String },
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from(pairs: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|name| vars.get(name).cloned())
    }

    #[test]
    fn defaults_apply_when_unset() {
        let config = config_from(&[]).unwrap();
        assert_eq!(config.server_addr(), "0.0.0.0:10186");
        assert_eq!(config.node_addr, "127.0.0.1:10186");
        assert!(config.redis_url.is_none());
        assert!(config.cors_origins.is_empty());

        let delivery = config.delivery();
        assert_eq!(delivery.heartbeat_interval, Duration::from_secs(1));
        assert_eq!(delivery.retry_delay, Duration::from_secs(3));
        assert_eq!(delivery.sweep_concurrency, 16);
        assert_eq!(delivery.transport_timeout, Duration::from_secs(5));
    }

    #[test]
    fn node_addr_follows_explicit_host() {
        let config = config_from(&[("HOST", "10.1.2.3"), ("PORT", "9000")]).unwrap();
        assert_eq!(config.node_addr, "10.1.2.3:9000");

        let config = config_from(&[("NODE_ADDR", "gw-1.internal:9000")]).unwrap();
        assert_eq!(config.node_addr, "gw-1.internal:9000");
    }

    #[test]
    fn bad_numbers_are_rejected() {
        match config_from(&[("PORT", "eighty")]) {
            Err(ConfigError::Invalid { name, .. }) => assert_eq!(name, "PORT"),
            other => panic!("unexpected: {:?}", other),
        }
        assert!(config_from(&[("RETRY_DELAY_MS", "-5")]).is_err());
    }

    #[test]
    fn cors_origins_are_trimmed() {
        let config = config_from(&[(
            "CORS_ORIGINS",
            "https://a.example , ,https://b.example",
        )])
        .unwrap();
        assert_eq!(
            config.cors_origins,
            vec!["https://a.example", "https://b.example"]
        );
    }
}
