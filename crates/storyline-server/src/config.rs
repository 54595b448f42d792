// Server configuration
//
// Everything comes from environment variables (optionally via .env).
// Unset variables fall back to defaults; malformed values are startup errors.

use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use storyline_core::SessionConfig;

/// Which pub/sub transport to use
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BroadcasterKind {
    /// Process-local channels (single instance only)
    Memory,
    /// Redis PUBLISH / SUBSCRIBE
    Redis,
    /// No broadcaster; every session polls
    None,
}

impl FromStr for BroadcasterKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "memory" => Ok(BroadcasterKind::Memory),
            "redis" => Ok(BroadcasterKind::Redis),
            "none" | "off" => Ok(BroadcasterKind::None),
            other => bail!("unknown broadcaster '{}' (expected memory, redis or none)", other),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_addr: String,
    /// PostgreSQL URL; in-memory storage when unset
    pub database_url: Option<String>,
    pub broadcaster: BroadcasterKind,
    pub redis_url: String,
    pub session: SessionConfig,
    /// Prefix for API routes (e.g., "/api"); health stays at the root
    pub api_prefix: String,
    pub cors_allowed_origins: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:9000".to_string(),
            database_url: None,
            broadcaster: BroadcasterKind::Memory,
            redis_url: "redis://localhost:6379".to_string(),
            session: SessionConfig::default(),
            api_prefix: String::new(),
            cors_allowed_origins: Vec::new(),
        }
    }
}

impl ServerConfig {
    /// Create configuration from environment variables
    ///
    /// Environment variables:
    /// - `BIND_ADDR`: listen address (default: "0.0.0.0:9000")
    /// - `DATABASE_URL`: PostgreSQL URL (unset: in-memory dev mode)
    /// - `BROADCASTER`: "memory" | "redis" | "none" (default: "memory")
    /// - `REDIS_URL`: Redis URL (default: "redis://localhost:6379")
    /// - `USE_BROADCASTER`: "false" forces poll mode (default: true)
    /// - `POLL_INTERVAL_MS`, `KEEPALIVE_INTERVAL_SECS`, `MAX_SESSION_SECS`,
    ///   `ERROR_BACKOFF_SECS`, `DEDUP_CAPACITY`, `READ_BATCH_LIMIT`: session tuning
    /// - `API_PREFIX`: route prefix (default: empty)
    /// - `CORS_ALLOWED_ORIGINS`: comma-separated origins (default: same-origin only)
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup (used by tests)
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = ServerConfig::default();
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let session = SessionConfig::default()
            .with_poll_interval(Duration::from_millis(parse_or(
                &get,
                "POLL_INTERVAL_MS",
                2000u64,
            )?))
            .with_keepalive_interval(Duration::from_secs(parse_or(
                &get,
                "KEEPALIVE_INTERVAL_SECS",
                30u64,
            )?))
            .with_max_duration(Duration::from_secs(parse_or(
                &get,
                "MAX_SESSION_SECS",
                300u64,
            )?))
            .with_error_backoff(Duration::from_secs(parse_or(
                &get,
                "ERROR_BACKOFF_SECS",
                5u64,
            )?))
            .with_dedup_capacity(parse_or(&get, "DEDUP_CAPACITY", 1000usize)?)
            .with_read_batch_limit(parse_or(&get, "READ_BATCH_LIMIT", 500usize)?)
            .with_use_broadcaster(parse_or(&get, "USE_BROADCASTER", true)?);

        Ok(Self {
            bind_addr: get("BIND_ADDR").unwrap_or(defaults.bind_addr),
            database_url: get("DATABASE_URL"),
            broadcaster: parse_or(&get, "BROADCASTER", defaults.broadcaster)?,
            redis_url: get("REDIS_URL").unwrap_or(defaults.redis_url),
            session,
            api_prefix: get("API_PREFIX").unwrap_or_default(),
            cors_allowed_origins: get("CORS_ALLOWED_ORIGINS")
                .map(|s| {
                    s.split(',')
                        .map(str::trim)
                        .filter(|s| !s.is_empty())
                        .map(String::from)
                        .collect()
                })
                .unwrap_or_default(),
        })
    }
}

fn parse_or<T>(get: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match get(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e: T::Err| anyhow::anyhow!("{}", e))
            .with_context(|| format!("invalid value for {}: '{}'", key, raw)),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)]) -> Result<ServerConfig> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        ServerConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = config(&[]).unwrap();
        assert_eq!(config.bind_addr, "0.0.0.0:9000");
        assert_eq!(config.broadcaster, BroadcasterKind::Memory);
        assert!(config.database_url.is_none());
        assert_eq!(config.session, SessionConfig::default());
        assert!(config.cors_allowed_origins.is_empty());
    }

    #[test]
    fn test_overrides() {
        let config = config(&[
            ("BROADCASTER", "redis"),
            ("POLL_INTERVAL_MS", "500"),
            ("MAX_SESSION_SECS", "60"),
            ("USE_BROADCASTER", "false"),
            ("CORS_ALLOWED_ORIGINS", "https://a.example, https://b.example,"),
            ("API_PREFIX", "/api"),
        ])
        .unwrap();

        assert_eq!(config.broadcaster, BroadcasterKind::Redis);
        assert_eq!(config.session.poll_interval, Duration::from_millis(500));
        assert_eq!(config.session.max_duration, Duration::from_secs(60));
        assert!(!config.session.use_broadcaster);
        assert_eq!(
            config.cors_allowed_origins,
            vec!["https://a.example", "https://b.example"]
        );
        assert_eq!(config.api_prefix, "/api");
    }

    #[test]
    fn test_blank_values_use_defaults() {
        let config = config(&[("DATABASE_URL", ""), ("POLL_INTERVAL_MS", " ")]).unwrap();
        assert!(config.database_url.is_none());
        assert_eq!(config.session.poll_interval, Duration::from_secs(2));
    }

    #[test]
    fn test_malformed_values_fail() {
        let err = config(&[("KEEPALIVE_INTERVAL_SECS", "soon")]).unwrap_err();
        assert!(err.to_string().contains("KEEPALIVE_INTERVAL_SECS"));

        assert!(config(&[("BROADCASTER", "kafka")]).is_err());
    }
}
