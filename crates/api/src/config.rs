//! Application configuration loaded from environment variables.

use std::time::Duration;

use saga::RetryPolicy;

/// Server and engine configuration with sensible defaults.
///
/// Reads from environment variables:
/// - `HOST`: bind address (default: `"0.0.0.0"`)
/// - `PORT`: listen port (default: `3000`)
/// - `RUST_LOG`: tracing filter directive (default: `"info"`)
/// - `DATABASE_URL`: PostgreSQL URL; unset selects the in-memory store
/// - `SAGA_OWNER_ID`: lease owner name of this process (default: `orchestrator-<uuid>`)
/// - `SAGA_LEASE_SECS`: saga ownership lease (default: `60`)
/// - `SAGA_RECOVERY_INTERVAL_SECS`: periodic recovery sweep interval (default: `30`)
/// - `SAGA_COMPENSATION_MAX_ATTEMPTS`: compensation retry ceiling (default: `5`)
/// - `SAGA_COMPENSATION_BASE_DELAY_MS`: first retry backoff (default: `100`)
/// - `SAGA_MAX_RECOVERY_ATTEMPTS`: failed recoveries before dead-lettering (default: `3`)
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub log_level: String,
    pub database_url: Option<String>,
    pub owner_id: String,
    pub lease: Duration,
    pub recovery_interval: Duration,
    pub compensation_max_attempts: u32,
    pub compensation_base_delay: Duration,
    pub max_recovery_attempts: u32,
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn default_owner() -> String {
    format!("orchestrator-{}", uuid::Uuid::new_v4())
}

impl Config {
    /// Loads configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self {
            host: std::env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            port: env_or("PORT", 3000),
            log_level: std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string()),
            database_url: std::env::var("DATABASE_URL").ok().filter(|url| !url.is_empty()),
            owner_id: std::env::var("SAGA_OWNER_ID").unwrap_or_else(|_| default_owner()),
            lease: Duration::from_secs(env_or("SAGA_LEASE_SECS", 60)),
            recovery_interval: Duration::from_secs(env_or("SAGA_RECOVERY_INTERVAL_SECS", 30)),
            compensation_max_attempts: env_or(
                "SAGA_COMPENSATION_MAX_ATTEMPTS",
                RetryPolicy::DEFAULT_MAX_ATTEMPTS,
            ),
            compensation_base_delay: Duration::from_millis(env_or(
                "SAGA_COMPENSATION_BASE_DELAY_MS",
                100,
            )),
            max_recovery_attempts: env_or("SAGA_MAX_RECOVERY_ATTEMPTS", 3),
        }
    }

    /// Returns the `"host:port"` bind address string.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Retry policy for compensating actions.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.compensation_max_attempts, self.compensation_base_delay)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
            log_level: "info".to_string(),
            database_url: None,
            owner_id: default_owner(),
            lease: Duration::from_secs(60),
            recovery_interval: Duration::from_secs(30),
            compensation_max_attempts: RetryPolicy::DEFAULT_MAX_ATTEMPTS,
            compensation_base_delay: RetryPolicy::DEFAULT_BASE_DELAY,
            max_recovery_attempts: 3,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_values() {
        let config = Config::default();
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 3000);
        assert_eq!(config.log_level, "info");
        assert!(config.database_url.is_none());
        assert!(config.owner_id.starts_with("orchestrator-"));
        assert_eq!(config.lease, Duration::from_secs(60));
        assert_eq!(config.recovery_interval, Duration::from_secs(30));
        assert_eq!(config.max_recovery_attempts, 3);
    }

    #[test]
    fn test_addr_formatting() {
        let config = Config {
            host: "127.0.0.1".to_string(),
            port: 8080,
            ..Config::default()
        };
        assert_eq!(config.addr(), "127.0.0.1:8080");
    }

    #[test]
    fn test_retry_policy_from_config() {
        let config = Config {
            compensation_max_attempts: 2,
            compensation_base_delay: Duration::from_millis(10),
            ..Config::default()
        };
        let policy = config.retry_policy();
        assert_eq!(policy.max_attempts(), 2);
        assert_eq!(policy.backoff(1), Some(Duration::from_millis(10)));
        assert_eq!(policy.backoff(2), None);
    }

    #[test]
    fn test_env_or_falls_back_on_garbage() {
        // SAFETY: test-only env mutation on a key no other test reads.
        unsafe { std::env::set_var("SAGA_TEST_NOT_A_NUMBER", "abc") };
        assert_eq!(env_or("SAGA_TEST_NOT_A_NUMBER", 7u32), 7);
        assert_eq!(env_or("SAGA_TEST_UNSET_KEY", 9u64), 9);
    }
}
