use crate::retry::RetryPolicy;
use std::env;
use std::str::FromStr;
use std::time::Duration;

/// Partition node settings, read once at startup.
#[derive(Debug, Clone)]
pub struct Config {
    pub http_addr: String,
    /// Unset selects the in-memory store.
    pub database_url: Option<String>,
    pub retry_max_attempts: u32,
    pub retry_base_interval_ms: u64,
    pub lock_timeout_ms: u64,
    pub queue_length_include_in_progress: bool,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            http_addr: "0.0.0.0:8081".to_string(),
            database_url: None,
            retry_max_attempts: 5,
            retry_base_interval_ms: 100,
            lock_timeout_ms: 4000,
            queue_length_include_in_progress: false,
            log_level: "info".to_string(),
        }
    }
}

/// Reads `key`, falling back to `default` when unset or unparseable.
pub fn env_or<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

impl Config {
    pub fn from_env() -> Self {
        let defaults = Self::default();

        Self {
            http_addr: env::var("HTTP_ADDR").unwrap_or(defaults.http_addr),
            database_url: env::var("DATABASE_URL").ok().filter(|url| !url.trim().is_empty()),
            retry_max_attempts: env_or("RETRY_MAX_ATTEMPTS", defaults.retry_max_attempts),
            retry_base_interval_ms: env_or("RETRY_BASE_INTERVAL_MS", defaults.retry_base_interval_ms),
            lock_timeout_ms: env_or("LOCK_TIMEOUT_MS", defaults.lock_timeout_ms),
            queue_length_include_in_progress: env_or(
                "QUEUE_LENGTH_INCLUDE_IN_PROGRESS",
                defaults.queue_length_include_in_progress,
            ),
            log_level: env::var("LOG_LEVEL").unwrap_or(defaults.log_level),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.retry_max_attempts,
            Duration::from_millis(self.retry_base_interval_ms),
        )
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    /// Database location without credentials, for logging.
    pub fn database_display(&self) -> String {
        match &self.database_url {
            Some(url) => url.split('@').last().unwrap_or("***").to_string(),
            None => "in-memory".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_or_falls_back() {
        assert_eq!(env_or("INGESTOR_TEST_UNSET_VARIABLE", 42u32), 42);

        env::set_var("INGESTOR_TEST_GARBAGE_VARIABLE", "not-a-number");
        assert_eq!(env_or("INGESTOR_TEST_GARBAGE_VARIABLE", 7u64), 7);

        env::set_var("INGESTOR_TEST_BOOL_VARIABLE", "true");
        assert!(env_or("INGESTOR_TEST_BOOL_VARIABLE", false));
    }

    #[test]
    fn test_database_display_hides_credentials() {
        let config = Config {
            database_url: Some("postgres://iot:pass@db:5432/iotdb".to_string()),
            ..Default::default()
        };
        assert_eq!(config.database_display(), "db:5432/iotdb");
        assert_eq!(Config::default().database_display(), "in-memory");
    }

    #[test]
    fn test_retry_policy_from_config() {
        let policy = Config::default().retry_policy();
        assert_eq!(policy.max_attempts, 5);
        assert_eq!(policy.base_interval, Duration::from_millis(100));
    }
}
