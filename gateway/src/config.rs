use ingestor::config::env_or;
use std::env;
use std::time::Duration;

/// Gateway settings, read once at startup.
#[derive(Debug, Clone)]
pub struct Config {
    pub http_addr: String,
    pub partition_endpoints: Vec<String>,
    pub partition_timeout_ms: u64,
    /// Unset disables the report loop.
    pub report_publish_url: Option<String>,
    pub report_interval_ms: u64,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            http_addr: "0.0.0.0:8080".to_string(),
            partition_endpoints: vec!["http://localhost:8081".to_string()],
            partition_timeout_ms: 10_000,
            report_publish_url: None,
            report_interval_ms: 5_000,
            log_level: "info".to_string(),
        }
    }
}

pub fn parse_endpoints(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|e| e.trim().trim_end_matches('/'))
        .filter(|e| !e.is_empty())
        .map(str::to_string)
        .collect()
}

impl Config {
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let partition_endpoints = env::var("PARTITION_ENDPOINTS")
            .map(|raw| parse_endpoints(&raw))
            .ok()
            .filter(|endpoints| !endpoints.is_empty())
            .unwrap_or(defaults.partition_endpoints);

        Self {
            http_addr: env::var("HTTP_ADDR").unwrap_or(defaults.http_addr),
            partition_endpoints,
            partition_timeout_ms: env_or("PARTITION_TIMEOUT_MS", defaults.partition_timeout_ms),
            report_publish_url: env::var("REPORT_PUBLISH_URL").ok().filter(|url| !url.trim().is_empty()),
            report_interval_ms: env_or("REPORT_INTERVAL_MS", defaults.report_interval_ms),
            log_level: env::var("LOG_LEVEL").unwrap_or(defaults.log_level),
        }
    }

    pub fn partition_timeout(&self) -> Duration {
        Duration::from_millis(self.partition_timeout_ms)
    }

    pub fn report_interval(&self) -> Duration {
        Duration::from_millis(self.report_interval_ms.max(1))
    }
}
