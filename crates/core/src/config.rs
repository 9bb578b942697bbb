use serde::Deserialize;

/// Root application configuration. Loaded from environment variables with
/// the prefix `COHORT__`. Built once at startup and handed to the components
/// that need it; there is no process-wide mutable config.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub reports: ReportsConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_http_port")]
    pub http_port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    /// Upper bound on any single store call made by the orchestrator.
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerConfig {
    /// Journal file holding scheduled expirations across restarts.
    #[serde(default = "default_journal_path")]
    pub journal_path: String,
    /// How often the worker scans for due expirations.
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
    /// First retry delay after a failed expiration callback.
    #[serde(default = "default_retry_base_ms")]
    pub retry_base_ms: u64,
    /// Cap on the exponential retry delay.
    #[serde(default = "default_retry_max_ms")]
    pub retry_max_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReportsConfig {
    /// Directory where generated CSV reports are written.
    #[serde(default = "default_reports_dir")]
    pub dir: String,
    /// Host advertised in report download links.
    #[serde(default = "default_public_host")]
    pub public_host: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

// Default functions
fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_http_port() -> u16 {
    8080
}
fn default_request_timeout_ms() -> u64 {
    5000
}
fn default_journal_path() -> String {
    "./data/expirations.journal".to_string()
}
fn default_tick_interval_ms() -> u64 {
    500
}
fn default_retry_base_ms() -> u64 {
    1000
}
fn default_retry_max_ms() -> u64 {
    60_000
}
fn default_reports_dir() -> String {
    "./reports".to_string()
}
fn default_public_host() -> String {
    "localhost".to_string()
}
fn default_metrics_port() -> u16 {
    9091
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            http_port: default_http_port(),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: default_request_timeout_ms(),
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            journal_path: default_journal_path(),
            tick_interval_ms: default_tick_interval_ms(),
            retry_base_ms: default_retry_base_ms(),
            retry_max_ms: default_retry_max_ms(),
        }
    }
}

impl Default for ReportsConfig {
    fn default() -> Self {
        Self {
            dir: default_reports_dir(),
            public_host: default_public_host(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            port: default_metrics_port(),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            api: ApiConfig::default(),
            store: StoreConfig::default(),
            scheduler: SchedulerConfig::default(),
            reports: ReportsConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl AppConfig {
    /// Load configuration from environment variables.
    pub fn load() -> Result<Self, config::ConfigError> {
        let builder = config::Config::builder().add_source(
            config::Environment::with_prefix("COHORT")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build()?;
        config.try_deserialize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.api.http_port, 8080);
        assert_eq!(cfg.store.request_timeout_ms, 5000);
        assert_eq!(cfg.scheduler.tick_interval_ms, 500);
        assert!(cfg.scheduler.retry_base_ms <= cfg.scheduler.retry_max_ms);
        assert_eq!(cfg.reports.dir, "./reports");
    }
}
