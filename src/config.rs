use crate::engine::{EngineConfig, SchedulerConfig};
use crate::retry::RetryPolicy;
use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Main configuration structure
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub accrual: AccrualConfig,
    #[serde(default)]
    pub engine: EngineSettings,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Service listen address (host:port), set by `-a`/`RUN_ADDRESS`
    #[serde(default = "default_run_address")]
    pub run_address: String,
    /// Separate bind address for health and stats; falls back to `run_address`
    #[serde(default)]
    pub health_address: Option<String>,
}

impl ServerConfig {
    /// Where the health server listens
    pub fn health_bind_address(&self) -> &str {
        self.health_address
            .as_deref()
            .map(str::trim)
            .filter(|addr| !addr.is_empty())
            .unwrap_or(self.run_address.as_str())
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            run_address: default_run_address(),
            health_address: None,
        }
    }
}

fn default_run_address() -> String {
    "localhost:8080".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// PostgreSQL connection URL
    #[serde(default)]
    pub url: String,
    /// Maximum connections in pool
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    #[serde(default = "default_acquire_timeout_ms")]
    pub acquire_timeout_ms: u64,
    /// Delays between attempts on transient store failures
    #[serde(default = "default_store_retry_delays")]
    pub retry_delays_ms: Vec<u64>,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            max_connections: default_max_connections(),
            acquire_timeout_ms: default_acquire_timeout_ms(),
            retry_delays_ms: default_store_retry_delays(),
        }
    }
}

fn default_max_connections() -> u32 {
    5
}

fn default_acquire_timeout_ms() -> u64 {
    5000
}

fn default_store_retry_delays() -> Vec<u64> {
    vec![100, 300, 500]
}

#[derive(Debug, Clone, Deserialize)]
pub struct AccrualConfig {
    /// Base URL of the accrual system
    #[serde(default)]
    pub address: String,
    /// Per-attempt HTTP timeout
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    /// Delays between attempts on transport failures
    #[serde(default = "default_gateway_retry_delays")]
    pub retry_delays_ms: Vec<u64>,
}

impl Default for AccrualConfig {
    fn default() -> Self {
        Self {
            address: String::new(),
            request_timeout_ms: default_request_timeout_ms(),
            retry_delays_ms: default_gateway_retry_delays(),
        }
    }
}

impl AccrualConfig {
    /// Longest a single status fetch can take with every retry spent
    pub fn worst_case_fetch_ms(&self) -> u64 {
        let attempts = self.retry_delays_ms.len() as u64 + 1;
        let backoff: u64 = self.retry_delays_ms.iter().sum();
        self.request_timeout_ms
            .saturating_mul(attempts)
            .saturating_add(backoff)
    }
}

fn default_request_timeout_ms() -> u64 {
    1000
}

fn default_gateway_retry_delays() -> Vec<u64> {
    vec![100, 200, 300]
}

#[derive(Debug, Clone, Deserialize)]
pub struct EngineSettings {
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Concurrent accrual requests per cycle
    #[serde(default = "default_fan_out")]
    pub fan_out: usize,
    /// Overall bound on one order's status fetch, retries included
    #[serde(default = "default_fetch_timeout_ms")]
    pub fetch_timeout_ms: u64,
    /// Pause after a 429 without `Retry-After`
    #[serde(default = "default_rate_limit_cooldown_secs")]
    pub rate_limit_cooldown_secs: u64,
    /// Pause between two ledger writes
    #[serde(default = "default_write_delay_ms")]
    pub write_delay_ms: u64,
    #[serde(default = "default_shutdown_timeout_secs")]
    pub shutdown_timeout_secs: u64,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            fan_out: default_fan_out(),
            fetch_timeout_ms: default_fetch_timeout_ms(),
            rate_limit_cooldown_secs: default_rate_limit_cooldown_secs(),
            write_delay_ms: default_write_delay_ms(),
            shutdown_timeout_secs: default_shutdown_timeout_secs(),
        }
    }
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_fan_out() -> usize {
    4
}

fn default_fetch_timeout_ms() -> u64 {
    5000
}

fn default_rate_limit_cooldown_secs() -> u64 {
    60
}

fn default_write_delay_ms() -> u64 {
    100
}

fn default_shutdown_timeout_secs() -> u64 {
    10
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log filter used when `RUST_LOG` is unset
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Enable JSON formatted logs
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_log_level() -> String {
    "info,loyalty=debug,sqlx=warn".to_string()
}

/// Values given on the command line; each one wins over files and environment
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub run_address: Option<String>,
    pub database_uri: Option<String>,
    pub accrual_address: Option<String>,
}

impl AppConfig {
    /// Load configuration from files and environment
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from("config")
    }

    /// Load configuration from a specific directory
    pub fn load_from<P: AsRef<Path>>(config_dir: P) -> Result<Self, ConfigError> {
        let config_dir = config_dir.as_ref();

        let builder = Config::builder()
            // Load default config file
            .add_source(File::from(config_dir.join("default.toml")).required(false))
            // Load environment-specific config (e.g., config/production.toml)
            .add_source(
                File::from(config_dir.join(
                    std::env::var("LOYALTY_ENV").unwrap_or_else(|_| "development".to_string()),
                ))
                .required(false),
            )
            // Override with environment variables (LOYALTY__DATABASE__URL, etc.)
            .add_source(
                Environment::with_prefix("LOYALTY")
                    .separator("__")
                    .try_parsing(true),
            );

        builder.build()?.try_deserialize()
    }

    pub fn apply_overrides(&mut self, overrides: Overrides) {
        if let Some(addr) = overrides.run_address {
            self.server.run_address = addr;
        }
        if let Some(uri) = overrides.database_uri {
            self.database.url = uri;
        }
        if let Some(addr) = overrides.accrual_address {
            self.accrual.address = addr;
        }
    }

    /// Validate configuration values, reporting every problem at once
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.database.url.trim().is_empty() {
            errors.push("database URI is required (-d, DATABASE_URI)".to_string());
        }
        if self.accrual.address.trim().is_empty() {
            errors.push(
                "accrual system address is required (-r, ACCRUAL_SYSTEM_ADDRESS)".to_string(),
            );
        }
        if self.server.run_address.trim().is_empty() {
            errors.push("run address must not be empty".to_string());
        }
        if self.database.max_connections == 0 {
            errors.push("database.max_connections must be positive".to_string());
        }
        if self.engine.fan_out == 0 {
            errors.push("engine.fan_out must be at least 1".to_string());
        }
        if self.engine.poll_interval_ms == 0 {
            errors.push("engine.poll_interval_ms must be positive".to_string());
        }
        if self.engine.fetch_timeout_ms == 0 {
            errors.push("engine.fetch_timeout_ms must be positive".to_string());
        }
        let worst_case = self.accrual.worst_case_fetch_ms();
        if worst_case > self.engine.fetch_timeout_ms {
            errors.push(format!(
                "engine.fetch_timeout_ms ({}) is shorter than the accrual retry budget ({}ms); \
                 lower accrual.request_timeout_ms or raise the fetch timeout",
                self.engine.fetch_timeout_ms, worst_case
            ));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            poll_interval: Duration::from_millis(self.engine.poll_interval_ms),
            scheduler: SchedulerConfig {
                fan_out: self.engine.fan_out,
                fetch_timeout: Duration::from_millis(self.engine.fetch_timeout_ms),
                rate_limit_cooldown: Duration::from_secs(self.engine.rate_limit_cooldown_secs),
            },
            write_delay: Duration::from_millis(self.engine.write_delay_ms),
            shutdown_timeout: Duration::from_secs(self.engine.shutdown_timeout_secs),
        }
    }

    pub fn store_retry(&self) -> RetryPolicy {
        RetryPolicy::from_millis("ledger_store", &self.database.retry_delays_ms)
    }

    pub fn gateway_retry(&self) -> RetryPolicy {
        RetryPolicy::from_millis("accrual_gateway", &self.accrual.retry_delays_ms)
    }
}
