//! Connector service configuration.
//!
//! Configuration is loaded from environment variables. The database and
//! Redis URLs and the external API token are redacted in Debug output.

use common::secret::SecretString;
use std::collections::{BTreeSet, HashMap};
use std::env;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Default admin HTTP bind address.
pub const DEFAULT_BIND_ADDRESS: &str = "0.0.0.0:8090";

/// Default connector provider name accepted in `{provider}` path segments.
pub const DEFAULT_PROVIDER: &str = "sberjazz";

/// Default per-attempt timeout for external API calls in seconds.
pub const DEFAULT_TIMEOUT_SECONDS: u64 = 10;

/// Default number of retries after the first attempt.
pub const DEFAULT_HTTP_RETRIES: u32 = 2;

/// Default retry backoff base in milliseconds.
pub const DEFAULT_RETRY_BACKOFF_MS: u64 = 300;

/// Default retry backoff cap in milliseconds.
pub const DEFAULT_RETRY_BACKOFF_CAP_MS: u64 = 5000;

/// Default set of HTTP statuses that trigger a retry.
pub const DEFAULT_RETRY_STATUSES: &str = "408,409,425,429,500,502,503,504";

/// Default consecutive exhausted failures before the breaker opens.
pub const DEFAULT_CB_FAILURE_THRESHOLD: u32 = 5;

/// Default breaker cooldown in seconds.
pub const DEFAULT_CB_OPEN_SECONDS: u64 = 60;

/// Default minimum breaker age before an automatic reset, in seconds.
pub const DEFAULT_CB_AUTO_RESET_MIN_AGE_SECONDS: u64 = 30;

/// Default operation lock TTL in seconds.
pub const DEFAULT_OP_LOCK_TTL_SECONDS: u64 = 60;

/// Default reconciliation interval in seconds.
pub const DEFAULT_RECONCILE_INTERVAL_SECONDS: u64 = 30;

/// Default number of reconnects per reconciliation cycle.
pub const DEFAULT_RECONCILE_LIMIT: usize = 20;

/// Default number of sessions loaded per reconciliation cycle.
pub const DEFAULT_RECONCILE_SCAN_LIMIT: usize = 2000;

/// Default heartbeat staleness threshold in seconds.
pub const DEFAULT_RECONCILE_STALE_SECONDS: u64 = 120;

/// Default Redis connect timeout in milliseconds.
pub const DEFAULT_REDIS_CONNECT_TIMEOUT_MS: u64 = 5000;

/// Default Redis command timeout in milliseconds.
pub const DEFAULT_REDIS_COMMAND_TIMEOUT_MS: u64 = 2000;

/// Default shutdown drain period in seconds.
pub const DEFAULT_DRAIN_SECONDS: u64 = 5;

/// Connector service configuration.
#[derive(Clone)]
pub struct Config {
    /// PostgreSQL connection URL (durable session store).
    pub database_url: String,

    /// Redis connection URL (operation locks and breaker state).
    pub redis_url: String,

    /// Admin HTTP bind address (default: "0.0.0.0:8090").
    pub bind_address: String,

    /// Provider name served by this instance (default: "sberjazz").
    pub provider: String,

    /// External meeting-platform API base URL.
    pub api_base: String,

    /// Bearer token for the external API.
    pub api_token: Option<SecretString>,

    /// Per-attempt HTTP timeout in seconds.
    pub timeout_seconds: u64,

    /// Retries after the first attempt.
    pub http_retries: u32,

    /// Retry backoff base in milliseconds.
    pub retry_backoff_ms: u64,

    /// Retry backoff cap in milliseconds.
    pub retry_backoff_cap_ms: u64,

    /// HTTP statuses that are retried.
    pub retry_statuses: BTreeSet<u16>,

    /// Consecutive exhausted failures that open the breaker.
    pub cb_failure_threshold: u32,

    /// Breaker cooldown in seconds.
    pub cb_open_seconds: u64,

    /// Whether the reconciliation worker resets an expired breaker.
    pub cb_auto_reset_enabled: bool,

    /// Minimum breaker age before an automatic reset, in seconds.
    pub cb_auto_reset_min_age_seconds: u64,

    /// Operation lock TTL in seconds.
    pub op_lock_ttl_seconds: u64,

    /// Whether the background reconciliation worker runs.
    pub reconcile_enabled: bool,

    /// Reconciliation interval in seconds.
    pub reconcile_interval_seconds: u64,

    /// Reconnects per reconciliation cycle.
    pub reconcile_limit: usize,

    /// Sessions loaded per reconciliation cycle.
    pub reconcile_scan_limit: usize,

    /// Heartbeat staleness threshold in seconds.
    pub reconcile_stale_seconds: u64,

    /// Redis connect timeout in milliseconds.
    pub redis_connect_timeout_ms: u64,

    /// Deadline for a single Redis command in milliseconds.
    pub redis_command_timeout_ms: u64,

    /// Shutdown drain period in seconds.
    pub drain_seconds: u64,

    /// Emit JSON logs instead of the human-readable format.
    pub json_logs: bool,
}

/// Custom Debug implementation that redacts sensitive fields.
impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("database_url", &"[REDACTED]")
            .field("redis_url", &"[REDACTED]")
            .field("bind_address", &self.bind_address)
            .field("provider", &self.provider)
            .field("api_base", &self.api_base)
            .field("api_token", &self.api_token.as_ref().map(|_| "[REDACTED]"))
            .field("timeout_seconds", &self.timeout_seconds)
            .field("http_retries", &self.http_retries)
            .field("retry_backoff_ms", &self.retry_backoff_ms)
            .field("retry_backoff_cap_ms", &self.retry_backoff_cap_ms)
            .field("retry_statuses", &self.retry_statuses)
            .field("cb_failure_threshold", &self.cb_failure_threshold)
            .field("cb_open_seconds", &self.cb_open_seconds)
            .field("cb_auto_reset_enabled", &self.cb_auto_reset_enabled)
            .field(
                "cb_auto_reset_min_age_seconds",
                &self.cb_auto_reset_min_age_seconds,
            )
            .field("op_lock_ttl_seconds", &self.op_lock_ttl_seconds)
            .field("reconcile_enabled", &self.reconcile_enabled)
            .field(
                "reconcile_interval_seconds",
                &self.reconcile_interval_seconds,
            )
            .field("reconcile_limit", &self.reconcile_limit)
            .field("reconcile_scan_limit", &self.reconcile_scan_limit)
            .field("reconcile_stale_seconds", &self.reconcile_stale_seconds)
            .field("redis_connect_timeout_ms", &self.redis_connect_timeout_ms)
            .field("redis_command_timeout_ms", &self.redis_command_timeout_ms)
            .field("drain_seconds", &self.drain_seconds)
            .field("json_logs", &self.json_logs)
            .finish()
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),

    #[error("Invalid retry status list: {0}")]
    InvalidRetryStatuses(String),
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(&env::vars().collect())
    }

    /// Load configuration from a HashMap (for testing).
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let database_url = required(vars, "DATABASE_URL")?;
        let redis_url = required(vars, "REDIS_URL")?;

        let bind_address = vars
            .get("BIND_ADDRESS")
            .cloned()
            .unwrap_or_else(|| DEFAULT_BIND_ADDRESS.to_string());

        let provider = vars
            .get("CONNECTOR_PROVIDER")
            .map(|p| p.trim().to_ascii_lowercase())
            .unwrap_or_else(|| DEFAULT_PROVIDER.to_string());
        if provider.is_empty() {
            return Err(ConfigError::InvalidValue(
                "CONNECTOR_PROVIDER must not be empty".to_string(),
            ));
        }

        let api_base = required(vars, "SBERJAZZ_API_BASE")?
            .trim()
            .trim_end_matches('/')
            .to_string();
        if api_base.is_empty() {
            return Err(ConfigError::InvalidValue(
                "SBERJAZZ_API_BASE must not be empty".to_string(),
            ));
        }

        let api_token = vars
            .get("SBERJAZZ_API_TOKEN")
            .map(|t| t.trim())
            .filter(|t| !t.is_empty())
            .map(|t| SecretString::from(t.to_string()));

        let timeout_seconds = parse_positive(vars, "SBERJAZZ_TIMEOUT_SECONDS", DEFAULT_TIMEOUT_SECONDS)?;
        let http_retries = parse_number(vars, "SBERJAZZ_HTTP_RETRIES", DEFAULT_HTTP_RETRIES)?;
        let retry_backoff_ms =
            parse_number(vars, "SBERJAZZ_HTTP_RETRY_BACKOFF_MS", DEFAULT_RETRY_BACKOFF_MS)?;
        let retry_backoff_cap_ms = parse_number(
            vars,
            "SBERJAZZ_HTTP_RETRY_BACKOFF_CAP_MS",
            DEFAULT_RETRY_BACKOFF_CAP_MS,
        )?;
        if retry_backoff_cap_ms < retry_backoff_ms {
            return Err(ConfigError::InvalidValue(format!(
                "SBERJAZZ_HTTP_RETRY_BACKOFF_CAP_MS ({}) must not be less than SBERJAZZ_HTTP_RETRY_BACKOFF_MS ({})",
                retry_backoff_cap_ms, retry_backoff_ms
            )));
        }

        let retry_statuses = parse_retry_statuses(
            vars.get("SBERJAZZ_HTTP_RETRY_STATUSES")
                .map(String::as_str)
                .unwrap_or(DEFAULT_RETRY_STATUSES),
        )?;

        let cb_failure_threshold = parse_positive(
            vars,
            "SBERJAZZ_CB_FAILURE_THRESHOLD",
            DEFAULT_CB_FAILURE_THRESHOLD,
        )?;
        let cb_open_seconds = parse_positive(vars, "SBERJAZZ_CB_OPEN_SECONDS", DEFAULT_CB_OPEN_SECONDS)?;
        let cb_auto_reset_enabled = parse_bool(vars, "SBERJAZZ_CB_AUTO_RESET_ENABLED", true)?;
        let cb_auto_reset_min_age_seconds = parse_number(
            vars,
            "SBERJAZZ_CB_AUTO_RESET_MIN_AGE_SECONDS",
            DEFAULT_CB_AUTO_RESET_MIN_AGE_SECONDS,
        )?;

        let op_lock_ttl_seconds =
            parse_positive(vars, "SBERJAZZ_OP_LOCK_TTL_SECONDS", DEFAULT_OP_LOCK_TTL_SECONDS)?;

        let reconcile_enabled = parse_bool(vars, "SBERJAZZ_RECONCILE_ENABLED", true)?;
        let reconcile_interval_seconds = parse_positive(
            vars,
            "SBERJAZZ_RECONCILE_INTERVAL_SECONDS",
            DEFAULT_RECONCILE_INTERVAL_SECONDS,
        )?;
        let reconcile_limit =
            parse_positive(vars, "SBERJAZZ_RECONCILE_LIMIT", DEFAULT_RECONCILE_LIMIT)?;
        let reconcile_scan_limit = parse_positive(
            vars,
            "SBERJAZZ_RECONCILE_SCAN_LIMIT",
            DEFAULT_RECONCILE_SCAN_LIMIT,
        )?;
        let reconcile_stale_seconds = parse_positive(
            vars,
            "SBERJAZZ_RECONCILE_STALE_SECONDS",
            DEFAULT_RECONCILE_STALE_SECONDS,
        )?;

        let redis_connect_timeout_ms = parse_positive(
            vars,
            "REDIS_CONNECT_TIMEOUT_MS",
            DEFAULT_REDIS_CONNECT_TIMEOUT_MS,
        )?;
        let redis_command_timeout_ms = parse_positive(
            vars,
            "REDIS_COMMAND_TIMEOUT_MS",
            DEFAULT_REDIS_COMMAND_TIMEOUT_MS,
        )?;

        let drain_seconds = parse_number(vars, "CONNECTOR_DRAIN_SECONDS", DEFAULT_DRAIN_SECONDS)?;

        let json_logs = vars
            .get("LOG_FORMAT")
            .map(|f| f.eq_ignore_ascii_case("json"))
            .unwrap_or(false);

        Ok(Config {
            database_url,
            redis_url,
            bind_address,
            provider,
            api_base,
            api_token,
            timeout_seconds,
            http_retries,
            retry_backoff_ms,
            retry_backoff_cap_ms,
            retry_statuses,
            cb_failure_threshold,
            cb_open_seconds,
            cb_auto_reset_enabled,
            cb_auto_reset_min_age_seconds,
            op_lock_ttl_seconds,
            reconcile_enabled,
            reconcile_interval_seconds,
            reconcile_limit,
            reconcile_scan_limit,
            reconcile_stale_seconds,
            redis_connect_timeout_ms,
            redis_command_timeout_ms,
            drain_seconds,
            json_logs,
        })
    }

    /// Per-attempt timeout for external API calls.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }

    /// Operation lock TTL.
    pub fn op_lock_ttl(&self) -> Duration {
        Duration::from_secs(self.op_lock_ttl_seconds)
    }

    /// Redis connect timeout.
    pub fn redis_connect_timeout(&self) -> Duration {
        Duration::from_millis(self.redis_connect_timeout_ms)
    }

    /// Deadline for a single Redis command.
    pub fn redis_command_timeout(&self) -> Duration {
        Duration::from_millis(self.redis_command_timeout_ms)
    }
}

fn required(vars: &HashMap<String, String>, name: &str) -> Result<String, ConfigError> {
    vars.get(name)
        .cloned()
        .ok_or_else(|| ConfigError::MissingEnvVar(name.to_string()))
}

fn parse_number<T>(vars: &HashMap<String, String>, name: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    match vars.get(name) {
        Some(value_str) => value_str.trim().parse().map_err(|e| {
            ConfigError::InvalidValue(format!(
                "{} must be a valid non-negative integer, got '{}': {}",
                name, value_str, e
            ))
        }),
        None => Ok(default),
    }
}

fn parse_positive<T>(vars: &HashMap<String, String>, name: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr + Default + PartialEq,
    T::Err: fmt::Display,
{
    let value = parse_number(vars, name, default)?;
    if value == T::default() {
        return Err(ConfigError::InvalidValue(format!(
            "{} must be greater than 0",
            name
        )));
    }
    Ok(value)
}

fn parse_bool(vars: &HashMap<String, String>, name: &str, default: bool) -> Result<bool, ConfigError> {
    match vars.get(name).map(|v| v.trim().to_ascii_lowercase()) {
        None => Ok(default),
        Some(v) => match v.as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(ConfigError::InvalidValue(format!(
                "{} must be a boolean, got '{}'",
                name, v
            ))),
        },
    }
}

/// Parse a comma-separated list of HTTP statuses.
///
/// Empty items are ignored; anything else must be a status in 100..=599.
pub fn parse_retry_statuses(raw: &str) -> Result<BTreeSet<u16>, ConfigError> {
    let mut statuses = BTreeSet::new();
    for item in raw.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let status: u16 = item.parse().map_err(|_| {
            ConfigError::InvalidRetryStatuses(format!("'{}' is not an HTTP status", item))
        })?;
        if !(100..=599).contains(&status) {
            return Err(ConfigError::InvalidRetryStatuses(format!(
                "{} is outside 100..=599",
                status
            )));
        }
        statuses.insert(status);
    }
    Ok(statuses)
}
