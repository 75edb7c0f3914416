//! Application configuration for bulkmapper.
//!
//! User config lives at `~/.bulkmapper/bulkmapper.toml`.
//! CLI flags override config file values, which override defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{BulkMapperError, Result};
use crate::types::{CleanupLevel, Endpoint};

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "bulkmapper.toml";

/// Default config directory name under the user's home.
const CONFIG_DIR_NAME: &str = ".bulkmapper";

/// Hard ceiling on concurrent requests, regardless of flags.
pub const MAX_NUM_THREADS: u32 = 8;

/// Hard ceiling on attempts per request.
pub const MAX_NUM_RETRIES: u32 = 10;

/// Hard ceiling on the per-request timeout, in seconds.
pub const MAX_TIMEOUT_SECS: u64 = 35;

// ---------------------------------------------------------------------------
// Config structs (matching bulkmapper.toml schema)
// ---------------------------------------------------------------------------

/// Top-level application config, deserialized from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Mapper API access settings.
    #[serde(default)]
    pub api: ApiConfig,

    /// Default request settings.
    #[serde(default)]
    pub defaults: DefaultsConfig,

    /// Retry, backoff and concurrency adaptation settings.
    #[serde(default)]
    pub failure_handling: FailureHandlingConfig,
}

/// `[api]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// Base URL of the Mapper API gateway.
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Name of the env var holding the API key (never store the key itself).
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,

    /// Contact address included in error messages.
    #[serde(default = "default_support_email")]
    pub support_email: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            api_key_env: default_api_key_env(),
            support_email: default_support_email(),
        }
    }
}

fn default_base_url() -> String {
    "https://api-2445582026130.production.gw.apicast.io".into()
}
fn default_api_key_env() -> String {
    "MAPPER_API_KEY".into()
}
fn default_support_email() -> String {
    "info@altdg.com".into()
}

/// `[defaults]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefaultsConfig {
    /// Mapper endpoint to query.
    #[serde(default)]
    pub endpoint: Endpoint,

    /// Concurrent requests (upper bound for the adaptive controller).
    #[serde(default = "default_num_threads")]
    pub num_threads: u32,

    /// Attempts per request.
    #[serde(default = "default_num_retries")]
    pub num_retries: u32,

    /// Per-request timeout in seconds.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Input cleanup level sent to the API.
    #[serde(default)]
    pub cleanup: CleanupLevel,
}

impl Default for DefaultsConfig {
    fn default() -> Self {
        Self {
            endpoint: Endpoint::default(),
            num_threads: default_num_threads(),
            num_retries: default_num_retries(),
            timeout_secs: default_timeout_secs(),
            cleanup: CleanupLevel::default(),
        }
    }
}

fn default_num_threads() -> u32 {
    4
}
fn default_num_retries() -> u32 {
    2
}
fn default_timeout_secs() -> u64 {
    30
}

/// How the concurrency limit shrinks after a capacity failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DecreasePolicy {
    /// Drop by 2 while above 4, then by 1.
    #[default]
    Step,
    /// Halve, rounding up.
    Halve,
}

/// `[failure_handling]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureHandlingConfig {
    /// Base interval for per-request retry backoff. Attempt `n` waits a random
    /// duration in `[interval * (n - 1), interval * n)`.
    #[serde(default = "default_retry_interval_ms")]
    pub retry_interval_ms: u64,

    /// Pause after a batch hit the rate limit.
    #[serde(default = "default_rate_limit_pause_ms")]
    pub rate_limit_pause_ms: u64,

    /// Clean batches in a row needed before concurrency grows again.
    #[serde(default = "default_grow_after")]
    pub grow_after: u32,

    /// Reduction rule applied on timeouts and rate limits.
    #[serde(default)]
    pub decrease_policy: DecreasePolicy,
}

impl Default for FailureHandlingConfig {
    fn default() -> Self {
        Self {
            retry_interval_ms: default_retry_interval_ms(),
            rate_limit_pause_ms: default_rate_limit_pause_ms(),
            grow_after: default_grow_after(),
            decrease_policy: DecreasePolicy::default(),
        }
    }
}

fn default_retry_interval_ms() -> u64 {
    15_000
}
fn default_rate_limit_pause_ms() -> u64 {
    15_000
}
fn default_grow_after() -> u32 {
    1
}

// ---------------------------------------------------------------------------
// Client config (runtime, merged from config + CLI flags)
// ---------------------------------------------------------------------------

/// Runtime settings for the Mapper API client, merged from config file + CLI flags.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// API gateway base URL.
    pub base_url: Url,
    /// Endpoint to query.
    pub endpoint: Endpoint,
    /// Static API key, sent as the `X_User_Key` query parameter.
    pub api_key: String,
    /// Per-request timeout.
    pub timeout: Duration,
    /// Attempts per request (at least 1).
    pub num_retries: u32,
    /// Base backoff interval between attempts.
    pub retry_interval: Duration,
    /// Cleanup level header value.
    pub cleanup: CleanupLevel,
    /// Global type hint; a per-row hint takes precedence.
    pub type_hint: Option<String>,
    /// Inputs are clean company names (merchant endpoint only).
    pub companies_only: bool,
    /// Contact address for error messages.
    pub support_email: String,
}

impl ClientConfig {
    /// Build client settings from the loaded config and a resolved API key.
    pub fn from_app(config: &AppConfig, api_key: impl Into<String>) -> Result<Self> {
        Ok(Self {
            base_url: parse_base_url(&config.api.base_url)?,
            endpoint: config.defaults.endpoint,
            api_key: api_key.into(),
            timeout: Duration::from_secs(config.defaults.timeout_secs),
            num_retries: config.defaults.num_retries,
            retry_interval: Duration::from_millis(config.failure_handling.retry_interval_ms),
            cleanup: config.defaults.cleanup,
            type_hint: None,
            companies_only: false,
            support_email: config.api.support_email.clone(),
        }
        .with_limits())
    }

    /// Clamp retries and timeout to their ceilings, warning when a value was lowered.
    pub fn with_limits(mut self) -> Self {
        self.num_retries = clamp_to_max("number of retries", self.num_retries.max(1), MAX_NUM_RETRIES);
        let secs = clamp_to_max("request timeout (seconds)", self.timeout.as_secs().max(1), MAX_TIMEOUT_SECS);
        self.timeout = Duration::from_secs(secs);
        self
    }
}

/// Parse and validate the API base URL.
pub fn parse_base_url(raw: &str) -> Result<Url> {
    let url = Url::parse(raw.trim_end_matches('/'))
        .map_err(|e| BulkMapperError::config(format!("invalid API base URL '{raw}': {e}")))?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        other => Err(BulkMapperError::config(format!(
            "API base URL must be http or https, got '{other}'"
        ))),
    }
}

/// Lower `value` to `max` if needed, logging a warning when it happens.
pub fn clamp_to_max<T>(setting: &str, value: T, max: T) -> T
where
    T: PartialOrd + Copy + std::fmt::Display,
{
    if value > max {
        tracing::warn!(%value, %max, "{setting} was set to its max of {max}");
        max
    } else {
        value
    }
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

/// Get the path to the config directory (`~/.bulkmapper/`).
pub fn config_dir() -> Result<PathBuf> {
    let home = dirs::home_dir()
        .ok_or_else(|| BulkMapperError::config("could not determine home directory"))?;
    Ok(home.join(CONFIG_DIR_NAME))
}

/// Get the path to the config file (`~/.bulkmapper/bulkmapper.toml`).
pub fn config_file_path() -> Result<PathBuf> {
    Ok(config_dir()?.join(CONFIG_FILE_NAME))
}

/// Load the application config from disk. Returns defaults if the file does not exist.
pub fn load_config() -> Result<AppConfig> {
    let path = config_file_path()?;

    if !path.exists() {
        tracing::debug!(?path, "config file not found, using defaults");
        return Ok(AppConfig::default());
    }

    load_config_from(&path)
}

/// Load the application config from a specific file path.
pub fn load_config_from(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| BulkMapperError::io(path, e))?;

    toml::from_str(&content).map_err(|e| {
        BulkMapperError::config(format!("failed to parse {}: {e}", path.display()))
    })
}

/// Create the config directory and write a default config file.
/// Returns the path to the created file.
pub fn init_config() -> Result<PathBuf> {
    let dir = config_dir()?;
    std::fs::create_dir_all(&dir).map_err(|e| BulkMapperError::io(&dir, e))?;

    let path = dir.join(CONFIG_FILE_NAME);
    let config = AppConfig::default();
    let content =
        toml::to_string_pretty(&config).map_err(|e| BulkMapperError::config(e.to_string()))?;

    std::fs::write(&path, content).map_err(|e| BulkMapperError::io(&path, e))?;
    tracing::info!(?path, "created default config file");

    Ok(path)
}

/// Resolve the API key: an explicit value wins, then the configured env var.
pub fn resolve_api_key(explicit: Option<&str>, config: &AppConfig) -> Result<String> {
    if let Some(key) = explicit.map(str::trim).filter(|k| !k.is_empty()) {
        return Ok(key.to_string());
    }

    let var_name = &config.api.api_key_env;
    match std::env::var(var_name) {
        Ok(val) if !val.trim().is_empty() => Ok(val.trim().to_string()),
        _ => Err(BulkMapperError::config(format!(
            "Mapper API key not found. Pass --key or set the {var_name} environment variable."
        ))),
    }
}
