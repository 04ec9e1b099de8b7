//! Configuration for the F1 pipeline.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::retry::RetryConfig;

/// Pipeline identity and trigger configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default = "default_pipeline_id")]
    pub id: String,
    /// Toggle value used until the store records one
    #[serde(default = "default_enabled")]
    pub enabled_by_default: bool,
    #[serde(default = "default_schedule_interval_secs")]
    pub schedule_interval_secs: u64,
    /// Shell command run by the downstream consumer hook
    #[serde(default)]
    pub downstream_command: Option<String>,
}

fn default_pipeline_id() -> String {
    "f1_etl_pipeline".to_string()
}

fn default_enabled() -> bool {
    true
}

fn default_schedule_interval_secs() -> u64 {
    24 * 60 * 60
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            id: default_pipeline_id(),
            enabled_by_default: default_enabled(),
            schedule_interval_secs: default_schedule_interval_secs(),
            downstream_command: None,
        }
    }
}

/// Persisted store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_store_path")]
    pub path: String,
}

fn default_store_path() -> String {
    "data/f1_data.db".to_string()
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
        }
    }
}

impl StoreConfig {
    pub fn path(&self) -> &Path {
        Path::new(&self.path)
    }

    /// Lock file guarding the store against concurrent runs
    pub fn lock_path(&self) -> PathBuf {
        PathBuf::from(format!("{}.lock", self.path))
    }
}

/// Upstream telemetry API configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_start_year")]
    pub start_year: i32,
    /// Session names to ingest (e.g. "Race", "Qualifying")
    #[serde(default = "default_session_names")]
    pub session_names: Vec<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_requests_per_minute")]
    pub requests_per_minute: u32,
    #[serde(default = "default_min_delay_ms")]
    pub min_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

fn default_base_url() -> String {
    crate::source::openf1::BASE_URL.to_string()
}

fn default_start_year() -> i32 {
    2023
}

fn default_session_names() -> Vec<String> {
    vec!["Race".to_string()]
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_requests_per_minute() -> u32 {
    60
}

fn default_min_delay_ms() -> u64 {
    150
}

fn default_max_delay_ms() -> u64 {
    300
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            start_year: default_start_year(),
            session_names: default_session_names(),
            timeout_secs: default_timeout_secs(),
            requests_per_minute: default_requests_per_minute(),
            min_delay_ms: default_min_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

impl SourceConfig {
    pub fn wants_session(&self, session_name: &str) -> bool {
        self.session_names.is_empty()
            || self
                .session_names
                .iter()
                .any(|name| name.eq_ignore_ascii_case(session_name))
    }
}

/// Backoff settings for source requests
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrySettings {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_retry_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
}

fn default_max_retries() -> u32 {
    2
}

fn default_initial_delay_ms() -> u64 {
    500
}

fn default_retry_max_delay_ms() -> u64 {
    30_000
}

fn default_multiplier() -> f64 {
    2.0
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_retry_max_delay_ms(),
            multiplier: default_multiplier(),
        }
    }
}

impl From<&RetrySettings> for RetryConfig {
    fn from(settings: &RetrySettings) -> Self {
        RetryConfig {
            max_retries: settings.max_retries,
            initial_delay: Duration::from_millis(settings.initial_delay_ms),
            max_delay: Duration::from_millis(settings.max_delay_ms),
            multiplier: settings.multiplier,
        }
    }
}

/// Tyre-change feature configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeatureConfig {
    /// Laps averaged on each side of a compound change
    #[serde(default = "default_window")]
    pub window: usize,
    /// Laps either side of a pit stop excluded from the means
    #[serde(default = "default_pit_adjacent_laps")]
    pub pit_adjacent_laps: i64,
}

fn default_window() -> usize {
    3
}

fn default_pit_adjacent_laps() -> i64 {
    1
}

impl Default for FeatureConfig {
    fn default() -> Self {
        Self {
            window: default_window(),
            pit_adjacent_laps: default_pit_adjacent_laps(),
        }
    }
}

/// Extra team alias appended to the built-in lineage table
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TeamAliasConfig {
    pub alias: String,
    pub team_id: i64,
    #[serde(default)]
    pub first_season: Option<i32>,
    #[serde(default)]
    pub last_season: Option<i32>,
}

/// Identity resolution configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IdentityConfig {
    #[serde(default)]
    pub team_aliases: Vec<TeamAliasConfig>,
}

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub source: SourceConfig,
    #[serde(default)]
    pub retry: RetrySettings,
    #[serde(default)]
    pub features: FeatureConfig,
    #[serde(default)]
    pub identity: IdentityConfig,
}

impl AppConfig {
    /// Load configuration from defaults, an optional file and the environment
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let file = match path {
            Some(p) => config::File::from(p).required(true),
            None => config::File::with_name("config").required(false),
        };

        let config = config::Config::builder()
            // Start with defaults
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(file)
            // Override with environment variables (F1_SOURCE__BASE_URL, etc.)
            .add_source(
                config::Environment::with_prefix("F1")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        Ok(config.try_deserialize()?)
    }

    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig::from(&self.retry)
    }
}
