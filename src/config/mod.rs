use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::info;

/// Name of the configuration file looked up inside the configs directory
pub const CONFIG_FILE_NAME: &str = "config.toml";

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub state: StateConfig,
    #[serde(default)]
    pub http: HttpConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            data_dir: default_data_dir(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    17000
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Relational store holding rules, mutes, resources, users and datasources
    #[serde(default = "default_store_url")]
    pub rule_store_url: String,
    /// Append-only store for alert events (may point at the same database)
    #[serde(default = "default_store_url")]
    pub event_store_url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            rule_store_url: default_store_url(),
            event_store_url: default_store_url(),
            max_connections: default_max_connections(),
        }
    }
}

fn default_store_url() -> String {
    "sqlite:./data/n9e.db?mode=rwc".to_string()
}

fn default_max_connections() -> u32 {
    5
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    /// Interval between stat checks against the rule store (default: 9)
    #[serde(default = "default_sync_interval")]
    pub sync_interval_secs: u64,
    /// Force a full reload after this many seconds even if stats are unchanged (default: 600)
    #[serde(default = "default_full_sync_ceiling")]
    pub full_sync_ceiling_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            sync_interval_secs: default_sync_interval(),
            full_sync_ceiling_secs: default_full_sync_ceiling(),
        }
    }
}

fn default_sync_interval() -> u64 {
    9
}

fn default_full_sync_ceiling() -> u64 {
    600
}

#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerConfig {
    /// Interval between reconciliations of cached rules against running tasks (default: 9)
    #[serde(default = "default_sync_interval")]
    pub sync_interval_secs: u64,
    /// Delay before the first reconciliation, lets caches warm up (default: 0)
    #[serde(default)]
    pub engine_delay_secs: u64,
    /// Total time shutdown gives in-flight evaluations and the pipeline drain together (default: 5)
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_secs: u64,
    /// Upper bound on concurrently running rule evaluations (default: 256)
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    /// Period used when a rule declares none (default: 10)
    #[serde(default = "default_period")]
    pub default_period_secs: i64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            sync_interval_secs: default_sync_interval(),
            engine_delay_secs: 0,
            shutdown_grace_secs: default_shutdown_grace(),
            max_concurrency: default_max_concurrency(),
            default_period_secs: default_period(),
        }
    }
}

fn default_shutdown_grace() -> u64 {
    5
}

fn default_max_concurrency() -> usize {
    256
}

fn default_period() -> i64 {
    crate::db::DEFAULT_PERIOD_SECS
}

#[derive(Debug, Clone, Deserialize)]
pub struct PipelineConfig {
    /// Capacity of the primary candidate buffer (default: 10000)
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    /// Number of pipeline workers; fingerprints are sharded across them (default: 8)
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Fill ratio above which evaluators skip comparison queries (default: 0.8)
    #[serde(default = "default_throttle_ratio")]
    pub throttle_ratio: f64,
    /// Capacity of the secondary queue in front of slow sinks (default: 1000)
    #[serde(default = "default_forward_buffer")]
    pub forward_buffer: usize,
    /// How long persisted events are retained (default: 86400)
    #[serde(default = "default_retention")]
    pub retention_secs: i64,
    /// Append-only JSON-lines file for events that could not be persisted
    #[serde(default = "default_dead_letter_path")]
    pub dead_letter_path: PathBuf,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            buffer_size: default_buffer_size(),
            workers: default_workers(),
            throttle_ratio: default_throttle_ratio(),
            forward_buffer: default_forward_buffer(),
            retention_secs: default_retention(),
            dead_letter_path: default_dead_letter_path(),
        }
    }
}

fn default_buffer_size() -> usize {
    10_000
}

fn default_workers() -> usize {
    8
}

fn default_throttle_ratio() -> f64 {
    0.8
}

fn default_forward_buffer() -> usize {
    1000
}

fn default_retention() -> i64 {
    86_400
}

fn default_dead_letter_path() -> PathBuf {
    PathBuf::from("./data/dead_letter.jsonl")
}

#[derive(Debug, Clone, Deserialize)]
pub struct StateConfig {
    /// Where per-fingerprint alert state is written on clean shutdown
    #[serde(default = "default_snapshot_path")]
    pub snapshot_path: PathBuf,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            snapshot_path: default_snapshot_path(),
        }
    }
}

fn default_snapshot_path() -> PathBuf {
    PathBuf::from("./data/alert_state.json")
}

#[derive(Debug, Clone, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

fn default_true() -> bool {
    true
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            database: DatabaseConfig::default(),
            logging: LoggingConfig::default(),
            cache: CacheConfig::default(),
            scheduler: SchedulerConfig::default(),
            pipeline: PipelineConfig::default(),
            state: StateConfig::default(),
            http: HttpConfig::default(),
        }
    }
}

impl Config {
    /// Load `config.toml` from the given configs directory.
    ///
    /// A missing file yields defaults; an unreadable or malformed file is an error.
    pub fn load(configs_dir: &Path) -> Result<Self> {
        let path = configs_dir.join(CONFIG_FILE_NAME);
        if path.exists() {
            info!("Loading configuration from {}", path.display());
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;
            Self::parse(&content)
        } else {
            info!("No config file found in {}, using defaults", configs_dir.display());
            Ok(Config::default())
        }
    }

    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).with_context(|| "Failed to parse configuration file")
    }
}
