//! Configuration management
//!
//! Server, database, storage, model-path and experiment settings, read from a
//! TOML file. A missing file is written out with defaults on first load.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default configuration file name, relative to the working directory
pub const DEFAULT_CONFIG_FILE: &str = "bao.toml";

/// Main configuration structure
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Protocol server listener
    #[serde(default)]
    pub server: ServerConfig,
    /// Live PostgreSQL connection used for experiments
    #[serde(default)]
    pub postgres: PostgresConfig,
    /// Experience database
    #[serde(default)]
    pub storage: StorageConfig,
    /// Model directories
    #[serde(default)]
    pub models: ModelsConfig,
    /// Retraining limits
    #[serde(default)]
    pub training: TrainingConfig,
    /// Experiment reward polling
    #[serde(default)]
    pub experiments: ExperimentsConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_listen_on")]
    pub listen_on: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_listen_on() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    9381
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_on: default_listen_on(),
            port: default_port(),
        }
    }
}

impl ServerConfig {
    pub fn address(&self) -> String {
        format!("{}:{}", self.listen_on, self.port)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PostgresConfig {
    /// libpq-style connection string
    #[serde(default = "default_connect_string")]
    pub connect_string: String,
    /// Cap on a single experimental query
    #[serde(default = "default_max_query_time_seconds")]
    pub max_query_time_seconds: u64,
}

fn default_connect_string() -> String {
    "host=localhost user=postgres".to_string()
}

fn default_max_query_time_seconds() -> u64 {
    120
}

impl Default for PostgresConfig {
    fn default() -> Self {
        Self {
            connect_string: default_connect_string(),
            max_query_time_seconds: default_max_query_time_seconds(),
        }
    }
}

impl PostgresConfig {
    pub fn max_query_time(&self) -> Duration {
        Duration::from_secs(self.max_query_time_seconds)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,
}

fn default_database_path() -> PathBuf {
    PathBuf::from("bao.db")
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
        }
    }
}

/// Where the served, previous and in-training models live
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelsConfig {
    #[serde(default = "default_model_path")]
    pub default_path: PathBuf,
    #[serde(default = "default_previous_model_path")]
    pub previous_path: PathBuf,
    #[serde(default = "default_tmp_model_path")]
    pub tmp_path: PathBuf,
}

fn default_model_path() -> PathBuf {
    PathBuf::from("bao_default_model")
}

fn default_previous_model_path() -> PathBuf {
    PathBuf::from("bao_previous_model")
}

fn default_tmp_model_path() -> PathBuf {
    PathBuf::from("bao_tmp_model")
}

impl Default for ModelsConfig {
    fn default() -> Self {
        Self {
            default_path: default_model_path(),
            previous_path: default_previous_model_path(),
            tmp_path: default_tmp_model_path(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingConfig {
    /// Retrain attempts after the first rejected model
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Warn when training on fewer experiences than this
    #[serde(default = "default_min_experience_warning")]
    pub min_experience_warning: usize,
}

fn default_max_retries() -> u32 {
    5
}

fn default_min_experience_warning() -> usize {
    20
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            min_experience_warning: default_min_experience_warning(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentsConfig {
    #[serde(default = "default_reward_poll_attempts")]
    pub reward_poll_attempts: u32,
    #[serde(default = "default_reward_poll_interval_ms")]
    pub reward_poll_interval_ms: u64,
}

fn default_reward_poll_attempts() -> u32 {
    5
}

fn default_reward_poll_interval_ms() -> u64 {
    1000
}

impl Default for ExperimentsConfig {
    fn default() -> Self {
        Self {
            reward_poll_attempts: default_reward_poll_attempts(),
            reward_poll_interval_ms: default_reward_poll_interval_ms(),
        }
    }
}

impl ExperimentsConfig {
    pub fn reward_poll_interval(&self) -> Duration {
        Duration::from_millis(self.reward_poll_interval_ms)
    }
}

impl Config {
    /// Load configuration from file, writing defaults if it doesn't exist
    pub fn load(path: &Path) -> Result<Self> {
        if path.exists() {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file {}", path.display()))?;
            let config: Config = toml::from_str(&contents)
                .with_context(|| format!("Failed to parse config file {}", path.display()))?;
            Ok(config)
        } else {
            let config = Config::default();
            config.save(path)?;
            Ok(config)
        }
    }

    /// Save configuration to file
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .context("Failed to create config directory")?;
            }
        }

        let contents = toml::to_string_pretty(self)
            .context("Failed to serialize config")?;

        std::fs::write(path, contents)
            .context("Failed to write config file")?;

        Ok(())
    }
}

/// Print the effective configuration
pub fn show_config(path: &Path) -> Result<()> {
    let config = Config::load(path)?;

    println!("Configuration ({})", path.display());
    println!();
    println!("  {:<28} {}", "server.address", config.server.address());
    println!("  {:<28} {}", "postgres.connect_string", config.postgres.connect_string);
    println!("  {:<28} {}s", "postgres.max_query_time", config.postgres.max_query_time_seconds);
    println!("  {:<28} {}", "storage.database_path", config.storage.database_path.display());
    println!("  {:<28} {}", "models.default_path", config.models.default_path.display());
    println!("  {:<28} {}", "models.previous_path", config.models.previous_path.display());
    println!("  {:<28} {}", "models.tmp_path", config.models.tmp_path.display());
    println!("  {:<28} {}", "training.max_retries", config.training.max_retries);
    println!("  {:<28} {}", "training.min_experience_warning", config.training.min_experience_warning);
    println!("  {:<28} {}", "experiments.reward_poll_attempts", config.experiments.reward_poll_attempts);
    println!("  {:<28} {}ms", "experiments.reward_poll_interval", config.experiments.reward_poll_interval_ms);

    Ok(())
}
