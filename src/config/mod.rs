//! Configuration layer: typed settings with layered precedence (file → env → CLI).

use std::{collections::BTreeMap, path::PathBuf, str::FromStr, sync::Arc, time::Duration};

use clap::Parser;
use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;

use crate::{
    cache::{AssetCache, CacheCategory, ExpiryTable, OutputCache, OutputPolicy, default_expiries},
    infra::fetcher::{AssetFetcher, FetchError, HttpFetcher, RetryPolicy},
    render::{ConfigError, EngineConfig, EngineMode, WorkerSettings},
    util::bytes::mebibytes,
};

mod cli;

pub use cli::{CacheOverrides, CleanArgs, CliArgs, Command, RunArgs, RunOverrides, StatsArgs};

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "feedcard";
const ENV_PREFIX: &str = "FEEDCARD";
const DEFAULT_ASSETS_DIR: &str = "data/cache";
const DEFAULT_OUTPUT_DIR: &str = "data/image_cache";
const DEFAULT_OUTPUT_FRESHNESS_HOURS: u64 = 24;
const DEFAULT_OUTPUT_MAX_AGE_DAYS: u64 = 7;
const DEFAULT_OUTPUT_MAX_SIZE_MB: u64 = 1024;
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;
const DEFAULT_RETRY_BACKOFF_MS: u64 = 3000;

/// Fully-resolved settings after precedence resolution and validation.
#[derive(Debug, Clone)]
pub struct Settings {
    pub logging: LoggingSettings,
    pub engine: EngineConfig,
    pub assets: AssetSettings,
    pub output: OutputSettings,
    pub network: NetworkSettings,
}

#[derive(Debug, Clone)]
pub struct LoggingSettings {
    pub level: LevelFilter,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy)]
pub enum LogFormat {
    Json,
    Compact,
}

#[derive(Debug, Clone)]
pub struct AssetSettings {
    pub directory: PathBuf,
    pub download_original: bool,
    pub expires: ExpiryTable,
}

#[derive(Debug, Clone)]
pub struct OutputSettings {
    pub directory: PathBuf,
    pub freshness: Duration,
    pub max_age: Duration,
    pub max_bytes: u64,
}

impl OutputSettings {
    pub fn policy(&self) -> OutputPolicy {
        OutputPolicy {
            freshness: self.freshness,
            max_age: self.max_age,
            max_bytes: self.max_bytes,
        }
    }
}

#[derive(Debug, Clone)]
pub struct NetworkSettings {
    pub request_timeout: Duration,
    pub retry_backoff: Duration,
    pub user_agent: String,
}

impl NetworkSettings {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::with_backoff(self.retry_backoff)
    }
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to build configuration: {0}")]
    Build(#[from] config::ConfigError),
    #[error("invalid configuration for `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
    #[error("invalid engine configuration: {0}")]
    Engine(#[from] ConfigError),
}

impl LoadError {
    fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            reason: reason.into(),
        }
    }
}

/// Load settings using the configured precedence (file → environment → CLI).
pub fn load(cli: &CliArgs) -> Result<Settings, LoadError> {
    let mut builder = Config::builder()
        .add_source(File::with_name(DEFAULT_CONFIG_BASENAME).required(false))
        .add_source(File::with_name(LOCAL_CONFIG_BASENAME).required(false));

    if let Some(path) = cli.config_file.as_ref() {
        builder = builder.add_source(File::from(path.as_path()).required(true));
    }

    builder = builder.add_source(Environment::with_prefix(ENV_PREFIX).separator("__"));

    let mut raw: RawSettings = builder.build()?.try_deserialize()?;

    match cli.command.as_ref() {
        Some(Command::Run(args)) => raw.apply_run_overrides(&args.overrides),
        Some(Command::Clean(args)) => raw.apply_cache_overrides(&args.cache),
        Some(Command::Stats(args)) => raw.apply_cache_overrides(&args.cache),
        None => raw.apply_run_overrides(&RunOverrides::default()),
    }

    Settings::from_raw(raw)
}

/// Resolve configuration using the supplied CLI arguments, returning both for downstream use.
pub fn load_with_cli() -> Result<(CliArgs, Settings), LoadError> {
    let args = CliArgs::parse();
    let settings = load(&args)?;
    Ok((args, settings))
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    logging: RawLoggingSettings,
    engine: RawEngineSettings,
    assets: RawAssetSettings,
    output: RawOutputSettings,
    network: RawNetworkSettings,
}

impl RawSettings {
    fn apply_run_overrides(&mut self, overrides: &RunOverrides) {
        if let Some(level) = overrides.log_level.as_ref() {
            self.logging.level = Some(level.clone());
        }
        if let Some(json) = overrides.log_json {
            self.logging.json = Some(json);
        }
        if let Some(value) = overrides.engine_max_concurrent {
            self.engine.max_concurrent = Some(value);
        }
        if let Some(value) = overrides.engine_max_queue_size {
            self.engine.max_queue_size = Some(value);
        }
        if let Some(value) = overrides.engine_drawing_timeout_ms {
            self.engine.drawing_timeout_ms = Some(value);
        }
        if let Some(value) = overrides.engine_cleanup_interval_ms {
            self.engine.cleanup_interval_ms = Some(value);
        }

        self.apply_cache_overrides(&overrides.cache);
    }

    fn apply_cache_overrides(&mut self, overrides: &CacheOverrides) {
        if let Some(directory) = overrides.assets_directory.as_ref() {
            self.assets.directory = Some(directory.clone());
        }
        if let Some(directory) = overrides.output_directory.as_ref() {
            self.output.directory = Some(directory.clone());
        }
        if let Some(size) = overrides.output_max_size_mb {
            self.output.max_size_mb = Some(size);
        }
    }
}

impl Settings {
    /// Source asset cache with the configured directory, origin preference and retry.
    pub fn asset_cache(&self, fetcher: Arc<dyn AssetFetcher>) -> AssetCache {
        AssetCache::new(self.assets.directory.clone(), fetcher)
            .with_download_original(self.assets.download_original)
            .with_retry(self.network.retry_policy())
    }

    pub fn output_cache(&self, fetcher: Arc<dyn AssetFetcher>) -> OutputCache {
        OutputCache::new(self.output.directory.clone(), fetcher)
            .with_policy(self.output.policy())
            .with_retry(self.network.retry_policy())
    }

    /// Shared HTTP fetcher honouring the network settings.
    pub fn http_fetcher(&self) -> Result<HttpFetcher, FetchError> {
        HttpFetcher::new(self.network.request_timeout, &self.network.user_agent)
    }

    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let RawSettings {
            logging,
            engine,
            assets,
            output,
            network,
        } = raw;

        Ok(Self {
            logging: build_logging_settings(logging)?,
            engine: build_engine_config(engine)?,
            assets: build_asset_settings(assets)?,
            output: build_output_settings(output)?,
            network: build_network_settings(network)?,
        })
    }
}

fn build_logging_settings(logging: RawLoggingSettings) -> Result<LoggingSettings, LoadError> {
    let level = match logging.level {
        Some(level) => LevelFilter::from_str(level.as_str()).map_err(|err| {
            LoadError::invalid("logging.level", format!("failed to parse: {err}"))
        })?,
        None => LevelFilter::INFO,
    };

    let format = if logging.json.unwrap_or(false) {
        LogFormat::Json
    } else {
        LogFormat::Compact
    };

    Ok(LoggingSettings { level, format })
}

fn build_engine_config(engine: RawEngineSettings) -> Result<EngineConfig, LoadError> {
    let defaults = EngineConfig::default();
    let mode = match engine.mode.as_deref().map(str::trim) {
        None => defaults.mode,
        Some("in_process") => EngineMode::InProcess,
        Some("worker_process") => EngineMode::WorkerProcess,
        Some(other) => {
            return Err(LoadError::invalid(
                "engine.mode",
                format!("expected `in_process` or `worker_process`, got `{other}`"),
            ));
        }
    };

    let worker_defaults = WorkerSettings::default();
    let worker = WorkerSettings {
        restart_interval: millis_or(
            engine.worker.restart_interval_ms,
            worker_defaults.restart_interval,
        ),
        max_memory_mb: engine
            .worker
            .max_memory_mb
            .unwrap_or(worker_defaults.max_memory_mb),
        idle_timeout: millis_or(engine.worker.idle_timeout_ms, worker_defaults.idle_timeout),
    };

    let config = EngineConfig {
        max_concurrent: engine.max_concurrent.unwrap_or(defaults.max_concurrent),
        max_queue_size: engine.max_queue_size.unwrap_or(defaults.max_queue_size),
        idle_timeout: millis_or(engine.idle_timeout_ms, defaults.idle_timeout),
        cleanup_interval: millis_or(engine.cleanup_interval_ms, defaults.cleanup_interval),
        drawing_timeout: millis_or(engine.drawing_timeout_ms, defaults.drawing_timeout),
        memory_warning_threshold: engine
            .memory_warning_threshold
            .unwrap_or(defaults.memory_warning_threshold),
        memory_critical_threshold: engine
            .memory_critical_threshold
            .unwrap_or(defaults.memory_critical_threshold),
        memory_budget_mb: engine.memory_budget_mb.or(defaults.memory_budget_mb),
        mode,
        worker,
    };
    config.validate()?;
    Ok(config)
}

fn build_asset_settings(assets: RawAssetSettings) -> Result<AssetSettings, LoadError> {
    let directory = non_empty_path(
        assets.directory,
        DEFAULT_ASSETS_DIR,
        "assets.directory",
    )?;

    let mut expires = default_expiries();
    for (name, days) in assets.expires {
        let category = CacheCategory::from_str(&name)
            .map_err(|err| LoadError::invalid("assets.expires", err.to_string()))?;
        expires.insert(category, days);
    }

    Ok(AssetSettings {
        directory,
        download_original: assets.download_original.unwrap_or(true),
        expires,
    })
}

fn build_output_settings(output: RawOutputSettings) -> Result<OutputSettings, LoadError> {
    let directory = non_empty_path(output.directory, DEFAULT_OUTPUT_DIR, "output.directory")?;
    let freshness_hours = positive(
        output.freshness_hours,
        DEFAULT_OUTPUT_FRESHNESS_HOURS,
        "output.freshness_hours",
    )?;
    let max_age_days = positive(
        output.max_age_days,
        DEFAULT_OUTPUT_MAX_AGE_DAYS,
        "output.max_age_days",
    )?;
    let max_size_mb = positive(
        output.max_size_mb,
        DEFAULT_OUTPUT_MAX_SIZE_MB,
        "output.max_size_mb",
    )?;

    Ok(OutputSettings {
        directory,
        freshness: Duration::from_secs(freshness_hours.saturating_mul(60 * 60)),
        max_age: Duration::from_secs(max_age_days.saturating_mul(24 * 60 * 60)),
        max_bytes: mebibytes(max_size_mb),
    })
}

fn build_network_settings(network: RawNetworkSettings) -> Result<NetworkSettings, LoadError> {
    let request_timeout_secs = positive(
        network.request_timeout_secs,
        DEFAULT_REQUEST_TIMEOUT_SECS,
        "network.request_timeout_secs",
    )?;
    let user_agent = match network.user_agent {
        Some(agent) if agent.trim().is_empty() => {
            return Err(LoadError::invalid(
                "network.user_agent",
                "must not be empty",
            ));
        }
        Some(agent) => agent,
        None => HttpFetcher::default_user_agent().to_string(),
    };

    Ok(NetworkSettings {
        request_timeout: Duration::from_secs(request_timeout_secs),
        retry_backoff: Duration::from_millis(
            network.retry_backoff_ms.unwrap_or(DEFAULT_RETRY_BACKOFF_MS),
        ),
        user_agent,
    })
}

fn millis_or(value: Option<u64>, default: Duration) -> Duration {
    value.map(Duration::from_millis).unwrap_or(default)
}

fn positive(value: Option<u64>, default: u64, key: &'static str) -> Result<u64, LoadError> {
    match value.unwrap_or(default) {
        0 => Err(LoadError::invalid(key, "must be greater than zero")),
        value => Ok(value),
    }
}

fn non_empty_path(
    value: Option<PathBuf>,
    default: &str,
    key: &'static str,
) -> Result<PathBuf, LoadError> {
    let path = value.unwrap_or_else(|| PathBuf::from(default));
    if path.as_os_str().is_empty() {
        return Err(LoadError::invalid(key, "path must not be empty"));
    }
    Ok(path)
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLoggingSettings {
    level: Option<String>,
    json: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawEngineSettings {
    max_concurrent: Option<usize>,
    max_queue_size: Option<usize>,
    idle_timeout_ms: Option<u64>,
    cleanup_interval_ms: Option<u64>,
    drawing_timeout_ms: Option<u64>,
    memory_warning_threshold: Option<f64>,
    memory_critical_threshold: Option<f64>,
    memory_budget_mb: Option<u64>,
    mode: Option<String>,
    worker: RawWorkerSettings,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawWorkerSettings {
    restart_interval_ms: Option<u64>,
    max_memory_mb: Option<u32>,
    idle_timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawAssetSettings {
    directory: Option<PathBuf>,
    download_original: Option<bool>,
    expires: BTreeMap<String, u32>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawOutputSettings {
    directory: Option<PathBuf>,
    freshness_hours: Option<u64>,
    max_age_days: Option<u64>,
    max_size_mb: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawNetworkSettings {
    request_timeout_secs: Option<u64>,
    retry_backoff_ms: Option<u64>,
    user_agent: Option<String>,
}
