use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, builder::BoolishValueParser};

/// Command-line arguments for the feedcard binary.
#[derive(Debug, Parser)]
#[command(name = "feedcard", version, about = "Feed card rendering engine")]
pub struct CliArgs {
    /// Optional path to a configuration file.
    #[arg(long = "config-file", env = "FEEDCARD_CONFIG_FILE", value_name = "PATH")]
    pub config_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Run the engine with its cleanup monitor and daily asset sweep.
    Run(Box<RunArgs>),
    /// Sweep expired assets and trim the output cache once, then exit.
    Clean(CleanArgs),
    /// Print output cache statistics and engine status as JSON.
    Stats(StatsArgs),
}

#[derive(Debug, Args, Default, Clone)]
pub struct RunArgs {
    #[command(flatten)]
    pub overrides: RunOverrides,
}

#[derive(Debug, Args, Default, Clone)]
pub struct CacheOverrides {
    /// Override the source asset cache root.
    #[arg(long = "assets-directory", value_name = "PATH")]
    pub assets_directory: Option<PathBuf>,

    /// Override the output cache directory.
    #[arg(long = "output-directory", value_name = "PATH")]
    pub output_directory: Option<PathBuf>,

    /// Override the output cache size budget.
    #[arg(long = "output-max-size-mb", value_name = "MB")]
    pub output_max_size_mb: Option<u64>,
}

#[derive(Debug, Args, Default, Clone)]
pub struct RunOverrides {
    #[command(flatten)]
    pub cache: CacheOverrides,

    /// Override the base log level (trace|debug|info|warn|error).
    #[arg(long = "log-level", value_name = "LEVEL")]
    pub log_level: Option<String>,

    /// Toggle JSON logging.
    #[arg(
        long = "log-json",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub log_json: Option<bool>,

    /// Override how many drawings may run at once.
    #[arg(long = "engine-max-concurrent", value_name = "COUNT")]
    pub engine_max_concurrent: Option<usize>,

    /// Override how many drawings may wait for a slot.
    #[arg(long = "engine-max-queue-size", value_name = "COUNT")]
    pub engine_max_queue_size: Option<usize>,

    /// Override the per-drawing deadline.
    #[arg(long = "engine-drawing-timeout-ms", value_name = "MS")]
    pub engine_drawing_timeout_ms: Option<u64>,

    /// Override the cleanup monitor period.
    #[arg(long = "engine-cleanup-interval-ms", value_name = "MS")]
    pub engine_cleanup_interval_ms: Option<u64>,
}

#[derive(Debug, Args, Default, Clone)]
pub struct CleanArgs {
    #[command(flatten)]
    pub cache: CacheOverrides,

    /// Only trim the output cache.
    #[arg(long, action = clap::ArgAction::SetTrue)]
    pub output_only: bool,
}

#[derive(Debug, Args, Default, Clone)]
pub struct StatsArgs {
    #[command(flatten)]
    pub cache: CacheOverrides,

    /// Pretty-print the JSON document.
    #[arg(long, action = clap::ArgAction::SetTrue)]
    pub pretty: bool,
}
