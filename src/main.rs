use std::{process, sync::Arc, time::Duration};

use feedcard::{
    cache::{AssetSweeper, OutputCache},
    config::{self, CleanArgs, Settings, StatsArgs},
    error::AppError,
    graphics::GraphicsContext,
    infra::{
        error::InfraError,
        fetcher::AssetFetcher,
        telemetry,
    },
    render::{CleanupMonitor, RenderEngine},
    util::bytes::format_bytes,
};
use serde_json::json;
use time::{OffsetDateTime, format_description::well_known::Rfc3339};
use tokio::{signal, task::JoinHandle};
use tracing::{Dispatch, Level, dispatcher, error, info, warn};
use tracing_subscriber::fmt as tracing_fmt;

const SWEEP_PERIOD: Duration = Duration::from_secs(24 * 60 * 60);

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        report_application_error(&error);
        process::exit(error.exit_code());
    }
}

fn report_application_error(error: &AppError) {
    if dispatcher::has_been_set() {
        error!(error = %error, "application error");
        return;
    }

    let subscriber = tracing_fmt().with_max_level(Level::ERROR).finish();
    let dispatch = Dispatch::new(subscriber);
    dispatcher::with_default(&dispatch, || {
        error!(error = %error, "application error");
    });
}

async fn run() -> Result<(), AppError> {
    let (cli_args, settings) = config::load_with_cli()?;

    let command = cli_args
        .command
        .unwrap_or(config::Command::Run(Box::<config::RunArgs>::default()));

    telemetry::init(&settings.logging)?;

    match command {
        config::Command::Run(_) => run_engine(settings).await,
        config::Command::Clean(args) => run_clean(settings, args).await,
        config::Command::Stats(args) => run_stats(settings, args).await,
    }
}

async fn run_engine(settings: Settings) -> Result<(), AppError> {
    let fetcher = build_fetcher(&settings)?;
    let output_cache = Arc::new(settings.output_cache(fetcher.clone()));
    let asset_cache = Arc::new(settings.asset_cache(fetcher));
    let engine = Arc::new(
        RenderEngine::new(settings.engine.clone(), GraphicsContext::new())?
            .with_output_cache(output_cache.clone())
            .with_asset_cache(asset_cache),
    );

    let monitor = CleanupMonitor::new(engine.clone()).spawn();
    let sweep_handle = spawn_daily_sweep(&settings, output_cache);

    info!(
        assets = %settings.assets.directory.display(),
        download_original = settings.assets.download_original,
        output = %settings.output.directory.display(),
        "feedcard engine running; press Ctrl+C to stop"
    );

    signal::ctrl_c()
        .await
        .map_err(|err| AppError::from(InfraError::Io(err)))?;
    info!("Shutdown signal received");

    monitor.stop();
    sweep_handle.abort();
    let _ = sweep_handle.await;

    let report = engine.shutdown().await;
    info!(
        drained = report.drained,
        purged_entries = report.purged_entries,
        "feedcard engine stopped"
    );
    Ok(())
}

/// Daily retention pass over both caches.
fn spawn_daily_sweep(settings: &Settings, output_cache: Arc<OutputCache>) -> JoinHandle<()> {
    let sweeper = AssetSweeper::new(settings.assets.directory.clone());
    let expires = settings.assets.expires.clone();

    tokio::spawn(async move {
        let mut interval = tokio::time::interval(SWEEP_PERIOD);
        interval.tick().await; // Skip the first immediate tick
        loop {
            interval.tick().await;
            if let Err(err) = sweeper.sweep(&expires).await {
                warn!(error = %err, "Asset sweep failed");
            }
            if let Err(err) = output_cache.clean_expired_cache().await {
                warn!(error = %err, "Output expiry pass failed");
            }
        }
    })
}

async fn run_clean(settings: Settings, args: CleanArgs) -> Result<(), AppError> {
    if !args.output_only {
        let report = AssetSweeper::new(settings.assets.directory.clone())
            .sweep(&settings.assets.expires)
            .await?;
        info!(
            removed = report.total_removed(),
            freed = %format_bytes(report.freed_bytes),
            "Source assets swept"
        );
    }

    let report = settings
        .output_cache(build_fetcher(&settings)?)
        .clean_cache()
        .await?;
    info!(
        before = %format_bytes(report.before.total_bytes),
        after = %format_bytes(report.after.total_bytes),
        expired_removed = report.expired_removed,
        evicted = report.evicted,
        "Output cache cleaned"
    );
    let rendered = serde_json::to_string(&report)
        .map_err(|err| AppError::unexpected(format!("failed to encode report: {err}")))?;
    println!("{rendered}");
    Ok(())
}

async fn run_stats(settings: Settings, args: StatsArgs) -> Result<(), AppError> {
    let output_cache = settings.output_cache(build_fetcher(&settings)?);
    let engine = RenderEngine::new(settings.engine.clone(), GraphicsContext::new())?;

    let cache = output_cache.cache_stats().await;
    let status = engine.status();
    let last_activity = OffsetDateTime::from(status.queue.last_activity)
        .format(&Rfc3339)
        .map_err(|err| AppError::unexpected(format!("failed to format timestamp: {err}")))?;

    let document = json!({
        "output_cache": {
            "directory": cache.directory,
            "file_count": cache.file_count,
            "total_bytes": cache.total_bytes,
            "total": format_bytes(cache.total_bytes),
            "max_bytes": settings.output.max_bytes,
        },
        "engine": {
            "mode": status.mode,
            "memory_usage": status.memory_usage,
            "max_concurrent": settings.engine.max_concurrent,
            "max_queue_size": settings.engine.max_queue_size,
            "pending_count": status.queue.pending_count,
            "active_count": status.queue.active_count,
            "last_activity": last_activity,
        },
    });

    let rendered = if args.pretty {
        serde_json::to_string_pretty(&document)
    } else {
        serde_json::to_string(&document)
    }
    .map_err(|err| AppError::unexpected(format!("failed to encode stats: {err}")))?;
    println!("{rendered}");
    Ok(())
}

fn build_fetcher(settings: &Settings) -> Result<Arc<dyn AssetFetcher>, AppError> {
    let fetcher = settings.http_fetcher().map_err(InfraError::from)?;
    Ok(Arc::new(fetcher))
}
