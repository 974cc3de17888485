use std::sync::Once;

use metrics::{Unit, describe_counter, describe_gauge, describe_histogram};
use tracing_error::ErrorLayer;
use tracing_subscriber::{
    EnvFilter, fmt,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
};

use crate::config::{LogFormat, LoggingSettings};

use super::error::InfraError;

static METRIC_DESCRIPTIONS: Once = Once::new();

/// Install a global tracing subscriber using the provided logging settings.
pub fn init(logging: &LoggingSettings) -> Result<(), InfraError> {
    describe_metrics();

    let env_filter = EnvFilter::builder()
        .with_default_directive(logging.level.into())
        .from_env_lossy();

    let fmt_layer = match logging.format {
        LogFormat::Json => fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(true)
            .with_target(true)
            .boxed(),
        LogFormat::Compact => fmt::layer().compact().with_target(true).boxed(),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(ErrorLayer::default())
        .with(fmt_layer)
        .try_init()
        .map_err(|err| {
            InfraError::telemetry(format!("failed to install tracing subscriber: {err}"))
        })
}

/// Register descriptions for every metric the engine and caches emit.
pub fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(
            "feedcard_drawing_submitted_total",
            Unit::Count,
            "Drawing jobs handed to the engine."
        );
        describe_counter!(
            "feedcard_drawing_completed_total",
            Unit::Count,
            "Drawing jobs that finished within their deadline."
        );
        describe_counter!(
            "feedcard_drawing_rejected_total",
            Unit::Count,
            "Drawing jobs refused because the admission queue was full."
        );
        describe_counter!(
            "feedcard_drawing_timeout_total",
            Unit::Count,
            "Drawing jobs abandoned after exceeding the drawing timeout."
        );
        describe_histogram!(
            "feedcard_drawing_ms",
            Unit::Milliseconds,
            "Time spent holding a drawing slot."
        );
        describe_gauge!(
            "feedcard_drawing_pending",
            Unit::Count,
            "Jobs waiting for a drawing slot."
        );
        describe_gauge!(
            "feedcard_drawing_active",
            Unit::Count,
            "Jobs currently drawing."
        );
        describe_counter!(
            "feedcard_cleanup_total",
            Unit::Count,
            "Engine cleanups performed."
        );
        describe_gauge!(
            "feedcard_memory_usage_ratio",
            Unit::Count,
            "Last sampled process memory usage as a fraction of system memory."
        );
        describe_counter!(
            "feedcard_memory_pressure_total",
            Unit::Count,
            "Monitor ticks that observed memory above a pressure threshold."
        );
        describe_counter!(
            "feedcard_fetch_retry_total",
            Unit::Count,
            "Downloads retried after a failed first attempt."
        );
        describe_counter!(
            "feedcard_fetch_failed_total",
            Unit::Count,
            "Downloads that failed after all attempts."
        );
        describe_counter!(
            "feedcard_asset_cache_hit_total",
            Unit::Count,
            "Source asset lookups served from disk."
        );
        describe_counter!(
            "feedcard_asset_cache_miss_total",
            Unit::Count,
            "Source asset lookups that missed the disk cache."
        );
        describe_counter!(
            "feedcard_asset_cache_blocked_total",
            Unit::Count,
            "Source asset downloads refused for private targets."
        );
        describe_counter!(
            "feedcard_asset_cache_stored_total",
            Unit::Count,
            "Source assets written under an explicit relative path."
        );
        describe_counter!(
            "feedcard_asset_cache_expired_total",
            Unit::Count,
            "Source assets removed by the retention sweep."
        );
        describe_counter!(
            "feedcard_output_cache_hit_total",
            Unit::Count,
            "Output lookups served by a fresh cached file."
        );
        describe_counter!(
            "feedcard_output_cache_miss_total",
            Unit::Count,
            "Output lookups that required a download."
        );
        describe_counter!(
            "feedcard_output_cache_blocked_total",
            Unit::Count,
            "Output downloads refused for private targets."
        );
        describe_counter!(
            "feedcard_output_cache_evicted_total",
            Unit::Count,
            "Output files removed by age expiry or the size budget."
        );
    });
}
