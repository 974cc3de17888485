use std::{
    future::Future,
    sync::{
        Arc, RwLock,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use metrics::counter;
use serde::Serialize;
use tokio::time::{Instant, sleep, timeout};
use tracing::{debug, info, warn};

use crate::{
    cache::{AssetCache, CleanReport, OutputCache},
    graphics::GraphicsContext,
    infra::memory::{MemorySampler, SystemMemorySampler},
    util::{
        bytes::format_bytes,
        lock::{rw_read, rw_write},
    },
};

use super::{
    config::{EngineConfig, EngineMode},
    error::{BoxError, DrawOutcome, EngineError},
    queue::{DrawingQueue, QueueStatus},
    session::DrawingSession,
};

const DRAIN_GRACE: Duration = Duration::from_secs(30);
const PURGE_ROUNDS: usize = 3;
const PURGE_PAUSE: Duration = Duration::from_millis(100);

/// Entry point for drawing work.
///
/// Every job runs inside its own [`DrawingSession`] behind the
/// [`DrawingQueue`]; the session is closed on every exit path before
/// `execute_drawing` returns.
pub struct RenderEngine {
    config: RwLock<EngineConfig>,
    queue: DrawingQueue,
    graphics: GraphicsContext,
    output_cache: Option<Arc<OutputCache>>,
    asset_cache: Option<Arc<AssetCache>>,
    memory: Arc<dyn MemorySampler>,
    total_drawings: AtomicU64,
    total_cleanups: AtomicU64,
    started: Instant,
}

/// Point-in-time view of the engine for monitoring and the `stats` command.
#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    pub mode: EngineMode,
    /// Fraction of memory in use, `0.0..=1.0`.
    pub memory_usage: f64,
    pub total_drawing_count: u64,
    pub total_cleanup_count: u64,
    pub queue: QueueStatus,
    pub uptime: Duration,
    pub native_live_bytes: u64,
    pub native_live_handles: usize,
}

/// What one cleanup pass did.
#[derive(Debug, Clone, Default)]
pub struct CleanupReport {
    /// `false` when running jobs outlived the drain grace period.
    pub drained: bool,
    pub output: Option<CleanReport>,
    pub purged_entries: usize,
}

impl RenderEngine {
    pub fn new(config: EngineConfig, graphics: GraphicsContext) -> Result<Self, EngineError> {
        config.validate()?;
        info!(
            target = "render::engine",
            mode = %config.mode,
            max_concurrent = config.max_concurrent,
            max_queue_size = config.max_queue_size,
            drawing_timeout_ms = config.drawing_timeout.as_millis() as u64,
            "Render engine initialised"
        );

        let memory = SystemMemorySampler::new()
            .with_budget(config.memory_budget_mb.map(|mb| mb.saturating_mul(1024 * 1024)));
        Ok(Self {
            queue: DrawingQueue::new(&config),
            config: RwLock::new(config),
            graphics,
            output_cache: None,
            asset_cache: None,
            memory: Arc::new(memory),
            total_drawings: AtomicU64::new(0),
            total_cleanups: AtomicU64::new(0),
            started: Instant::now(),
        })
    }

    /// Include the output cache in [`perform_cleanup`](Self::perform_cleanup).
    pub fn with_output_cache(mut self, cache: Arc<OutputCache>) -> Self {
        self.output_cache = Some(cache);
        self
    }

    /// Source assets for drawing jobs, see [`asset_cache`](Self::asset_cache).
    pub fn with_asset_cache(mut self, cache: Arc<AssetCache>) -> Self {
        self.asset_cache = Some(cache);
        self
    }

    pub fn asset_cache(&self) -> Option<&Arc<AssetCache>> {
        self.asset_cache.as_ref()
    }

    pub fn with_memory_sampler(mut self, sampler: Arc<dyn MemorySampler>) -> Self {
        self.memory = sampler;
        self
    }

    pub fn graphics(&self) -> &GraphicsContext {
        &self.graphics
    }

    pub fn config(&self) -> EngineConfig {
        rw_read(&self.config, "render::engine", "config").clone()
    }

    /// Run `job` with a fresh session once the queue admits it.
    pub async fn execute_drawing<T, E, F, Fut>(&self, job: F) -> Result<T, EngineError>
    where
        F: FnOnce(DrawingSession) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Into<BoxError>,
    {
        self.total_drawings.fetch_add(1, Ordering::Relaxed);
        counter!("feedcard_drawing_submitted_total").increment(1);

        let mode = rw_read(&self.config, "render::engine", "execute_drawing").mode;
        if mode != EngineMode::InProcess {
            return Err(EngineError::UnsupportedMode(mode));
        }

        let session = DrawingSession::new(self.graphics.clone());
        let job_session = session.clone();
        let result = self
            .queue
            .submit(async move { job(job_session).await.map_err(Into::into) })
            .await;

        let report = session.close();
        debug!(
            target = "render::engine",
            session_id = session.id(),
            released = report.released,
            failed = report.failed,
            success = result.is_ok(),
            "Drawing finished"
        );

        result.map_err(EngineError::from)
    }

    /// Like [`execute_drawing`](Self::execute_drawing), but folds rejection,
    /// timeout and unavailable inputs into [`DrawOutcome::Unavailable`].
    pub async fn render<T, E, F, Fut>(&self, job: F) -> Result<DrawOutcome<T>, EngineError>
    where
        F: FnOnce(DrawingSession) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Into<BoxError>,
    {
        match self.execute_drawing(job).await {
            Ok(value) => Ok(DrawOutcome::Ready(value)),
            Err(err) => match err.unavailable_reason() {
                Some(reason) => {
                    debug!(
                        target = "render::engine",
                        op = "render",
                        %reason,
                        "Drawing unavailable; caller falls back"
                    );
                    Ok(DrawOutcome::Unavailable(reason))
                }
                None => Err(err),
            },
        }
    }

    pub fn is_idle_timeout(&self) -> bool {
        self.queue.is_idle_timeout()
    }

    /// Drain running work, trim the output cache and purge backend caches.
    pub async fn perform_cleanup(&self) -> CleanupReport {
        let started = Instant::now();
        info!(target = "render::engine", op = "cleanup", "Starting cleanup");

        let drained = timeout(DRAIN_GRACE, self.queue.await_all_completed())
            .await
            .is_ok();
        if !drained {
            warn!(
                target = "render::engine",
                op = "cleanup",
                grace_ms = DRAIN_GRACE.as_millis() as u64,
                active = self.queue.status().active_count,
                "Drawing jobs still running after drain grace; cleaning anyway"
            );
        }

        let output = match &self.output_cache {
            Some(cache) => match cache.clean_cache().await {
                Ok(report) => {
                    info!(
                        target = "render::engine",
                        op = "cleanup",
                        before = %format_bytes(report.before.total_bytes),
                        after = %format_bytes(report.after.total_bytes),
                        expired_removed = report.expired_removed,
                        evicted = report.evicted,
                        "Output cache trimmed"
                    );
                    Some(report)
                }
                Err(err) => {
                    warn!(
                        target = "render::engine",
                        op = "cleanup",
                        error = %err,
                        "Output cache cleanup failed"
                    );
                    None
                }
            },
            None => None,
        };

        let mut purged_entries = 0;
        for _ in 0..PURGE_ROUNDS {
            purged_entries += self.graphics.purge_caches();
            sleep(PURGE_PAUSE).await;
        }

        let total = self.total_cleanups.fetch_add(1, Ordering::Relaxed) + 1;
        counter!("feedcard_cleanup_total").increment(1);
        info!(
            target = "render::engine",
            op = "cleanup",
            total_cleanups = total,
            drained,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Cleanup finished"
        );

        CleanupReport {
            drained,
            output,
            purged_entries,
        }
    }

    pub fn status(&self) -> EngineStatus {
        let heap = self.graphics.heap_stats();
        EngineStatus {
            mode: rw_read(&self.config, "render::engine", "status").mode,
            memory_usage: self.memory.memory_usage(),
            total_drawing_count: self.total_drawings.load(Ordering::Relaxed),
            total_cleanup_count: self.total_cleanups.load(Ordering::Relaxed),
            queue: self.queue.status(),
            uptime: self.started.elapsed(),
            native_live_bytes: heap.live_bytes,
            native_live_handles: heap.live_handles,
        }
    }

    /// Swap in a new configuration. An invalid one leaves the current config untouched.
    pub fn reload(&self, config: EngineConfig) -> Result<(), EngineError> {
        config.validate()?;
        self.queue.apply_limits(&config);
        info!(
            target = "render::engine",
            op = "reload",
            mode = %config.mode,
            max_concurrent = config.max_concurrent,
            max_queue_size = config.max_queue_size,
            "Engine configuration reloaded"
        );
        *rw_write(&self.config, "render::engine", "reload") = config;
        Ok(())
    }

    /// Final cleanup; the queue refuses work afterwards.
    pub async fn shutdown(&self) -> CleanupReport {
        info!(target = "render::engine", op = "shutdown", "Shutting down render engine");
        let report = self.perform_cleanup().await;
        self.queue.close();
        report
    }
}

#[cfg(test)]
mod tests {
    use std::future::pending;

    use async_trait::async_trait;
    use bytes::Bytes;
    use tempfile::TempDir;

    use super::*;
    use crate::{
        cache::CacheCategory,
        graphics::{Color, Rect, Typeface},
        infra::fetcher::{AssetFetcher, FetchError, RetryPolicy},
        render::{
            config::WorkerSettings,
            error::{AssetUnavailable, DrawingError, UnavailableReason},
        },
    };

    struct FixedSampler(f64);

    impl MemorySampler for FixedSampler {
        fn memory_usage(&self) -> f64 {
            self.0
        }
    }

    fn engine(config: EngineConfig) -> RenderEngine {
        RenderEngine::new(config, GraphicsContext::new())
            .expect("valid config")
            .with_memory_sampler(Arc::new(FixedSampler(0.25)))
    }

    #[test]
    fn invalid_config_is_fatal() {
        let result = RenderEngine::new(
            EngineConfig {
                max_concurrent: 0,
                ..Default::default()
            },
            GraphicsContext::new(),
        );
        assert!(matches!(result, Err(EngineError::InvalidConfig(err)) if err.field == "max_concurrent"));
    }

    #[tokio::test]
    async fn draws_and_releases_every_handle() {
        let engine = engine(EngineConfig::default());
        let png = engine
            .execute_drawing(|session| async move {
                let surface = session.create_surface(16, 16)?;
                surface.clear(Color::WHITE)?;
                surface.fill_rect(Rect::new(2, 2, 4, 4), Color::rgba(255, 0, 0, 255))?;
                let font = session.create_font(&Typeface::new("Noto Sans", 400), 12.0)?;
                session.create_text_line("card", &font)?;
                surface.encode_png()
            })
            .await
            .expect("drawing succeeds");

        assert!(png.starts_with(&[0x89, b'P', b'N', b'G']));
        let heap = engine.graphics().heap_stats();
        assert_eq!(heap.live_handles, 0);
        assert_eq!(heap.leaked_handles, 0);
        assert_eq!(engine.status().total_drawing_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_releases_session_handles() {
        let engine = engine(EngineConfig {
            drawing_timeout: Duration::from_millis(250),
            ..Default::default()
        });

        let result = engine
            .execute_drawing(|session| async move {
                let _surface = session.create_surface(64, 64)?;
                let _font = session.create_font(&Typeface::new("Noto Sans", 400), 18.0)?;
                pending::<()>().await;
                Ok::<_, BoxError>(())
            })
            .await;

        assert!(matches!(
            result,
            Err(EngineError::Drawing(DrawingError::Timeout { .. }))
        ));
        let heap = engine.graphics().heap_stats();
        assert_eq!(heap.live_handles, 0);
        assert_eq!(heap.live_bytes, 0);
        assert_eq!(heap.leaked_handles, 0);
    }

    #[tokio::test]
    async fn failing_job_still_releases() {
        let engine = engine(EngineConfig::default());
        let result = engine
            .execute_drawing(|session| async move {
                session.create_surface(8, 8)?;
                Err::<(), BoxError>("layout failed".into())
            })
            .await;

        assert!(matches!(result, Err(EngineError::Drawing(DrawingError::Job(_)))));
        assert_eq!(engine.graphics().heap_stats().live_handles, 0);
    }

    #[tokio::test]
    async fn render_folds_unavailable_assets() {
        let engine = engine(EngineConfig::default());
        let outcome = engine
            .render(|_session| async move {
                Err::<(), _>(AssetUnavailable::new("https://example.com/avatar.png"))
            })
            .await
            .expect("unavailable is not an error");
        assert_eq!(
            outcome,
            DrawOutcome::Unavailable(UnavailableReason::AssetUnavailable)
        );

        let ready = engine
            .render(|_session| async move { Ok::<_, BoxError>(42) })
            .await
            .expect("ready");
        assert_eq!(ready.ready(), Some(42));
    }

    #[tokio::test]
    async fn worker_mode_is_rejected_at_execution() {
        let engine = engine(EngineConfig {
            mode: EngineMode::WorkerProcess,
            worker: WorkerSettings::default(),
            ..Default::default()
        });
        let result = engine
            .execute_drawing(|_session| async move { Ok::<_, BoxError>(()) })
            .await;

        assert!(matches!(
            result,
            Err(EngineError::UnsupportedMode(EngineMode::WorkerProcess))
        ));
        assert_eq!(engine.status().total_drawing_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cleanup_purges_and_counts() {
        let engine = engine(EngineConfig::default());
        engine
            .execute_drawing(|session| async move {
                session.create_font(&Typeface::new("Noto Sans", 400), 12.0)?;
                Ok::<_, BoxError>(())
            })
            .await
            .expect("drawing");

        let report = engine.perform_cleanup().await;
        assert!(report.drained);
        assert!(report.output.is_none());
        assert_eq!(report.purged_entries, 1);

        let status = engine.status();
        assert_eq!(status.total_cleanup_count, 1);
        assert!((status.memory_usage - 0.25).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn reload_validates_before_applying() {
        let engine = engine(EngineConfig::default());
        let invalid = EngineConfig {
            memory_warning_threshold: 0.95,
            ..Default::default()
        };
        assert!(engine.reload(invalid).is_err());
        assert_eq!(engine.config(), EngineConfig::default());

        let tighter = EngineConfig {
            max_queue_size: 5,
            ..Default::default()
        };
        engine.reload(tighter.clone()).expect("valid reload");
        assert_eq!(engine.config(), tighter);
    }

    struct Offline;

    #[async_trait]
    impl AssetFetcher for Offline {
        async fn fetch(&self, url: &str) -> Result<Bytes, FetchError> {
            Err(FetchError::Empty { url: url.into() })
        }
    }

    #[tokio::test]
    async fn jobs_read_assets_through_the_engine_cache() {
        let dir = TempDir::new().expect("temp dir");
        let assets = Arc::new(
            AssetCache::new(dir.path(), Arc::new(Offline))
                .with_retry(RetryPolicy::with_backoff(Duration::ZERO)),
        );
        assets
            .store(CacheCategory::Emoji, "smile.png", Bytes::from_static(b"cached"))
            .await
            .expect("store");

        let engine = engine(EngineConfig::default()).with_asset_cache(assets);
        let cache = engine.asset_cache().cloned().expect("asset cache");
        let bytes = engine
            .execute_drawing(|_session| async move {
                cache
                    .fetch("https://example.com/emoji/smile.png", CacheCategory::Emoji)
                    .await
                    .ok_or_else(|| AssetUnavailable::new("https://example.com/emoji/smile.png"))
            })
            .await
            .expect("cached asset");

        assert_eq!(bytes, Bytes::from_static(b"cached"));
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_refuses_later_work() {
        let engine = engine(EngineConfig::default());
        engine.shutdown().await;

        let result = engine
            .execute_drawing(|_session| async move { Ok::<_, BoxError>(()) })
            .await;
        assert!(matches!(result, Err(EngineError::Drawing(DrawingError::Closed))));
    }
}
