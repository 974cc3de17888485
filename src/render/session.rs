use std::{
    collections::HashSet,
    sync::{
        Arc, Mutex,
        atomic::{AtomicU64, Ordering},
    },
};

use tracing::{debug, warn};

use crate::{
    graphics::{
        Font, GraphicsContext, GraphicsError, Image, NativeResource, Paragraph, Surface, TextLine,
        Typeface,
    },
    util::lock::mutex_lock,
};

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Resource scope for one drawing job.
///
/// Every handle created through the session, or registered with
/// [`DrawingSession::track`], is released exactly once when the session
/// closes. Closing happens explicitly through [`DrawingSession::close`] or
/// implicitly when the last clone is dropped, which covers jobs that fail,
/// panic, or are cancelled at their deadline.
///
/// Clones share one scope. The engine keeps a clone so it can close the scope
/// after the job future is gone; jobs should not move clones into detached
/// tasks.
#[derive(Clone)]
pub struct DrawingSession {
    inner: Arc<SessionInner>,
}

struct SessionInner {
    id: u64,
    graphics: GraphicsContext,
    state: Mutex<TrackedHandles>,
}

#[derive(Default)]
struct TrackedHandles {
    handles: Vec<Arc<dyn NativeResource>>,
    /// Allocation addresses of `handles`; a handle is tracked at most once.
    identities: HashSet<usize>,
    closed: bool,
}

/// Outcome of closing a session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReleaseReport {
    pub released: usize,
    pub failed: usize,
}

impl DrawingSession {
    pub fn new(graphics: GraphicsContext) -> Self {
        Self {
            inner: Arc::new(SessionInner {
                id: NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed),
                graphics,
                state: Mutex::new(TrackedHandles::default()),
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn create_surface(&self, width: u32, height: u32) -> Result<Arc<Surface>, GraphicsError> {
        self.ensure_open()?;
        let surface = self.inner.graphics.create_surface(width, height)?;
        Ok(self.track(Arc::new(surface)))
    }

    pub fn create_font(&self, typeface: &Typeface, size: f32) -> Result<Arc<Font>, GraphicsError> {
        self.ensure_open()?;
        let font = self.inner.graphics.create_font(typeface, size)?;
        Ok(self.track(Arc::new(font)))
    }

    pub fn create_text_line(&self, text: &str, font: &Font) -> Result<Arc<TextLine>, GraphicsError> {
        self.ensure_open()?;
        let line = self.inner.graphics.create_text_line(text, font)?;
        Ok(self.track(Arc::new(line)))
    }

    pub fn decode_image(&self, encoded: &[u8]) -> Result<Arc<Image>, GraphicsError> {
        self.ensure_open()?;
        let image = self.inner.graphics.decode_image(encoded)?;
        Ok(self.track(Arc::new(image)))
    }

    pub fn create_paragraph(
        &self,
        text: &str,
        font: &Font,
        max_width: f32,
    ) -> Result<Arc<Paragraph>, GraphicsError> {
        self.ensure_open()?;
        let paragraph = self.inner.graphics.create_paragraph(text, font, max_width)?;
        Ok(self.track(Arc::new(paragraph)))
    }

    /// Register an externally built handle and hand it back unchanged.
    ///
    /// A handle tracked after the session closed is released immediately, so
    /// late registrations cannot leak.
    pub fn track<T: NativeResource>(&self, handle: Arc<T>) -> Arc<T> {
        let mut state = mutex_lock(&self.inner.state, "render::session", "track");
        if state.closed {
            drop(state);
            warn!(
                target = "render::session",
                session_id = self.inner.id,
                kind = %handle.kind(),
                result = "late_track",
                "Handle tracked after session close; releasing immediately"
            );
            if let Err(err) = handle.release() {
                warn!(
                    target = "render::session",
                    session_id = self.inner.id,
                    error = %err,
                    "Failed to release late-tracked handle"
                );
            }
            return handle;
        }

        if state.identities.insert(identity(&handle)) {
            let erased: Arc<dyn NativeResource> = handle.clone();
            state.handles.push(erased);
        }
        handle
    }

    pub fn tracked_count(&self) -> usize {
        mutex_lock(&self.inner.state, "render::session", "tracked_count")
            .handles
            .len()
    }

    pub fn is_closed(&self) -> bool {
        mutex_lock(&self.inner.state, "render::session", "is_closed").closed
    }

    /// Release every tracked handle. Calling this again is a no-op.
    pub fn close(&self) -> ReleaseReport {
        self.inner.close()
    }

    fn ensure_open(&self) -> Result<(), GraphicsError> {
        if self.is_closed() {
            return Err(GraphicsError::SessionClosed);
        }
        Ok(())
    }
}

impl SessionInner {
    fn close(&self) -> ReleaseReport {
        let handles = {
            let mut state = mutex_lock(&self.state, "render::session", "close");
            if state.closed {
                return ReleaseReport::default();
            }
            state.closed = true;
            state.identities.clear();
            std::mem::take(&mut state.handles)
        };

        let mut report = ReleaseReport::default();
        for handle in handles {
            match handle.release() {
                Ok(()) => report.released += 1,
                Err(err) => {
                    report.failed += 1;
                    warn!(
                        target = "render::session",
                        session_id = self.id,
                        kind = %handle.kind(),
                        error = %err,
                        result = "release_failed",
                        "Failed to release native handle"
                    );
                }
            }
        }

        debug!(
            target = "render::session",
            session_id = self.id,
            released = report.released,
            failed = report.failed,
            "Drawing session closed"
        );
        report
    }
}

impl Drop for SessionInner {
    fn drop(&mut self) {
        self.close();
    }
}

fn identity<T>(handle: &Arc<T>) -> usize {
    Arc::as_ptr(handle) as *const () as usize
}

/// Fluent registration: `rasterize_svg(..).tracked_by(&session)`.
pub trait Tracked: Sized {
    fn tracked_by(self, session: &DrawingSession) -> Self;
}

impl<T: NativeResource> Tracked for Arc<T> {
    fn tracked_by(self, session: &DrawingSession) -> Self {
        session.track(self)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;
    use crate::graphics::{ReleaseError, ResourceKind};

    #[derive(Default)]
    struct CountingHandle {
        releases: AtomicUsize,
        fail: bool,
    }

    impl NativeResource for CountingHandle {
        fn kind(&self) -> ResourceKind {
            ResourceKind::External
        }

        fn release(&self) -> Result<(), ReleaseError> {
            self.releases.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(ReleaseError::Backend {
                    kind: ResourceKind::External,
                    message: "device lost".to_string(),
                });
            }
            Ok(())
        }
    }

    #[test]
    fn close_releases_each_handle_once() {
        let graphics = GraphicsContext::new();
        let session = DrawingSession::new(graphics.clone());
        let typeface = Typeface::new("Noto Sans", 400);

        let surface = session.create_surface(8, 8).expect("surface");
        let font = session.create_font(&typeface, 14.0).expect("font");
        let line = session.create_text_line("hello", &font).expect("line");
        let external = Arc::new(CountingHandle::default()).tracked_by(&session);
        assert_eq!(session.tracked_count(), 4);

        let report = session.close();
        assert_eq!(report, ReleaseReport { released: 4, failed: 0 });
        assert!(surface.is_released() && font.is_released() && line.is_released());
        assert_eq!(external.releases.load(Ordering::SeqCst), 1);

        assert_eq!(session.close(), ReleaseReport::default());
        drop(session);
        assert_eq!(external.releases.load(Ordering::SeqCst), 1);
        assert_eq!(graphics.heap_stats().live_handles, 0);
    }

    #[test]
    fn tracking_the_same_handle_twice_releases_it_once() {
        let graphics = GraphicsContext::new();
        let session = DrawingSession::new(graphics.clone());

        let external = Arc::new(CountingHandle::default());
        session.track(external.clone());
        external.clone().tracked_by(&session);
        let surface = session
            .create_surface(4, 4)
            .expect("surface")
            .tracked_by(&session);
        assert_eq!(session.tracked_count(), 2);

        let report = session.close();
        assert_eq!(report, ReleaseReport { released: 2, failed: 0 });
        assert_eq!(external.releases.load(Ordering::SeqCst), 1);
        assert!(surface.is_released());
        assert_eq!(graphics.heap_stats().live_handles, 0);
    }

    #[test]
    fn failed_release_does_not_stop_the_rest() {
        let session = DrawingSession::new(GraphicsContext::new());
        let broken = session.track(Arc::new(CountingHandle {
            fail: true,
            ..Default::default()
        }));
        let healthy = session.track(Arc::new(CountingHandle::default()));

        let report = session.close();
        assert_eq!(report, ReleaseReport { released: 1, failed: 1 });
        assert_eq!(broken.releases.load(Ordering::SeqCst), 1);
        assert_eq!(healthy.releases.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn dropping_last_clone_closes() {
        let graphics = GraphicsContext::new();
        let session = DrawingSession::new(graphics.clone());
        let surface = session.create_surface(2, 2).expect("surface");
        let clone = session.clone();

        drop(session);
        assert!(!surface.is_released());
        drop(clone);
        assert!(surface.is_released());
        assert_eq!(graphics.heap_stats().leaked_handles, 0);
    }

    #[test]
    fn closed_session_refuses_factories_and_releases_late_tracks() {
        let session = DrawingSession::new(GraphicsContext::new());
        session.close();

        assert!(matches!(
            session.create_surface(2, 2),
            Err(GraphicsError::SessionClosed)
        ));
        let late = session.track(Arc::new(CountingHandle::default()));
        assert_eq!(late.releases.load(Ordering::SeqCst), 1);
        assert_eq!(session.tracked_count(), 0);
    }

    #[test]
    fn panicking_job_still_releases() {
        let graphics = GraphicsContext::new();
        let session = DrawingSession::new(graphics.clone());
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let job_session = session.clone();
            let _surface = job_session.create_surface(4, 4).expect("surface");
            panic!("layout bug");
        }));
        assert!(result.is_err());
        drop(session);

        let stats = graphics.heap_stats();
        assert_eq!(stats.live_handles, 0);
        assert_eq!(stats.leaked_handles, 0);
    }
}
