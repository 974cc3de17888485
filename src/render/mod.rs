//! Drawing execution: per-job resource sessions, admission control and the
//! engine that ties them to the caches.

pub mod config;
pub mod engine;
pub mod error;
pub mod monitor;
pub mod queue;
pub mod session;

pub use config::{ConfigError, EngineConfig, EngineMode, WorkerSettings};
pub use engine::{CleanupReport, EngineStatus, RenderEngine};
pub use error::{
    AssetUnavailable, BoxError, DrawOutcome, DrawingError, EngineError, UnavailableReason,
};
pub use monitor::{CleanupMonitor, MonitorHandle, MonitorTick, PressureLevel};
pub use queue::{DrawingQueue, QueueStatus};
pub use session::{DrawingSession, ReleaseReport, Tracked};
