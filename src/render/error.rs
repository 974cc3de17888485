use std::{error::Error as StdError, fmt, time::Duration};

use thiserror::Error;

use super::config::{ConfigError, EngineMode};

pub type BoxError = Box<dyn StdError + Send + Sync>;

/// Failures surfaced by the admission queue.
#[derive(Debug, Error)]
pub enum DrawingError {
    #[error("drawing queue is full ({capacity} jobs waiting)")]
    QueueFull { capacity: usize },
    #[error("drawing job exceeded its {after:?} deadline")]
    Timeout { after: Duration },
    #[error("drawing queue is closed")]
    Closed,
    #[error("drawing job failed")]
    Job(#[source] BoxError),
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    InvalidConfig(#[from] ConfigError),
    #[error("engine mode `{0}` is not supported")]
    UnsupportedMode(EngineMode),
    #[error(transparent)]
    Drawing(#[from] DrawingError),
}

/// Returned by a job when an input it cannot draw without failed to load.
#[derive(Debug, Error)]
#[error("asset `{url}` is unavailable")]
pub struct AssetUnavailable {
    pub url: String,
}

impl AssetUnavailable {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

/// Why a job produced no artifact, for callers that fall back to plain text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnavailableReason {
    QueueFull,
    TimedOut,
    AssetUnavailable,
}

impl fmt::Display for UnavailableReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UnavailableReason::QueueFull => f.write_str("queue_full"),
            UnavailableReason::TimedOut => f.write_str("timed_out"),
            UnavailableReason::AssetUnavailable => f.write_str("asset_unavailable"),
        }
    }
}

impl EngineError {
    pub fn unavailable_reason(&self) -> Option<UnavailableReason> {
        match self {
            EngineError::Drawing(DrawingError::QueueFull { .. }) => Some(UnavailableReason::QueueFull),
            EngineError::Drawing(DrawingError::Timeout { .. }) => Some(UnavailableReason::TimedOut),
            EngineError::Drawing(DrawingError::Job(source))
                if source.downcast_ref::<AssetUnavailable>().is_some() =>
            {
                Some(UnavailableReason::AssetUnavailable)
            }
            _ => None,
        }
    }
}

/// Result of [`RenderEngine::render`](super::RenderEngine::render).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DrawOutcome<T> {
    Ready(T),
    Unavailable(UnavailableReason),
}

impl<T> DrawOutcome<T> {
    pub fn ready(self) -> Option<T> {
        match self {
            DrawOutcome::Ready(value) => Some(value),
            DrawOutcome::Unavailable(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_unavailable_failures() {
        let full = EngineError::from(DrawingError::QueueFull { capacity: 3 });
        assert_eq!(full.unavailable_reason(), Some(UnavailableReason::QueueFull));

        let slow = EngineError::from(DrawingError::Timeout {
            after: Duration::from_secs(1),
        });
        assert_eq!(slow.unavailable_reason(), Some(UnavailableReason::TimedOut));

        let missing = EngineError::from(DrawingError::Job(Box::new(AssetUnavailable::new(
            "https://example.com/a.png",
        ))));
        assert_eq!(
            missing.unavailable_reason(),
            Some(UnavailableReason::AssetUnavailable)
        );

        let broken = EngineError::from(DrawingError::Job("layout exploded".into()));
        assert_eq!(broken.unavailable_reason(), None);
    }
}
