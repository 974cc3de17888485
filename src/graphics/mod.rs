//! Native graphics handles used by drawing jobs.
//!
//! Every object here wraps memory owned by the raster backend rather than by
//! Rust, and must be handed back through [`NativeResource::release`]. Jobs do
//! not call `release` themselves: they allocate through a
//! [`DrawingSession`](crate::render::DrawingSession), which tracks each handle
//! and releases it when the job ends.

mod context;
mod handles;
mod heap;

use std::fmt;

use thiserror::Error;

pub use context::GraphicsContext;
pub use handles::{Color, Font, FontMetrics, Image, Paragraph, Rect, Surface, TextLine, Typeface};
pub use heap::{HeapStats, NativeHeap};

/// An object whose backing memory is released explicitly rather than on drop.
///
/// Implementations must be safe to release from any thread and must report a
/// second release as [`ReleaseError::AlreadyReleased`] instead of freeing twice.
pub trait NativeResource: Send + Sync + 'static {
    fn kind(&self) -> ResourceKind;

    fn release(&self) -> Result<(), ReleaseError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    Surface,
    Font,
    TextLine,
    Image,
    Paragraph,
    /// Objects built outside the session factories, e.g. an SVG rasterization.
    External,
}

impl ResourceKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ResourceKind::Surface => "surface",
            ResourceKind::Font => "font",
            ResourceKind::TextLine => "text_line",
            ResourceKind::Image => "image",
            ResourceKind::Paragraph => "paragraph",
            ResourceKind::External => "external",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum ReleaseError {
    #[error("{0} handle was already released")]
    AlreadyReleased(ResourceKind),
    #[error("backend failed to release {kind} handle: {message}")]
    Backend {
        kind: ResourceKind,
        message: String,
    },
}

#[derive(Debug, Error)]
pub enum GraphicsError {
    #[error("invalid surface dimensions {width}x{height}")]
    InvalidDimensions { width: u32, height: u32 },
    #[error("surface of {pixels} pixels exceeds the limit of {limit}")]
    SurfaceTooLarge { pixels: u64, limit: u64 },
    #[error("invalid font size {0}")]
    InvalidFontSize(f32),
    #[error("failed to decode image")]
    Decode(#[source] image::ImageError),
    #[error("failed to encode surface")]
    Encode(#[source] image::ImageError),
    #[error("{0} handle used after release")]
    Released(ResourceKind),
    #[error("drawing session is already closed")]
    SessionClosed,
}
