use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use tracing::debug;

use crate::util::lock::mutex_lock;

use super::{
    Font, FontMetrics, GraphicsError, Image, Paragraph, ResourceKind, Surface, TextLine, Typeface,
    heap::{HeapStats, NativeHeap},
};

const DEFAULT_MAX_SURFACE_PIXELS: u64 = 8192 * 8192;
const FONT_HANDLE_BYTES: u64 = 256;
const TEXT_HANDLE_OVERHEAD: u64 = 64;
const GLYPH_BYTES: u64 = 16;

/// Process-wide raster backend shared by every drawing session.
///
/// The context owns the [`NativeHeap`] all handles report to and a metrics
/// cache for typefaces. Handle creation happens through a
/// [`DrawingSession`](crate::render::DrawingSession), never directly from job
/// code, so that each allocation is tracked.
#[derive(Clone, Debug)]
pub struct GraphicsContext {
    inner: Arc<ContextInner>,
}

#[derive(Debug)]
struct ContextInner {
    heap: Arc<NativeHeap>,
    max_surface_pixels: u64,
    font_metrics: Mutex<HashMap<FontKey, FontMetrics>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct FontKey {
    typeface: Typeface,
    size_bits: u32,
}

impl Default for GraphicsContext {
    fn default() -> Self {
        Self::new()
    }
}

impl GraphicsContext {
    pub fn new() -> Self {
        Self::with_max_surface_pixels(DEFAULT_MAX_SURFACE_PIXELS)
    }

    pub fn with_max_surface_pixels(max_surface_pixels: u64) -> Self {
        Self {
            inner: Arc::new(ContextInner {
                heap: NativeHeap::new(),
                max_surface_pixels,
                font_metrics: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn heap_stats(&self) -> HeapStats {
        self.inner.heap.stats()
    }

    pub(crate) fn create_surface(&self, width: u32, height: u32) -> Result<Surface, GraphicsError> {
        if width == 0 || height == 0 {
            return Err(GraphicsError::InvalidDimensions { width, height });
        }
        let pixels = u64::from(width) * u64::from(height);
        if pixels > self.inner.max_surface_pixels {
            return Err(GraphicsError::SurfaceTooLarge {
                pixels,
                limit: self.inner.max_surface_pixels,
            });
        }

        let allocation = self
            .inner
            .heap
            .allocate(ResourceKind::Surface, pixels.saturating_mul(4));
        Ok(Surface::new(width, height, allocation))
    }

    pub(crate) fn create_font(&self, typeface: &Typeface, size: f32) -> Result<Font, GraphicsError> {
        if !size.is_finite() || size <= 0.0 {
            return Err(GraphicsError::InvalidFontSize(size));
        }

        let metrics = self.font_metrics(typeface, size);
        let allocation = self.inner.heap.allocate(
            ResourceKind::Font,
            FONT_HANDLE_BYTES + typeface.family.len() as u64,
        );
        Ok(Font::new(typeface.clone(), size, metrics, allocation))
    }

    pub(crate) fn create_text_line(&self, text: &str, font: &Font) -> Result<TextLine, GraphicsError> {
        if font.is_released() {
            return Err(GraphicsError::Released(ResourceKind::Font));
        }

        let allocation = self
            .inner
            .heap
            .allocate(ResourceKind::TextLine, text_bytes(text));
        Ok(TextLine::new(
            text.to_string(),
            font.measure(text),
            font.metrics().line_height(),
            allocation,
        ))
    }

    pub(crate) fn decode_image(&self, encoded: &[u8]) -> Result<Image, GraphicsError> {
        let decoded = image::load_from_memory(encoded)
            .map_err(GraphicsError::Decode)?
            .to_rgba8();
        let bytes = u64::from(decoded.width()) * u64::from(decoded.height()) * 4;
        let allocation = self.inner.heap.allocate(ResourceKind::Image, bytes);
        Ok(Image::new(decoded, allocation))
    }

    pub(crate) fn create_paragraph(
        &self,
        text: &str,
        font: &Font,
        max_width: f32,
    ) -> Result<Paragraph, GraphicsError> {
        if font.is_released() {
            return Err(GraphicsError::Released(ResourceKind::Font));
        }

        let lines = wrap_text(text, font, max_width);
        let allocation = self
            .inner
            .heap
            .allocate(ResourceKind::Paragraph, text_bytes(text));
        Ok(Paragraph::new(
            lines,
            max_width,
            font.metrics().line_height(),
            allocation,
        ))
    }

    /// Drop cached typeface metrics. Returns the number of entries purged.
    pub fn purge_caches(&self) -> usize {
        let mut cache = mutex_lock(&self.inner.font_metrics, "graphics::context", "purge");
        let purged = cache.len();
        cache.clear();
        let stats = self.inner.heap.stats();
        debug!(
            target = "graphics::context",
            op = "purge_caches",
            purged,
            live_handles = stats.live_handles,
            live_bytes = stats.live_bytes,
            "Purged graphics caches"
        );
        purged
    }

    fn font_metrics(&self, typeface: &Typeface, size: f32) -> FontMetrics {
        let key = FontKey {
            typeface: typeface.clone(),
            size_bits: size.to_bits(),
        };
        let mut cache = mutex_lock(&self.inner.font_metrics, "graphics::context", "font_metrics");
        *cache
            .entry(key)
            .or_insert_with(|| derive_metrics(typeface, size))
    }
}

fn derive_metrics(typeface: &Typeface, size: f32) -> FontMetrics {
    let weight_factor = 1.0 + (f32::from(typeface.weight.clamp(100, 900)) - 400.0) / 4000.0;
    FontMetrics {
        ascent: size * 0.8,
        descent: size * 0.2,
        narrow_advance: size * 0.55 * weight_factor,
        wide_advance: size * weight_factor,
    }
}

fn text_bytes(text: &str) -> u64 {
    TEXT_HANDLE_OVERHEAD + text.chars().count() as u64 * GLYPH_BYTES
}

/// Greedy per-character wrapping; explicit newlines always break.
fn wrap_text(text: &str, font: &Font, max_width: f32) -> Vec<String> {
    let mut lines = Vec::new();
    for raw in text.split('\n') {
        let mut current = String::new();
        let mut width = 0.0_f32;
        for ch in raw.chars() {
            let advance = font.advance(ch);
            if width + advance > max_width && !current.is_empty() {
                lines.push(std::mem::take(&mut current));
                width = 0.0;
                if ch == ' ' {
                    continue;
                }
            }
            current.push(ch);
            width += advance;
        }
        lines.push(current);
    }
    lines
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graphics::{Color, NativeResource, Rect};

    #[test]
    fn rejects_degenerate_surfaces() {
        let context = GraphicsContext::with_max_surface_pixels(100);
        assert!(matches!(
            context.create_surface(0, 10),
            Err(GraphicsError::InvalidDimensions { .. })
        ));
        assert!(matches!(
            context.create_surface(11, 10),
            Err(GraphicsError::SurfaceTooLarge { pixels: 110, .. })
        ));
        assert_eq!(context.heap_stats().live_handles, 0);
    }

    #[test]
    fn surface_release_frees_pixels() {
        let context = GraphicsContext::new();
        let surface = context.create_surface(4, 4).expect("surface");
        assert_eq!(context.heap_stats().live_bytes, 64);

        surface.release().expect("release");
        assert!(surface.is_released());
        assert!(matches!(
            surface.fill_rect(Rect::new(0, 0, 1, 1), Color::WHITE),
            Err(GraphicsError::Released(ResourceKind::Surface))
        ));
        assert_eq!(context.heap_stats().live_bytes, 0);
    }

    #[test]
    fn paragraph_wraps_wide_glyphs() {
        let context = GraphicsContext::new();
        let font = context
            .create_font(&Typeface::new("Noto Sans", 400), 10.0)
            .expect("font");
        let paragraph = context
            .create_paragraph("动态更新\nok", &font, 25.0)
            .expect("paragraph");

        assert_eq!(paragraph.lines(), ["动态", "更新", "ok"]);
        assert!((paragraph.height() - 30.0).abs() < f32::EPSILON);

        paragraph.release().expect("release paragraph");
        font.release().expect("release font");
    }

    #[test]
    fn purge_clears_metrics_cache() {
        let context = GraphicsContext::new();
        let typeface = Typeface::new("Noto Sans", 700);
        let first = context.create_font(&typeface, 12.0).expect("font");
        let second = context.create_font(&typeface, 12.0).expect("font");
        assert_eq!(first.metrics(), second.metrics());

        assert_eq!(context.purge_caches(), 1);
        assert_eq!(context.purge_caches(), 0);

        first.release().expect("release");
        second.release().expect("release");
    }
}
