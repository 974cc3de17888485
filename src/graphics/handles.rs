use std::{io::Cursor, sync::Mutex};

use image::{ImageFormat, Rgba, RgbaImage, imageops};

use crate::util::lock::mutex_lock;

use super::{GraphicsError, NativeResource, ReleaseError, ResourceKind, heap::Allocation};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Color(pub [u8; 4]);

impl Color {
    pub const WHITE: Color = Color([255, 255, 255, 255]);
    pub const TRANSPARENT: Color = Color([0, 0, 0, 0]);

    pub const fn rgba(r: u8, g: u8, b: u8, a: u8) -> Self {
        Self([r, g, b, a])
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl Rect {
    pub const fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }
}

/// A raster render target.
#[derive(Debug)]
pub struct Surface {
    width: u32,
    height: u32,
    pixels: Mutex<Option<RgbaImage>>,
    allocation: Allocation,
}

impl Surface {
    pub(super) fn new(width: u32, height: u32, allocation: Allocation) -> Self {
        Self {
            width,
            height,
            pixels: Mutex::new(Some(RgbaImage::new(width, height))),
            allocation,
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn clear(&self, color: Color) -> Result<(), GraphicsError> {
        self.with_pixels(|pixels| {
            for pixel in pixels.pixels_mut() {
                *pixel = Rgba(color.0);
            }
        })
    }

    /// Fill `rect`, clipped to the surface bounds.
    pub fn fill_rect(&self, rect: Rect, color: Color) -> Result<(), GraphicsError> {
        let x_end = rect.x.saturating_add(rect.width).min(self.width);
        let y_end = rect.y.saturating_add(rect.height).min(self.height);
        self.with_pixels(|pixels| {
            for y in rect.y..y_end {
                for x in rect.x..x_end {
                    pixels.put_pixel(x, y, Rgba(color.0));
                }
            }
        })
    }

    /// Composite `image` with its top-left corner at (`x`, `y`).
    pub fn draw_image(&self, image: &Image, x: i64, y: i64) -> Result<(), GraphicsError> {
        let source = mutex_lock(&image.pixels, "graphics::image", "draw_image");
        let source = source
            .as_ref()
            .ok_or(GraphicsError::Released(ResourceKind::Image))?;
        self.with_pixels(|pixels| imageops::overlay(pixels, source, x, y))
    }

    pub fn pixel(&self, x: u32, y: u32) -> Result<Option<Color>, GraphicsError> {
        let guard = mutex_lock(&self.pixels, "graphics::surface", "pixel");
        let pixels = guard
            .as_ref()
            .ok_or(GraphicsError::Released(ResourceKind::Surface))?;
        Ok(pixels.get_pixel_checked(x, y).map(|pixel| Color(pixel.0)))
    }

    pub fn encode_png(&self) -> Result<Vec<u8>, GraphicsError> {
        let guard = mutex_lock(&self.pixels, "graphics::surface", "encode_png");
        let pixels = guard
            .as_ref()
            .ok_or(GraphicsError::Released(ResourceKind::Surface))?;
        let mut output = Cursor::new(Vec::new());
        pixels
            .write_to(&mut output, ImageFormat::Png)
            .map_err(GraphicsError::Encode)?;
        Ok(output.into_inner())
    }

    pub fn is_released(&self) -> bool {
        self.allocation.is_released()
    }

    pub fn native_bytes(&self) -> u64 {
        self.allocation.bytes()
    }

    fn with_pixels(&self, draw: impl FnOnce(&mut RgbaImage)) -> Result<(), GraphicsError> {
        let mut guard = mutex_lock(&self.pixels, "graphics::surface", "draw");
        let pixels = guard
            .as_mut()
            .ok_or(GraphicsError::Released(ResourceKind::Surface))?;
        draw(pixels);
        Ok(())
    }
}

impl NativeResource for Surface {
    fn kind(&self) -> ResourceKind {
        ResourceKind::Surface
    }

    fn release(&self) -> Result<(), ReleaseError> {
        self.allocation.release()?;
        mutex_lock(&self.pixels, "graphics::surface", "release").take();
        Ok(())
    }
}

/// A decoded bitmap.
#[derive(Debug)]
pub struct Image {
    width: u32,
    height: u32,
    pixels: Mutex<Option<RgbaImage>>,
    allocation: Allocation,
}

impl Image {
    pub(super) fn new(pixels: RgbaImage, allocation: Allocation) -> Self {
        Self {
            width: pixels.width(),
            height: pixels.height(),
            pixels: Mutex::new(Some(pixels)),
            allocation,
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn is_released(&self) -> bool {
        self.allocation.is_released()
    }
}

impl NativeResource for Image {
    fn kind(&self) -> ResourceKind {
        ResourceKind::Image
    }

    fn release(&self) -> Result<(), ReleaseError> {
        self.allocation.release()?;
        mutex_lock(&self.pixels, "graphics::image", "release").take();
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Typeface {
    pub family: String,
    pub weight: u16,
}

impl Typeface {
    pub fn new(family: impl Into<String>, weight: u16) -> Self {
        Self {
            family: family.into(),
            weight,
        }
    }
}

/// Glyph metrics derived from a typeface at a given size.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FontMetrics {
    pub ascent: f32,
    pub descent: f32,
    pub narrow_advance: f32,
    pub wide_advance: f32,
}

impl FontMetrics {
    pub fn line_height(&self) -> f32 {
        self.ascent + self.descent
    }
}

#[derive(Debug)]
pub struct Font {
    typeface: Typeface,
    size: f32,
    metrics: FontMetrics,
    allocation: Allocation,
}

impl Font {
    pub(super) fn new(
        typeface: Typeface,
        size: f32,
        metrics: FontMetrics,
        allocation: Allocation,
    ) -> Self {
        Self {
            typeface,
            size,
            metrics,
            allocation,
        }
    }

    pub fn typeface(&self) -> &Typeface {
        &self.typeface
    }

    pub fn size(&self) -> f32 {
        self.size
    }

    pub fn metrics(&self) -> FontMetrics {
        self.metrics
    }

    /// Horizontal advance of one character. CJK and other non-ASCII glyphs
    /// are treated as full width.
    pub fn advance(&self, ch: char) -> f32 {
        if ch.is_ascii() {
            self.metrics.narrow_advance
        } else {
            self.metrics.wide_advance
        }
    }

    pub fn measure(&self, text: &str) -> f32 {
        text.chars().map(|ch| self.advance(ch)).sum()
    }

    pub fn is_released(&self) -> bool {
        self.allocation.is_released()
    }
}

impl NativeResource for Font {
    fn kind(&self) -> ResourceKind {
        ResourceKind::Font
    }

    fn release(&self) -> Result<(), ReleaseError> {
        self.allocation.release()
    }
}

/// A single shaped run of text.
#[derive(Debug)]
pub struct TextLine {
    text: String,
    width: f32,
    height: f32,
    allocation: Allocation,
}

impl TextLine {
    pub(super) fn new(text: String, width: f32, height: f32, allocation: Allocation) -> Self {
        Self {
            text,
            width,
            height,
            allocation,
        }
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn width(&self) -> f32 {
        self.width
    }

    pub fn height(&self) -> f32 {
        self.height
    }

    pub fn is_released(&self) -> bool {
        self.allocation.is_released()
    }
}

impl NativeResource for TextLine {
    fn kind(&self) -> ResourceKind {
        ResourceKind::TextLine
    }

    fn release(&self) -> Result<(), ReleaseError> {
        self.allocation.release()
    }
}

/// Text broken into lines that fit a maximum width.
#[derive(Debug)]
pub struct Paragraph {
    lines: Vec<String>,
    max_width: f32,
    line_height: f32,
    allocation: Allocation,
}

impl Paragraph {
    pub(super) fn new(
        lines: Vec<String>,
        max_width: f32,
        line_height: f32,
        allocation: Allocation,
    ) -> Self {
        Self {
            lines,
            max_width,
            line_height,
            allocation,
        }
    }

    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    pub fn max_width(&self) -> f32 {
        self.max_width
    }

    pub fn height(&self) -> f32 {
        self.line_height * self.lines.len() as f32
    }

    pub fn is_released(&self) -> bool {
        self.allocation.is_released()
    }
}

impl NativeResource for Paragraph {
    fn kind(&self) -> ResourceKind {
        ResourceKind::Paragraph
    }

    fn release(&self) -> Result<(), ReleaseError> {
        self.allocation.release()
    }
}
