//! Pixel buffers.
//!
//! A [`Raster`] is a rectangle of interleaved `f32` samples positioned in the
//! image plane. The backing store is reference counted, so child views over a
//! sub-rectangle are free and clones never copy pixels. Writes go through
//! copy-on-write: a raster that shares its storage with a view detaches
//! before it is modified, and the view keeps the old contents.

use crate::core::error::{TileError, TileResult};
use crate::core::geometry::Rectangle;
use image::{Rgba, RgbaImage};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Sample layout descriptor. The core only cares about the band count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PixelFormat {
    /// Samples per pixel.
    pub bands: usize,
}

impl PixelFormat {
    /// A format with `bands` samples per pixel.
    pub const fn new(bands: usize) -> Self {
        Self { bands }
    }

    /// Single-band format.
    pub const fn gray() -> Self {
        Self::new(1)
    }

    /// Four-band RGBA format.
    pub const fn rgba() -> Self {
        Self::new(4)
    }

    /// Bytes used by one pixel.
    pub fn bytes_per_pixel(&self) -> usize {
        self.bands * std::mem::size_of::<f32>()
    }
}

impl Default for PixelFormat {
    fn default() -> Self {
        Self::rgba()
    }
}

/// A rectangle of pixel data.
#[derive(Clone)]
pub struct Raster {
    /// Area this raster exposes.
    bounds: Rectangle,
    /// Area covered by the backing store.
    data_bounds: Rectangle,
    format: PixelFormat,
    data: Arc<Vec<f32>>,
}

fn allocate(len: usize, fill: f32) -> TileResult<Vec<f32>> {
    let mut samples = Vec::new();
    samples
        .try_reserve_exact(len)
        .map_err(|_| TileError::OutOfMemory {
            requested_bytes: len.saturating_mul(std::mem::size_of::<f32>()),
        })?;
    samples.resize(len, fill);
    Ok(samples)
}

fn sample_count(bounds: &Rectangle, format: PixelFormat) -> usize {
    if bounds.is_empty() {
        0
    } else {
        bounds.width as usize * bounds.height as usize * format.bands
    }
}

impl Raster {
    /// Allocate a zero-filled raster.
    pub fn new(bounds: Rectangle, format: PixelFormat) -> TileResult<Self> {
        Self::filled(bounds, format, 0.0)
    }

    /// Allocate a raster with every sample set to `value`.
    pub fn filled(bounds: Rectangle, format: PixelFormat, value: f32) -> TileResult<Self> {
        let samples = allocate(sample_count(&bounds, format), value)?;
        Ok(Self {
            bounds,
            data_bounds: bounds,
            format,
            data: Arc::new(samples),
        })
    }

    /// Wrap existing row-major interleaved samples.
    pub fn from_samples(bounds: Rectangle, format: PixelFormat, samples: Vec<f32>) -> TileResult<Self> {
        let expected = sample_count(&bounds, format);
        if samples.len() != expected {
            return Err(TileError::IncompatibleRaster(format!(
                "{} samples supplied for {} with {} bands, expected {}",
                samples.len(),
                bounds,
                format.bands,
                expected
            )));
        }
        Ok(Self {
            bounds,
            data_bounds: bounds,
            format,
            data: Arc::new(samples),
        })
    }

    /// Convert an 8-bit RGBA image placed at `(x, y)`. Samples are scaled to `0.0..=1.0`.
    pub fn from_rgba8(image: &RgbaImage, x: i32, y: i32) -> TileResult<Self> {
        let bounds = Rectangle::new(x, y, image.width() as i32, image.height() as i32);
        let samples = image.as_raw().iter().map(|&v| v as f32 / 255.0).collect();
        Self::from_samples(bounds, PixelFormat::rgba(), samples)
    }

    /// Area this raster exposes, in image coordinates.
    pub fn bounds(&self) -> Rectangle {
        self.bounds
    }

    /// Left edge.
    pub fn min_x(&self) -> i32 {
        self.bounds.x
    }

    /// Top edge.
    pub fn min_y(&self) -> i32 {
        self.bounds.y
    }

    /// Width in pixels.
    pub fn width(&self) -> i32 {
        self.bounds.width
    }

    /// Height in pixels.
    pub fn height(&self) -> i32 {
        self.bounds.height
    }

    /// Sample layout.
    pub fn format(&self) -> PixelFormat {
        self.format
    }

    /// Samples per pixel.
    pub fn num_bands(&self) -> usize {
        self.format.bands
    }

    /// Bytes held by the backing store, which may exceed what this view exposes.
    pub fn memory_size(&self) -> usize {
        self.data.len() * std::mem::size_of::<f32>()
    }

    /// Whether two rasters share the same backing store.
    pub fn shares_buffer_with(&self, other: &Raster) -> bool {
        Arc::ptr_eq(&self.data, &other.data)
    }

    fn offset(&self, x: i32, y: i32) -> usize {
        let col = (x - self.data_bounds.x) as usize;
        let row = (y - self.data_bounds.y) as usize;
        (row * self.data_bounds.width as usize + col) * self.format.bands
    }

    fn check_point(&self, x: i32, y: i32) {
        assert!(
            self.bounds.contains_point(x, y),
            "pixel ({}, {}) outside raster {}",
            x,
            y,
            self.bounds
        );
    }

    /// Sample `band` of pixel `(x, y)`.
    ///
    /// # Panics
    ///
    /// Panics if the pixel lies outside the raster or the band does not exist.
    pub fn sample(&self, x: i32, y: i32, band: usize) -> f32 {
        self.check_point(x, y);
        assert!(band < self.format.bands, "band {} out of range", band);
        self.data[self.offset(x, y) + band]
    }

    /// All samples of pixel `(x, y)`.
    pub fn pixel(&self, x: i32, y: i32) -> &[f32] {
        self.check_point(x, y);
        let start = self.offset(x, y);
        &self.data[start..start + self.format.bands]
    }

    /// Set sample `band` of pixel `(x, y)`.
    pub fn set_sample(&mut self, x: i32, y: i32, band: usize, value: f32) {
        self.check_point(x, y);
        assert!(band < self.format.bands, "band {} out of range", band);
        let index = self.offset(x, y) + band;
        Arc::make_mut(&mut self.data)[index] = value;
    }

    /// Set every sample of pixel `(x, y)`.
    pub fn set_pixel(&mut self, x: i32, y: i32, values: &[f32]) {
        self.check_point(x, y);
        let start = self.offset(x, y);
        let bands = self.format.bands.min(values.len());
        Arc::make_mut(&mut self.data)[start..start + bands].copy_from_slice(&values[..bands]);
    }

    /// Samples of one row within `x0..x1`, clipped to the raster.
    pub fn row(&self, y: i32, x0: i32, x1: i32) -> &[f32] {
        let x0 = x0.max(self.bounds.x);
        let x1 = x1.min(self.bounds.max_x());
        if x1 <= x0 || y < self.bounds.y || y >= self.bounds.max_y() {
            return &[];
        }
        let start = self.offset(x0, y);
        &self.data[start..start + (x1 - x0) as usize * self.format.bands]
    }

    /// Mutable samples of one row within `x0..x1`, clipped to the raster.
    pub fn row_mut(&mut self, y: i32, x0: i32, x1: i32) -> &mut [f32] {
        let x0 = x0.max(self.bounds.x);
        let x1 = x1.min(self.bounds.max_x());
        if x1 <= x0 || y < self.bounds.y || y >= self.bounds.max_y() {
            return &mut [];
        }
        let start = self.offset(x0, y);
        let len = (x1 - x0) as usize * self.format.bands;
        &mut Arc::make_mut(&mut self.data)[start..start + len]
    }

    /// Set every sample inside `rect` (clipped to the raster) to the
    /// matching entry of `values`, one per band.
    pub fn fill_rect(&mut self, rect: &Rectangle, values: &[f32]) {
        let area = self.bounds.intersection(rect);
        let bands = self.format.bands;
        for y in area.y..area.max_y() {
            for chunk in self.row_mut(y, area.x, area.max_x()).chunks_mut(bands) {
                for (band, sample) in chunk.iter_mut().enumerate() {
                    *sample = values.get(band).copied().unwrap_or(0.0);
                }
            }
        }
    }

    /// A zero-copy view of `region`, which must lie inside this raster.
    pub fn child(&self, region: &Rectangle) -> Option<Raster> {
        if !self.bounds.contains(region) {
            return None;
        }
        Some(Raster {
            bounds: *region,
            data_bounds: self.data_bounds,
            format: self.format,
            data: Arc::clone(&self.data),
        })
    }

    /// A compact copy of `region` (clipped to this raster) with its own storage.
    pub fn deep_copy(&self, region: &Rectangle) -> TileResult<Raster> {
        let mut copy = Raster::new(*region, self.format)?;
        copy.copy_from(self);
        Ok(copy)
    }

    /// Copy the overlapping area of `source` into this raster.
    pub fn copy_from(&mut self, source: &Raster) {
        let area = source.bounds;
        self.copy_rect_from(source, &area);
    }

    /// Copy `rect` from `source`, clipped to both rasters.
    pub fn copy_rect_from(&mut self, source: &Raster, rect: &Rectangle) {
        let area = rect.intersection(&self.bounds).intersection(&source.bounds);
        if area.is_empty() {
            return;
        }
        let bands = self.format.bands.min(source.format.bands);
        if bands == self.format.bands && bands == source.format.bands {
            for y in area.y..area.max_y() {
                let src = source.row(y, area.x, area.max_x());
                self.row_mut(y, area.x, area.max_x()).copy_from_slice(src);
            }
            return;
        }
        for y in area.y..area.max_y() {
            for x in area.x..area.max_x() {
                for band in 0..bands {
                    let value = source.sample(x, y, band);
                    self.set_sample(x, y, band, value);
                }
            }
        }
    }

    /// Row-major samples of `region` (clipped to the raster).
    pub fn samples_in(&self, region: &Rectangle) -> Vec<f32> {
        let area = region.intersection(&self.bounds);
        let mut out = Vec::with_capacity(sample_count(&area, self.format));
        for y in area.y..area.max_y() {
            out.extend_from_slice(self.row(y, area.x, area.max_x()));
        }
        out
    }

    /// Take the backing store if nothing else references it and it matches
    /// the exposed bounds.
    pub fn into_samples(self) -> Option<Vec<f32>> {
        if self.bounds != self.data_bounds {
            return None;
        }
        Arc::try_unwrap(self.data).ok()
    }

    /// Convert to an 8-bit RGBA image. Samples are clamped to `0.0..=1.0`.
    /// Single-band rasters are replicated to gray; other band counts use the
    /// first three bands and an opaque alpha when no fourth band exists.
    pub fn to_rgba8(&self) -> RgbaImage {
        let width = self.bounds.width.max(0) as u32;
        let height = self.bounds.height.max(0) as u32;
        let to_u8 = |v: f32| (v.clamp(0.0, 1.0) * 255.0).round() as u8;
        RgbaImage::from_fn(width, height, |px, py| {
            let pixel = self.pixel(self.bounds.x + px as i32, self.bounds.y + py as i32);
            match pixel.len() {
                1 => {
                    let g = to_u8(pixel[0]);
                    Rgba([g, g, g, 255])
                }
                2 => {
                    let g = to_u8(pixel[0]);
                    Rgba([g, g, g, to_u8(pixel[1])])
                }
                3 => Rgba([to_u8(pixel[0]), to_u8(pixel[1]), to_u8(pixel[2]), 255]),
                _ => Rgba([to_u8(pixel[0]), to_u8(pixel[1]), to_u8(pixel[2]), to_u8(pixel[3])]),
            }
        })
    }
}

impl PartialEq for Raster {
    /// Rasters are equal when they cover the same area with the same samples.
    fn eq(&self, other: &Self) -> bool {
        self.bounds == other.bounds
            && self.format == other.format
            && (0..self.bounds.height.max(0)).all(|dy| {
                let y = self.bounds.y + dy;
                self.row(y, self.bounds.x, self.bounds.max_x())
                    == other.row(y, other.bounds.x, other.bounds.max_x())
            })
    }
}

impl fmt::Debug for Raster {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Raster")
            .field("bounds", &self.bounds)
            .field("bands", &self.format.bands)
            .field("shared", &(Arc::strong_count(&self.data) > 1))
            .finish()
    }
}
