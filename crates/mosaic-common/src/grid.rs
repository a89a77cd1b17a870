//! Raster grid geometry: affine grid-to-world transforms and pixel rectangles.

use crate::{BoundingBox, CrsCode};
use serde::{Deserialize, Serialize};

/// Affine mapping from pixel (col, row) to world (x, y), GDAL coefficient order.
///
/// ```text
/// x = translate_x + col * scale_x + row * shear_x
/// y = translate_y + col * shear_y + row * scale_y
/// ```
///
/// Pixel (0, 0) addresses the upper-left *corner* of the first pixel.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AffineTransform {
    pub scale_x: f64,
    pub shear_x: f64,
    pub translate_x: f64,
    pub shear_y: f64,
    pub scale_y: f64,
    pub translate_y: f64,
}

impl AffineTransform {
    pub fn new(
        scale_x: f64,
        shear_x: f64,
        translate_x: f64,
        shear_y: f64,
        scale_y: f64,
        translate_y: f64,
    ) -> Self {
        Self {
            scale_x,
            shear_x,
            translate_x,
            shear_y,
            scale_y,
            translate_y,
        }
    }

    /// North-up transform mapping a `width` x `height` raster onto `bbox`.
    pub fn from_bbox(bbox: &BoundingBox, width: usize, height: usize) -> Self {
        Self::new(
            bbox.width() / width as f64,
            0.0,
            bbox.min_x,
            0.0,
            -bbox.height() / height as f64,
            bbox.max_y,
        )
    }

    /// North-up transform from an upper-left corner and pixel size.
    pub fn north_up(min_x: f64, max_y: f64, res_x: f64, res_y: f64) -> Self {
        Self::new(res_x, 0.0, min_x, 0.0, -res_y, max_y)
    }

    /// Map a pixel-space coordinate to world coordinates.
    #[inline]
    pub fn apply(&self, col: f64, row: f64) -> (f64, f64) {
        (
            self.translate_x + col * self.scale_x + row * self.shear_x,
            self.translate_y + col * self.shear_y + row * self.scale_y,
        )
    }

    /// World coordinates of the centre of pixel (col, row).
    #[inline]
    pub fn pixel_center(&self, col: i64, row: i64) -> (f64, f64) {
        self.apply(col as f64 + 0.5, row as f64 + 0.5)
    }

    /// The inverse (world-to-grid) transform. `None` if singular.
    pub fn inverse(&self) -> Option<AffineTransform> {
        let det = self.scale_x * self.scale_y - self.shear_x * self.shear_y;
        if det.abs() < f64::EPSILON * 1e-6 || !det.is_finite() {
            return None;
        }
        Some(Self::new(
            self.scale_y / det,
            -self.shear_x / det,
            (self.shear_x * self.translate_y - self.scale_y * self.translate_x) / det,
            -self.shear_y / det,
            self.scale_x / det,
            (self.shear_y * self.translate_x - self.scale_x * self.translate_y) / det,
        ))
    }

    /// Envelope of `bbox` after mapping its four corners through this transform.
    pub fn transform_bbox(&self, bbox: &BoundingBox) -> BoundingBox {
        let corners = bbox.corners().map(|(x, y)| self.apply(x, y));
        // four corners always present
        BoundingBox::from_points(corners).unwrap_or(*bbox)
    }

    /// Pixel size along each axis (always positive).
    pub fn resolution(&self) -> (f64, f64) {
        (
            self.scale_x.hypot(self.shear_y),
            self.shear_x.hypot(self.scale_y),
        )
    }

    /// Same grid, re-based so that pixel (col, row) becomes pixel (0, 0).
    pub fn translated(&self, col: i64, row: i64) -> AffineTransform {
        let (tx, ty) = self.apply(col as f64, row as f64);
        Self {
            translate_x: tx,
            translate_y: ty,
            ..*self
        }
    }

    /// Same origin with pixels `factor_x` / `factor_y` times larger.
    pub fn scaled(&self, factor_x: f64, factor_y: f64) -> AffineTransform {
        Self {
            scale_x: self.scale_x * factor_x,
            shear_y: self.shear_y * factor_x,
            shear_x: self.shear_x * factor_y,
            scale_y: self.scale_y * factor_y,
            ..*self
        }
    }
}

/// An integer rectangle in pixel space. `x`/`y` may be negative.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PixelRect {
    pub x: i64,
    pub y: i64,
    pub width: usize,
    pub height: usize,
}

impl PixelRect {
    pub fn new(x: i64, y: i64, width: usize, height: usize) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// Rectangle anchored at the origin.
    pub fn sized(width: usize, height: usize) -> Self {
        Self::new(0, 0, width, height)
    }

    /// Rectangle for a pixel-space envelope, rounding each edge to the nearest
    /// grid line. Degenerate spans are widened to one pixel.
    pub fn rounded(bounds: &BoundingBox) -> Self {
        let x0 = bounds.min_x.round() as i64;
        let y0 = bounds.min_y.round() as i64;
        let x1 = (bounds.max_x.round() as i64).max(x0 + 1);
        let y1 = (bounds.max_y.round() as i64).max(y0 + 1);
        Self::new(x0, y0, (x1 - x0) as usize, (y1 - y0) as usize)
    }

    /// Smallest rectangle covering every pixel touched by a pixel-space envelope.
    pub fn enclosing(bounds: &BoundingBox) -> Self {
        let x0 = bounds.min_x.floor() as i64;
        let y0 = bounds.min_y.floor() as i64;
        let x1 = (bounds.max_x.ceil() as i64).max(x0 + 1);
        let y1 = (bounds.max_y.ceil() as i64).max(y0 + 1);
        Self::new(x0, y0, (x1 - x0) as usize, (y1 - y0) as usize)
    }

    pub fn max_x(&self) -> i64 {
        self.x + self.width as i64
    }

    pub fn max_y(&self) -> i64 {
        self.y + self.height as i64
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    pub fn area(&self) -> usize {
        self.width * self.height
    }

    pub fn intersection(&self, other: &PixelRect) -> Option<PixelRect> {
        let x0 = self.x.max(other.x);
        let y0 = self.y.max(other.y);
        let x1 = self.max_x().min(other.max_x());
        let y1 = self.max_y().min(other.max_y());
        if x1 <= x0 || y1 <= y0 {
            return None;
        }
        Some(PixelRect::new(x0, y0, (x1 - x0) as usize, (y1 - y0) as usize))
    }

    /// Grow by `n` pixels on every side.
    pub fn grow(&self, n: usize) -> PixelRect {
        PixelRect::new(
            self.x - n as i64,
            self.y - n as i64,
            self.width + 2 * n,
            self.height + 2 * n,
        )
    }

    pub fn contains(&self, col: i64, row: i64) -> bool {
        col >= self.x && col < self.max_x() && row >= self.y && row < self.max_y()
    }

    /// As a pixel-space bounding box (corner coordinates).
    pub fn as_bbox(&self) -> BoundingBox {
        BoundingBox::new(
            self.x as f64,
            self.y as f64,
            self.max_x() as f64,
            self.max_y() as f64,
        )
    }
}

/// A requested output grid: CRS, world extent and pixel dimensions.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GridGeometry {
    pub crs: CrsCode,
    pub bbox: BoundingBox,
    pub width: usize,
    pub height: usize,
}

impl GridGeometry {
    pub fn new(crs: CrsCode, bbox: BoundingBox, width: usize, height: usize) -> Self {
        Self {
            crs,
            bbox,
            width,
            height,
        }
    }

    pub fn grid_to_world(&self) -> AffineTransform {
        AffineTransform::from_bbox(&self.bbox, self.width, self.height)
    }

    /// Pixel size (x, y) in CRS units.
    pub fn resolution(&self) -> (f64, f64) {
        (
            self.bbox.width() / self.width as f64,
            self.bbox.height() / self.height as f64,
        )
    }
}
