//! Interpolation kernels and grid-to-grid resampling.
//!
//! Sample coordinates are in pixel-index space: integer values address
//! pixel centres. Coordinates are clamped to the raster so edge pixels
//! never read outside the buffer.

use projection::transform_point;

use crate::error::{MosaicError, Result};
use crate::loader::WorkingGrid;
use crate::types::{InterpolationMethod, Raster};

/// Nearest neighbor interpolation.
///
/// Returns the value of the nearest grid point.
pub fn nearest_interpolate(data: &[f32], width: usize, height: usize, x: f64, y: f64) -> f32 {
    if width == 0 || height == 0 {
        return f32::NAN;
    }
    let col = x.round().clamp(0.0, (width - 1) as f64) as usize;
    let row = y.round().clamp(0.0, (height - 1) as f64) as usize;
    data[row * width + col]
}

/// Bilinear interpolation.
///
/// Smoothly interpolates between the four nearest grid points.
pub fn bilinear_interpolate(data: &[f32], width: usize, height: usize, x: f64, y: f64) -> f32 {
    if width == 0 || height == 0 {
        return f32::NAN;
    }
    let x = x.clamp(0.0, (width - 1) as f64);
    let y = y.clamp(0.0, (height - 1) as f64);
    let x0 = x.floor() as usize;
    let y0 = y.floor() as usize;
    let x1 = (x0 + 1).min(width - 1);
    let y1 = (y0 + 1).min(height - 1);

    let xf = (x - x0 as f64) as f32;
    let yf = (y - y0 as f64) as f32;

    let v00 = data[y0 * width + x0];
    let v10 = data[y0 * width + x1];
    let v01 = data[y1 * width + x0];
    let v11 = data[y1 * width + x1];

    // Handle NaN values - if any corner is NaN, fall back to nearest
    if v00.is_nan() || v10.is_nan() || v01.is_nan() || v11.is_nan() {
        return nearest_interpolate(data, width, height, x, y);
    }

    let top = v00 * (1.0 - xf) + v10 * xf;
    let bottom = v01 * (1.0 - xf) + v11 * xf;
    top * (1.0 - yf) + bottom * yf
}

/// Bicubic interpolation.
///
/// Uses 16 surrounding points for smoother interpolation.
pub fn cubic_interpolate(data: &[f32], width: usize, height: usize, x: f64, y: f64) -> f32 {
    if width == 0 || height == 0 {
        return f32::NAN;
    }
    let x = x.clamp(0.0, (width - 1) as f64);
    let y = y.clamp(0.0, (height - 1) as f64);
    let xi = x.floor() as i64;
    let yi = y.floor() as i64;

    let xf = (x - xi as f64) as f32;
    let yf = (y - yi as f64) as f32;

    let mut values = [[0.0f32; 4]; 4];
    for j in 0..4 {
        for i in 0..4 {
            let px = (xi + i - 1).clamp(0, width as i64 - 1) as usize;
            let py = (yi + j - 1).clamp(0, height as i64 - 1) as usize;
            let v = data[py * width + px];
            // If any value is NaN, fall back to bilinear
            if v.is_nan() {
                return bilinear_interpolate(data, width, height, x, y);
            }
            values[j as usize][i as usize] = v;
        }
    }

    let mut row_values = [0.0f32; 4];
    for j in 0..4 {
        row_values[j] = cubic_1d(values[j][0], values[j][1], values[j][2], values[j][3], xf);
    }
    cubic_1d(row_values[0], row_values[1], row_values[2], row_values[3], yf)
}

/// 1D cubic interpolation using Catmull-Rom spline.
fn cubic_1d(p0: f32, p1: f32, p2: f32, p3: f32, t: f32) -> f32 {
    let t2 = t * t;
    let t3 = t2 * t;

    let a = -0.5 * p0 + 1.5 * p1 - 1.5 * p2 + 0.5 * p3;
    let b = p0 - 2.5 * p1 + 2.0 * p2 - 0.5 * p3;
    let c = -0.5 * p0 + 0.5 * p2;
    let d = p1;

    a * t3 + b * t2 + c * t + d
}

/// Sample a band with the given method.
#[inline]
pub fn sample(method: InterpolationMethod, data: &[f32], width: usize, height: usize, x: f64, y: f64) -> f32 {
    match method {
        InterpolationMethod::Nearest => nearest_interpolate(data, width, height, x, y),
        InterpolationMethod::Bilinear => bilinear_interpolate(data, width, height, x, y),
        InterpolationMethod::Cubic => cubic_interpolate(data, width, height, x, y),
    }
}

/// Sample every band of `source` at pixel-corner coordinates `(u, v)`.
///
/// Returns `None` when the point falls outside the raster or on a
/// transparent pixel.
pub fn sample_pixel(method: InterpolationMethod, source: &Raster, u: f64, v: f64, out: &mut [f32]) -> Option<f32> {
    if u < 0.0 || v < 0.0 || u >= source.width as f64 || v >= source.height as f64 {
        return None;
    }
    let idx = source.index(u as usize, v as usize);
    let alpha = source.alpha_at(idx);
    if alpha <= 0.0 {
        return None;
    }
    // Blend kernels only where the neighbourhood is fully opaque.
    let method = if source.alpha.is_some() { InterpolationMethod::Nearest } else { method };
    for (b, band) in source.bands.iter().enumerate() {
        out[b] = sample(method, band, source.width, source.height, u - 0.5, v - 0.5);
    }
    Some(alpha)
}

/// Warp a raster from one grid onto another by inverse mapping each target
/// pixel centre into the source grid.
///
/// Target pixels with no source sample get `background` and zero alpha.
pub fn reproject(
    source: &Raster,
    source_grid: &WorkingGrid,
    target_grid: &WorkingGrid,
    method: InterpolationMethod,
    background: &[f64],
) -> Result<Raster> {
    let failure = |message: &str| MosaicError::ReprojectionFailure {
        from: source_grid.crs,
        to: target_grid.crs,
        message: message.to_string(),
    };
    let w2g = source_grid
        .grid_to_world
        .inverse()
        .ok_or_else(|| failure("singular source grid"))?;

    let mut out = Raster::filled(target_grid.width, target_grid.height, source.num_bands(), background);
    let mut alpha = vec![0.0f32; target_grid.width * target_grid.height];
    let mut pixel = vec![0.0f32; source.num_bands()];
    let mut transformed = 0usize;

    for row in 0..target_grid.height {
        for col in 0..target_grid.width {
            let (x, y) = target_grid.grid_to_world.pixel_center(col as i64, row as i64);
            let Ok((sx, sy)) = transform_point(target_grid.crs, source_grid.crs, x, y) else {
                continue;
            };
            transformed += 1;
            let (u, v) = w2g.apply(sx, sy);
            if let Some(a) = sample_pixel(method, source, u, v, &mut pixel) {
                let idx = row * target_grid.width + col;
                for (b, value) in pixel.iter().enumerate() {
                    out.bands[b][idx] = *value;
                }
                alpha[idx] = a;
            }
        }
    }

    if transformed == 0 && target_grid.width * target_grid.height > 0 {
        return Err(failure("no target pixel maps into the source CRS"));
    }
    Ok(out.with_alpha(alpha))
}
