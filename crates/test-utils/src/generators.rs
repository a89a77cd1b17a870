//! Band generators for synthetic granule rasters.
//!
//! Values are chosen so a test can tell from an output pixel which granule,
//! and which source pixel, it came from.

/// A row-major band where pixel `(col, row)` holds `col * 1000 + row`.
///
/// ```
/// let band = test_utils::create_test_grid(4, 3);
/// assert_eq!(band[2], 2000.0);
/// assert_eq!(band[4 + 2], 2001.0);
/// ```
pub fn create_test_grid(width: usize, height: usize) -> Vec<f32> {
    (0..height)
        .flat_map(|row| (0..width).map(move |col| (col * 1000 + row) as f32))
        .collect()
}

/// A band rising linearly from `start` in the first column to `end` in the
/// last, constant down each column.
///
/// Bilinear and cubic kernels reproduce a ramp exactly away from the edges.
pub fn create_gradient_band(width: usize, height: usize, start: f32, end: f32) -> Vec<f32> {
    let step = if width > 1 { (end - start) / (width - 1) as f32 } else { 0.0 };
    (0..width * height)
        .map(|i| start + step * (i % width) as f32)
        .collect()
}

pub fn create_constant_grid(width: usize, height: usize, value: f32) -> Vec<f32> {
    vec![value; width * height]
}

/// A zero band with NaN holes at the given `(col, row)` positions.
/// Out-of-range positions are ignored.
pub fn create_grid_with_nans(width: usize, height: usize, holes: &[(usize, usize)]) -> Vec<f32> {
    let mut band = vec![0.0f32; width * height];
    holes
        .iter()
        .filter(|(col, row)| *col < width && *row < height)
        .for_each(|(col, row)| band[row * width + col] = f32::NAN);
    band
}

/// `count` constant bands valued `base`, `base + 1`, ...
pub fn create_band_stack(width: usize, height: usize, count: usize, base: f32) -> Vec<Vec<f32>> {
    (0..count)
        .map(|band| create_constant_grid(width, height, base + band as f32))
        .collect()
}
