//! Downsampling functions for generating overview levels.
//!
//! Each level halves both dimensions, rounding down for odd sizes, which
//! matches the level dimensions of [`crate::GranuleRecord::with_overviews`].

use serde::{Deserialize, Serialize};

use crate::types::Raster;

/// Method used to combine each 2x2 block.
///
/// - **Mean**: continuous imagery and measurements
/// - **Max**: sparse peaks that must survive reduction
/// - **Nearest**: categorical data, exact values preserved
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DownsampleMethod {
    /// Average of 2x2 block
    #[default]
    Mean,
    /// Maximum of 2x2 block
    Max,
    /// Top-left value of 2x2 block
    Nearest,
}

/// Downsample a 2D grid by a factor of 2.
///
/// Takes a grid of size (width, height) and produces a grid of size
/// (width/2, height/2), rounded down for odd dimensions.
///
/// # Returns
/// Tuple of (downsampled_data, new_width, new_height)
pub fn downsample_2x(
    data: &[f32],
    width: usize,
    height: usize,
    method: DownsampleMethod,
) -> (Vec<f32>, usize, usize) {
    let new_width = width / 2;
    let new_height = height / 2;

    if new_width == 0 || new_height == 0 {
        return (vec![], 0, 0);
    }

    let mut output = vec![f32::NAN; new_width * new_height];

    for out_y in 0..new_height {
        for out_x in 0..new_width {
            let in_x = out_x * 2;
            let in_y = out_y * 2;

            let block = [
                data[in_y * width + in_x],
                data[in_y * width + in_x + 1],
                data[(in_y + 1) * width + in_x],
                data[(in_y + 1) * width + in_x + 1],
            ];

            output[out_y * new_width + out_x] = match method {
                DownsampleMethod::Mean => mean_of_block(block),
                DownsampleMethod::Max => max_of_block(block),
                DownsampleMethod::Nearest => block[0],
            };
        }
    }

    (output, new_width, new_height)
}

/// Mean of the non-NaN values; NaN if all are NaN.
#[inline]
fn mean_of_block(values: [f32; 4]) -> f32 {
    let mut sum = 0.0f32;
    let mut count = 0;
    for v in values.into_iter().filter(|v| !v.is_nan()) {
        sum += v;
        count += 1;
    }
    if count == 0 {
        f32::NAN
    } else {
        sum / count as f32
    }
}

/// Maximum of the non-NaN values; NaN if all are NaN.
#[inline]
fn max_of_block(values: [f32; 4]) -> f32 {
    values
        .into_iter()
        .filter(|v| !v.is_nan())
        .reduce(f32::max)
        .unwrap_or(f32::NAN)
}

/// Halve every band of a raster. Alpha is always averaged.
pub fn downsample_raster(raster: &Raster, method: DownsampleMethod) -> Option<Raster> {
    let (w, h) = (raster.width / 2, raster.height / 2);
    if w == 0 || h == 0 {
        return None;
    }
    let bands = raster
        .bands
        .iter()
        .map(|band| downsample_2x(band, raster.width, raster.height, method).0)
        .collect();
    let alpha = raster
        .alpha
        .as_ref()
        .map(|a| downsample_2x(a, raster.width, raster.height, DownsampleMethod::Mean).0);
    Some(Raster {
        width: w,
        height: h,
        bands,
        alpha,
    })
}

/// Build a pyramid: the base raster followed by up to `overviews` halvings.
///
/// Stops early when a dimension would reach zero.
pub fn build_pyramid(base: Raster, overviews: usize, method: DownsampleMethod) -> Vec<Raster> {
    let mut levels = vec![base];
    for _ in 0..overviews {
        let Some(next) = levels.last().and_then(|l| downsample_raster(l, method)) else {
            break;
        };
        levels.push(next);
    }
    levels
}
