//! Test helpers shared by the mosaic crates.
//!
//! - [`generators`]: synthetic bands and masks with predictable values
//! - [`fixtures`]: extents, tile layouts and temporary sidecar directories
//! - `assert_approx_eq!` / `assert_band_approx_eq!` for float comparisons
//!
//! Pull it in as a dev-dependency:
//!
//! ```toml
//! [dev-dependencies]
//! test-utils = { path = "../test-utils" }
//! ```

pub mod fixtures;
pub mod generators;

pub use fixtures::*;
pub use generators::*;

/// Assert two scalars are within `epsilon` of each other.
///
/// ```ignore
/// assert_approx_eq!(bilinear(&band, 0.5, 0.5), 2.5, 1e-6);
/// ```
#[macro_export]
macro_rules! assert_approx_eq {
    ($left:expr, $right:expr, $epsilon:expr) => {{
        let (left, right, epsilon) = ($left as f64, $right as f64, $epsilon as f64);
        let diff = (left - right).abs();
        if !(diff <= epsilon) {
            panic!(
                "assertion failed: `(left ≈ right)`\n  left: `{:?}`\n right: `{:?}`\n  diff: `{:?}` > `{:?}`",
                left, right, diff, epsilon
            );
        }
    }};
}

/// Assert two bands match pixel by pixel within `epsilon`.
///
/// NaN matches NaN. The first mismatching index is reported.
///
/// ```ignore
/// assert_band_approx_eq!(&out.bands[0], &expected, 1e-5);
/// ```
#[macro_export]
macro_rules! assert_band_approx_eq {
    ($left:expr, $right:expr, $epsilon:expr) => {{
        let left: &[f32] = $left;
        let right: &[f32] = $right;
        let epsilon = $epsilon as f32;
        assert_eq!(left.len(), right.len(), "band lengths differ");
        let mismatch = left.iter().zip(right).position(|(a, b)| {
            !((a.is_nan() && b.is_nan()) || (a - b).abs() <= epsilon)
        });
        if let Some(i) = mismatch {
            panic!(
                "assertion failed: bands differ at index {}: `{:?}` vs `{:?}` (epsilon `{:?}`)",
                i, left[i], right[i], epsilon
            );
        }
    }};
}
