//! Point and envelope transformations between supported CRS codes.
//!
//! Every transformation pivots through geographic longitude/latitude.
//! EPSG:4326 and EPSG:4269 are treated as the same datum (they differ by
//! about a meter over North America).

use mosaic_common::{BoundingBox, CrsCode};
use thiserror::Error;

use crate::albers::AlbersEqualArea;
use crate::mercator;
use crate::polar::PolarStereographic;

/// Errors raised while transforming coordinates.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ProjectionError {
    /// The point has no finite image in the target CRS.
    #[error("point ({x}, {y}) cannot be transformed from {from} to {to}")]
    OutOfDomain {
        from: CrsCode,
        to: CrsCode,
        x: f64,
        y: f64,
    },

    /// No sample of the envelope could be transformed.
    #[error("envelope {bbox} cannot be transformed from {from} to {to}")]
    EnvelopeOutOfDomain {
        from: CrsCode,
        to: CrsCode,
        bbox: String,
    },
}

/// Number of samples per envelope edge used when reprojecting envelopes.
pub const DEFAULT_DENSIFY: usize = 16;

/// Convert CRS coordinates to geographic longitude/latitude in degrees.
pub fn to_geographic(crs: CrsCode, x: f64, y: f64) -> (f64, f64) {
    match crs {
        CrsCode::Epsg4326 | CrsCode::Epsg4269 => (x, y),
        CrsCode::Epsg3857 => mercator::inverse(x, y),
        CrsCode::Epsg5070 => AlbersEqualArea::conus().inverse(x, y),
        CrsCode::Epsg3413 => PolarStereographic::nsidc_north().inverse(x, y),
        CrsCode::Epsg3031 => PolarStereographic::antarctic().inverse(x, y),
    }
}

/// Convert geographic longitude/latitude in degrees to CRS coordinates.
pub fn from_geographic(crs: CrsCode, lon: f64, lat: f64) -> (f64, f64) {
    match crs {
        CrsCode::Epsg4326 | CrsCode::Epsg4269 => (lon, lat),
        CrsCode::Epsg3857 => mercator::forward(lon, lat),
        CrsCode::Epsg5070 => AlbersEqualArea::conus().forward(lon, lat),
        CrsCode::Epsg3413 => PolarStereographic::nsidc_north().forward(lon, lat),
        CrsCode::Epsg3031 => PolarStereographic::antarctic().forward(lon, lat),
    }
}

/// Whether two CRS codes share identical coordinates (no resampling needed).
pub fn is_identity(from: CrsCode, to: CrsCode) -> bool {
    from == to || (from.is_geographic() && to.is_geographic())
}

/// Transform a single point between two CRS codes.
pub fn transform_point(from: CrsCode, to: CrsCode, x: f64, y: f64) -> Result<(f64, f64), ProjectionError> {
    if is_identity(from, to) {
        return Ok((x, y));
    }

    let (lon, lat) = to_geographic(from, x, y);
    let (tx, ty) = from_geographic(to, lon, lat);
    if tx.is_finite() && ty.is_finite() && lon.is_finite() && lat.is_finite() {
        Ok((tx, ty))
    } else {
        Err(ProjectionError::OutOfDomain { from, to, x, y })
    }
}

/// Transform an envelope, sampling `densify` points along each edge plus an
/// interior lattice so that curved edges and interior extrema are captured.
///
/// Samples that fall outside the target domain are skipped; the call fails
/// only when no sample survives.
pub fn transform_bbox(
    from: CrsCode,
    to: CrsCode,
    bbox: &BoundingBox,
    densify: usize,
) -> Result<BoundingBox, ProjectionError> {
    if is_identity(from, to) {
        return Ok(*bbox);
    }

    let steps = densify.max(1);
    let mut points = Vec::with_capacity((steps + 1) * (steps + 1));
    for j in 0..=steps {
        let y = bbox.min_y + bbox.height() * j as f64 / steps as f64;
        for i in 0..=steps {
            let x = bbox.min_x + bbox.width() * i as f64 / steps as f64;
            if let Ok(p) = transform_point(from, to, x, y) {
                points.push(p);
            }
        }
    }

    BoundingBox::from_points(points).ok_or_else(|| ProjectionError::EnvelopeOutOfDomain {
        from,
        to,
        bbox: bbox.cache_key(),
    })
}
