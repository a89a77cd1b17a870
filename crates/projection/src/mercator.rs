//! Spherical (Web) Mercator, EPSG:3857.

use std::f64::consts::PI;

/// Sphere radius used by EPSG:3857 (the WGS84 semi-major axis).
pub const WEB_MERCATOR_RADIUS: f64 = 6378137.0;

/// Latitude beyond which Web Mercator is clipped (the square-world limit).
pub const MAX_LATITUDE: f64 = 85.05112877980659;

/// Forward projection: longitude/latitude in degrees to meters.
///
/// Latitudes are clamped to ±[`MAX_LATITUDE`] so the poles stay finite.
pub fn forward(lon_deg: f64, lat_deg: f64) -> (f64, f64) {
    let lat = lat_deg.clamp(-MAX_LATITUDE, MAX_LATITUDE).to_radians();
    let x = WEB_MERCATOR_RADIUS * lon_deg.to_radians();
    let y = WEB_MERCATOR_RADIUS * (PI / 4.0 + lat / 2.0).tan().ln();
    (x, y)
}

/// Inverse projection: meters to longitude/latitude in degrees.
pub fn inverse(x: f64, y: f64) -> (f64, f64) {
    let lon = (x / WEB_MERCATOR_RADIUS).to_degrees();
    let lat = (2.0 * (y / WEB_MERCATOR_RADIUS).exp().atan() - PI / 2.0).to_degrees();
    (lon, lat)
}
