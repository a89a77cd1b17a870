//! Albers Equal Area Conic projection (spherical form).
//!
//! Used for EPSG:5070 (CONUS Albers). The projection parameters are:
//! - Standard parallels: 29.5°N and 45.5°N
//! - Latitude of origin: 23°N
//! - Central meridian: 96°W
//!
//! The sphere approximation is within a few hundred meters of the NAD83
//! ellipsoidal definition over CONUS, which is below one pixel at the
//! resolutions mosaics are usually served at.

use std::f64::consts::PI;

use crate::mercator::WEB_MERCATOR_RADIUS;

/// Albers Equal Area Conic projection parameters.
#[derive(Debug, Clone)]
pub struct AlbersEqualArea {
    /// Central meridian in radians
    pub lon0: f64,
    /// Latitude of origin in radians
    pub lat0: f64,
    /// First standard parallel in radians
    pub lat1: f64,
    /// Second standard parallel in radians
    pub lat2: f64,
    /// Sphere radius (meters)
    pub radius: f64,
    /// Cone constant
    n: f64,
    c: f64,
    rho0: f64,
}

impl AlbersEqualArea {
    /// Create the projection from parameters in degrees.
    pub fn new(lat0_deg: f64, lon0_deg: f64, lat1_deg: f64, lat2_deg: f64) -> Self {
        let lat0 = lat0_deg.to_radians();
        let lon0 = lon0_deg.to_radians();
        let lat1 = lat1_deg.to_radians();
        let lat2 = lat2_deg.to_radians();
        let radius = WEB_MERCATOR_RADIUS;

        let n = (lat1.sin() + lat2.sin()) / 2.0;
        let c = lat1.cos().powi(2) + 2.0 * n * lat1.sin();
        let rho0 = radius * (c - 2.0 * n * lat0.sin()).sqrt() / n;

        Self {
            lon0,
            lat0,
            lat1,
            lat2,
            radius,
            n,
            c,
            rho0,
        }
    }

    /// EPSG:5070, NAD83 / Conus Albers.
    pub fn conus() -> Self {
        Self::new(23.0, -96.0, 29.5, 45.5)
    }

    /// Longitude/latitude in degrees to projected meters.
    pub fn forward(&self, lon_deg: f64, lat_deg: f64) -> (f64, f64) {
        let lat = lat_deg.to_radians();
        let mut dlon = lon_deg.to_radians() - self.lon0;
        while dlon > PI {
            dlon -= 2.0 * PI;
        }
        while dlon < -PI {
            dlon += 2.0 * PI;
        }

        let rho = self.radius * (self.c - 2.0 * self.n * lat.sin()).sqrt() / self.n;
        let theta = self.n * dlon;
        (rho * theta.sin(), self.rho0 - rho * theta.cos())
    }

    /// Projected meters to longitude/latitude in degrees.
    pub fn inverse(&self, x: f64, y: f64) -> (f64, f64) {
        let dy = self.rho0 - y;
        let rho = x.hypot(dy);
        let theta = x.atan2(dy);
        let q = (self.c - (rho * self.n / self.radius).powi(2)) / (2.0 * self.n);
        let lat = q.clamp(-1.0, 1.0).asin();
        let lon = self.lon0 + theta / self.n;
        (lon.to_degrees(), lat.to_degrees())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_origin_maps_to_zero() {
        let proj = AlbersEqualArea::conus();
        let (x, y) = proj.forward(-96.0, 23.0);
        assert!(x.abs() < 1e-6);
        assert!(y.abs() < 1e-6);
    }

    #[test]
    fn test_roundtrip_over_conus() {
        let proj = AlbersEqualArea::conus();
        for &(lon, lat) in &[(-120.0, 45.0), (-75.0, 40.0), (-100.0, 30.0)] {
            let (x, y) = proj.forward(lon, lat);
            let (lon2, lat2) = proj.inverse(x, y);
            assert!((lon - lon2).abs() < 1e-9, "lon {} vs {}", lon, lon2);
            assert!((lat - lat2).abs() < 1e-9, "lat {} vs {}", lat, lat2);
        }
    }

    #[test]
    fn test_east_is_positive_x() {
        let proj = AlbersEqualArea::conus();
        let (x_east, _) = proj.forward(-80.0, 35.0);
        let (x_west, _) = proj.forward(-110.0, 35.0);
        assert!(x_east > 0.0);
        assert!(x_west < 0.0);
    }
}
