//! Polar Stereographic projection (spherical, variant B: true scale at a
//! standard parallel).
//!
//! Used for EPSG:3413 (north, true scale 70°N, central meridian 45°W) and
//! EPSG:3031 (south, true scale 71°S, central meridian 0°).

use std::f64::consts::PI;

use crate::mercator::WEB_MERCATOR_RADIUS;

/// Which pole the projection is centred on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pole {
    North,
    South,
}

/// Polar stereographic projection parameters.
#[derive(Debug, Clone)]
pub struct PolarStereographic {
    pub pole: Pole,
    /// Central meridian in radians
    pub lon0: f64,
    /// Latitude of true scale in radians (absolute value)
    pub lat_ts: f64,
    /// Sphere radius (meters)
    pub radius: f64,
    /// rho = k * tan(pi/4 - lat/2)
    k: f64,
}

impl PolarStereographic {
    pub fn new(pole: Pole, lon0_deg: f64, lat_ts_deg: f64) -> Self {
        let lat_ts = lat_ts_deg.abs().to_radians();
        let radius = WEB_MERCATOR_RADIUS;
        let k = radius * lat_ts.cos() / (PI / 4.0 - lat_ts / 2.0).tan();
        Self {
            pole,
            lon0: lon0_deg.to_radians(),
            lat_ts,
            radius,
            k,
        }
    }

    /// EPSG:3413, NSIDC Sea Ice Polar Stereographic North.
    pub fn nsidc_north() -> Self {
        Self::new(Pole::North, -45.0, 70.0)
    }

    /// EPSG:3031, Antarctic Polar Stereographic.
    pub fn antarctic() -> Self {
        Self::new(Pole::South, 0.0, -71.0)
    }

    /// Longitude/latitude in degrees to projected meters.
    ///
    /// The opposite pole projects to infinity; callers should check for
    /// non-finite results.
    pub fn forward(&self, lon_deg: f64, lat_deg: f64) -> (f64, f64) {
        let dlon = lon_deg.to_radians() - self.lon0;
        match self.pole {
            Pole::North => {
                let rho = self.k * (PI / 4.0 - lat_deg.to_radians() / 2.0).tan();
                (rho * dlon.sin(), -rho * dlon.cos())
            }
            Pole::South => {
                let rho = self.k * (PI / 4.0 + lat_deg.to_radians() / 2.0).tan();
                (rho * dlon.sin(), rho * dlon.cos())
            }
        }
    }

    /// Projected meters to longitude/latitude in degrees.
    pub fn inverse(&self, x: f64, y: f64) -> (f64, f64) {
        let rho = x.hypot(y);
        let colat = 2.0 * (rho / self.k).atan();
        match self.pole {
            Pole::North => {
                let lat = PI / 2.0 - colat;
                let lon = self.lon0 + x.atan2(-y);
                (normalize_lon(lon.to_degrees()), lat.to_degrees())
            }
            Pole::South => {
                let lat = colat - PI / 2.0;
                let lon = self.lon0 + x.atan2(y);
                (normalize_lon(lon.to_degrees()), lat.to_degrees())
            }
        }
    }
}

fn normalize_lon(mut lon: f64) -> f64 {
    while lon > 180.0 {
        lon -= 360.0;
    }
    while lon < -180.0 {
        lon += 360.0;
    }
    lon
}
