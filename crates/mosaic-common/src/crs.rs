//! Coordinate Reference System codes.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Well-known CRS codes a mosaic can be indexed in or requested in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum CrsCode {
    /// WGS84 Geographic (lat/lon in degrees)
    Epsg4326,
    /// Web Mercator (meters)
    Epsg3857,
    /// NAD83 Geographic
    Epsg4269,
    /// CONUS Albers Equal Area (meters)
    Epsg5070,
    /// Polar Stereographic North
    Epsg3413,
    /// Polar Stereographic South
    Epsg3031,
}

impl CrsCode {
    /// Parse a CRS string.
    ///
    /// Accepts formats like:
    /// - "EPSG:4326"
    /// - "epsg:4326"
    /// - "CRS:84" (equivalent to EPSG:4326 with lon/lat axis order)
    /// - "4326"
    pub fn from_wms_string(s: &str) -> Result<Self, CrsParseError> {
        let normalized = s.trim().to_uppercase();
        let code = normalized.strip_prefix("EPSG:").unwrap_or(&normalized);

        match code {
            "4326" | "CRS:84" => Ok(CrsCode::Epsg4326),
            "3857" | "900913" => Ok(CrsCode::Epsg3857),
            "4269" => Ok(CrsCode::Epsg4269),
            "5070" => Ok(CrsCode::Epsg5070),
            "3413" => Ok(CrsCode::Epsg3413),
            "3031" => Ok(CrsCode::Epsg3031),
            _ => Err(CrsParseError::UnsupportedCrs(s.to_string())),
        }
    }

    /// Numeric EPSG code.
    pub fn epsg(&self) -> u32 {
        match self {
            CrsCode::Epsg4326 => 4326,
            CrsCode::Epsg3857 => 3857,
            CrsCode::Epsg4269 => 4269,
            CrsCode::Epsg5070 => 5070,
            CrsCode::Epsg3413 => 3413,
            CrsCode::Epsg3031 => 3031,
        }
    }

    /// Check if this is a geographic (lat/lon) CRS.
    pub fn is_geographic(&self) -> bool {
        matches!(self, CrsCode::Epsg4326 | CrsCode::Epsg4269)
    }

    /// Get the valid bounds for this CRS.
    pub fn valid_bounds(&self) -> crate::BoundingBox {
        use crate::BoundingBox;

        match self {
            CrsCode::Epsg4326 | CrsCode::Epsg4269 => BoundingBox::new(-180.0, -90.0, 180.0, 90.0),
            CrsCode::Epsg3857 => {
                // Web Mercator bounds (approx ±85.06° latitude)
                let max_extent = 20037508.342789244;
                BoundingBox::new(-max_extent, -max_extent, max_extent, max_extent)
            }
            CrsCode::Epsg5070 => BoundingBox::new(-2500000.0, -2500000.0, 2500000.0, 2500000.0),
            CrsCode::Epsg3413 | CrsCode::Epsg3031 => {
                BoundingBox::new(-4000000.0, -4000000.0, 4000000.0, 4000000.0)
            }
        }
    }
}

impl fmt::Display for CrsCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EPSG:{}", self.epsg())
    }
}

impl std::str::FromStr for CrsCode {
    type Err = CrsParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_wms_string(s)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CrsParseError {
    #[error("Unsupported CRS: {0}")]
    UnsupportedCrs(String),
}
