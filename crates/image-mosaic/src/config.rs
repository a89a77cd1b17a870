//! Configuration for one mosaic.

use serde::{Deserialize, Serialize};
use std::fmt;

use mosaic_common::{BoundingBox, CrsCode};

use crate::acceptor::AcceptorRegistry;
use crate::types::InterpolationMethod;

/// Configuration for a mosaic: its coverage CRS, attribute bindings and
/// resource limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MosaicConfig {
    /// Coverage name, used in logs and provenance.
    pub name: String,

    /// CRS the coverage is advertised in.
    pub crs: CrsCode,

    /// Coverage extent in `crs`. Derived from the catalog when absent.
    pub extent: Option<BoundingBox>,

    /// Native pixel size in `crs` units. Derived from the catalog when absent.
    pub native_resolution: Option<(f64, f64)>,

    /// Attribute the TIME parameter filters on.
    pub time_attribute: Option<String>,

    /// Attribute the ELEVATION parameter filters on.
    pub elevation_attribute: Option<String>,

    /// Custom dimensions addressable as `DIM_<NAME>` parameters.
    pub additional_domains: Vec<String>,

    /// Accept granules whose native CRS differs from `crs`.
    pub heterogeneous_crs: bool,

    /// Granule acceptor registry name. `heterogeneous_crs` overrides it.
    pub acceptor: String,

    /// Upper bound on concurrently decoding granules.
    pub max_decode_tasks: usize,

    /// Decode in parallel unless the request says otherwise.
    pub allow_multithreading: bool,

    /// Interpolation used for resampling and reprojection.
    pub interpolation: InterpolationMethod,

    /// How footprints are shrunk before masking.
    pub footprint_inset: FootprintInset,

    /// Inset distance in granule CRS units.
    pub footprint_inset_margin: f64,

    /// Number of loaded footprints kept in memory.
    pub footprint_cache_entries: usize,

    /// Hard cap on granules per request; the smaller of this and the request cap wins.
    pub max_allowed_tiles: Option<usize>,

    /// Background used when the request has none.
    pub default_background: Vec<f64>,
}

impl Default for MosaicConfig {
    fn default() -> Self {
        Self {
            name: "mosaic".to_string(),
            crs: CrsCode::Epsg4326,
            extent: None,
            native_resolution: None,
            time_attribute: None,
            elevation_attribute: None,
            additional_domains: Vec::new(),
            heterogeneous_crs: false,
            acceptor: "default".to_string(),
            max_decode_tasks: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
            allow_multithreading: false,
            interpolation: InterpolationMethod::Nearest,
            footprint_inset: FootprintInset::None,
            footprint_inset_margin: 0.0,
            footprint_cache_entries: 1024,
            max_allowed_tiles: None,
            default_background: vec![0.0],
        }
    }
}

impl MosaicConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(val) = std::env::var("MOSAIC_NAME") {
            config.name = val;
        }

        if let Ok(val) = std::env::var("MOSAIC_CRS") {
            if let Ok(crs) = CrsCode::from_wms_string(&val) {
                config.crs = crs;
            }
        }

        if let Ok(val) = std::env::var("MOSAIC_MAX_DECODE_TASKS") {
            if let Ok(n) = val.parse() {
                config.max_decode_tasks = n;
            }
        }

        if let Ok(val) = std::env::var("MOSAIC_ALLOW_MULTITHREADING") {
            config.allow_multithreading = parse_flag(&val);
        }

        if let Ok(val) = std::env::var("MOSAIC_HETEROGENEOUS_CRS") {
            config.heterogeneous_crs = parse_flag(&val);
        }

        if let Ok(val) = std::env::var("MOSAIC_INTERPOLATION") {
            config.interpolation = InterpolationMethod::parse(&val);
        }

        if let Ok(val) = std::env::var("MOSAIC_FOOTPRINT_INSET") {
            config.footprint_inset = FootprintInset::parse(&val);
        }

        if let Ok(val) = std::env::var("MOSAIC_FOOTPRINT_INSET_MARGIN") {
            if let Ok(margin) = val.parse() {
                config.footprint_inset_margin = margin;
            }
        }

        if let Ok(val) = std::env::var("MOSAIC_MAX_ALLOWED_TILES") {
            if let Ok(n) = val.parse() {
                config.max_allowed_tiles = Some(n);
            }
        }

        config
    }

    /// Validate the configuration against the built-in acceptors.
    pub fn validate(&self) -> Result<(), String> {
        self.validate_with(&AcceptorRegistry::with_builtins())
    }

    /// Validate the configuration, resolving the acceptor in `acceptors`.
    pub fn validate_with(&self, acceptors: &AcceptorRegistry) -> Result<(), String> {
        if self.max_decode_tasks == 0 {
            return Err("max_decode_tasks must be > 0".to_string());
        }

        if !self.footprint_inset_margin.is_finite() || self.footprint_inset_margin < 0.0 {
            return Err("footprint_inset_margin must be a non-negative number".to_string());
        }

        if self.footprint_cache_entries == 0 {
            return Err("footprint_cache_entries must be > 0".to_string());
        }

        if self.max_allowed_tiles == Some(0) {
            return Err("max_allowed_tiles must be > 0".to_string());
        }

        if let Some((rx, ry)) = self.native_resolution {
            if !(rx > 0.0 && ry > 0.0) {
                return Err("native_resolution must be positive".to_string());
            }
        }

        if let Some(extent) = &self.extent {
            if extent.is_empty() {
                return Err("extent must not be empty".to_string());
            }
        }

        if !acceptors.contains(&self.acceptor_name()) {
            return Err(format!("unknown granule acceptor '{}'", self.acceptor));
        }

        Ok(())
    }

    /// Effective acceptor name.
    pub fn acceptor_name(&self) -> String {
        if self.heterogeneous_crs {
            "heterogeneous_crs".to_string()
        } else {
            self.acceptor.clone()
        }
    }
}

fn parse_flag(val: &str) -> bool {
    val.to_lowercase() == "true" || val == "1"
}

/// How a footprint is shrunk before it is used as a mask.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum FootprintInset {
    /// Use the footprint as is.
    #[default]
    None,
    /// Shrink every edge by the margin.
    Full,
    /// Shrink only edges that do not lie on the granule bounding box.
    Border,
}

impl FootprintInset {
    /// Parse from string (case-insensitive).
    pub fn parse(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "full" => Self::Full,
            "border" => Self::Border,
            _ => Self::None,
        }
    }

    /// Get the policy name as a string.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Full => "full",
            Self::Border => "border",
        }
    }
}

impl fmt::Display for FootprintInset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
