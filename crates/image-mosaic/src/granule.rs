//! Granule records: one source raster tile as registered in the catalog.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use mosaic_common::{AffineTransform, BoundingBox, CrsCode};

use crate::footprint::MultiPolygon;
use crate::types::BandStatistics;

/// Stable identifier of a granule, used for provenance and caching.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct GranuleId(pub String);

impl GranuleId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for GranuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for GranuleId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// A typed attribute value attached to a granule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttributeValue {
    Bool(bool),
    Integer(i64),
    Float(f64),
    Time(DateTime<Utc>),
    Text(String),
}

/// Kind of an attribute in the catalog schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttributeKind {
    Bool,
    Integer,
    Float,
    Time,
    Text,
}

impl AttributeValue {
    pub fn kind(&self) -> AttributeKind {
        match self {
            Self::Bool(_) => AttributeKind::Bool,
            Self::Integer(_) => AttributeKind::Integer,
            Self::Float(_) => AttributeKind::Float,
            Self::Time(_) => AttributeKind::Time,
            Self::Text(_) => AttributeKind::Text,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Integer(v) => Some(*v as f64),
            Self::Float(v) => Some(*v),
            _ => None,
        }
    }

    fn rank(&self) -> u8 {
        match self {
            Self::Bool(_) => 0,
            Self::Integer(_) | Self::Float(_) => 1,
            Self::Time(_) => 2,
            Self::Text(_) => 3,
        }
    }

    /// Total order used for sorting: type rank first, then value.
    /// Integers and floats compare numerically.
    pub fn total_cmp(&self, other: &AttributeValue) -> Ordering {
        match (self, other) {
            (Self::Bool(a), Self::Bool(b)) => a.cmp(b),
            (Self::Integer(a), Self::Integer(b)) => a.cmp(b),
            (Self::Time(a), Self::Time(b)) => a.cmp(b),
            (Self::Text(a), Self::Text(b)) => a.cmp(b),
            _ => match (self.as_f64(), other.as_f64()) {
                (Some(a), Some(b)) => a.total_cmp(&b),
                _ => self.rank().cmp(&other.rank()),
            },
        }
    }

    /// Parse a request-supplied string against an attribute kind.
    pub fn parse_as(kind: AttributeKind, s: &str) -> Option<AttributeValue> {
        let s = s.trim();
        match kind {
            AttributeKind::Bool => match s.to_lowercase().as_str() {
                "true" | "1" => Some(Self::Bool(true)),
                "false" | "0" => Some(Self::Bool(false)),
                _ => None,
            },
            AttributeKind::Integer => s.parse().ok().map(Self::Integer),
            AttributeKind::Float => s.parse().ok().map(Self::Float),
            AttributeKind::Time => mosaic_common::parse_iso8601(s).ok().map(Self::Time),
            AttributeKind::Text => Some(Self::Text(s.to_string())),
        }
    }
}

impl fmt::Display for AttributeValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(v) => write!(f, "{v}"),
            Self::Integer(v) => write!(f, "{v}"),
            Self::Float(v) => write!(f, "{v}"),
            Self::Time(v) => write!(f, "{}", v.to_rfc3339()),
            Self::Text(v) => f.write_str(v),
        }
    }
}

impl From<i64> for AttributeValue {
    fn from(v: i64) -> Self {
        Self::Integer(v)
    }
}

impl From<f64> for AttributeValue {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<&str> for AttributeValue {
    fn from(v: &str) -> Self {
        Self::Text(v.to_string())
    }
}

impl From<DateTime<Utc>> for AttributeValue {
    fn from(v: DateTime<Utc>) -> Self {
        Self::Time(v)
    }
}

/// One level of a granule's resolution pyramid.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OverviewLevel {
    pub width: usize,
    pub height: usize,
    pub grid_to_world: AffineTransform,
}

impl OverviewLevel {
    pub fn new(width: usize, height: usize, grid_to_world: AffineTransform) -> Self {
        Self {
            width,
            height,
            grid_to_world,
        }
    }

    /// A level spanning `bbox` with the given pixel dimensions.
    pub fn spanning(bbox: &BoundingBox, width: usize, height: usize) -> Self {
        Self::new(width, height, AffineTransform::from_bbox(bbox, width, height))
    }

    /// Pixel size (x, y) in CRS units.
    pub fn resolution(&self) -> (f64, f64) {
        self.grid_to_world.resolution()
    }
}

/// Where a granule's valid-data footprint comes from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum FootprintSource {
    /// The whole bounding box is valid.
    #[default]
    WholeExtent,
    /// Geometry already known to the catalog, in the granule's CRS.
    Geometry { shape: MultiPolygon },
    /// GeoJSON Polygon/MultiPolygon file.
    VectorSidecar { path: PathBuf },
    /// PNG mask over the granule extent; non-zero pixels are valid.
    RasterSidecar { path: PathBuf },
}

impl FootprintSource {
    /// Conventional sidecar locations next to a granule file: `<location>.geojson`
    /// first, then `<location>.mask.png`.
    pub fn discover(location: &str) -> FootprintSource {
        let vector = PathBuf::from(format!("{location}.geojson"));
        if vector.is_file() {
            return Self::VectorSidecar { path: vector };
        }
        let raster = PathBuf::from(format!("{location}.mask.png"));
        if raster.is_file() {
            return Self::RasterSidecar { path: raster };
        }
        Self::WholeExtent
    }
}

/// An immutable catalog entry describing one granule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GranuleRecord {
    pub id: GranuleId,
    /// Reference the pixel decoder resolves (path, URL or key).
    pub location: String,
    pub crs: CrsCode,
    pub bbox: BoundingBox,
    /// Pyramid levels, finest first. Never empty.
    pub levels: Vec<OverviewLevel>,
    pub attributes: BTreeMap<String, AttributeValue>,
    pub footprint: FootprintSource,
    pub decoder_hint: Option<String>,
    pub statistics: Option<Vec<BandStatistics>>,
}

impl GranuleRecord {
    /// A granule with a single base level of `width` x `height` pixels over `bbox`.
    pub fn new(
        id: impl Into<String>,
        location: impl Into<String>,
        crs: CrsCode,
        bbox: BoundingBox,
        width: usize,
        height: usize,
    ) -> Self {
        Self {
            id: GranuleId::new(id),
            location: location.into(),
            crs,
            bbox,
            levels: vec![OverviewLevel::spanning(&bbox, width, height)],
            attributes: BTreeMap::new(),
            footprint: FootprintSource::WholeExtent,
            decoder_hint: None,
            statistics: None,
        }
    }

    /// Add `count` power-of-two overview levels below the last level.
    ///
    /// Dimensions halve (rounding down) at each level, as produced by
    /// [`crate::downsample::build_pyramid`]. Stops before a dimension reaches zero.
    pub fn with_overviews(mut self, count: usize) -> Self {
        for _ in 0..count {
            let last = self.levels[self.levels.len() - 1];
            let (w, h) = (last.width / 2, last.height / 2);
            if w == 0 || h == 0 {
                break;
            }
            self.levels.push(OverviewLevel::spanning(&self.bbox, w, h));
        }
        self
    }

    pub fn with_level(mut self, level: OverviewLevel) -> Self {
        self.levels.push(level);
        self
    }

    pub fn with_attribute(mut self, name: impl Into<String>, value: impl Into<AttributeValue>) -> Self {
        self.attributes.insert(name.into(), value.into());
        self
    }

    pub fn with_footprint(mut self, footprint: FootprintSource) -> Self {
        self.footprint = footprint;
        self
    }

    pub fn with_decoder_hint(mut self, hint: impl Into<String>) -> Self {
        self.decoder_hint = Some(hint.into());
        self
    }

    pub fn with_statistics(mut self, statistics: Vec<BandStatistics>) -> Self {
        self.statistics = Some(statistics);
        self
    }

    pub fn attribute(&self, name: &str) -> Option<&AttributeValue> {
        self.attributes.get(name)
    }

    /// Native (finest) resolution.
    pub fn native_resolution(&self) -> (f64, f64) {
        self.levels[0].resolution()
    }
}
