//! Granule footprints: valid-data regions that may be smaller than a
//! granule's bounding box.
//!
//! A footprint is loaded lazily from the granule's [`FootprintSource`],
//! optionally inset, and cached per granule in an LRU.

use lru::LruCache;
use serde::{Deserialize, Serialize};
use std::num::NonZeroUsize;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::debug;

use mosaic_common::{AffineTransform, BoundingBox};

use crate::config::FootprintInset;
use crate::error::{MosaicError, Result};
use crate::granule::{FootprintSource, GranuleId, GranuleRecord};

/// A polygon with an exterior ring and optional holes. Rings need not be closed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Polygon {
    pub exterior: Vec<(f64, f64)>,
    #[serde(default)]
    pub holes: Vec<Vec<(f64, f64)>>,
}

impl Polygon {
    pub fn new(exterior: Vec<(f64, f64)>) -> Self {
        Self {
            exterior,
            holes: Vec::new(),
        }
    }

    pub fn with_hole(mut self, hole: Vec<(f64, f64)>) -> Self {
        self.holes.push(hole);
        self
    }

    /// Axis-aligned rectangle.
    pub fn rectangle(bbox: &BoundingBox) -> Self {
        Self::new(bbox.corners().to_vec())
    }

    fn rings(&self) -> impl Iterator<Item = &Vec<(f64, f64)>> {
        std::iter::once(&self.exterior).chain(self.holes.iter())
    }

    /// Even-odd point-in-polygon test across all rings, so holes are excluded.
    pub fn contains(&self, x: f64, y: f64) -> bool {
        let mut inside = false;
        for ring in self.rings() {
            for (a, b) in ring_edges(ring) {
                if (a.1 > y) != (b.1 > y) {
                    let cross_x = a.0 + (y - a.1) * (b.0 - a.0) / (b.1 - a.1);
                    if x < cross_x {
                        inside = !inside;
                    }
                }
            }
        }
        inside
    }

    /// Distance from a point to the nearest edge, ignoring edges that lie on
    /// the boundary of `skip_on`.
    pub fn distance_to_edges(&self, x: f64, y: f64, skip_on: Option<&BoundingBox>) -> f64 {
        self.rings()
            .flat_map(|ring| ring_edges(ring))
            .filter(|(a, b)| skip_on.map_or(true, |bbox| !edge_on_bbox(*a, *b, bbox)))
            .map(|(a, b)| point_segment_distance((x, y), a, b))
            .fold(f64::INFINITY, f64::min)
    }

    pub fn bbox(&self) -> Option<BoundingBox> {
        BoundingBox::from_points(self.exterior.iter().copied())
    }
}

/// A set of polygons; a point is inside if any member contains it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct MultiPolygon(pub Vec<Polygon>);

impl MultiPolygon {
    pub fn contains(&self, x: f64, y: f64) -> bool {
        self.0.iter().any(|p| p.contains(x, y))
    }

    /// Containment after growing the shape outward by `buffer`.
    pub fn contains_buffered(&self, x: f64, y: f64, buffer: f64) -> bool {
        self.contains(x, y) || (buffer > 0.0 && self.distance_to_edges(x, y, None) <= buffer)
    }

    pub fn distance_to_edges(&self, x: f64, y: f64, skip_on: Option<&BoundingBox>) -> f64 {
        self.0
            .iter()
            .map(|p| p.distance_to_edges(x, y, skip_on))
            .fold(f64::INFINITY, f64::min)
    }

    pub fn bbox(&self) -> Option<BoundingBox> {
        self.0
            .iter()
            .filter_map(Polygon::bbox)
            .reduce(|a, b| a.union(&b))
    }

    pub fn is_empty(&self) -> bool {
        self.0.iter().all(|p| p.exterior.len() < 3)
    }
}

fn ring_edges(ring: &[(f64, f64)]) -> impl Iterator<Item = ((f64, f64), (f64, f64))> + '_ {
    let n = ring.len();
    (0..n).map(move |i| (ring[i], ring[(i + 1) % n]))
}

fn point_segment_distance(p: (f64, f64), a: (f64, f64), b: (f64, f64)) -> f64 {
    let (dx, dy) = (b.0 - a.0, b.1 - a.1);
    let len2 = dx * dx + dy * dy;
    let t = if len2 == 0.0 {
        0.0
    } else {
        (((p.0 - a.0) * dx + (p.1 - a.1) * dy) / len2).clamp(0.0, 1.0)
    };
    (p.0 - (a.0 + t * dx)).hypot(p.1 - (a.1 + t * dy))
}

fn edge_on_bbox(a: (f64, f64), b: (f64, f64), bbox: &BoundingBox) -> bool {
    let eps = 1e-9 * bbox.width().abs().max(bbox.height().abs()).max(1.0);
    let same = |u: f64, v: f64, edge: f64| (u - edge).abs() <= eps && (v - edge).abs() <= eps;
    same(a.0, b.0, bbox.min_x)
        || same(a.0, b.0, bbox.max_x)
        || same(a.1, b.1, bbox.min_y)
        || same(a.1, b.1, bbox.max_y)
}

/// Validity mask raster aligned with a granule extent.
#[derive(Debug, Clone, PartialEq)]
pub struct RasterMask {
    pub width: usize,
    pub height: usize,
    pub valid: Vec<bool>,
    pub grid_to_world: AffineTransform,
    world_to_grid: AffineTransform,
}

impl RasterMask {
    pub fn new(width: usize, height: usize, valid: Vec<bool>, grid_to_world: AffineTransform) -> Option<Self> {
        if valid.len() != width * height {
            return None;
        }
        let world_to_grid = grid_to_world.inverse()?;
        Some(Self {
            width,
            height,
            valid,
            grid_to_world,
            world_to_grid,
        })
    }

    /// Validity at a world position; `None` outside the mask raster.
    fn lookup(&self, x: f64, y: f64) -> Option<bool> {
        let (col, row) = self.world_to_grid.apply(x, y);
        if col < 0.0 || row < 0.0 {
            return None;
        }
        let (col, row) = (col.floor() as usize, row.floor() as usize);
        if col >= self.width || row >= self.height {
            return None;
        }
        Some(self.valid[row * self.width + col])
    }

    /// Envelope of the valid pixels.
    fn valid_bbox(&self) -> Option<BoundingBox> {
        let mut corners = Vec::new();
        for row in 0..self.height {
            for col in 0..self.width {
                if self.valid[row * self.width + col] {
                    corners.push(self.grid_to_world.apply(col as f64, row as f64));
                    corners.push(self.grid_to_world.apply(col as f64 + 1.0, row as f64 + 1.0));
                }
            }
        }
        BoundingBox::from_points(corners)
    }
}

#[derive(Debug, Clone, PartialEq)]
enum RoiShape {
    Polygons(MultiPolygon),
    Mask(RasterMask),
}

/// A resolved region of interest: footprint shape plus inset.
#[derive(Debug, Clone, PartialEq)]
pub struct Roi {
    shape: RoiShape,
    inset: f64,
    /// When set, edges lying on this box are not inset.
    fixed_edges: Option<BoundingBox>,
    bbox: Option<BoundingBox>,
}

impl Roi {
    pub fn from_polygons(shape: MultiPolygon) -> Self {
        let bbox = shape.bbox();
        Self {
            shape: RoiShape::Polygons(shape),
            inset: 0.0,
            fixed_edges: None,
            bbox,
        }
    }

    pub fn from_mask(mask: RasterMask) -> Self {
        let bbox = mask.valid_bbox();
        Self {
            shape: RoiShape::Mask(mask),
            inset: 0.0,
            fixed_edges: None,
            bbox,
        }
    }

    /// Apply an inset policy relative to the granule extent.
    pub fn inset(mut self, policy: FootprintInset, margin: f64, granule_bbox: &BoundingBox) -> Self {
        if policy == FootprintInset::None || margin <= 0.0 {
            return self;
        }
        self.inset = margin;
        self.fixed_edges = (policy == FootprintInset::Border).then_some(*granule_bbox);
        if let (Some(bbox), FootprintInset::Full) = (self.bbox, policy) {
            self.bbox = Some(bbox.buffer(-margin, -margin)).filter(|b| !b.is_empty());
        }
        self
    }

    /// Envelope of the region; `None` if the region is empty.
    pub fn bbox(&self) -> Option<BoundingBox> {
        self.bbox
    }

    pub fn contains(&self, x: f64, y: f64) -> bool {
        if !self.bbox.map_or(false, |b| b.contains_point(x, y)) {
            return false;
        }
        match &self.shape {
            RoiShape::Polygons(shape) => {
                shape.contains(x, y)
                    && (self.inset <= 0.0
                        || shape.distance_to_edges(x, y, self.fixed_edges.as_ref()) >= self.inset)
            }
            RoiShape::Mask(mask) => {
                if mask.lookup(x, y) != Some(true) {
                    return false;
                }
                if self.inset <= 0.0 {
                    return true;
                }
                let d = self.inset;
                [(d, 0.0), (-d, 0.0), (0.0, d), (0.0, -d)]
                    .iter()
                    .all(|(dx, dy)| match mask.lookup(x + dx, y + dy) {
                        Some(valid) => valid,
                        None => self.fixed_edges.is_some(),
                    })
            }
        }
    }
}

/// Source of granule regions of interest.
///
/// Implementations must be safe to call from concurrent decode tasks.
pub trait FootprintProvider: Send + Sync {
    /// The granule's region of interest in its native CRS, or `None` if the
    /// granule has no footprint.
    fn roi(&self, granule: &GranuleRecord) -> Result<Option<Arc<Roi>>>;
}

/// Statistics about the footprint cache.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FootprintCacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entries: usize,
}

/// LRU cache of resolved footprints keyed by granule.
pub struct FootprintCache {
    cache: LruCache<GranuleId, Option<Arc<Roi>>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl FootprintCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            cache: LruCache::new(NonZeroUsize::new(capacity.max(1)).unwrap_or(NonZeroUsize::MIN)),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn get(&mut self, id: &GranuleId) -> Option<Option<Arc<Roi>>> {
        if let Some(roi) = self.cache.get(id) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            Some(roi.clone())
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            None
        }
    }

    pub fn insert(&mut self, id: GranuleId, roi: Option<Arc<Roi>>) {
        self.cache.put(id, roi);
    }

    pub fn stats(&self) -> FootprintCacheStats {
        FootprintCacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entries: self.cache.len(),
        }
    }
}

/// Resolves [`FootprintSource`]s: whole extent, inline geometry, GeoJSON or
/// PNG mask sidecars.
pub struct SidecarFootprintProvider {
    inset: FootprintInset,
    margin: f64,
    cache: Mutex<FootprintCache>,
}

impl SidecarFootprintProvider {
    pub fn new(inset: FootprintInset, margin: f64, cache_entries: usize) -> Self {
        Self {
            inset,
            margin,
            cache: Mutex::new(FootprintCache::new(cache_entries)),
        }
    }

    pub fn cache_stats(&self) -> FootprintCacheStats {
        self.cache
            .lock()
            .map(|c| c.stats())
            .unwrap_or_default()
    }

    fn load(&self, granule: &GranuleRecord) -> Result<Roi> {
        let roi = match &granule.footprint {
            FootprintSource::WholeExtent => {
                Roi::from_polygons(MultiPolygon(vec![Polygon::rectangle(&granule.bbox)]))
            }
            FootprintSource::Geometry { shape } => Roi::from_polygons(shape.clone()),
            FootprintSource::VectorSidecar { path } => {
                Roi::from_polygons(read_geojson(path).map_err(|e| MosaicError::footprint(granule.id.as_str(), e))?)
            }
            FootprintSource::RasterSidecar { path } => {
                Roi::from_mask(read_mask(path, &granule.bbox).map_err(|e| MosaicError::footprint(granule.id.as_str(), e))?)
            }
        };
        Ok(roi.inset(self.inset, self.margin, &granule.bbox))
    }
}

impl FootprintProvider for SidecarFootprintProvider {
    fn roi(&self, granule: &GranuleRecord) -> Result<Option<Arc<Roi>>> {
        if let Ok(mut cache) = self.cache.lock() {
            if let Some(hit) = cache.get(&granule.id) {
                return Ok(hit);
            }
        }

        let roi = Some(Arc::new(self.load(granule)?));
        debug!(granule = %granule.id, "Loaded footprint");

        if let Ok(mut cache) = self.cache.lock() {
            cache.insert(granule.id.clone(), roi.clone());
        }
        Ok(roi)
    }
}

#[derive(Deserialize)]
#[serde(tag = "type")]
enum GeoJson {
    Polygon {
        coordinates: Vec<Vec<Vec<f64>>>,
    },
    MultiPolygon {
        coordinates: Vec<Vec<Vec<Vec<f64>>>>,
    },
    GeometryCollection {
        geometries: Vec<GeoJson>,
    },
    Feature {
        geometry: Option<Box<GeoJson>>,
    },
    FeatureCollection {
        features: Vec<GeoJson>,
    },
}

impl GeoJson {
    fn collect_into(self, out: &mut Vec<Polygon>) -> std::result::Result<(), String> {
        match self {
            GeoJson::Polygon { coordinates } => out.push(polygon_from_rings(coordinates)?),
            GeoJson::MultiPolygon { coordinates } => {
                for rings in coordinates {
                    out.push(polygon_from_rings(rings)?);
                }
            }
            GeoJson::GeometryCollection { geometries } => {
                for g in geometries {
                    g.collect_into(out)?;
                }
            }
            GeoJson::Feature { geometry } => {
                if let Some(g) = geometry {
                    g.collect_into(out)?;
                }
            }
            GeoJson::FeatureCollection { features } => {
                for f in features {
                    f.collect_into(out)?;
                }
            }
        }
        Ok(())
    }
}

fn polygon_from_rings(rings: Vec<Vec<Vec<f64>>>) -> std::result::Result<Polygon, String> {
    let mut rings = rings.into_iter().map(|ring| {
        ring.into_iter()
            .map(|pos| match pos.as_slice() {
                [x, y, ..] => Ok((*x, *y)),
                _ => Err("position with fewer than two coordinates".to_string()),
            })
            .collect::<std::result::Result<Vec<_>, _>>()
    });
    let exterior = rings.next().ok_or("polygon without rings")??;
    let holes = rings.collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(Polygon { exterior, holes })
}

/// Parse a GeoJSON footprint (geometry, feature or collection).
pub fn parse_geojson(text: &str) -> std::result::Result<MultiPolygon, String> {
    let doc: GeoJson = serde_json::from_str(text).map_err(|e| e.to_string())?;
    let mut polygons = Vec::new();
    doc.collect_into(&mut polygons)?;
    Ok(MultiPolygon(polygons))
}

fn read_geojson(path: &Path) -> std::result::Result<MultiPolygon, String> {
    let text = std::fs::read_to_string(path).map_err(|e| format!("{}: {e}", path.display()))?;
    parse_geojson(&text).map_err(|e| format!("{}: {e}", path.display()))
}

fn read_mask(path: &Path, extent: &BoundingBox) -> std::result::Result<RasterMask, String> {
    let img = image::open(path)
        .map_err(|e| format!("{}: {e}", path.display()))?
        .to_luma8();
    let (width, height) = (img.width() as usize, img.height() as usize);
    let valid = img.pixels().map(|p| p.0[0] > 0).collect();
    RasterMask::new(width, height, valid, AffineTransform::from_bbox(extent, width, height))
        .ok_or_else(|| format!("{}: empty mask", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use mosaic_common::CrsCode;

    fn square(x0: f64, y0: f64, x1: f64, y1: f64) -> Vec<(f64, f64)> {
        vec![(x0, y0), (x1, y0), (x1, y1), (x0, y1)]
    }

    #[test]
    fn test_polygon_with_hole() {
        let poly = Polygon::new(square(0.0, 0.0, 10.0, 10.0)).with_hole(square(4.0, 4.0, 6.0, 6.0));
        assert!(poly.contains(1.0, 1.0));
        assert!(!poly.contains(5.0, 5.0));
        assert!(!poly.contains(11.0, 5.0));
    }

    #[test]
    fn test_full_and_border_inset() {
        let bbox = BoundingBox::new(0.0, 0.0, 10.0, 10.0);
        // Valid region is the left half of the granule.
        let shape = MultiPolygon(vec![Polygon::new(square(0.0, 0.0, 5.0, 10.0))]);

        let full = Roi::from_polygons(shape.clone()).inset(FootprintInset::Full, 1.0, &bbox);
        assert!(!full.contains(0.5, 5.0));
        assert!(full.contains(2.5, 5.0));
        assert!(!full.contains(4.5, 5.0));

        let border = Roi::from_polygons(shape).inset(FootprintInset::Border, 1.0, &bbox);
        // Edge x=0 lies on the granule box and is kept; x=5 is interior and is inset.
        assert!(border.contains(0.5, 5.0));
        assert!(border.contains(0.5, 0.5));
        assert!(!border.contains(4.5, 5.0));
    }

    #[test]
    fn test_buffered_containment() {
        let shape = MultiPolygon(vec![Polygon::new(square(0.0, 0.0, 1.0, 1.0))]);
        assert!(!shape.contains_buffered(1.5, 0.5, 0.0));
        assert!(shape.contains_buffered(1.5, 0.5, 0.6));
    }

    #[test]
    fn test_parse_geojson_variants() {
        let poly = parse_geojson(r#"{"type":"Polygon","coordinates":[[[0,0],[2,0],[2,2],[0,2],[0,0]]]}"#).unwrap();
        assert_eq!(poly.0.len(), 1);
        assert!(poly.contains(1.0, 1.0));

        let fc = parse_geojson(
            r#"{"type":"FeatureCollection","features":[
                {"type":"Feature","properties":{},"geometry":{"type":"MultiPolygon","coordinates":[
                    [[[0,0],[1,0],[1,1],[0,1]]],
                    [[[5,5,100],[6,5,100],[6,6,100],[5,6,100]]]
                ]}},
                {"type":"Feature","properties":{},"geometry":null}
            ]}"#,
        )
        .unwrap();
        assert_eq!(fc.0.len(), 2);
        assert!(fc.contains(5.5, 5.5));
        assert_eq!(fc.bbox(), Some(BoundingBox::new(0.0, 0.0, 6.0, 6.0)));

        assert!(parse_geojson(r#"{"type":"Point","coordinates":[0,0]}"#).is_err());
    }

    #[test]
    fn test_mask_roi() {
        let bbox = BoundingBox::new(0.0, 0.0, 4.0, 4.0);
        // Only the top-left 2x2 quadrant is valid.
        let valid = (0..16).map(|i| (i % 4) < 2 && (i / 4) < 2).collect();
        let mask = RasterMask::new(4, 4, valid, AffineTransform::from_bbox(&bbox, 4, 4)).unwrap();
        let roi = Roi::from_mask(mask);
        assert_eq!(roi.bbox(), Some(BoundingBox::new(0.0, 2.0, 2.0, 4.0)));
        assert!(roi.contains(0.5, 3.5));
        assert!(!roi.contains(3.5, 0.5));
    }

    #[test]
    fn test_provider_caches_and_reports_errors() {
        let dir = tempfile::tempdir().unwrap();
        let good = dir.path().join("good.geojson");
        std::fs::write(&good, r#"{"type":"Polygon","coordinates":[[[0,0],[1,0],[1,1],[0,1]]]}"#).unwrap();
        let bad = dir.path().join("bad.geojson");
        std::fs::write(&bad, "not json").unwrap();

        let bbox = BoundingBox::new(0.0, 0.0, 2.0, 2.0);
        let g1 = GranuleRecord::new("g1", "g1", CrsCode::Epsg4326, bbox, 2, 2)
            .with_footprint(FootprintSource::VectorSidecar { path: good });
        let g2 = GranuleRecord::new("g2", "g2", CrsCode::Epsg4326, bbox, 2, 2)
            .with_footprint(FootprintSource::VectorSidecar { path: bad });

        let provider = SidecarFootprintProvider::new(FootprintInset::None, 0.0, 8);
        let roi = provider.roi(&g1).unwrap().unwrap();
        assert!(roi.contains(0.5, 0.5));
        assert!(!roi.contains(1.5, 1.5));
        provider.roi(&g1).unwrap();
        let stats = provider.cache_stats();
        assert_eq!((stats.hits, stats.misses, stats.entries), (1, 1, 1));

        let err = provider.roi(&g2).unwrap_err();
        assert!(err.is_recoverable());
    }

    #[test]
    fn test_png_mask_sidecar() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tile.mask.png");
        let img = image::GrayImage::from_fn(4, 4, |x, _| image::Luma([if x < 2 { 255 } else { 0 }]));
        img.save(&path).unwrap();

        let bbox = BoundingBox::new(0.0, 0.0, 4.0, 4.0);
        let granule = GranuleRecord::new("m", "m", CrsCode::Epsg4326, bbox, 4, 4)
            .with_footprint(FootprintSource::RasterSidecar { path });
        let provider = SidecarFootprintProvider::new(FootprintInset::None, 0.0, 4);
        let roi = provider.roi(&granule).unwrap().unwrap();
        assert!(roi.contains(1.0, 2.0));
        assert!(!roi.contains(3.0, 2.0));
    }
}
