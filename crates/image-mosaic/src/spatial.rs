//! Reconciles the coverage extent with the requested output grid.

use serde::{Deserialize, Serialize};

use mosaic_common::{AffineTransform, BoundingBox, CrsCode, GridGeometry, PixelRect};
use projection::{transform_bbox, DEFAULT_DENSIFY};

use crate::error::{MosaicError, Result};

/// What the mosaic covers: CRS, extent and native pixel size.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoverageDescriptor {
    pub name: String,
    pub crs: CrsCode,
    pub extent: BoundingBox,
    pub native_resolution: (f64, f64),
}

impl CoverageDescriptor {
    /// The grid covering the full extent at native resolution.
    pub fn native_grid(&self) -> GridGeometry {
        let width = (self.extent.width() / self.native_resolution.0).round().max(1.0) as usize;
        let height = (self.extent.height() / self.native_resolution.1).round().max(1.0) as usize;
        GridGeometry::new(self.crs, self.extent, width, height)
    }
}

/// Output-space geometry of one request, in the requested CRS.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SpatialContext {
    pub crs: CrsCode,
    /// Requested box clipped to the coverage extent.
    pub computed_bbox: BoundingBox,
    /// Output pixels, in the requested grid's pixel space.
    pub raster_area: PixelRect,
    /// Maps pixel (0, 0) of `raster_area` to world coordinates.
    pub grid_to_world: AffineTransform,
    pub resolution: (f64, f64),
    pub needs_reprojection: bool,
    pub is_empty: bool,
}

impl SpatialContext {
    fn empty(crs: CrsCode, needs_reprojection: bool) -> Self {
        Self {
            crs,
            computed_bbox: BoundingBox::new(0.0, 0.0, 0.0, 0.0),
            raster_area: PixelRect::sized(0, 0),
            grid_to_world: AffineTransform::north_up(0.0, 0.0, 1.0, 1.0),
            resolution: (0.0, 0.0),
            needs_reprojection,
            is_empty: true,
        }
    }

    /// World envelope of the output raster.
    pub fn output_bbox(&self) -> BoundingBox {
        self.grid_to_world
            .transform_bbox(&PixelRect::sized(self.raster_area.width, self.raster_area.height).as_bbox())
    }
}

/// Pure computation of [`SpatialContext`]s.
pub struct SpatialReconciler;

impl SpatialReconciler {
    /// Intersect the coverage with the requested grid.
    ///
    /// With `accurate_resolution` the output grid is anchored on the computed
    /// box and its pixel size recomputed from it, rather than snapped to the
    /// requested grid.
    pub fn reconcile(
        coverage: &CoverageDescriptor,
        requested: &GridGeometry,
        accurate_resolution: bool,
    ) -> Result<SpatialContext> {
        if requested.width == 0 || requested.height == 0 {
            return Err(MosaicError::invalid_request(
                "grid_geometry",
                format!("pixel dimensions must be positive, got {}x{}", requested.width, requested.height),
            ));
        }

        let needs_reprojection = requested.crs != coverage.crs;
        let extent = transform_bbox(coverage.crs, requested.crs, &coverage.extent, DEFAULT_DENSIFY)?;

        let Some(computed_bbox) = extent.intersection(&requested.bbox) else {
            return Ok(SpatialContext::empty(requested.crs, needs_reprojection));
        };

        let g2w = requested.grid_to_world();
        let w2g = g2w.inverse().ok_or_else(|| {
            MosaicError::invalid_request("grid_geometry", format!("degenerate bbox {:?}", requested.bbox))
        })?;

        let full = PixelRect::sized(requested.width, requested.height);
        let Some(raster_area) = PixelRect::rounded(&w2g.transform_bbox(&computed_bbox)).intersection(&full) else {
            return Ok(SpatialContext::empty(requested.crs, needs_reprojection));
        };

        let (grid_to_world, resolution) = if accurate_resolution {
            let res = (
                computed_bbox.width() / raster_area.width as f64,
                computed_bbox.height() / raster_area.height as f64,
            );
            (
                AffineTransform::north_up(computed_bbox.min_x, computed_bbox.max_y, res.0, res.1),
                res,
            )
        } else {
            (
                g2w.translated(raster_area.x, raster_area.y),
                g2w.resolution(),
            )
        };

        Ok(SpatialContext {
            crs: requested.crs,
            computed_bbox,
            raster_area,
            grid_to_world,
            resolution,
            needs_reprojection,
            is_empty: false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn coverage() -> CoverageDescriptor {
        CoverageDescriptor {
            name: "test".into(),
            crs: CrsCode::Epsg4326,
            extent: BoundingBox::new(0.0, 0.0, 100.0, 50.0),
            native_resolution: (0.5, 0.5),
        }
    }

    #[test]
    fn test_full_extent_request() {
        let cov = coverage();
        let grid = cov.native_grid();
        assert_eq!((grid.width, grid.height), (200, 100));
        let ctx = SpatialReconciler::reconcile(&cov, &grid, false).unwrap();
        assert!(!ctx.is_empty);
        assert!(!ctx.needs_reprojection);
        assert_eq!(ctx.raster_area, PixelRect::sized(200, 100));
        assert_eq!(ctx.computed_bbox, cov.extent);
        assert_eq!(ctx.resolution, (0.5, 0.5));
        assert_eq!(ctx.output_bbox(), cov.extent);
    }

    #[test]
    fn test_partial_overlap_clips_area() {
        let cov = coverage();
        let grid = GridGeometry::new(CrsCode::Epsg4326, BoundingBox::new(50.0, 25.0, 150.0, 75.0), 100, 50);
        let ctx = SpatialReconciler::reconcile(&cov, &grid, false).unwrap();
        assert_eq!(ctx.computed_bbox, BoundingBox::new(50.0, 25.0, 100.0, 50.0));
        // Right half of columns, bottom half of rows.
        assert_eq!(ctx.raster_area, PixelRect::new(0, 25, 50, 25));
        assert_eq!(ctx.grid_to_world.apply(0.0, 0.0), (50.0, 50.0));
    }

    #[test]
    fn test_disjoint_request_is_empty() {
        let cov = coverage();
        let grid = GridGeometry::new(CrsCode::Epsg4326, BoundingBox::new(120.0, 0.0, 130.0, 10.0), 10, 10);
        let ctx = SpatialReconciler::reconcile(&cov, &grid, false).unwrap();
        assert!(ctx.is_empty);
    }

    #[test]
    fn test_reconcile_is_idempotent() {
        let cov = coverage();
        let grid = GridGeometry::new(CrsCode::Epsg3857, BoundingBox::new(0.0, 0.0, 5_000_000.0, 5_000_000.0), 256, 256);
        let a = SpatialReconciler::reconcile(&cov, &grid, false).unwrap();
        let b = SpatialReconciler::reconcile(&cov, &grid, false).unwrap();
        assert_eq!(a, b);
        assert!(a.needs_reprojection);
        assert!(!a.is_empty);
    }

    #[test]
    fn test_reprojection_flag_for_equivalent_crs() {
        let cov = coverage();
        let grid = GridGeometry::new(CrsCode::Epsg4269, cov.extent, 200, 100);
        let ctx = SpatialReconciler::reconcile(&cov, &grid, false).unwrap();
        assert!(ctx.needs_reprojection);
        assert_eq!(ctx.computed_bbox, cov.extent);
    }

    #[test]
    fn test_accurate_resolution_anchors_on_computed_box() {
        let cov = coverage();
        let grid = GridGeometry::new(CrsCode::Epsg4326, BoundingBox::new(-0.3, 0.0, 9.7, 10.0), 10, 10);
        let snapped = SpatialReconciler::reconcile(&cov, &grid, false).unwrap();
        let accurate = SpatialReconciler::reconcile(&cov, &grid, true).unwrap();
        assert_eq!(snapped.raster_area, accurate.raster_area);
        assert_eq!(snapped.raster_area, PixelRect::new(0, 0, 10, 10));
        assert!((snapped.grid_to_world.translate_x + 0.3).abs() < 1e-12);
        assert_eq!(accurate.grid_to_world.translate_x, 0.0);
        assert!((accurate.resolution.0 - 0.97).abs() < 1e-12);
    }

    #[test]
    fn test_zero_dimension_is_invalid() {
        let cov = coverage();
        let grid = GridGeometry::new(CrsCode::Epsg4326, cov.extent, 0, 10);
        assert!(matches!(
            SpatialReconciler::reconcile(&cov, &grid, false),
            Err(MosaicError::InvalidRequest { .. })
        ));
    }
}
