//! Decodes one granule onto a working grid and applies its footprint.

use std::sync::Arc;
use tracing::{debug, trace};

use mosaic_common::{AffineTransform, BoundingBox, CrsCode, PixelRect};
use projection::{is_identity, transform_bbox, DEFAULT_DENSIFY};

use crate::decoder::DecoderRegistry;
use crate::error::{MosaicError, Result};
use crate::footprint::FootprintProvider;
use crate::granule::{GranuleId, GranuleRecord};
use crate::overview::ReadPlan;
use crate::resample::sample_pixel;
use crate::spatial::SpatialContext;
use crate::types::{BandStatistics, FootprintBehavior, InterpolationMethod, Raster};

/// A pixel grid that tiles are decoded onto and composed in.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WorkingGrid {
    pub crs: CrsCode,
    pub bbox: BoundingBox,
    pub width: usize,
    pub height: usize,
    pub grid_to_world: AffineTransform,
}

impl WorkingGrid {
    pub fn new(crs: CrsCode, bbox: BoundingBox, width: usize, height: usize) -> Self {
        Self {
            crs,
            bbox,
            width,
            height,
            grid_to_world: AffineTransform::from_bbox(&bbox, width, height),
        }
    }

    /// The output raster area of a request, grown by `padding` pixels per side.
    pub fn from_context(ctx: &SpatialContext, padding: usize) -> Self {
        let p = padding as i64;
        let grid_to_world = ctx.grid_to_world.translated(-p, -p);
        let width = ctx.raster_area.width + 2 * padding;
        let height = ctx.raster_area.height + 2 * padding;
        Self {
            crs: ctx.crs,
            bbox: grid_to_world.transform_bbox(&PixelRect::sized(width, height).as_bbox()),
            width,
            height,
            grid_to_world,
        }
    }

    /// A grid of the same pixel dimensions over this grid's envelope
    /// expressed in `crs`.
    pub fn in_crs(&self, crs: CrsCode) -> Result<WorkingGrid> {
        if is_identity(self.crs, crs) {
            return Ok(WorkingGrid { crs, ..*self });
        }
        let bbox = transform_bbox(self.crs, crs, &self.bbox, DEFAULT_DENSIFY)?;
        Ok(WorkingGrid::new(crs, bbox, self.width, self.height))
    }

    pub fn resolution(&self) -> (f64, f64) {
        self.grid_to_world.resolution()
    }

    pub fn pixel_count(&self) -> usize {
        self.width * self.height
    }

    pub fn rect(&self) -> PixelRect {
        PixelRect::sized(self.width, self.height)
    }
}

/// Per-request knobs the loader needs.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct LoadOptions {
    pub footprint_behavior: FootprintBehavior,
    /// Band indices to keep, in order.
    pub bands: Option<Vec<usize>>,
    pub interpolation: InterpolationMethod,
}

/// One granule decoded onto a working grid.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedTile {
    pub source: GranuleId,
    pub crs: CrsCode,
    /// Placement in the working grid.
    pub window: PixelRect,
    /// Window-sized pixels; alpha is always present.
    pub raster: Raster,
    /// Window-sized footprint mask, when footprints are in use.
    pub roi_mask: Option<Vec<bool>>,
    /// Window-sized pixels this tile hides from lower-priority tiles.
    pub coverage: Vec<bool>,
    pub statistics: Option<Vec<BandStatistics>>,
}

impl DecodedTile {
    pub fn covers_anything(&self) -> bool {
        self.coverage.iter().any(|c| *c)
    }
}

/// Reads granules through the decoder registry and masks them with their
/// footprints.
pub struct GranuleLoader {
    decoders: DecoderRegistry,
    footprints: Arc<dyn FootprintProvider>,
}

impl GranuleLoader {
    pub fn new(decoders: DecoderRegistry, footprints: Arc<dyn FootprintProvider>) -> Self {
        Self { decoders, footprints }
    }

    /// Decode the part of `granule` that falls on `grid`.
    ///
    /// Returns `Ok(None)` when the granule contributes no pixel. Decode
    /// failures become [`MosaicError::GranuleUnavailable`].
    pub async fn load(
        &self,
        granule: &GranuleRecord,
        plan: &ReadPlan,
        grid: &WorkingGrid,
        options: &LoadOptions,
    ) -> Result<Option<DecodedTile>> {
        if !is_identity(granule.crs, grid.crs) {
            return Err(MosaicError::ReprojectionFailure {
                from: granule.crs,
                to: grid.crs,
                message: format!("granule '{}' is not on the working grid CRS", granule.id),
            });
        }

        let Some(overlap) = granule.bbox.intersection(&grid.bbox) else {
            return Ok(None);
        };

        let roi = match options.footprint_behavior {
            FootprintBehavior::None => None,
            _ => self.footprints.roi(granule)?,
        };
        if let Some(roi) = &roi {
            if !roi.bbox().map_or(false, |b| b.intersects(&overlap)) {
                trace!(granule = %granule.id, "Footprint outside request");
                return Ok(None);
            }
        }

        let level_index = plan.level.min(granule.levels.len().saturating_sub(1));
        let level = granule
            .levels
            .get(level_index)
            .ok_or_else(|| MosaicError::granule_unavailable(granule.id.as_str(), "no pyramid levels"))?;
        let level_w2g = level
            .grid_to_world
            .inverse()
            .ok_or_else(|| MosaicError::granule_unavailable(granule.id.as_str(), "singular grid-to-world"))?;
        let Some(region) = PixelRect::enclosing(&level_w2g.transform_bbox(&overlap))
            .intersection(&plan.source_region)
        else {
            return Ok(None);
        };
        let plan = plan.with_region(region);

        let grid_w2g = grid
            .grid_to_world
            .inverse()
            .ok_or_else(|| MosaicError::invalid_request("grid_geometry", "singular working grid"))?;
        let Some(window) = PixelRect::enclosing(&grid_w2g.transform_bbox(&overlap)).intersection(&grid.rect()) else {
            return Ok(None);
        };

        let decoder = self.decoders.for_granule(granule);
        let mut raster = decoder
            .decode_region(&granule.location, level_index, plan.subsampling, region)
            .await
            .map_err(|e| MosaicError::granule_unavailable(granule.id.as_str(), e.to_string()))?;

        let mut statistics = granule.statistics.clone();
        if let Some(indices) = &options.bands {
            raster = raster.select_bands(indices).ok_or_else(|| {
                MosaicError::invalid_request(
                    "BANDS",
                    format!(
                        "band selection {:?} out of range for granule '{}' with {} bands",
                        indices,
                        granule.id,
                        raster.num_bands()
                    ),
                )
            })?;
            statistics = statistics.and_then(|s| indices.iter().map(|&i| s.get(i).copied()).collect());
        }

        let (ss_x, ss_y) = plan.subsampling;
        let decoded_w2g = level
            .grid_to_world
            .translated(region.x, region.y)
            .scaled(ss_x.max(1) as f64, ss_y.max(1) as f64)
            .inverse()
            .ok_or_else(|| MosaicError::granule_unavailable(granule.id.as_str(), "singular decoded grid"))?;

        let num_bands = raster.num_bands();
        let mut bands = vec![vec![0.0f32; window.area()]; num_bands];
        let mut alpha = vec![0.0f32; window.area()];
        let mut coverage = vec![false; window.area()];
        let mut roi_mask = roi.as_ref().map(|_| vec![false; window.area()]);
        let mut pixel = vec![0.0f32; num_bands];

        for row in 0..window.height {
            for col in 0..window.width {
                let idx = row * window.width + col;
                let (x, y) = grid
                    .grid_to_world
                    .pixel_center(window.x + col as i64, window.y + row as i64);
                if !granule.bbox.contains_point(x, y) {
                    continue;
                }
                let (u, v) = decoded_w2g.apply(x, y);
                let Some(a) = sample_pixel(options.interpolation, &raster, u, v, &mut pixel) else {
                    continue;
                };
                if pixel.iter().any(|p| p.is_nan()) {
                    continue;
                }
                for (b, value) in pixel.iter().enumerate() {
                    bands[b][idx] = *value;
                }

                let inside = roi.as_ref().map_or(true, |r| r.contains(x, y));
                if let Some(mask) = roi_mask.as_mut() {
                    mask[idx] = inside;
                }
                if inside {
                    alpha[idx] = a;
                }
                coverage[idx] = match options.footprint_behavior {
                    FootprintBehavior::Cut => inside && a > 0.0,
                    FootprintBehavior::None | FootprintBehavior::Transparent => true,
                };
            }
        }

        let tile = DecodedTile {
            source: granule.id.clone(),
            crs: granule.crs,
            window,
            raster: Raster::new(window.width, window.height, bands).with_alpha(alpha),
            roi_mask,
            coverage,
            statistics,
        };

        if !tile.covers_anything() {
            trace!(granule = %granule.id, "No valid pixels on working grid");
            return Ok(None);
        }

        debug!(
            granule = %granule.id,
            level = level_index,
            ss_x,
            ss_y,
            window = ?tile.window,
            "Decoded granule"
        );
        Ok(Some(tile))
    }
}
