//! Composition of one CRS group's tiles into a sub-mosaic.
//!
//! Tiles arrive in catalog sort order. The first tile has the highest
//! priority: it survives excess granule removal unconditionally and ends
//! up on top of the overlay.

use tracing::{debug, trace};

use mosaic_common::{CrsCode, PixelRect};

use crate::error::{MosaicError, Result};
use crate::granule::GranuleId;
use crate::loader::{DecodedTile, WorkingGrid};
use crate::types::{background_value, merge_statistics, BandStatistics, MergeBehavior, Raster};

/// Per-request composition settings.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct CompositionSettings {
    pub merge: MergeBehavior,
    /// Blend overlapping pixels instead of replacing them.
    pub fading: bool,
    pub background: Vec<f64>,
    /// Input pixels of this color become transparent before compositing.
    pub input_transparent_color: Option<Vec<f64>>,
    /// Drop tiles whose coverage is already hidden by earlier tiles.
    pub excess_granule_removal: bool,
}

/// Composite raster of one CRS group.
#[derive(Debug, Clone, PartialEq)]
pub struct Submosaic {
    pub crs: CrsCode,
    pub grid: WorkingGrid,
    /// Grid-sized, alpha always present.
    pub raster: Raster,
    /// Contributing granules in sort order.
    pub sources: Vec<GranuleId>,
    pub statistics: Option<Vec<BandStatistics>>,
    /// Granules dropped by excess granule removal.
    pub removed: Vec<GranuleId>,
}

pub struct SubmosaicComposer {
    settings: CompositionSettings,
}

impl SubmosaicComposer {
    pub fn new(settings: CompositionSettings) -> Self {
        Self { settings }
    }

    /// Compose `tiles` onto `grid`. Returns `None` when no tile survives.
    ///
    /// Tiles are consumed and released as they are drawn.
    pub fn compose(&self, tiles: Vec<DecodedTile>, grid: &WorkingGrid) -> Result<Option<Submosaic>> {
        let (mut survivors, removed) = if self.settings.excess_granule_removal {
            remove_excess(tiles, grid)
        } else {
            (tiles, Vec::new())
        };
        if survivors.is_empty() {
            return Ok(None);
        }

        if let Some(color) = &self.settings.input_transparent_color {
            for tile in survivors.iter_mut() {
                mask_color(&mut tile.raster, color);
            }
        }

        let sources: Vec<GranuleId> = survivors.iter().map(|t| t.source.clone()).collect();
        let statistics = if survivors.iter().all(|t| t.statistics.is_some()) {
            merge_statistics(survivors.iter().filter_map(|t| t.statistics.as_deref()))
        } else {
            None
        };

        let mut raster = match self.settings.merge {
            MergeBehavior::Normal => self.overlay_tiles(survivors, grid)?,
            MergeBehavior::Stack => self.stack_tiles(survivors, grid)?,
        };
        fill_background(&mut raster, &self.settings.background);

        debug!(
            crs = %grid.crs,
            merge = %self.settings.merge,
            tiles = sources.len(),
            removed = removed.len(),
            "Composed sub-mosaic"
        );

        Ok(Some(Submosaic {
            crs: grid.crs,
            grid: *grid,
            raster,
            sources,
            statistics,
            removed,
        }))
    }

    fn overlay_tiles(&self, tiles: Vec<DecodedTile>, grid: &WorkingGrid) -> Result<Raster> {
        let expected = tiles.first().map(|t| t.raster.num_bands()).unwrap_or(0);
        if let Some(odd) = tiles.iter().find(|t| t.raster.num_bands() != expected) {
            return Err(MosaicError::IncompatibleBands {
                group: grid.crs.to_string(),
                expected,
                found: odd.raster.num_bands(),
            });
        }

        let mut out = Raster::filled(grid.width, grid.height, expected, &self.settings.background)
            .with_alpha(vec![0.0; grid.pixel_count()]);
        // Lowest priority first so the first-sorted tile lands on top.
        for tile in tiles.into_iter().rev() {
            overlay(&mut out, &tile.raster, tile.window, self.settings.fading);
            trace!(granule = %tile.source, "Overlaid tile");
        }
        Ok(out)
    }

    fn stack_tiles(&self, tiles: Vec<DecodedTile>, grid: &WorkingGrid) -> Result<Raster> {
        let Some(first) = tiles.first() else {
            return Ok(Raster::filled(grid.width, grid.height, 0, &self.settings.background));
        };
        let window = first.window;
        if let Some(odd) = tiles.iter().find(|t| t.window != window) {
            return Err(MosaicError::incompatible_stack(
                grid.crs,
                format!(
                    "granule '{}' covers {:?} but '{}' covers {:?}",
                    odd.source, odd.window, first.source, window
                ),
            ));
        }

        let total_bands: usize = tiles.iter().map(|t| t.raster.num_bands()).sum();
        let mut out = Raster::filled(grid.width, grid.height, total_bands, &self.settings.background);
        let mut alpha = vec![0.0f32; grid.pixel_count()];
        let mut placed = vec![false; grid.pixel_count()];
        let mut band_offset = 0;

        for tile in tiles {
            for_each_placed(&tile.raster, window, grid.width, grid.height, |src, dst| {
                for (b, band) in tile.raster.bands.iter().enumerate() {
                    out.bands[band_offset + b][dst] = band[src];
                }
                // A stacked pixel is only as opaque as its least opaque layer.
                let a = tile.raster.alpha_at(src);
                alpha[dst] = if placed[dst] { alpha[dst].min(a) } else { a };
                placed[dst] = true;
            });
            band_offset += tile.raster.num_bands();
        }
        Ok(out.with_alpha(alpha))
    }
}

/// Walk tiles in priority order and drop each whose coverage is already
/// fully covered by the tiles kept before it.
fn remove_excess(tiles: Vec<DecodedTile>, grid: &WorkingGrid) -> (Vec<DecodedTile>, Vec<GranuleId>) {
    let mut covered = vec![false; grid.pixel_count()];
    let mut survivors = Vec::with_capacity(tiles.len());
    let mut removed = Vec::new();

    for tile in tiles {
        let mut hidden = true;
        for_each_placed(&tile.raster, tile.window, grid.width, grid.height, |src, dst| {
            if tile.coverage[src] && !covered[dst] {
                hidden = false;
            }
        });
        if hidden && !survivors.is_empty() {
            debug!(granule = %tile.source, "Excess granule removed");
            removed.push(tile.source);
            continue;
        }
        for_each_placed(&tile.raster, tile.window, grid.width, grid.height, |src, dst| {
            if tile.coverage[src] {
                covered[dst] = true;
            }
        });
        survivors.push(tile);
    }
    (survivors, removed)
}

pub(crate) fn mask_color(raster: &mut Raster, color: &[f64]) {
    let n = raster.pixel_count();
    let mut alpha = raster.alpha.take().unwrap_or_else(|| vec![1.0; n]);
    for (idx, a) in alpha.iter_mut().enumerate() {
        if raster.matches_color(idx, color) {
            *a = 0.0;
        }
    }
    raster.alpha = Some(alpha);
}

pub(crate) fn fill_background(raster: &mut Raster, background: &[f64]) {
    let Some(alpha) = raster.alpha.as_ref() else {
        return;
    };
    for (b, band) in raster.bands.iter_mut().enumerate() {
        let bg = background_value(background, b);
        for (value, a) in band.iter_mut().zip(alpha) {
            if *a <= 0.0 {
                *value = bg;
            }
        }
    }
}

/// Call `f(src_index, dst_index)` for every pixel of `src` placed at
/// `window` that lands inside a `width` x `height` destination.
fn for_each_placed<F>(src: &Raster, window: PixelRect, width: usize, height: usize, mut f: F)
where
    F: FnMut(usize, usize),
{
    let Some(visible) = window.intersection(&PixelRect::sized(width, height)) else {
        return;
    };
    for row in visible.y..visible.max_y() {
        for col in visible.x..visible.max_x() {
            let src_idx = src.index((col - window.x) as usize, (row - window.y) as usize);
            let dst_idx = row as usize * width + col as usize;
            f(src_idx, dst_idx);
        }
    }
}

/// Draw `src`, placed at `window`, over `dst`.
///
/// Without fading this is the usual "over" operator, so opaque source pixels
/// replace what is below. With fading, overlapping pixels are averaged by
/// weight. `dst` must carry alpha.
pub fn overlay(dst: &mut Raster, src: &Raster, window: PixelRect, fading: bool) {
    let (width, height) = (dst.width, dst.height);
    let Some(dst_alpha) = dst.alpha.as_mut() else {
        return;
    };
    let bands = &mut dst.bands;
    for_each_placed(src, window, width, height, |s, d| {
        let a = src.alpha_at(s);
        if a <= 0.0 {
            return;
        }
        let da = dst_alpha[d];
        let (src_weight, dst_weight, out_alpha) = if da <= 0.0 {
            (1.0, 0.0, a)
        } else if fading {
            let total = a + da;
            (a / total, da / total, a.max(da))
        } else {
            let out = a + da * (1.0 - a);
            (a / out, da * (1.0 - a) / out, out)
        };
        for (band, src_band) in bands.iter_mut().zip(&src.bands) {
            band[d] = src_band[s] * src_weight + band[d] * dst_weight;
        }
        dst_alpha[d] = out_alpha;
    });
}
