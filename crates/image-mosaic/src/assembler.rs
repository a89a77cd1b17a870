//! Top-level read pipeline.
//!
//! normalize -> reconcile -> select -> group -> (plan, load) per granule ->
//! compose per group -> reproject -> final overlay -> mask, crop, finalize.

use metrics::{counter, histogram};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, Semaphore};
use tracing::{debug, instrument, warn};

use mosaic_common::{AffineTransform, BoundingBox, CrsCode, PixelRect};
use projection::{is_identity, transform_bbox, DEFAULT_DENSIFY};

use crate::acceptor::{AcceptorRegistry, GranuleAcceptor};
use crate::catalog::GranuleCatalog;
use crate::composer::{fill_background, mask_color, overlay, Submosaic, SubmosaicComposer};
use crate::config::MosaicConfig;
use crate::decoder::DecoderRegistry;
use crate::error::{MosaicError, Result};
use crate::footprint::{FootprintProvider, SidecarFootprintProvider};
use crate::granule::{GranuleId, GranuleRecord};
use crate::loader::{DecodedTile, GranuleLoader, LoadOptions, WorkingGrid};
use crate::overview::{resolve, ReadPlan};
use crate::request::{MosaicRequest, ReadParams, RequestNormalizer};
use crate::resample::reproject;
use crate::selector::GranuleSelector;
use crate::spatial::{CoverageDescriptor, SpatialContext, SpatialReconciler};
use crate::types::{merge_statistics, BandStatistics, FootprintBehavior, Raster};

/// Why a read produced no coverage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EmptyReason {
    /// The request does not overlap the coverage extent.
    NoIntersection,
    /// No granule matched the spatial and attribute filters.
    NoGranulesSelected,
    /// Every selected granule was skipped, masked out or removed.
    NoSurvivingTiles,
}

impl EmptyReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            EmptyReason::NoIntersection => "no_intersection",
            EmptyReason::NoGranulesSelected => "no_granules_selected",
            EmptyReason::NoSurvivingTiles => "no_surviving_tiles",
        }
    }
}

/// The assembled output raster and its provenance.
#[derive(Debug, Clone, PartialEq)]
pub struct OutputCoverage {
    /// Alpha is present when footprints are transparent or an output
    /// transparent color was requested.
    pub raster: Raster,
    pub crs: CrsCode,
    pub grid_to_world: AffineTransform,
    pub bbox: BoundingBox,
    /// Contributing granules, highest priority first.
    pub sources: Vec<GranuleId>,
    /// `sources` joined with commas.
    pub provenance: String,
    pub statistics: Option<Vec<BandStatistics>>,
    pub skipped_granules: usize,
    pub removed_granules: usize,
    pub needs_reprojection: bool,
}

/// Result of a read.
#[derive(Debug, Clone, PartialEq)]
pub enum MosaicOutcome {
    Coverage(OutputCoverage),
    Empty(EmptyReason),
}

impl MosaicOutcome {
    pub fn is_empty(&self) -> bool {
        matches!(self, MosaicOutcome::Empty(_))
    }

    pub fn coverage(&self) -> Option<&OutputCoverage> {
        match self {
            MosaicOutcome::Coverage(c) => Some(c),
            MosaicOutcome::Empty(_) => None,
        }
    }

    pub fn into_coverage(self) -> Option<OutputCoverage> {
        match self {
            MosaicOutcome::Coverage(c) => Some(c),
            MosaicOutcome::Empty(_) => None,
        }
    }
}

/// Granules of one composition group, in sort order.
struct Group {
    crs: CrsCode,
    granules: Vec<Arc<GranuleRecord>>,
}

struct LoadJob {
    granule: Arc<GranuleRecord>,
    plan: ReadPlan,
}

/// Assembles mosaics from a catalog of granules.
pub struct MosaicAssembler {
    config: MosaicConfig,
    coverage: CoverageDescriptor,
    catalog: Arc<dyn GranuleCatalog>,
    loader: Arc<GranuleLoader>,
    decoders: DecoderRegistry,
    acceptor: Arc<dyn GranuleAcceptor>,
}

impl MosaicAssembler {
    /// Create an assembler with the built-in acceptors and sidecar footprints.
    pub async fn new(
        config: MosaicConfig,
        catalog: Arc<dyn GranuleCatalog>,
        decoders: DecoderRegistry,
    ) -> Result<Self> {
        Self::with_registry(config, catalog, decoders, &AcceptorRegistry::with_builtins()).await
    }

    /// Create an assembler resolving the configured acceptor in `acceptors`.
    ///
    /// Missing extent or native resolution in the configuration are derived
    /// from the catalog.
    pub async fn with_registry(
        config: MosaicConfig,
        catalog: Arc<dyn GranuleCatalog>,
        decoders: DecoderRegistry,
        acceptors: &AcceptorRegistry,
    ) -> Result<Self> {
        config.validate_with(acceptors).map_err(MosaicError::Config)?;
        let acceptor_name = config.acceptor_name();
        let acceptor = acceptors
            .get(&acceptor_name)
            .ok_or_else(|| MosaicError::Config(format!("unknown granule acceptor '{acceptor_name}'")))?;

        let coverage = derive_coverage(&config, catalog.as_ref()).await?;
        let footprints: Arc<dyn FootprintProvider> = Arc::new(SidecarFootprintProvider::new(
            config.footprint_inset,
            config.footprint_inset_margin,
            config.footprint_cache_entries,
        ));

        debug!(
            coverage = %coverage.name,
            crs = %coverage.crs,
            extent = %coverage.extent.cache_key(),
            acceptor = acceptor.name(),
            "Mosaic assembler ready"
        );

        Ok(Self {
            loader: Arc::new(GranuleLoader::new(decoders.clone(), footprints)),
            config,
            coverage,
            catalog,
            decoders,
            acceptor,
        })
    }

    /// Replace the footprint provider.
    pub fn with_footprints(mut self, footprints: Arc<dyn FootprintProvider>) -> Self {
        self.loader = Arc::new(GranuleLoader::new(self.decoders.clone(), footprints));
        self
    }

    pub fn coverage(&self) -> &CoverageDescriptor {
        &self.coverage
    }

    pub fn config(&self) -> &MosaicConfig {
        &self.config
    }

    /// Assemble the mosaic for one read.
    #[instrument(skip(self, params), fields(coverage = %self.coverage.name))]
    pub async fn read(&self, params: ReadParams) -> Result<MosaicOutcome> {
        let started = Instant::now();
        counter!("mosaic_requests_total").increment(1);

        let schema = self.catalog.schema();
        let request = RequestNormalizer::new(&self.coverage, &schema, &self.config).normalize(&params)?;
        let outcome = self.assemble(&request).await;

        histogram!("mosaic_assembly_duration_seconds").record(started.elapsed().as_secs_f64());
        if let Ok(MosaicOutcome::Empty(reason)) = &outcome {
            counter!("mosaic_empty_results_total", "reason" => reason.as_str()).increment(1);
            debug!(reason = reason.as_str(), "Empty result");
        }
        outcome
    }

    /// Number of granules a read would select, without decoding anything.
    pub async fn count_granules(&self, params: ReadParams) -> Result<usize> {
        let schema = self.catalog.schema();
        let request = RequestNormalizer::new(&self.coverage, &schema, &self.config).normalize(&params)?;
        let ctx = SpatialReconciler::reconcile(&self.coverage, &request.grid, request.accurate_resolution)?;
        if ctx.is_empty {
            return Ok(0);
        }
        let granules = GranuleSelector::new(self.catalog.as_ref()).select(&request, &ctx).await?;
        Ok(granules.len())
    }

    async fn assemble(&self, request: &MosaicRequest) -> Result<MosaicOutcome> {
        let ctx = SpatialReconciler::reconcile(&self.coverage, &request.grid, request.accurate_resolution)?;
        if ctx.is_empty {
            return Ok(MosaicOutcome::Empty(EmptyReason::NoIntersection));
        }
        debug!(
            raster_area = ?ctx.raster_area,
            needs_reprojection = ctx.needs_reprojection,
            "Reconciled request grid"
        );

        let granules = GranuleSelector::new(self.catalog.as_ref()).select(request, &ctx).await?;
        if granules.is_empty() {
            return Ok(MosaicOutcome::Empty(EmptyReason::NoGranulesSelected));
        }

        let mut skipped = 0usize;
        let groups = self.group(granules, &mut skipped);

        let padding = request.interpolation.kernel_padding();
        let work = WorkingGrid::from_context(&ctx, padding);
        let options = request.load_options();
        let composer = SubmosaicComposer::new(request.composition_settings());

        let mut submosaics = Vec::with_capacity(groups.len());
        for group in groups {
            let grid = work.in_crs(group.crs)?;
            let jobs: Vec<LoadJob> = group
                .granules
                .into_iter()
                .map(|granule| LoadJob {
                    plan: resolve(
                        grid.resolution(),
                        &granule.levels,
                        request.overview_policy,
                        request.decimation_policy,
                    ),
                    granule,
                })
                .collect();

            let results = if request.multithreading && jobs.len() > 1 {
                self.load_parallel(jobs, grid, &options).await
            } else {
                self.load_sequential(jobs, grid, &options).await
            };

            let mut tiles: Vec<DecodedTile> = Vec::with_capacity(results.len());
            for (id, result) in results {
                match result {
                    Ok(Some(tile)) => tiles.push(tile),
                    Ok(None) => {}
                    Err(e) if e.is_recoverable() => {
                        warn!(granule = %id, error = %e, "Skipping granule");
                        counter!("mosaic_granules_skipped_total").increment(1);
                        skipped += 1;
                    }
                    Err(e) => return Err(e),
                }
            }
            counter!("mosaic_granules_loaded_total").increment(tiles.len() as u64);
            debug!(crs = %group.crs, tiles = tiles.len(), "Loaded group");

            if let Some(sub) = composer.compose(tiles, &grid)? {
                submosaics.push(sub);
            }
        }

        let removed: usize = submosaics.iter().map(|s| s.removed.len()).sum();
        counter!("mosaic_granules_removed_total").increment(removed as u64);

        if submosaics.is_empty() {
            return Ok(MosaicOutcome::Empty(EmptyReason::NoSurvivingTiles));
        }

        let coverage = self.finalize(request, &ctx, &work, submosaics, skipped, removed)?;
        Ok(MosaicOutcome::Coverage(coverage))
    }

    /// Split selected granules into composition groups, keeping sort order
    /// within each group and ordering groups by their first granule.
    fn group(&self, granules: Vec<Arc<GranuleRecord>>, skipped: &mut usize) -> Vec<Group> {
        let mut groups: Vec<Group> = Vec::new();
        for granule in granules {
            if !self.acceptor.accepts(&granule, &self.coverage) {
                warn!(
                    granule = %granule.id,
                    crs = %granule.crs,
                    acceptor = self.acceptor.name(),
                    "Granule not accepted"
                );
                counter!("mosaic_granules_skipped_total").increment(1);
                *skipped += 1;
                continue;
            }
            let key = self.acceptor.group_key(&granule, &self.coverage);
            match groups.iter_mut().find(|g| g.crs == key) {
                Some(group) => group.granules.push(granule),
                None => groups.push(Group {
                    crs: key,
                    granules: vec![granule],
                }),
            }
        }
        groups
    }

    async fn load_sequential(
        &self,
        jobs: Vec<LoadJob>,
        grid: WorkingGrid,
        options: &LoadOptions,
    ) -> Vec<(GranuleId, Result<Option<DecodedTile>>)> {
        let mut results = Vec::with_capacity(jobs.len());
        for job in jobs {
            let result = self.loader.load(&job.granule, &job.plan, &grid, options).await;
            results.push((job.granule.id.clone(), result));
        }
        results
    }

    /// Decode on the tokio pool, at most `max_decode_tasks` at a time.
    ///
    /// Results come back in completion order and are put back in job order
    /// before returning. A task that dies without reporting (a panicking
    /// decoder) turns into a `GranuleUnavailable` for its granule. Dropping
    /// the returned future leaves the spawned tasks to run to completion.
    async fn load_parallel(
        &self,
        jobs: Vec<LoadJob>,
        grid: WorkingGrid,
        options: &LoadOptions,
    ) -> Vec<(GranuleId, Result<Option<DecodedTile>>)> {
        let semaphore = Arc::new(Semaphore::new(self.config.max_decode_tasks));
        let (tx, mut rx) = mpsc::channel(jobs.len().max(1));
        let ids: Vec<GranuleId> = jobs.iter().map(|j| j.granule.id.clone()).collect();

        let mut handles = Vec::with_capacity(jobs.len());
        for (index, job) in jobs.into_iter().enumerate() {
            let tx = tx.clone();
            let loader = self.loader.clone();
            let semaphore = semaphore.clone();
            let options = options.clone();
            handles.push(tokio::spawn(async move {
                let result = match semaphore.acquire_owned().await {
                    Ok(_permit) => loader.load(&job.granule, &job.plan, &grid, &options).await,
                    Err(_) => Err(MosaicError::granule_unavailable(job.granule.id.as_str(), "decode pool closed")),
                };
                // Fails only when the read was abandoned; the tile is dropped.
                let _ = tx.send((index, result)).await;
            }));
        }
        drop(tx);

        let mut slots: Vec<Option<Result<Option<DecodedTile>>>> = (0..ids.len()).map(|_| None).collect();
        while let Some((index, result)) = rx.recv().await {
            slots[index] = Some(result);
        }

        let mut results = Vec::with_capacity(ids.len());
        for ((id, slot), handle) in ids.into_iter().zip(slots).zip(handles) {
            let result = match slot {
                Some(result) => result,
                None => {
                    let reason = match handle.await {
                        Err(e) if e.is_panic() => "decode task panicked".to_string(),
                        Err(e) => format!("decode task failed: {e}"),
                        Ok(()) => "decode task ended without a result".to_string(),
                    };
                    warn!(granule = %id, reason = %reason, "Decode task lost");
                    Err(MosaicError::granule_unavailable(id.as_str(), reason))
                }
            };
            results.push((id, result));
        }
        results
    }

    /// Bring sub-mosaics onto the output grid, overlay them and apply the
    /// output masks.
    fn finalize(
        &self,
        request: &MosaicRequest,
        ctx: &SpatialContext,
        work: &WorkingGrid,
        submosaics: Vec<Submosaic>,
        skipped: usize,
        removed: usize,
    ) -> Result<OutputCoverage> {
        let background = &request.background;
        let sources: Vec<GranuleId> = submosaics.iter().flat_map(|s| s.sources.iter().cloned()).collect();
        let statistics = if submosaics.iter().all(|s| s.statistics.is_some()) {
            merge_statistics(submosaics.iter().filter_map(|s| s.statistics.as_deref()))
        } else {
            None
        };

        let mut rasters = Vec::with_capacity(submosaics.len());
        for sub in submosaics {
            if is_identity(sub.crs, work.crs) {
                rasters.push(sub.raster);
            } else {
                debug!(from = %sub.crs, to = %work.crs, "Reprojecting sub-mosaic");
                rasters.push(reproject(&sub.raster, &sub.grid, work, request.interpolation, background)?);
            }
        }

        let mut raster = if rasters.len() == 1 {
            rasters.remove(0)
        } else {
            let bands = rasters[0].num_bands();
            if let Some(odd) = rasters.iter().find(|r| r.num_bands() != bands) {
                return Err(MosaicError::IncompatibleBands {
                    group: work.crs.to_string(),
                    expected: bands,
                    found: odd.num_bands(),
                });
            }
            let mut out = Raster::filled(work.width, work.height, bands, background)
                .with_alpha(vec![0.0; work.pixel_count()]);
            for sub in rasters.iter().rev() {
                overlay(&mut out, sub, work.rect(), request.fading);
            }
            out
        };

        if let Some(mask) = &request.geometry_mask {
            let (rx, ry) = work.resolution();
            let buffer = request.masking_buffer_pixels * rx.max(ry);
            let n = raster.pixel_count();
            let mut alpha = raster.alpha.take().unwrap_or_else(|| vec![1.0; n]);
            for row in 0..work.height {
                for col in 0..work.width {
                    let (x, y) = work.grid_to_world.pixel_center(col as i64, row as i64);
                    if !mask.contains_buffered(x, y, buffer) {
                        alpha[row * work.width + col] = 0.0;
                    }
                }
            }
            raster.alpha = Some(alpha);
        }
        fill_background(&mut raster, background);

        let padding = (work.width - ctx.raster_area.width) / 2;
        let mut raster = raster.crop(
            &PixelRect::new(
                padding as i64,
                padding as i64,
                ctx.raster_area.width,
                ctx.raster_area.height,
            ),
            background,
        );

        let keep_alpha = match &request.output_transparent_color {
            Some(color) => {
                mask_color(&mut raster, color);
                true
            }
            None => request.footprint_behavior == FootprintBehavior::Transparent,
        };
        if !keep_alpha {
            raster.alpha = None;
        } else if raster.alpha.is_none() {
            raster.alpha = Some(vec![1.0; raster.pixel_count()]);
        }

        let provenance = sources.iter().map(GranuleId::as_str).collect::<Vec<_>>().join(",");
        debug!(
            sources = sources.len(),
            skipped,
            removed,
            bands = raster.num_bands(),
            "Finalized coverage"
        );

        Ok(OutputCoverage {
            raster,
            crs: ctx.crs,
            grid_to_world: ctx.grid_to_world,
            bbox: ctx.output_bbox(),
            sources,
            provenance,
            statistics,
            skipped_granules: skipped,
            removed_granules: removed,
            needs_reprojection: ctx.needs_reprojection,
        })
    }
}

/// Fill in the coverage extent and resolution the configuration leaves open.
async fn derive_coverage(config: &MosaicConfig, catalog: &dyn GranuleCatalog) -> Result<CoverageDescriptor> {
    let (extent, native_resolution) = match (config.extent, config.native_resolution) {
        (Some(extent), Some(res)) => (extent, res),
        (extent, res) => {
            let summary = catalog.summary().await?.ok_or_else(|| {
                MosaicError::Config(format!(
                    "mosaic '{}' has no extent or resolution configured and the catalog is empty",
                    config.name
                ))
            })?;
            let catalog_crs = catalog.schema().crs;
            let bounds = transform_bbox(catalog_crs, config.crs, &summary.bounds, DEFAULT_DENSIFY)?;
            let derived_res = (
                summary.finest_resolution.0 * bounds.width() / summary.bounds.width(),
                summary.finest_resolution.1 * bounds.height() / summary.bounds.height(),
            );
            (extent.unwrap_or(bounds), res.unwrap_or(derived_res))
        }
    };

    if !(native_resolution.0 > 0.0 && native_resolution.1 > 0.0) || !native_resolution.0.is_finite() {
        return Err(MosaicError::Config(format!(
            "cannot derive a native resolution for mosaic '{}'",
            config.name
        )));
    }

    Ok(CoverageDescriptor {
        name: config.name.clone(),
        crs: config.crs,
        extent,
        native_resolution,
    })
}
