//! On-demand raster mosaics from a catalog of georeferenced granules.
//!
//! Given an output grid and a set of filters, the assembler selects the
//! matching granules, decodes each at a suitable pyramid level, masks it
//! with its footprint, drops granules hidden by higher-priority ones, and
//! composites everything into one output raster:
//!
//! - **Per-granule level choice**: granules may have different native
//!   resolutions and pyramid depths
//! - **Footprint aware**: vector or raster sidecars cut or fade granules
//! - **Heterogeneous CRS**: granules are composed per native CRS and the
//!   sub-mosaics reprojected onto the output grid
//!
//! # Architecture
//!
//! ```text
//! ReadParams
//!      │
//!      ▼
//! RequestNormalizer ──► MosaicRequest
//!      │
//!      ▼
//! SpatialReconciler ──► SpatialContext ──(empty)──► MosaicOutcome::Empty
//!      │
//!      ▼
//! GranuleSelector (GranuleCatalog query, sorted, capped)
//!      │
//!      ├─► GranuleAcceptor: accept + group by native CRS
//!      │
//!      ▼  per group
//! overview::resolve ──► ReadPlan
//!      │
//!      ├─► GranuleLoader::load  (tokio tasks, Semaphore bound,
//!      │        │                results re-sorted by index)
//!      │        ├─► DecoderRegistry ──► PixelDecoder::decode_region
//!      │        └─► FootprintProvider ──► Roi
//!      │
//!      ▼
//! SubmosaicComposer (excess granule removal, overlay or stack)
//!      │
//!      ▼
//! reproject sub-mosaics ──► final overlay ──► mask, crop ──► OutputCoverage
//! ```
//!
//! # Example
//!
//! ```ignore
//! use image_mosaic::{DecoderRegistry, InMemoryCatalog, MosaicAssembler, MosaicOutcome, ReadParams};
//!
//! let assembler = MosaicAssembler::new(config, catalog, DecoderRegistry::new(decoder)).await?;
//! match assembler.read(ReadParams::from_kvp(&query)?).await? {
//!     MosaicOutcome::Coverage(coverage) => println!("{} from {}", coverage.raster.width, coverage.provenance),
//!     MosaicOutcome::Empty(reason) => println!("no data: {}", reason.as_str()),
//! }
//! ```

pub mod acceptor;
pub mod assembler;
pub mod catalog;
pub mod composer;
pub mod config;
pub mod decoder;
pub mod downsample;
pub mod error;
pub mod footprint;
pub mod granule;
pub mod loader;
pub mod overview;
pub mod request;
pub mod resample;
pub mod selector;
pub mod spatial;
pub mod types;

// Re-export commonly used types at crate root
pub use acceptor::{AcceptorRegistry, DefaultAcceptor, GranuleAcceptor, HeterogeneousCrsAcceptor};
pub use assembler::{EmptyReason, MosaicAssembler, MosaicOutcome, OutputCoverage};
pub use catalog::{
    CatalogQuery, CatalogSchema, CatalogSummary, CompareOp, GranuleCatalog, GranuleFilter, InMemoryCatalog,
    SortBy, SortOrder,
};
pub use composer::{CompositionSettings, Submosaic, SubmosaicComposer};
pub use config::{FootprintInset, MosaicConfig};
pub use decoder::{DecodeError, DecoderRegistry, MemoryDecoder, PixelDecoder};
pub use downsample::{build_pyramid, downsample_2x, DownsampleMethod};
pub use error::{MosaicError, Result};
pub use footprint::{
    parse_geojson, FootprintCacheStats, FootprintProvider, MultiPolygon, Polygon, RasterMask, Roi,
    SidecarFootprintProvider,
};
pub use granule::{AttributeKind, AttributeValue, FootprintSource, GranuleId, GranuleRecord, OverviewLevel};
pub use loader::{DecodedTile, GranuleLoader, LoadOptions, WorkingGrid};
pub use overview::{resolve, ReadPlan};
pub use request::{ElevationSelection, MosaicRequest, ReadParams, RequestNormalizer};
pub use resample::{bilinear_interpolate, cubic_interpolate, nearest_interpolate, reproject};
pub use selector::GranuleSelector;
pub use spatial::{CoverageDescriptor, SpatialContext, SpatialReconciler};
pub use types::{
    BandStatistics, DecimationPolicy, ExcessGranulePolicy, FootprintBehavior, InterpolationMethod, MergeBehavior,
    OverviewPolicy, Raster,
};

pub use mosaic_common::{AffineTransform, BoundingBox, CrsCode, GridGeometry, PixelRect, TimeSelection};
