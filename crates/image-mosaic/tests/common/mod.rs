//! Common helpers for image-mosaic integration tests
//!
//! Provides builders for:
//! - In-memory catalogs of constant-valued tiles
//! - Decoders holding the matching pyramids
//! - Assemblers wired to both

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Once};
use std::time::Duration;

use async_trait::async_trait;
use image_mosaic::{
    BoundingBox, CrsCode, DecodeError, DecoderRegistry, DownsampleMethod, GranuleRecord, GridGeometry,
    InMemoryCatalog, MemoryDecoder, MosaicAssembler, MosaicConfig, PixelDecoder, PixelRect, Raster,
};

static TRACING: Once = Once::new();

/// Route `tracing` output to the test harness. Set `RUST_LOG` to see it.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

pub fn bbox(extent: (f64, f64, f64, f64)) -> BoundingBox {
    BoundingBox::new(extent.0, extent.1, extent.2, extent.3)
}

pub fn grid(crs: CrsCode, extent: (f64, f64, f64, f64), width: usize, height: usize) -> GridGeometry {
    GridGeometry::new(crs, bbox(extent), width, height)
}

pub fn kvp(pairs: &[(&str, &str)]) -> HashMap<String, String> {
    pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
}

/// A catalog plus the decoder that serves its granules.
pub struct Fixture {
    pub catalog: Arc<InMemoryCatalog>,
    pub decoder: Arc<MemoryDecoder>,
}

impl Fixture {
    pub fn new(crs: CrsCode) -> Self {
        init_tracing();
        Self {
            catalog: Arc::new(InMemoryCatalog::new(crs)),
            decoder: Arc::new(MemoryDecoder::new()),
        }
    }

    /// Register a single-band constant tile with one overview level.
    pub fn add_constant(
        &self,
        id: &str,
        crs: CrsCode,
        extent: (f64, f64, f64, f64),
        pixels: usize,
        value: f32,
    ) -> GranuleRecord {
        let base = Raster::new(pixels, pixels, vec![test_utils::create_constant_grid(pixels, pixels, value)]);
        self.add_raster(id, crs, extent, base)
    }

    /// Register a tile from an arbitrary base raster and return its record
    /// (with one overview level) without inserting it in the catalog.
    pub fn prepare(&self, id: &str, crs: CrsCode, extent: (f64, f64, f64, f64), base: Raster) -> GranuleRecord {
        let location = format!("mem://{id}");
        let (w, h) = (base.width, base.height);
        self.decoder
            .insert_with_overviews(location.clone(), base, 1, DownsampleMethod::Mean);
        GranuleRecord::new(id, location, crs, bbox(extent), w, h).with_overviews(1)
    }

    /// Register a tile from an arbitrary base raster and insert it.
    pub fn add_raster(&self, id: &str, crs: CrsCode, extent: (f64, f64, f64, f64), base: Raster) -> GranuleRecord {
        let record = self.prepare(id, crs, extent, base);
        self.catalog.insert(record.clone()).expect("insert granule");
        record
    }

    pub fn insert(&self, record: GranuleRecord) {
        self.catalog.insert(record).expect("insert granule");
    }

    pub async fn assembler(&self, config: MosaicConfig) -> MosaicAssembler {
        self.assembler_with(config, self.decoder.clone()).await
    }

    /// An assembler reading through `decoder` instead of the fixture's own.
    pub async fn assembler_with(&self, config: MosaicConfig, decoder: Arc<dyn PixelDecoder>) -> MosaicAssembler {
        MosaicAssembler::new(config, self.catalog.clone(), DecoderRegistry::new(decoder))
            .await
            .expect("assembler")
    }
}

/// Panics when asked for `location`, delegates everything else.
pub struct PanickingDecoder {
    pub inner: Arc<MemoryDecoder>,
    pub location: String,
}

#[async_trait]
impl PixelDecoder for PanickingDecoder {
    async fn decode_region(
        &self,
        location: &str,
        level: usize,
        subsampling: (usize, usize),
        region: PixelRect,
    ) -> Result<Raster, DecodeError> {
        if location == self.location {
            panic!("decoder crashed on {location}");
        }
        self.inner.decode_region(location, level, subsampling, region).await
    }
}

/// Sleeps before every decode and counts the decodes that ran to the end.
pub struct SlowDecoder {
    pub inner: Arc<MemoryDecoder>,
    pub delay: Duration,
    pub finished: AtomicUsize,
}

impl SlowDecoder {
    pub fn new(inner: Arc<MemoryDecoder>, delay: Duration) -> Self {
        Self {
            inner,
            delay,
            finished: AtomicUsize::new(0),
        }
    }

    pub fn finished(&self) -> usize {
        self.finished.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PixelDecoder for SlowDecoder {
    async fn decode_region(
        &self,
        location: &str,
        level: usize,
        subsampling: (usize, usize),
        region: PixelRect,
    ) -> Result<Raster, DecodeError> {
        tokio::time::sleep(self.delay).await;
        let result = self.inner.decode_region(location, level, subsampling, region).await;
        self.finished.fetch_add(1, Ordering::SeqCst);
        result
    }
}

/// Value of band 0 at `(col, row)`.
pub fn value_at(raster: &Raster, col: usize, row: usize) -> f32 {
    raster.get(0, col, row).expect("pixel in range")
}
