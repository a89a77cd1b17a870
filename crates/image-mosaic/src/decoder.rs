//! Pixel decoding interface, an in-memory decoder and the hint registry.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use thiserror::Error;

use mosaic_common::PixelRect;

use crate::downsample::{build_pyramid, DownsampleMethod};
use crate::granule::GranuleRecord;
use crate::types::Raster;

/// Errors reported by pixel decoders.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DecodeError {
    /// Nothing is stored at the location.
    #[error("no raster at '{0}'")]
    NotFound(String),

    /// The pyramid has fewer levels than requested.
    #[error("level {level} not available at '{location}' ({available} levels)")]
    LevelOutOfRange {
        location: String,
        level: usize,
        available: usize,
    },

    /// The window does not overlap the level.
    #[error("region {region:?} outside {width}x{height} raster")]
    RegionOutOfBounds {
        region: PixelRect,
        width: usize,
        height: usize,
    },

    /// Backend failure.
    #[error("decode failed: {0}")]
    Io(String),
}

/// Windowed, subsampling raster reader.
///
/// Implementations are shared across concurrent decode tasks.
#[async_trait]
pub trait PixelDecoder: Send + Sync {
    /// Decode `region` of pyramid level `level`, keeping every
    /// `subsampling`-th pixel along each axis.
    ///
    /// The result has `ceil(region.width / ss_x)` x `ceil(region.height / ss_y)` pixels.
    async fn decode_region(
        &self,
        location: &str,
        level: usize,
        subsampling: (usize, usize),
        region: PixelRect,
    ) -> Result<Raster, DecodeError>;
}

/// Decoder over pyramids held in memory.
#[derive(Default)]
pub struct MemoryDecoder {
    pyramids: RwLock<HashMap<String, Arc<Vec<Raster>>>>,
    failing: RwLock<HashSet<String>>,
    decodes: AtomicUsize,
}

impl MemoryDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a full pyramid, finest level first.
    pub fn insert(&self, location: impl Into<String>, levels: Vec<Raster>) {
        if let Ok(mut pyramids) = self.pyramids.write() {
            pyramids.insert(location.into(), Arc::new(levels));
        }
    }

    /// Store a base raster and derive `overviews` levels from it.
    pub fn insert_with_overviews(
        &self,
        location: impl Into<String>,
        base: Raster,
        overviews: usize,
        method: DownsampleMethod,
    ) {
        self.insert(location, build_pyramid(base, overviews, method));
    }

    /// Make every decode of `location` fail.
    pub fn fail(&self, location: impl Into<String>) {
        if let Ok(mut failing) = self.failing.write() {
            failing.insert(location.into());
        }
    }

    /// Number of successful decodes so far.
    pub fn decode_count(&self) -> usize {
        self.decodes.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl PixelDecoder for MemoryDecoder {
    async fn decode_region(
        &self,
        location: &str,
        level: usize,
        subsampling: (usize, usize),
        region: PixelRect,
    ) -> Result<Raster, DecodeError> {
        if self
            .failing
            .read()
            .map(|f| f.contains(location))
            .unwrap_or(false)
        {
            return Err(DecodeError::Io(format!("cannot open '{location}'")));
        }

        let pyramid = self
            .pyramids
            .read()
            .map_err(|_| DecodeError::Io("decoder lock poisoned".into()))?
            .get(location)
            .cloned()
            .ok_or_else(|| DecodeError::NotFound(location.to_string()))?;

        let source = pyramid.get(level).ok_or_else(|| DecodeError::LevelOutOfRange {
            location: location.to_string(),
            level,
            available: pyramid.len(),
        })?;

        let window = region
            .intersection(&PixelRect::sized(source.width, source.height))
            .filter(|w| *w == region)
            .ok_or(DecodeError::RegionOutOfBounds {
                region,
                width: source.width,
                height: source.height,
            })?;

        let (ss_x, ss_y) = (subsampling.0.max(1), subsampling.1.max(1));
        let out_w = window.width.div_ceil(ss_x);
        let out_h = window.height.div_ceil(ss_y);

        let pick = |data: &[f32]| {
            let mut out = Vec::with_capacity(out_w * out_h);
            for j in 0..out_h {
                let row = window.y as usize + j * ss_y;
                for i in 0..out_w {
                    let col = window.x as usize + i * ss_x;
                    out.push(data[row * source.width + col]);
                }
            }
            out
        };

        let raster = Raster {
            width: out_w,
            height: out_h,
            bands: source.bands.iter().map(|b| pick(b)).collect(),
            alpha: source.alpha.as_deref().map(pick),
        };
        self.decodes.fetch_add(1, Ordering::Relaxed);
        Ok(raster)
    }
}

/// Decoders by hint name, with a fallback for granules without a known hint.
#[derive(Clone)]
pub struct DecoderRegistry {
    default: Arc<dyn PixelDecoder>,
    by_hint: HashMap<String, Arc<dyn PixelDecoder>>,
}

impl DecoderRegistry {
    pub fn new(default: Arc<dyn PixelDecoder>) -> Self {
        Self {
            default,
            by_hint: HashMap::new(),
        }
    }

    pub fn register(mut self, hint: impl Into<String>, decoder: Arc<dyn PixelDecoder>) -> Self {
        self.by_hint.insert(hint.into(), decoder);
        self
    }

    /// Decoder for a granule: its hint if registered, otherwise the default.
    pub fn for_granule(&self, granule: &GranuleRecord) -> &Arc<dyn PixelDecoder> {
        granule
            .decoder_hint
            .as_ref()
            .and_then(|hint| self.by_hint.get(hint))
            .unwrap_or(&self.default)
    }
}
