//! Core types for mosaic assembly: request policies, pixel buffers and
//! auxiliary band statistics.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use mosaic_common::PixelRect;

macro_rules! keyword_enum {
    (@first $first:literal $(, $rest:literal)*) => { $first };
    (
        $(#[$meta:meta])*
        $name:ident { $( $(#[$vmeta:meta])* $variant:ident => [$($alias:literal),+] ),+ $(,)? }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(rename_all = "SCREAMING_SNAKE_CASE")]
        pub enum $name {
            $( $(#[$vmeta])* $variant ),+
        }

        impl $name {
            /// Canonical keyword as used in request parameters.
            pub fn as_str(&self) -> &'static str {
                match self {
                    $( Self::$variant => keyword_enum!(@first $($alias),+) ),+
                }
            }
        }

        impl FromStr for $name {
            type Err = String;

            /// Parse a keyword (case-insensitive).
            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let upper = s.trim().to_uppercase();
                $( if [$($alias),+].contains(&upper.as_str()) { return Ok(Self::$variant); } )+
                Err(format!("unknown {} '{}'", stringify!($name), s))
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

keyword_enum! {
    /// How a pyramid level is chosen for a requested resolution.
    OverviewPolicy {
        /// Finest level not finer than the request.
        Quality => ["QUALITY"],
        /// Next coarser level than the request.
        Speed => ["SPEED"],
        /// Level closest to the request on a log scale.
        Nearest => ["NEAREST"],
        /// Always decode the base level and decimate.
        Ignore => ["IGNORE"],
    }
}

keyword_enum! {
    /// Whether decoders may subsample on read.
    DecimationPolicy {
        Allow => ["ALLOW"],
        Disallow => ["DISALLOW"],
    }
}

keyword_enum! {
    /// What a granule footprint does to decoded pixels.
    FootprintBehavior {
        /// Footprints are ignored.
        None => ["NONE"],
        /// Pixels outside the footprint are dropped.
        Cut => ["CUT"],
        /// Pixels outside the footprint become transparent; the output keeps an alpha band.
        Transparent => ["TRANSPARENT"],
    }
}

keyword_enum! {
    /// How surviving tiles are merged.
    MergeBehavior {
        /// Spatial overlay, first-sorted tile on top.
        Normal => ["NORMAL", "FLAT"],
        /// Band concatenation over a shared pixel grid.
        Stack => ["STACK"],
    }
}

keyword_enum! {
    /// Whether granules hidden by higher-priority footprints are dropped.
    ExcessGranulePolicy {
        None => ["NONE"],
        Roi => ["ROI"],
    }
}

impl Default for OverviewPolicy {
    fn default() -> Self {
        Self::Nearest
    }
}

impl Default for DecimationPolicy {
    fn default() -> Self {
        Self::Allow
    }
}

impl Default for FootprintBehavior {
    fn default() -> Self {
        Self::None
    }
}

impl Default for MergeBehavior {
    fn default() -> Self {
        Self::Normal
    }
}

impl Default for ExcessGranulePolicy {
    fn default() -> Self {
        Self::None
    }
}

/// Interpolation method used when resampling onto another grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum InterpolationMethod {
    /// Nearest neighbor (preserves exact values).
    #[default]
    Nearest,
    /// Bilinear interpolation (smooth, slight value changes).
    Bilinear,
    /// Bicubic interpolation (smoothest, more compute).
    Cubic,
}

impl InterpolationMethod {
    /// Lenient parse for configuration: unknown names fall back to nearest.
    pub fn parse(s: &str) -> Self {
        s.parse().unwrap_or_default()
    }

    /// Extra pixels of context the kernel reads around a sample.
    pub fn kernel_padding(&self) -> usize {
        match self {
            Self::Nearest => 0,
            Self::Bilinear | Self::Cubic => 2,
        }
    }
}

impl FromStr for InterpolationMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "nearest" | "nearest_neighbor" => Ok(Self::Nearest),
            "bilinear" => Ok(Self::Bilinear),
            "cubic" | "bicubic" => Ok(Self::Cubic),
            _ => Err(format!("unknown interpolation '{s}'")),
        }
    }
}

impl fmt::Display for InterpolationMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Nearest => write!(f, "nearest"),
            Self::Bilinear => write!(f, "bilinear"),
            Self::Cubic => write!(f, "cubic"),
        }
    }
}

/// Planar multi-band pixel buffer, row-major, top row first.
///
/// `alpha` is a per-pixel coverage weight in `[0, 1]`; `None` means fully opaque.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Raster {
    pub width: usize,
    pub height: usize,
    pub bands: Vec<Vec<f32>>,
    pub alpha: Option<Vec<f32>>,
}

impl Raster {
    pub fn new(width: usize, height: usize, bands: Vec<Vec<f32>>) -> Self {
        Self {
            width,
            height,
            bands,
            alpha: None,
        }
    }

    /// A raster with every band set to its background value.
    pub fn filled(width: usize, height: usize, num_bands: usize, background: &[f64]) -> Self {
        let bands = (0..num_bands)
            .map(|b| vec![background_value(background, b); width * height])
            .collect();
        Self::new(width, height, bands)
    }

    pub fn with_alpha(mut self, alpha: Vec<f32>) -> Self {
        self.alpha = Some(alpha);
        self
    }

    pub fn num_bands(&self) -> usize {
        self.bands.len()
    }

    pub fn pixel_count(&self) -> usize {
        self.width * self.height
    }

    #[inline]
    pub fn index(&self, col: usize, row: usize) -> usize {
        row * self.width + col
    }

    pub fn get(&self, band: usize, col: usize, row: usize) -> Option<f32> {
        if col >= self.width || row >= self.height {
            return None;
        }
        self.bands.get(band).map(|b| b[self.index(col, row)])
    }

    /// Coverage weight at a pixel index.
    #[inline]
    pub fn alpha_at(&self, idx: usize) -> f32 {
        self.alpha.as_ref().map(|a| a[idx]).unwrap_or(1.0)
    }

    /// Copy out a sub-rectangle. Parts of `rect` outside the raster are
    /// filled with `background` and zero alpha.
    pub fn crop(&self, rect: &PixelRect, background: &[f64]) -> Raster {
        let mut out = Raster::filled(rect.width, rect.height, self.num_bands(), background);
        let mut alpha = vec![0.0f32; rect.area()];
        let own = PixelRect::sized(self.width, self.height);
        if let Some(overlap) = own.intersection(rect) {
            for row in overlap.y..overlap.max_y() {
                for col in overlap.x..overlap.max_x() {
                    let src = self.index(col as usize, row as usize);
                    let dst = ((row - rect.y) as usize) * rect.width + (col - rect.x) as usize;
                    for (b, band) in self.bands.iter().enumerate() {
                        out.bands[b][dst] = band[src];
                    }
                    alpha[dst] = self.alpha_at(src);
                }
            }
        }
        if self.alpha.is_some() || rect.intersection(&own) != Some(*rect) {
            out.alpha = Some(alpha);
        }
        out
    }

    /// Keep only the listed bands, in the listed order.
    pub fn select_bands(&self, indices: &[usize]) -> Option<Raster> {
        let mut bands = Vec::with_capacity(indices.len());
        for &i in indices {
            bands.push(self.bands.get(i)?.clone());
        }
        Some(Raster {
            width: self.width,
            height: self.height,
            bands,
            alpha: self.alpha.clone(),
        })
    }

    /// Whether every band matches `color` at a pixel index.
    pub fn matches_color(&self, idx: usize, color: &[f64]) -> bool {
        !color.is_empty()
            && self
                .bands
                .iter()
                .enumerate()
                .all(|(b, band)| band[idx] == background_value(color, b) as f32)
    }
}

/// Value for band `band` out of a per-band vector. Shorter vectors repeat
/// their first entry; an empty vector means zero.
pub fn background_value(values: &[f64], band: usize) -> f32 {
    values
        .get(band)
        .or_else(|| values.first())
        .copied()
        .unwrap_or(0.0) as f32
}

/// Summary statistics of one band.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BandStatistics {
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub count: u64,
}

impl BandStatistics {
    /// Compute statistics over the finite values of a band.
    pub fn from_values(values: &[f32]) -> Option<Self> {
        let mut min = f64::INFINITY;
        let mut max = f64::NEG_INFINITY;
        let mut sum = 0.0;
        let mut count = 0u64;
        for &v in values.iter().filter(|v| v.is_finite()) {
            let v = v as f64;
            min = min.min(v);
            max = max.max(v);
            sum += v;
            count += 1;
        }
        (count > 0).then(|| Self {
            min,
            max,
            mean: sum / count as f64,
            count,
        })
    }

    /// Combine two summaries as if computed over the union of their samples.
    pub fn merge(&self, other: &BandStatistics) -> BandStatistics {
        let count = self.count + other.count;
        let mean = if count == 0 {
            0.0
        } else {
            (self.mean * self.count as f64 + other.mean * other.count as f64) / count as f64
        };
        BandStatistics {
            min: self.min.min(other.min),
            max: self.max.max(other.max),
            mean,
            count,
        }
    }
}

/// Merge per-band statistics across granules, band by band.
///
/// Bands absent from some inputs are merged over the inputs that have them.
pub fn merge_statistics<'a, I>(inputs: I) -> Option<Vec<BandStatistics>>
where
    I: IntoIterator<Item = &'a [BandStatistics]>,
{
    let mut merged: Vec<BandStatistics> = Vec::new();
    let mut any = false;
    for stats in inputs {
        any = true;
        for (b, s) in stats.iter().enumerate() {
            match merged.get_mut(b) {
                Some(existing) => *existing = existing.merge(s),
                None => merged.push(*s),
            }
        }
    }
    (any && !merged.is_empty()).then_some(merged)
}
