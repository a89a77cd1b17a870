//! Read parameters and their normalization into a [`MosaicRequest`].

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::str::FromStr;
use tracing::debug;

use mosaic_common::{BoundingBox, CrsCode, GridGeometry, TimeSelection};

use crate::catalog::{CatalogSchema, CompareOp, GranuleFilter, SortBy};
use crate::composer::CompositionSettings;
use crate::config::MosaicConfig;
use crate::error::{MosaicError, Result};
use crate::footprint::{parse_geojson, MultiPolygon};
use crate::granule::{AttributeKind, AttributeValue};
use crate::loader::LoadOptions;
use crate::spatial::CoverageDescriptor;
use crate::types::{
    DecimationPolicy, ExcessGranulePolicy, FootprintBehavior, InterpolationMethod, MergeBehavior,
    OverviewPolicy,
};

/// One entry of an ELEVATION request.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum ElevationSelection {
    Value(f64),
    /// Inclusive range.
    Range { low: f64, high: f64 },
}

impl ElevationSelection {
    /// Parse "100", "0/500" or a comma list of those.
    pub fn parse_list(s: &str) -> std::result::Result<Vec<ElevationSelection>, String> {
        s.split(',')
            .map(str::trim)
            .filter(|e| !e.is_empty())
            .map(|entry| {
                let number = |v: &str| {
                    v.trim()
                        .parse::<f64>()
                        .map_err(|_| format!("invalid elevation '{}'", v.trim()))
                };
                match entry.split_once('/') {
                    Some((low, high)) => {
                        let (low, high) = (number(low)?, number(high)?);
                        if high < low {
                            return Err(format!("elevation range ends before it starts: {entry}"));
                        }
                        Ok(ElevationSelection::Range { low, high })
                    }
                    None => Ok(ElevationSelection::Value(number(entry)?)),
                }
            })
            .collect()
    }
}

/// Parameters of a read. Every field is optional; `None` and an empty value
/// mean the same thing.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ReadParams {
    pub grid_geometry: Option<GridGeometry>,
    pub overview_policy: Option<OverviewPolicy>,
    pub decimation_policy: Option<DecimationPolicy>,
    pub filter: Option<GranuleFilter>,
    pub sort_by: Option<Vec<SortBy>>,
    pub max_granules: Option<usize>,
    pub footprint_behavior: Option<FootprintBehavior>,
    pub merge_behavior: Option<MergeBehavior>,
    pub input_transparent_color: Option<Vec<f64>>,
    pub output_transparent_color: Option<Vec<f64>>,
    pub background_values: Option<Vec<f64>>,
    pub fading: Option<bool>,
    pub multithreading: Option<bool>,
    pub accurate_resolution: Option<bool>,
    pub excess_granule_removal: Option<ExcessGranulePolicy>,
    pub time: Option<Vec<TimeSelection>>,
    pub elevation: Option<Vec<ElevationSelection>>,
    /// Raw values per custom dimension name.
    pub additional_domains: BTreeMap<String, Vec<String>>,
    pub bands: Option<Vec<usize>>,
    /// Output mask in the requested CRS.
    pub geometry_mask: Option<MultiPolygon>,
    pub masking_buffer_pixels: Option<f64>,
    pub interpolation: Option<InterpolationMethod>,
}

impl ReadParams {
    /// Parse key-value request parameters. Keys are case-insensitive.
    ///
    /// `BBOX`, `WIDTH`, `HEIGHT` and `CRS` (or `SRS`) must be given together.
    /// `DIM_<NAME>` keys address custom dimensions.
    pub fn from_kvp(kvp: &HashMap<String, String>) -> Result<ReadParams> {
        let params: HashMap<String, &str> = kvp
            .iter()
            .map(|(k, v)| (k.trim().to_uppercase(), v.trim()))
            .filter(|(_, v)| !v.is_empty())
            .collect();
        let get = |key: &str| params.get(key).copied();

        let mut out = ReadParams::default();

        let crs = get("CRS").or_else(|| get("SRS"));
        let bbox = get("BBOX");
        let width = get("WIDTH");
        let height = get("HEIGHT");
        match (crs, bbox, width, height) {
            (None, None, None, None) => {}
            (Some(crs), Some(bbox), Some(width), Some(height)) => {
                let crs = CrsCode::from_wms_string(crs).map_err(|e| MosaicError::invalid_request("CRS", e.to_string()))?;
                let bbox = BoundingBox::from_wms_string(bbox)
                    .map_err(|e| MosaicError::invalid_request("BBOX", e.to_string()))?;
                out.grid_geometry = Some(GridGeometry::new(
                    crs,
                    bbox,
                    parse_value("WIDTH", width)?,
                    parse_value("HEIGHT", height)?,
                ));
            }
            _ => {
                return Err(MosaicError::invalid_request(
                    "BBOX",
                    "BBOX, WIDTH, HEIGHT and CRS must be given together",
                ))
            }
        }

        for (key, value) in &params {
            let value = *value;
            match key.as_str() {
                "CRS" | "SRS" | "BBOX" | "WIDTH" | "HEIGHT" => {}
                "OVERVIEW_POLICY" => out.overview_policy = Some(parse_keyword(key, value)?),
                "DECIMATION_POLICY" => out.decimation_policy = Some(parse_keyword(key, value)?),
                "FOOTPRINT_BEHAVIOR" => out.footprint_behavior = Some(parse_keyword(key, value)?),
                "MERGE_BEHAVIOR" => out.merge_behavior = Some(parse_keyword(key, value)?),
                "EXCESS_GRANULE_REMOVAL" => out.excess_granule_removal = Some(parse_keyword(key, value)?),
                "SORTING" => {
                    out.sort_by =
                        Some(SortBy::parse_clause(value).map_err(|e| MosaicError::invalid_request(key, e))?)
                }
                "MAX_ALLOWED_TILES" => out.max_granules = Some(parse_value(key, value)?),
                "INPUT_TRANSPARENT_COLOR" => out.input_transparent_color = Some(parse_color(key, value)?),
                "OUTPUT_TRANSPARENT_COLOR" => out.output_transparent_color = Some(parse_color(key, value)?),
                "BACKGROUND_VALUES" => out.background_values = Some(parse_numbers(key, value)?),
                "FADING" => out.fading = Some(parse_bool(key, value)?),
                "ALLOW_MULTITHREADING" => out.multithreading = Some(parse_bool(key, value)?),
                "ACCURATE_RESOLUTION" => out.accurate_resolution = Some(parse_bool(key, value)?),
                "TIME" => {
                    out.time = Some(
                        TimeSelection::parse_list(value).map_err(|e| MosaicError::invalid_request(key, e.to_string()))?,
                    )
                }
                "ELEVATION" => {
                    out.elevation =
                        Some(ElevationSelection::parse_list(value).map_err(|e| MosaicError::invalid_request(key, e))?)
                }
                "BANDS" => {
                    out.bands = Some(
                        value
                            .split(',')
                            .map(|b| parse_value(key, b.trim()))
                            .collect::<Result<Vec<usize>>>()?,
                    )
                }
                "GEOMETRY_MASK" => {
                    out.geometry_mask = Some(parse_geojson(value).map_err(|e| MosaicError::invalid_request(key, e))?)
                }
                "MASKING_BUFFER_PIXELS" => out.masking_buffer_pixels = Some(parse_value(key, value)?),
                "INTERPOLATION" => out.interpolation = Some(parse_keyword(key, value)?),
                other => {
                    if let Some(dim) = other.strip_prefix("DIM_") {
                        out.additional_domains.insert(
                            dim.to_string(),
                            value.split(',').map(|v| v.trim().to_string()).collect(),
                        );
                    } else {
                        debug!(key = other, "Ignoring unknown read parameter");
                    }
                }
            }
        }

        Ok(out)
    }
}

fn parse_value<T: FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .parse()
        .map_err(|_| MosaicError::invalid_request(key, format!("cannot parse '{value}'")))
}

fn parse_keyword<T: FromStr<Err = String>>(key: &str, value: &str) -> Result<T> {
    value.parse().map_err(|e| MosaicError::invalid_request(key, e))
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.to_lowercase().as_str() {
        "true" | "1" | "yes" => Ok(true),
        "false" | "0" | "no" => Ok(false),
        _ => Err(MosaicError::invalid_request(key, format!("expected a boolean, got '{value}'"))),
    }
}

fn parse_numbers(key: &str, value: &str) -> Result<Vec<f64>> {
    value.split(',').map(|v| parse_value(key, v.trim())).collect()
}

/// `#RRGGBB`, `0xRRGGBB` or a comma separated list of band values.
fn parse_color(key: &str, value: &str) -> Result<Vec<f64>> {
    let hex = value.strip_prefix('#').or_else(|| value.strip_prefix("0x"));
    match hex {
        Some(hex) if hex.len() == 6 => (0..3)
            .map(|i| {
                u8::from_str_radix(&hex[i * 2..i * 2 + 2], 16)
                    .map(f64::from)
                    .map_err(|_| MosaicError::invalid_request(key, format!("invalid color '{value}'")))
            })
            .collect(),
        Some(_) => Err(MosaicError::invalid_request(key, format!("invalid color '{value}'"))),
        None => parse_numbers(key, value),
    }
}

/// A fully resolved read. Built once per request and never modified.
#[derive(Debug, Clone, PartialEq)]
pub struct MosaicRequest {
    pub grid: GridGeometry,
    pub overview_policy: OverviewPolicy,
    pub decimation_policy: DecimationPolicy,
    /// User filter AND-ed with the dimension filters.
    pub filter: GranuleFilter,
    pub sort: Vec<SortBy>,
    pub max_granules: Option<usize>,
    pub footprint_behavior: FootprintBehavior,
    pub merge_behavior: MergeBehavior,
    pub input_transparent_color: Option<Vec<f64>>,
    pub output_transparent_color: Option<Vec<f64>>,
    pub background: Vec<f64>,
    pub fading: bool,
    pub multithreading: bool,
    pub accurate_resolution: bool,
    pub excess_granule_removal: ExcessGranulePolicy,
    pub bands: Option<Vec<usize>>,
    pub geometry_mask: Option<MultiPolygon>,
    pub masking_buffer_pixels: f64,
    pub interpolation: InterpolationMethod,
}

impl MosaicRequest {
    /// Excess granule removal needs footprints to reason about.
    pub fn removes_excess_granules(&self) -> bool {
        self.excess_granule_removal == ExcessGranulePolicy::Roi && self.footprint_behavior != FootprintBehavior::None
    }

    pub fn composition_settings(&self) -> CompositionSettings {
        CompositionSettings {
            merge: self.merge_behavior,
            fading: self.fading,
            background: self.background.clone(),
            input_transparent_color: self.input_transparent_color.clone(),
            excess_granule_removal: self.removes_excess_granules(),
        }
    }

    pub fn load_options(&self) -> LoadOptions {
        LoadOptions {
            footprint_behavior: self.footprint_behavior,
            bands: self.bands.clone(),
            interpolation: self.interpolation,
        }
    }
}

/// Resolves [`ReadParams`] against a coverage, its catalog schema and the
/// mosaic configuration.
pub struct RequestNormalizer<'a> {
    coverage: &'a CoverageDescriptor,
    schema: &'a CatalogSchema,
    config: &'a MosaicConfig,
}

impl<'a> RequestNormalizer<'a> {
    pub fn new(coverage: &'a CoverageDescriptor, schema: &'a CatalogSchema, config: &'a MosaicConfig) -> Self {
        Self {
            coverage,
            schema,
            config,
        }
    }

    pub fn normalize(&self, params: &ReadParams) -> Result<MosaicRequest> {
        let grid = params.grid_geometry.unwrap_or_else(|| self.coverage.native_grid());
        if grid.width == 0 || grid.height == 0 {
            return Err(MosaicError::invalid_request(
                "grid_geometry",
                format!("pixel dimensions must be positive, got {}x{}", grid.width, grid.height),
            ));
        }
        if !(grid.bbox.width() > 0.0 && grid.bbox.height() > 0.0) {
            return Err(MosaicError::invalid_request(
                "grid_geometry",
                format!("bbox must have positive area, got {}", grid.bbox.cache_key()),
            ));
        }

        let sort = params.sort_by.clone().unwrap_or_default();
        if let Some(missing) = sort.iter().find(|s| self.schema.kind_of(&s.attribute).is_none()) {
            return Err(MosaicError::invalid_request(
                "SORTING",
                format!("unknown attribute '{}'", missing.attribute),
            ));
        }

        let bands = match &params.bands {
            Some(b) if b.is_empty() => {
                return Err(MosaicError::invalid_request("BANDS", "band selection is empty"));
            }
            other => other.clone(),
        };

        let max_granules = match (params.max_granules, self.config.max_allowed_tiles) {
            (Some(0), _) => return Err(MosaicError::invalid_request("MAX_ALLOWED_TILES", "must be > 0")),
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };

        let masking_buffer_pixels = params.masking_buffer_pixels.unwrap_or(0.0);
        if !masking_buffer_pixels.is_finite() || masking_buffer_pixels < 0.0 {
            return Err(MosaicError::invalid_request(
                "MASKING_BUFFER_PIXELS",
                "must be a non-negative number",
            ));
        }

        let mut filters = vec![params.filter.clone().unwrap_or_default()];
        filters.push(self.time_filter(params)?);
        filters.push(self.elevation_filter(params)?);
        for (name, values) in &params.additional_domains {
            filters.push(self.domain_filter(name, values)?);
        }

        let request = MosaicRequest {
            grid,
            overview_policy: params.overview_policy.unwrap_or_default(),
            decimation_policy: params.decimation_policy.unwrap_or_default(),
            filter: GranuleFilter::and(filters),
            sort,
            max_granules,
            footprint_behavior: params.footprint_behavior.unwrap_or_default(),
            merge_behavior: params.merge_behavior.unwrap_or_default(),
            input_transparent_color: params.input_transparent_color.clone().filter(|c| !c.is_empty()),
            output_transparent_color: params.output_transparent_color.clone().filter(|c| !c.is_empty()),
            background: params
                .background_values
                .clone()
                .filter(|b| !b.is_empty())
                .unwrap_or_else(|| self.config.default_background.clone()),
            fading: params.fading.unwrap_or(false),
            multithreading: params.multithreading.unwrap_or(self.config.allow_multithreading),
            accurate_resolution: params.accurate_resolution.unwrap_or(false),
            excess_granule_removal: params.excess_granule_removal.unwrap_or_default(),
            bands,
            geometry_mask: params.geometry_mask.clone().filter(|m| !m.is_empty()),
            masking_buffer_pixels,
            interpolation: params.interpolation.unwrap_or(self.config.interpolation),
        };

        debug!(
            crs = %request.grid.crs,
            width = request.grid.width,
            height = request.grid.height,
            overview_policy = %request.overview_policy,
            merge = %request.merge_behavior,
            "Normalized read request"
        );
        Ok(request)
    }

    fn time_filter(&self, params: &ReadParams) -> Result<GranuleFilter> {
        let Some(times) = params.time.as_ref().filter(|t| !t.is_empty()) else {
            return Ok(GranuleFilter::Include);
        };
        let Some(attribute) = &self.config.time_attribute else {
            return Err(MosaicError::invalid_request("TIME", "mosaic has no time dimension"));
        };
        let terms = times
            .iter()
            .map(|t| match t {
                TimeSelection::Instant(at) => GranuleFilter::compare(attribute.as_str(), CompareOp::Eq, *at),
                TimeSelection::Range { start, end } => GranuleFilter::Between {
                    attribute: attribute.clone(),
                    low: AttributeValue::Time(*start),
                    high: AttributeValue::Time(*end),
                },
            })
            .collect();
        Ok(or_of(terms))
    }

    fn elevation_filter(&self, params: &ReadParams) -> Result<GranuleFilter> {
        let Some(elevations) = params.elevation.as_ref().filter(|e| !e.is_empty()) else {
            return Ok(GranuleFilter::Include);
        };
        let Some(attribute) = &self.config.elevation_attribute else {
            return Err(MosaicError::invalid_request("ELEVATION", "mosaic has no elevation dimension"));
        };
        let terms = elevations
            .iter()
            .map(|e| match e {
                ElevationSelection::Value(v) => GranuleFilter::compare(attribute.as_str(), CompareOp::Eq, *v),
                ElevationSelection::Range { low, high } => GranuleFilter::Between {
                    attribute: attribute.clone(),
                    low: AttributeValue::Float(*low),
                    high: AttributeValue::Float(*high),
                },
            })
            .collect();
        Ok(or_of(terms))
    }

    fn domain_filter(&self, name: &str, values: &[String]) -> Result<GranuleFilter> {
        let param = format!("DIM_{}", name.to_uppercase());
        let Some(attribute) = self
            .config
            .additional_domains
            .iter()
            .find(|d| d.eq_ignore_ascii_case(name))
        else {
            return Err(MosaicError::invalid_request(param, format!("unknown dimension '{name}'")));
        };
        let kind = self.schema.kind_of(attribute).unwrap_or(AttributeKind::Text);
        let parse = |raw: &str| {
            AttributeValue::parse_as(kind, raw.trim())
                .ok_or_else(|| MosaicError::invalid_request(param.as_str(), format!("cannot parse '{raw}' as {kind:?}")))
        };

        let mut terms = Vec::new();
        for value in values.iter().filter(|v| !v.trim().is_empty()) {
            let term = match value.split_once('/') {
                Some((low, high)) if kind != AttributeKind::Text => GranuleFilter::Between {
                    attribute: attribute.clone(),
                    low: parse(low)?,
                    high: parse(high)?,
                },
                _ => GranuleFilter::Compare {
                    attribute: attribute.clone(),
                    op: CompareOp::Eq,
                    value: parse(value)?,
                },
            };
            terms.push(term);
        }
        Ok(or_of(terms))
    }
}

fn or_of(mut terms: Vec<GranuleFilter>) -> GranuleFilter {
    match terms.len() {
        0 => GranuleFilter::Include,
        1 => terms.remove(0),
        _ => GranuleFilter::Or(terms),
    }
}
