//! Granule catalog interface and an in-memory implementation.
//!
//! The catalog answers spatial + attribute queries with an ordered list of
//! granules. Ordering is total: the sort keys first, then insertion order.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};
use tracing::debug;

use mosaic_common::{BoundingBox, CrsCode};
use projection::{transform_bbox, DEFAULT_DENSIFY};

use crate::error::{MosaicError, Result};
use crate::granule::{AttributeKind, AttributeValue, GranuleRecord};

/// Comparison operators for attribute predicates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl CompareOp {
    fn test(&self, ord: Ordering) -> bool {
        match self {
            Self::Eq => ord == Ordering::Equal,
            Self::Ne => ord != Ordering::Equal,
            Self::Lt => ord == Ordering::Less,
            Self::Le => ord != Ordering::Greater,
            Self::Gt => ord == Ordering::Greater,
            Self::Ge => ord != Ordering::Less,
        }
    }
}

/// Granule predicate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum GranuleFilter {
    #[default]
    Include,
    Exclude,
    Compare {
        attribute: String,
        op: CompareOp,
        value: AttributeValue,
    },
    /// Inclusive range.
    Between {
        attribute: String,
        low: AttributeValue,
        high: AttributeValue,
    },
    In {
        attribute: String,
        values: Vec<AttributeValue>,
    },
    And(Vec<GranuleFilter>),
    Or(Vec<GranuleFilter>),
    Not(Box<GranuleFilter>),
    /// Index envelope overlaps the box (catalog CRS).
    Intersects(BoundingBox),
}

impl GranuleFilter {
    pub fn compare(attribute: impl Into<String>, op: CompareOp, value: impl Into<AttributeValue>) -> Self {
        Self::Compare {
            attribute: attribute.into(),
            op,
            value: value.into(),
        }
    }

    pub fn eq(attribute: impl Into<String>, value: impl Into<AttributeValue>) -> Self {
        Self::compare(attribute, CompareOp::Eq, value)
    }

    /// Conjunction that drops `Include` terms and collapses trivial cases.
    pub fn and(filters: Vec<GranuleFilter>) -> Self {
        let mut terms: Vec<_> = filters
            .into_iter()
            .filter(|f| *f != GranuleFilter::Include)
            .collect();
        if terms.iter().any(|f| *f == GranuleFilter::Exclude) {
            return GranuleFilter::Exclude;
        }
        match terms.len() {
            0 => GranuleFilter::Include,
            1 => terms.remove(0),
            _ => GranuleFilter::And(terms),
        }
    }

    /// Attribute names referenced by the filter.
    pub fn attributes(&self) -> Vec<&str> {
        let mut names = Vec::new();
        self.collect_attributes(&mut names);
        names
    }

    fn collect_attributes<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            Self::Compare { attribute, .. } | Self::Between { attribute, .. } | Self::In { attribute, .. } => {
                out.push(attribute)
            }
            Self::And(fs) | Self::Or(fs) => fs.iter().for_each(|f| f.collect_attributes(out)),
            Self::Not(f) => f.collect_attributes(out),
            Self::Include | Self::Exclude | Self::Intersects(_) => {}
        }
    }

    /// Evaluate against a granule and its index envelope.
    pub fn matches(&self, granule: &GranuleRecord, index_bbox: &BoundingBox) -> bool {
        let cmp = |attribute: &str, value: &AttributeValue| {
            granule.attribute(attribute).map(|v| v.total_cmp(value))
        };
        match self {
            Self::Include => true,
            Self::Exclude => false,
            Self::Compare { attribute, op, value } => cmp(attribute, value).map_or(false, |o| op.test(o)),
            Self::Between { attribute, low, high } => {
                cmp(attribute, low).map_or(false, |o| o != Ordering::Less)
                    && cmp(attribute, high).map_or(false, |o| o != Ordering::Greater)
            }
            Self::In { attribute, values } => values
                .iter()
                .any(|v| cmp(attribute, v) == Some(Ordering::Equal)),
            Self::And(fs) => fs.iter().all(|f| f.matches(granule, index_bbox)),
            Self::Or(fs) => fs.iter().any(|f| f.matches(granule, index_bbox)),
            Self::Not(f) => !f.matches(granule, index_bbox),
            Self::Intersects(bbox) => index_bbox.intersects(bbox),
        }
    }
}

/// Sort direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SortOrder {
    Ascending,
    Descending,
}

/// One sort key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SortBy {
    pub attribute: String,
    pub order: SortOrder,
}

impl SortBy {
    pub fn asc(attribute: impl Into<String>) -> Self {
        Self {
            attribute: attribute.into(),
            order: SortOrder::Ascending,
        }
    }

    pub fn desc(attribute: impl Into<String>) -> Self {
        Self {
            attribute: attribute.into(),
            order: SortOrder::Descending,
        }
    }

    /// Parse a sort clause such as `"ingestion D,quality A"`.
    ///
    /// The direction suffix is optional and defaults to ascending.
    pub fn parse_clause(clause: &str) -> std::result::Result<Vec<SortBy>, String> {
        let mut keys = Vec::new();
        for term in clause.split(',').map(str::trim).filter(|t| !t.is_empty()) {
            let mut parts = term.split_whitespace();
            let attribute = parts.next().ok_or_else(|| format!("empty sort term in '{clause}'"))?;
            let order = match parts.next().map(|d| d.to_uppercase()) {
                None => SortOrder::Ascending,
                Some(d) if d == "A" || d == "ASC" => SortOrder::Ascending,
                Some(d) if d == "D" || d == "DESC" => SortOrder::Descending,
                Some(d) => return Err(format!("unknown sort direction '{d}' in '{term}'")),
            };
            if parts.next().is_some() {
                return Err(format!("malformed sort term '{term}'"));
            }
            keys.push(SortBy {
                attribute: attribute.to_string(),
                order,
            });
        }
        Ok(keys)
    }

    fn compare(&self, a: &GranuleRecord, b: &GranuleRecord) -> Ordering {
        // Granules missing the attribute sort last in either direction.
        let ord = match (a.attribute(&self.attribute), b.attribute(&self.attribute)) {
            (Some(x), Some(y)) => x.total_cmp(y),
            (Some(_), None) => return Ordering::Less,
            (None, Some(_)) => return Ordering::Greater,
            (None, None) => Ordering::Equal,
        };
        match self.order {
            SortOrder::Ascending => ord,
            SortOrder::Descending => ord.reverse(),
        }
    }
}

/// A catalog query.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct CatalogQuery {
    pub filter: GranuleFilter,
    pub sort: Vec<SortBy>,
    pub limit: Option<usize>,
}

/// Attribute schema of a catalog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogSchema {
    /// CRS of the index envelopes.
    pub crs: CrsCode,
    pub attributes: BTreeMap<String, AttributeKind>,
}

impl CatalogSchema {
    pub fn new(crs: CrsCode) -> Self {
        Self {
            crs,
            attributes: BTreeMap::new(),
        }
    }

    pub fn with_attribute(mut self, name: impl Into<String>, kind: AttributeKind) -> Self {
        self.attributes.insert(name.into(), kind);
        self
    }

    pub fn kind_of(&self, name: &str) -> Option<AttributeKind> {
        self.attributes.get(name).copied()
    }
}

/// Summary of the catalog contents.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CatalogSummary {
    /// Union of the index envelopes, catalog CRS.
    pub bounds: BoundingBox,
    /// Finest native pixel size among granules, catalog CRS units.
    pub finest_resolution: (f64, f64),
    pub granule_count: usize,
}

/// Source of granule records.
///
/// Must be safe to query concurrently.
#[async_trait]
pub trait GranuleCatalog: Send + Sync {
    /// Attribute schema, including the index CRS.
    fn schema(&self) -> CatalogSchema;

    /// Matching granules in query order.
    async fn query(&self, query: &CatalogQuery) -> Result<Vec<Arc<GranuleRecord>>>;

    /// Extent and resolution of the whole catalog, `None` if empty.
    async fn summary(&self) -> Result<Option<CatalogSummary>>;
}

struct CatalogEntry {
    index_bbox: BoundingBox,
    granule: Arc<GranuleRecord>,
}

/// Catalog held in memory, for embedding and tests.
pub struct InMemoryCatalog {
    schema: RwLock<CatalogSchema>,
    entries: RwLock<Vec<CatalogEntry>>,
}

impl InMemoryCatalog {
    pub fn new(crs: CrsCode) -> Self {
        Self::with_schema(CatalogSchema::new(crs))
    }

    pub fn with_schema(schema: CatalogSchema) -> Self {
        Self {
            schema: RwLock::new(schema),
            entries: RwLock::new(Vec::new()),
        }
    }

    /// Register a granule. Its envelope is indexed in the catalog CRS and its
    /// attributes extend the schema.
    pub fn insert(&self, granule: GranuleRecord) -> Result<()> {
        if granule.levels.is_empty() {
            return Err(MosaicError::Catalog(format!("granule '{}' has no pyramid levels", granule.id)));
        }
        let crs = self.crs()?;
        let index_bbox = transform_bbox(granule.crs, crs, &granule.bbox, DEFAULT_DENSIFY)?;

        {
            let mut schema = self
                .schema
                .write()
                .map_err(|_| MosaicError::Catalog("schema lock poisoned".into()))?;
            for (name, value) in &granule.attributes {
                match schema.kind_of(name) {
                    None => {
                        schema.attributes.insert(name.clone(), value.kind());
                    }
                    Some(kind) if kind == value.kind() => {}
                    Some(AttributeKind::Float) if value.kind() == AttributeKind::Integer => {}
                    Some(kind) => {
                        return Err(MosaicError::Catalog(format!(
                            "granule '{}' attribute '{}' is {:?}, schema says {:?}",
                            granule.id,
                            name,
                            value.kind(),
                            kind
                        )))
                    }
                }
            }
        }

        self.entries
            .write()
            .map_err(|_| MosaicError::Catalog("entries lock poisoned".into()))?
            .push(CatalogEntry {
                index_bbox,
                granule: Arc::new(granule),
            });
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.entries.read().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn crs(&self) -> Result<CrsCode> {
        self.schema
            .read()
            .map(|s| s.crs)
            .map_err(|_| MosaicError::Catalog("schema lock poisoned".into()))
    }
}

#[async_trait]
impl GranuleCatalog for InMemoryCatalog {
    fn schema(&self) -> CatalogSchema {
        self.schema
            .read()
            .map(|s| s.clone())
            .unwrap_or_else(|e| e.into_inner().clone())
    }

    async fn query(&self, query: &CatalogQuery) -> Result<Vec<Arc<GranuleRecord>>> {
        let entries = self
            .entries
            .read()
            .map_err(|_| MosaicError::Catalog("entries lock poisoned".into()))?;

        let mut matched: Vec<&CatalogEntry> = entries
            .iter()
            .filter(|e| query.filter.matches(&e.granule, &e.index_bbox))
            .collect();

        if !query.sort.is_empty() {
            // stable: insertion order breaks ties
            matched.sort_by(|a, b| {
                query
                    .sort
                    .iter()
                    .map(|key| key.compare(&a.granule, &b.granule))
                    .find(|o| *o != Ordering::Equal)
                    .unwrap_or(Ordering::Equal)
            });
        }

        let limit = query.limit.unwrap_or(usize::MAX);
        let result: Vec<_> = matched.into_iter().take(limit).map(|e| e.granule.clone()).collect();
        debug!(matched = result.len(), total = entries.len(), "Catalog query");
        Ok(result)
    }

    async fn summary(&self) -> Result<Option<CatalogSummary>> {
        let crs = self.crs()?;
        let entries = self
            .entries
            .read()
            .map_err(|_| MosaicError::Catalog("entries lock poisoned".into()))?;

        let Some(bounds) = entries
            .iter()
            .map(|e| e.index_bbox)
            .reduce(|a, b| a.union(&b))
        else {
            return Ok(None);
        };

        let mut finest = (f64::INFINITY, f64::INFINITY);
        for entry in entries.iter() {
            let g = &entry.granule;
            let (rx, ry) = if g.crs == crs {
                g.native_resolution()
            } else {
                // Foreign granules: spread the index envelope over the base level.
                (
                    entry.index_bbox.width() / g.levels[0].width as f64,
                    entry.index_bbox.height() / g.levels[0].height as f64,
                )
            };
            finest = (finest.0.min(rx), finest.1.min(ry));
        }

        Ok(Some(CatalogSummary {
            bounds,
            finest_resolution: finest,
            granule_count: entries.len(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn granule(id: &str, x0: f64, quality: i64) -> GranuleRecord {
        GranuleRecord::new(
            id,
            format!("mem://{id}"),
            CrsCode::Epsg4326,
            BoundingBox::new(x0, 0.0, x0 + 10.0, 10.0),
            10,
            10,
        )
        .with_attribute("quality", quality)
    }

    fn ids(granules: &[Arc<GranuleRecord>]) -> Vec<&str> {
        granules.iter().map(|g| g.id.as_str()).collect()
    }

    #[test]
    fn test_parse_sort_clause() {
        let keys = SortBy::parse_clause("ingestion D, quality A,name").unwrap();
        assert_eq!(
            keys,
            vec![SortBy::desc("ingestion"), SortBy::asc("quality"), SortBy::asc("name")]
        );
        assert!(SortBy::parse_clause("a X").is_err());
        assert!(SortBy::parse_clause("a A extra").is_err());
        assert_eq!(SortBy::parse_clause("").unwrap(), vec![]);
    }

    #[test]
    fn test_filter_and_collapses() {
        assert_eq!(GranuleFilter::and(vec![]), GranuleFilter::Include);
        assert_eq!(
            GranuleFilter::and(vec![GranuleFilter::Include, GranuleFilter::eq("a", 1i64)]),
            GranuleFilter::eq("a", 1i64)
        );
        assert_eq!(
            GranuleFilter::and(vec![GranuleFilter::eq("a", 1i64), GranuleFilter::Exclude]),
            GranuleFilter::Exclude
        );
    }

    #[tokio::test]
    async fn test_query_filters_sorts_and_limits() {
        let catalog = InMemoryCatalog::new(CrsCode::Epsg4326);
        catalog.insert(granule("a", 0.0, 2)).unwrap();
        catalog.insert(granule("b", 10.0, 1)).unwrap();
        catalog.insert(granule("c", 20.0, 2)).unwrap();
        catalog.insert(granule("d", 30.0, 3)).unwrap();

        let all = catalog.query(&CatalogQuery::default()).await.unwrap();
        assert_eq!(ids(&all), vec!["a", "b", "c", "d"]);

        let query = CatalogQuery {
            filter: GranuleFilter::And(vec![
                GranuleFilter::Intersects(BoundingBox::new(5.0, 0.0, 35.0, 10.0)),
                GranuleFilter::compare("quality", CompareOp::Ge, 2i64),
            ]),
            sort: vec![SortBy::desc("quality")],
            limit: None,
        };
        let hits = catalog.query(&query).await.unwrap();
        // a and c tie on quality and keep insertion order
        assert_eq!(ids(&hits), vec!["d", "a", "c"]);

        let limited = catalog
            .query(&CatalogQuery {
                limit: Some(2),
                ..query
            })
            .await
            .unwrap();
        assert_eq!(ids(&limited), vec!["d", "a"]);
    }

    #[tokio::test]
    async fn test_between_in_and_not() {
        let catalog = InMemoryCatalog::new(CrsCode::Epsg4326);
        for (i, q) in [1i64, 2, 3, 4].iter().enumerate() {
            catalog.insert(granule(&format!("g{i}"), i as f64 * 10.0, *q)).unwrap();
        }
        let between = GranuleFilter::Between {
            attribute: "quality".into(),
            low: 2i64.into(),
            high: AttributeValue::Float(3.5),
        };
        let hits = catalog
            .query(&CatalogQuery {
                filter: between,
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(ids(&hits), vec!["g1", "g2"]);

        let not_in = GranuleFilter::Not(Box::new(GranuleFilter::In {
            attribute: "quality".into(),
            values: vec![1i64.into(), 4i64.into()],
        }));
        let hits = catalog
            .query(&CatalogQuery {
                filter: not_in,
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(ids(&hits), vec!["g1", "g2"]);
    }

    #[tokio::test]
    async fn test_schema_and_summary() {
        let catalog = InMemoryCatalog::new(CrsCode::Epsg4326);
        assert!(catalog.summary().await.unwrap().is_none());
        catalog.insert(granule("a", 0.0, 1)).unwrap();
        catalog.insert(granule("b", 10.0, 1).with_attribute("sensor", "s2")).unwrap();

        let schema = catalog.schema();
        assert_eq!(schema.kind_of("quality"), Some(AttributeKind::Integer));
        assert_eq!(schema.kind_of("sensor"), Some(AttributeKind::Text));

        let summary = catalog.summary().await.unwrap().unwrap();
        assert_eq!(summary.bounds, BoundingBox::new(0.0, 0.0, 20.0, 10.0));
        assert_eq!(summary.finest_resolution, (1.0, 1.0));
        assert_eq!(summary.granule_count, 2);

        let conflicting = granule("c", 20.0, 1).with_attribute("sensor", 7i64);
        assert!(matches!(catalog.insert(conflicting), Err(MosaicError::Catalog(_))));
    }

    #[tokio::test]
    async fn test_foreign_granule_indexed_in_catalog_crs() {
        let catalog = InMemoryCatalog::new(CrsCode::Epsg4326);
        let merc = GranuleRecord::new(
            "m",
            "mem://m",
            CrsCode::Epsg3857,
            BoundingBox::new(0.0, 0.0, 1_113_194.9, 1_118_889.97),
            100,
            100,
        );
        catalog.insert(merc).unwrap();
        let hits = catalog
            .query(&CatalogQuery {
                filter: GranuleFilter::Intersects(BoundingBox::new(9.5, 9.5, 20.0, 20.0)),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
    }
}
