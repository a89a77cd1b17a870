//! Catalog query for the granules a request touches.

use std::sync::Arc;
use tracing::debug;

use projection::{transform_bbox, DEFAULT_DENSIFY};

use crate::catalog::{CatalogQuery, GranuleCatalog, GranuleFilter};
use crate::error::Result;
use crate::granule::GranuleRecord;
use crate::request::MosaicRequest;
use crate::spatial::SpatialContext;

pub struct GranuleSelector<'a> {
    catalog: &'a dyn GranuleCatalog,
}

impl<'a> GranuleSelector<'a> {
    pub fn new(catalog: &'a dyn GranuleCatalog) -> Self {
        Self { catalog }
    }

    /// The catalog query for a request: spatial intersection with the
    /// computed box (in catalog CRS) AND the request filter.
    pub fn query_for(&self, request: &MosaicRequest, ctx: &SpatialContext) -> Result<CatalogQuery> {
        let catalog_crs = self.catalog.schema().crs;
        let area = transform_bbox(ctx.crs, catalog_crs, &ctx.computed_bbox, DEFAULT_DENSIFY)?;
        Ok(CatalogQuery {
            filter: GranuleFilter::and(vec![GranuleFilter::Intersects(area), request.filter.clone()]),
            sort: request.sort.clone(),
            limit: request.max_granules,
        })
    }

    /// Matching granules in sort order, capped at the request limit.
    pub async fn select(&self, request: &MosaicRequest, ctx: &SpatialContext) -> Result<Vec<Arc<GranuleRecord>>> {
        let query = self.query_for(request, ctx)?;
        let granules = self.catalog.query(&query).await?;
        debug!(
            selected = granules.len(),
            limit = ?query.limit,
            sort_keys = query.sort.len(),
            "Selected granules"
        );
        Ok(granules)
    }
}
