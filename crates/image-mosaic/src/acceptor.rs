//! Granule acceptors: which selected granules take part in a mosaic and
//! which composition group each one lands in.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use mosaic_common::CrsCode;
use projection::is_identity;

use crate::granule::GranuleRecord;
use crate::spatial::CoverageDescriptor;

/// Decides whether a granule is usable and how it is grouped.
///
/// Granules with equal group keys are composed into one sub-mosaic on a grid
/// in that CRS.
pub trait GranuleAcceptor: Send + Sync + fmt::Debug {
    /// Registry name.
    fn name(&self) -> &'static str;

    fn accepts(&self, granule: &GranuleRecord, coverage: &CoverageDescriptor) -> bool;

    fn group_key(&self, granule: &GranuleRecord, coverage: &CoverageDescriptor) -> CrsCode;
}

/// Single group in the coverage CRS. Granules in any other CRS are rejected.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultAcceptor;

impl GranuleAcceptor for DefaultAcceptor {
    fn name(&self) -> &'static str {
        "default"
    }

    fn accepts(&self, granule: &GranuleRecord, coverage: &CoverageDescriptor) -> bool {
        is_identity(granule.crs, coverage.crs)
    }

    fn group_key(&self, _granule: &GranuleRecord, coverage: &CoverageDescriptor) -> CrsCode {
        coverage.crs
    }
}

/// One group per native CRS.
#[derive(Debug, Clone, Copy, Default)]
pub struct HeterogeneousCrsAcceptor;

impl GranuleAcceptor for HeterogeneousCrsAcceptor {
    fn name(&self) -> &'static str {
        "heterogeneous_crs"
    }

    fn accepts(&self, _granule: &GranuleRecord, _coverage: &CoverageDescriptor) -> bool {
        true
    }

    fn group_key(&self, granule: &GranuleRecord, coverage: &CoverageDescriptor) -> CrsCode {
        // Coordinate-identical CRSs share the coverage group.
        if is_identity(granule.crs, coverage.crs) {
            coverage.crs
        } else {
            granule.crs
        }
    }
}

// ============================================================================
// Registry
// ============================================================================

/// Acceptors keyed by name.
#[derive(Debug, Clone, Default)]
pub struct AcceptorRegistry {
    acceptors: HashMap<String, Arc<dyn GranuleAcceptor>>,
}

impl AcceptorRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding `default` and `heterogeneous_crs`.
    pub fn with_builtins() -> Self {
        Self::new()
            .register(Arc::new(DefaultAcceptor))
            .register(Arc::new(HeterogeneousCrsAcceptor))
    }

    /// Add an acceptor under its own name, replacing any previous one.
    pub fn register(mut self, acceptor: Arc<dyn GranuleAcceptor>) -> Self {
        self.acceptors.insert(acceptor.name().to_string(), acceptor);
        self
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn GranuleAcceptor>> {
        self.acceptors.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.acceptors.contains_key(name)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.acceptors.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}
