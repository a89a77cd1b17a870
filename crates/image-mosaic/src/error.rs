//! Error types for mosaic assembly.

use mosaic_common::CrsCode;
use projection::ProjectionError;
use thiserror::Error;

/// Errors that can occur while assembling a mosaic.
///
/// An empty result is not an error; see [`crate::MosaicOutcome::Empty`].
#[derive(Error, Debug, Clone, PartialEq)]
pub enum MosaicError {
    /// A request parameter is malformed or refers to something that does not exist.
    #[error("invalid request parameter '{param}': {message}")]
    InvalidRequest { param: String, message: String },

    /// One granule's backing resource could not be opened or decoded.
    #[error("granule '{granule}' unavailable: {message}")]
    GranuleUnavailable { granule: String, message: String },

    /// STACK merge over tiles that do not share a pixel grid.
    #[error("cannot stack tiles in group {group}: {message}")]
    IncompatibleStack { group: String, message: String },

    /// Tiles in one group disagree on the number of bands.
    #[error("incompatible band layout in group {group}: expected {expected} bands, found {found}")]
    IncompatibleBands {
        group: String,
        expected: usize,
        found: usize,
    },

    /// A raster or envelope cannot be carried from one CRS to another.
    #[error("cannot reproject from {from} to {to}: {message}")]
    ReprojectionFailure {
        from: CrsCode,
        to: CrsCode,
        message: String,
    },

    /// The granule catalog failed to answer a query.
    #[error("catalog error: {0}")]
    Catalog(String),

    /// A granule footprint could not be loaded.
    #[error("footprint of granule '{granule}' unavailable: {message}")]
    Footprint { granule: String, message: String },

    /// The mosaic configuration is invalid.
    #[error("configuration error: {0}")]
    Config(String),
}

impl MosaicError {
    /// Create an InvalidRequest error.
    pub fn invalid_request(param: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidRequest {
            param: param.into(),
            message: message.into(),
        }
    }

    /// Create a GranuleUnavailable error.
    pub fn granule_unavailable(granule: impl Into<String>, message: impl Into<String>) -> Self {
        Self::GranuleUnavailable {
            granule: granule.into(),
            message: message.into(),
        }
    }

    /// Create an IncompatibleStack error.
    pub fn incompatible_stack(group: CrsCode, message: impl Into<String>) -> Self {
        Self::IncompatibleStack {
            group: group.to_string(),
            message: message.into(),
        }
    }

    /// Create a Footprint error.
    pub fn footprint(granule: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Footprint {
            granule: granule.into(),
            message: message.into(),
        }
    }

    /// Per-granule failures that the pipeline skips instead of aborting.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::GranuleUnavailable { .. } | Self::Footprint { .. }
        )
    }
}

impl From<ProjectionError> for MosaicError {
    fn from(err: ProjectionError) -> Self {
        match &err {
            ProjectionError::OutOfDomain { from, to, .. }
            | ProjectionError::EnvelopeOutOfDomain { from, to, .. } => Self::ReprojectionFailure {
                from: *from,
                to: *to,
                message: err.to_string(),
            },
        }
    }
}

/// Result type for mosaic operations.
pub type Result<T> = std::result::Result<T, MosaicError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recoverable_variants() {
        assert!(MosaicError::granule_unavailable("g1", "missing").is_recoverable());
        assert!(MosaicError::footprint("g1", "bad geojson").is_recoverable());
        assert!(!MosaicError::invalid_request("WIDTH", "must be > 0").is_recoverable());
        assert!(!MosaicError::incompatible_stack(CrsCode::Epsg4326, "x").is_recoverable());
    }

    #[test]
    fn test_projection_error_conversion() {
        let err: MosaicError = ProjectionError::OutOfDomain {
            from: CrsCode::Epsg4326,
            to: CrsCode::Epsg3413,
            x: 0.0,
            y: -90.0,
        }
        .into();
        match err {
            MosaicError::ReprojectionFailure { from, to, .. } => {
                assert_eq!(from, CrsCode::Epsg4326);
                assert_eq!(to, CrsCode::Epsg3413);
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn test_message_names_parameter() {
        let err = MosaicError::invalid_request("SORTING", "unknown attribute 'foo'");
        assert_eq!(
            err.to_string(),
            "invalid request parameter 'SORTING': unknown attribute 'foo'"
        );
    }
}
