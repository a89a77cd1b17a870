//! Coordinate reference system transformations.
//!
//! Implements the map projections behind the supported CRS codes from
//! scratch, without external dependencies.

pub mod albers;
pub mod mercator;
pub mod polar;
pub mod transform;

pub use albers::AlbersEqualArea;
pub use polar::{PolarStereographic, Pole};
pub use transform::{
    from_geographic, is_identity, to_geographic, transform_bbox, transform_point,
    ProjectionError, DEFAULT_DENSIFY,
};
