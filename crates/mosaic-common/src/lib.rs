//! Common types shared across the image-mosaic workspace.

pub mod bbox;
pub mod crs;
pub mod grid;
pub mod time;

pub use bbox::{BboxParseError, BoundingBox};
pub use crs::{CrsCode, CrsParseError};
pub use grid::{AffineTransform, GridGeometry, PixelRect};
pub use time::{parse_iso8601, TimeParseError, TimeSelection};
