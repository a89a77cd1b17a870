//! Common test fixtures for mosaic tests.
//!
//! Extents, tile layouts and sidecar directories that show up across the
//! unit and integration tests.

use std::io;
use std::path::{Path, PathBuf};

/// Common bounding box definitions for testing, as (min_x, min_y, max_x, max_y).
pub mod bbox {
    /// A 4x4 degree square split into 2x2 tiles by [`super::tiles::TILE_2X2`]
    pub const UNIT_SQUARE_4: (f64, f64, f64, f64) = (0.0, 0.0, 4.0, 4.0);

    /// Far away from every other fixture
    pub const DISJOINT: (f64, f64, f64, f64) = (100.0, 50.0, 101.0, 51.0);
}

/// Tile layouts for building catalogs.
pub mod tiles {
    /// A regular layout of equally sized tiles over an extent.
    #[derive(Debug, Clone, Copy)]
    pub struct TileLayout {
        pub extent: (f64, f64, f64, f64),
        pub cols: usize,
        pub rows: usize,
        /// Pixels per tile along each axis
        pub tile_pixels: usize,
    }

    /// Four 2x2 degree tiles of 20x20 pixels over [`super::bbox::UNIT_SQUARE_4`].
    pub const TILE_2X2: TileLayout = TileLayout {
        extent: super::bbox::UNIT_SQUARE_4,
        cols: 2,
        rows: 2,
        tile_pixels: 20,
    };

    impl TileLayout {
        pub fn count(&self) -> usize {
            self.cols * self.rows
        }

        /// Extent of tile `(col, row)`, row 0 at the top.
        pub fn tile_bbox(&self, col: usize, row: usize) -> (f64, f64, f64, f64) {
            let (min_x, min_y, max_x, max_y) = self.extent;
            let w = (max_x - min_x) / self.cols as f64;
            let h = (max_y - min_y) / self.rows as f64;
            let top = max_y - h * row as f64;
            (min_x + w * col as f64, top - h, min_x + w * (col + 1) as f64, top)
        }

        /// All tile extents in row-major order.
        pub fn all(&self) -> Vec<(usize, (f64, f64, f64, f64))> {
            (0..self.rows)
                .flat_map(|row| (0..self.cols).map(move |col| (col, row)))
                .enumerate()
                .map(|(i, (col, row))| (i, self.tile_bbox(col, row)))
                .collect()
        }

        /// Native resolution of a single tile.
        pub fn resolution(&self) -> (f64, f64) {
            let (min_x, min_y, max_x, max_y) = self.extent;
            (
                (max_x - min_x) / (self.cols * self.tile_pixels) as f64,
                (max_y - min_y) / (self.rows * self.tile_pixels) as f64,
            )
        }
    }
}

/// Common CRS identifiers.
pub mod crs {
    /// WGS84 geographic
    pub const EPSG_4326: &str = "EPSG:4326";

    /// WMS 1.1.1 style (lon/lat order)
    pub const CRS_84: &str = "CRS:84";
}

/// Common time values for testing.
pub mod time {
    /// A fixed reference time for tests (2024-01-15T12:00:00Z)
    pub const REFERENCE_TIME: &str = "2024-01-15T12:00:00Z";

    /// The day after [`REFERENCE_TIME`]
    pub const NEXT_DAY: &str = "2024-01-16T12:00:00Z";
}

/// A temporary directory holding granule files and their sidecars.
///
/// Sidecars are written next to a granule path as `<granule>.<suffix>`,
/// which is where footprint discovery looks for them.
pub struct SidecarDir {
    dir: tempfile::TempDir,
}

impl SidecarDir {
    pub fn new() -> io::Result<Self> {
        Ok(Self {
            dir: tempfile::tempdir()?,
        })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Path of a (possibly not yet existing) granule file in the directory.
    pub fn granule_path(&self, file_name: &str) -> PathBuf {
        self.dir.path().join(file_name)
    }

    /// Writes `contents` to `<granule>.<suffix>`, e.g. `tile.tif.geojson`.
    pub fn write_sidecar(&self, granule: &str, suffix: &str, contents: &[u8]) -> io::Result<PathBuf> {
        let path = self.dir.path().join(format!("{granule}.{suffix}"));
        std::fs::write(&path, contents)?;
        Ok(path)
    }
}

/// GeoJSON text for a single rectangular polygon.
pub fn rectangle_geojson(bbox: (f64, f64, f64, f64)) -> String {
    let (x0, y0, x1, y1) = bbox;
    format!(
        r#"{{"type":"Polygon","coordinates":[[[{x0},{y0}],[{x1},{y0}],[{x1},{y1}],[{x0},{y1}],[{x0},{y0}]]]}}"#
    )
}
