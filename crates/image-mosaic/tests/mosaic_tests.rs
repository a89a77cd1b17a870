//! End-to-end reads through the mosaic assembler.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{bbox, grid, kvp, value_at, Fixture, PanickingDecoder, SlowDecoder};
use image_mosaic::{
    CrsCode, EmptyReason, ExcessGranulePolicy, FootprintBehavior, GranuleFilter, GranuleId, MergeBehavior,
    MosaicConfig, MosaicError, MosaicOutcome, Raster, ReadParams, SortBy,
};
use mosaic_common::parse_iso8601;
use test_utils::time::{NEXT_DAY, REFERENCE_TIME};
use test_utils::{bbox as extents, crs, tiles::TILE_2X2};

fn ids(sources: &[GranuleId]) -> Vec<&str> {
    sources.iter().map(GranuleId::as_str).collect()
}

/// Four adjacent tiles; tile `i` holds `10 * (i + 1)` and has rank `i`.
fn quad_fixture() -> Fixture {
    let fixture = Fixture::new(CrsCode::Epsg4326);
    for (i, extent) in TILE_2X2.all() {
        let record = fixture
            .prepare(
                &format!("t{i}"),
                CrsCode::Epsg4326,
                extent,
                Raster::new(
                    TILE_2X2.tile_pixels,
                    TILE_2X2.tile_pixels,
                    vec![test_utils::create_constant_grid(
                        TILE_2X2.tile_pixels,
                        TILE_2X2.tile_pixels,
                        10.0 * (i + 1) as f32,
                    )],
                ),
            )
            .with_attribute("rank", i as i64);
        fixture.insert(record);
    }
    fixture
}

/// Two granules over the same 2x2 degree square: "a" (value 1, rank 0) and
/// "b" (value 2, rank 1).
fn overlapping_fixture() -> Fixture {
    let fixture = Fixture::new(CrsCode::Epsg4326);
    for (id, value, rank) in [("a", 1.0, 0i64), ("b", 2.0, 1)] {
        let record = fixture
            .prepare(
                id,
                CrsCode::Epsg4326,
                (0.0, 0.0, 2.0, 2.0),
                Raster::new(20, 20, vec![vec![value; 400]]),
            )
            .with_attribute("rank", rank);
        fixture.insert(record);
    }
    fixture
}

// ============================================================================
// Tiling and ordering
// ============================================================================

#[tokio::test]
async fn test_tiles_cover_request_in_sort_order() {
    let fixture = quad_fixture();
    let assembler = fixture.assembler(MosaicConfig::default()).await;

    let params = ReadParams {
        sort_by: Some(vec![SortBy::desc("rank")]),
        ..Default::default()
    };
    let coverage = assembler.read(params).await.unwrap().into_coverage().unwrap();

    assert_eq!((coverage.raster.width, coverage.raster.height), (40, 40));
    assert_eq!(ids(&coverage.sources), vec!["t3", "t2", "t1", "t0"]);
    assert_eq!(coverage.provenance, "t3,t2,t1,t0");
    assert_eq!(coverage.skipped_granules, 0);
    assert!(!coverage.needs_reprojection);

    // Row 0 of the layout is the northern half.
    assert_eq!(value_at(&coverage.raster, 5, 5), 10.0);
    assert_eq!(value_at(&coverage.raster, 35, 5), 20.0);
    assert_eq!(value_at(&coverage.raster, 5, 35), 30.0);
    assert_eq!(value_at(&coverage.raster, 35, 35), 40.0);
}

#[tokio::test]
async fn test_first_sorted_granule_is_on_top() {
    let fixture = overlapping_fixture();
    let assembler = fixture.assembler(MosaicConfig::default()).await;

    let ascending = ReadParams::from_kvp(&kvp(&[("SORTING", "rank A")])).unwrap();
    let coverage = assembler.read(ascending).await.unwrap().into_coverage().unwrap();
    assert_eq!(ids(&coverage.sources), vec!["a", "b"]);
    assert!(coverage.raster.bands[0].iter().all(|&v| v == 1.0));

    let descending = ReadParams::from_kvp(&kvp(&[("SORTING", "rank D")])).unwrap();
    let coverage = assembler.read(descending).await.unwrap().into_coverage().unwrap();
    assert_eq!(ids(&coverage.sources), vec!["b", "a"]);
    assert!(coverage.raster.bands[0].iter().all(|&v| v == 2.0));
}

#[tokio::test]
async fn test_max_granules_caps_selection() {
    let fixture = quad_fixture();
    let assembler = fixture.assembler(MosaicConfig::default()).await;
    let params = ReadParams {
        sort_by: Some(vec![SortBy::asc("rank")]),
        max_granules: Some(2),
        background_values: Some(vec![-1.0]),
        ..Default::default()
    };
    let coverage = assembler.read(params).await.unwrap().into_coverage().unwrap();
    assert_eq!(ids(&coverage.sources), vec!["t0", "t1"]);
    assert_eq!(value_at(&coverage.raster, 5, 35), -1.0);
}

// ============================================================================
// Empty results
// ============================================================================

#[tokio::test]
async fn test_disjoint_request_is_empty() {
    let fixture = quad_fixture();
    let assembler = fixture.assembler(MosaicConfig::default()).await;
    let params = ReadParams {
        grid_geometry: Some(grid(CrsCode::Epsg4326, extents::DISJOINT, 10, 10)),
        ..Default::default()
    };
    let outcome = assembler.read(params).await.unwrap();
    assert_eq!(outcome, MosaicOutcome::Empty(EmptyReason::NoIntersection));
    assert_eq!(fixture.decoder.decode_count(), 0);
}

#[tokio::test]
async fn test_filter_matching_nothing_is_empty() {
    let fixture = quad_fixture();
    let assembler = fixture.assembler(MosaicConfig::default()).await;
    let params = ReadParams {
        filter: Some(GranuleFilter::eq("rank", 99i64)),
        ..Default::default()
    };
    let outcome = assembler.read(params).await.unwrap();
    assert_eq!(outcome, MosaicOutcome::Empty(EmptyReason::NoGranulesSelected));
}

#[tokio::test]
async fn test_all_granules_unavailable_is_empty() {
    let fixture = overlapping_fixture();
    fixture.decoder.fail("mem://a");
    fixture.decoder.fail("mem://b");
    let assembler = fixture.assembler(MosaicConfig::default()).await;
    let outcome = assembler.read(ReadParams::default()).await.unwrap();
    assert_eq!(outcome, MosaicOutcome::Empty(EmptyReason::NoSurvivingTiles));
}

// ============================================================================
// Failure handling
// ============================================================================

#[tokio::test]
async fn test_unavailable_granule_is_skipped() {
    let fixture = quad_fixture();
    fixture.decoder.fail("mem://t1");
    let assembler = fixture.assembler(MosaicConfig::default()).await;

    let params = ReadParams {
        background_values: Some(vec![-1.0]),
        ..Default::default()
    };
    let coverage = assembler.read(params).await.unwrap().into_coverage().unwrap();
    assert_eq!(coverage.skipped_granules, 1);
    assert_eq!(ids(&coverage.sources), vec!["t0", "t2", "t3"]);
    assert_eq!(value_at(&coverage.raster, 35, 5), -1.0);
    assert_eq!(value_at(&coverage.raster, 5, 5), 10.0);
}

#[tokio::test]
async fn test_band_selection_out_of_range_fails() {
    let fixture = quad_fixture();
    let assembler = fixture.assembler(MosaicConfig::default()).await;
    let params = ReadParams::from_kvp(&kvp(&[("BANDS", "0,3")])).unwrap();
    let err = assembler.read(params).await.unwrap_err();
    assert!(matches!(err, MosaicError::InvalidRequest { ref param, .. } if param == "BANDS"));
}

// ============================================================================
// Parallel decoding
// ============================================================================

/// 50 overlapping 1.5 degree tiles on a 1 degree stride.
fn many_tiles() -> (Fixture, MosaicConfig) {
    let fixture = Fixture::new(CrsCode::Epsg4326);
    for i in 0..50usize {
        let (x, y) = ((i % 10) as f64, (i / 10) as f64);
        // create_test_grid encodes the source pixel; the offset encodes the granule.
        let band: Vec<f32> = test_utils::create_test_grid(12, 12)
            .into_iter()
            .map(|v| v + i as f32 * 0.5)
            .collect();
        let base = Raster::new(12, 12, vec![band]);
        let record = fixture
            .prepare(&format!("g{i:02}"), CrsCode::Epsg4326, (x, y, x + 1.5, y + 1.5), base)
            .with_attribute("rank", i as i64);
        fixture.insert(record);
    }
    let config = MosaicConfig {
        extent: Some(bbox((0.0, 0.0, 10.5, 5.5))),
        native_resolution: Some((0.125, 0.125)),
        max_decode_tasks: 4,
        ..Default::default()
    };
    (fixture, config)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_parallel_and_sequential_reads_match() {
    let (fixture, config) = many_tiles();
    let assembler = fixture.assembler(config).await;

    let read = |multithreading: bool| ReadParams {
        sort_by: Some(vec![SortBy::desc("rank")]),
        multithreading: Some(multithreading),
        ..Default::default()
    };

    let sequential = assembler.read(read(false)).await.unwrap();
    let parallel = assembler.read(read(true)).await.unwrap();
    assert_eq!(sequential, parallel);

    let coverage = parallel.into_coverage().unwrap();
    assert_eq!(coverage.sources.len(), 50);
    assert_eq!(coverage.sources[0].as_str(), "g49");
    assert_eq!(coverage.sources[49].as_str(), "g00");
    assert_eq!(fixture.decoder.decode_count(), 100);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_parallel_read_keeps_sort_order_in_overlaps() {
    let (fixture, config) = many_tiles();
    let assembler = fixture.assembler(config).await;

    let params = ReadParams {
        sort_by: Some(vec![SortBy::asc("rank")]),
        multithreading: Some(true),
        ..Default::default()
    };
    let coverage = assembler.read(params).await.unwrap().into_coverage().unwrap();
    // Output pixel (10, 43) is centred on (1.3125, 0.0625), inside g00 and g01.
    // g00 sorts first, so its pixel (10, 11) shows: 10 * 1000 + 11.
    assert_eq!(value_at(&coverage.raster, 10, 43), 10_011.0);
    // (20, 43) is centred on (2.5625, 0.0625), past the east edge of g01,
    // so only g02 (offset 1.0) contributes, from its pixel (4, 11).
    assert_eq!(value_at(&coverage.raster, 20, 43), 4_012.0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_panicking_decode_task_is_counted_as_skipped() {
    let fixture = quad_fixture();
    let decoder = Arc::new(PanickingDecoder {
        inner: fixture.decoder.clone(),
        location: "mem://t1".into(),
    });
    let assembler = fixture.assembler_with(MosaicConfig::default(), decoder).await;

    let params = ReadParams {
        multithreading: Some(true),
        background_values: Some(vec![-1.0]),
        ..Default::default()
    };
    let coverage = assembler.read(params).await.unwrap().into_coverage().unwrap();
    assert_eq!(coverage.skipped_granules, 1);
    assert_eq!(ids(&coverage.sources), vec!["t0", "t2", "t3"]);
    assert_eq!(coverage.provenance, "t0,t2,t3");
    assert_eq!(value_at(&coverage.raster, 35, 5), -1.0);
    assert_eq!(value_at(&coverage.raster, 5, 5), 10.0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_abandoned_read_lets_decode_tasks_finish() {
    let fixture = quad_fixture();
    let decoder = Arc::new(SlowDecoder::new(fixture.decoder.clone(), Duration::from_millis(300)));
    let config = MosaicConfig {
        max_decode_tasks: 2,
        ..Default::default()
    };
    let assembler = fixture.assembler_with(config, decoder.clone()).await;

    let params = ReadParams {
        multithreading: Some(true),
        ..Default::default()
    };
    let abandoned = tokio::time::timeout(Duration::from_millis(100), assembler.read(params)).await;
    assert!(abandoned.is_err(), "read should still be decoding");
    assert_eq!(decoder.finished(), 0);

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while decoder.finished() < 4 && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(decoder.finished(), 4);
    assert_eq!(fixture.decoder.decode_count(), 4);
}

// ============================================================================
// Excess granule removal
// ============================================================================

/// "big" covers the whole coverage; "small" sits inside it.
fn nested_fixture() -> Fixture {
    let fixture = Fixture::new(CrsCode::Epsg4326);
    let big = fixture
        .prepare(
            "big",
            CrsCode::Epsg4326,
            (0.0, 0.0, 4.0, 4.0),
            Raster::new(40, 40, vec![vec![1.0; 1600]]),
        )
        .with_attribute("rank", 0i64);
    let small = fixture
        .prepare(
            "small",
            CrsCode::Epsg4326,
            (1.0, 1.0, 3.0, 3.0),
            Raster::new(20, 20, vec![vec![2.0; 400]]),
        )
        .with_attribute("rank", 1i64);
    fixture.insert(big);
    fixture.insert(small);
    fixture
}

#[tokio::test]
async fn test_excess_granule_removal_depends_on_sort_order() {
    let fixture = nested_fixture();
    let assembler = fixture.assembler(MosaicConfig::default()).await;

    let params = |sort: SortBy| ReadParams {
        sort_by: Some(vec![sort]),
        footprint_behavior: Some(FootprintBehavior::Cut),
        excess_granule_removal: Some(ExcessGranulePolicy::Roi),
        ..Default::default()
    };

    let coverage = assembler
        .read(params(SortBy::asc("rank")))
        .await
        .unwrap()
        .into_coverage()
        .unwrap();
    assert_eq!(ids(&coverage.sources), vec!["big"]);
    assert_eq!(coverage.removed_granules, 1);
    assert!(coverage.raster.alpha.is_none());
    assert!(coverage.raster.bands[0].iter().all(|&v| v == 1.0));

    let coverage = assembler
        .read(params(SortBy::desc("rank")))
        .await
        .unwrap()
        .into_coverage()
        .unwrap();
    assert_eq!(ids(&coverage.sources), vec!["small", "big"]);
    assert_eq!(coverage.removed_granules, 0);
    assert_eq!(value_at(&coverage.raster, 20, 20), 2.0);
    assert_eq!(value_at(&coverage.raster, 5, 5), 1.0);
}

#[tokio::test]
async fn test_excess_granule_removal_needs_footprints() {
    let fixture = nested_fixture();
    let assembler = fixture.assembler(MosaicConfig::default()).await;
    let params = ReadParams {
        sort_by: Some(vec![SortBy::asc("rank")]),
        excess_granule_removal: Some(ExcessGranulePolicy::Roi),
        ..Default::default()
    };
    let coverage = assembler.read(params).await.unwrap().into_coverage().unwrap();
    assert_eq!(coverage.removed_granules, 0);
    assert_eq!(coverage.sources.len(), 2);
}

// ============================================================================
// Merge behaviors
// ============================================================================

#[tokio::test]
async fn test_stack_concatenates_bands_in_sort_order() {
    let fixture = Fixture::new(CrsCode::Epsg4326);
    let first = fixture
        .prepare(
            "rgb",
            CrsCode::Epsg4326,
            (0.0, 0.0, 2.0, 2.0),
            Raster::new(20, 20, test_utils::create_band_stack(20, 20, 2, 1.0)),
        )
        .with_attribute("rank", 0i64);
    let second = fixture
        .prepare(
            "nir",
            CrsCode::Epsg4326,
            (0.0, 0.0, 2.0, 2.0),
            Raster::new(20, 20, vec![vec![3.0; 400]]),
        )
        .with_attribute("rank", 1i64);
    fixture.insert(first);
    fixture.insert(second);
    let assembler = fixture.assembler(MosaicConfig::default()).await;

    let params = ReadParams {
        sort_by: Some(vec![SortBy::asc("rank")]),
        merge_behavior: Some(MergeBehavior::Stack),
        ..Default::default()
    };
    let coverage = assembler.read(params).await.unwrap().into_coverage().unwrap();
    assert_eq!(coverage.raster.num_bands(), 3);
    assert_eq!(coverage.raster.get(0, 7, 7), Some(1.0));
    assert_eq!(coverage.raster.get(1, 7, 7), Some(2.0));
    assert_eq!(coverage.raster.get(2, 7, 7), Some(3.0));
    assert_eq!(ids(&coverage.sources), vec!["rgb", "nir"]);
}

#[tokio::test]
async fn test_stack_rejects_misaligned_tiles() {
    let fixture = quad_fixture();
    let assembler = fixture.assembler(MosaicConfig::default()).await;
    let params = ReadParams {
        merge_behavior: Some(MergeBehavior::Stack),
        ..Default::default()
    };
    let err = assembler.read(params).await.unwrap_err();
    assert!(matches!(err, MosaicError::IncompatibleStack { .. }));
}

#[tokio::test]
async fn test_band_count_mismatch_fails() {
    let fixture = Fixture::new(CrsCode::Epsg4326);
    fixture.add_raster(
        "one",
        CrsCode::Epsg4326,
        (0.0, 0.0, 2.0, 2.0),
        Raster::new(20, 20, vec![vec![1.0; 400]]),
    );
    fixture.add_raster(
        "two",
        CrsCode::Epsg4326,
        (2.0, 0.0, 4.0, 2.0),
        Raster::new(20, 20, test_utils::create_band_stack(20, 20, 2, 5.0)),
    );
    let assembler = fixture.assembler(MosaicConfig::default()).await;
    let err = assembler.read(ReadParams::default()).await.unwrap_err();
    assert!(matches!(
        err,
        MosaicError::IncompatibleBands {
            expected: 1,
            found: 2,
            ..
        }
    ));
}

// ============================================================================
// Key-value requests
// ============================================================================

#[tokio::test]
async fn test_kvp_read_uses_overview() {
    let fixture = overlapping_fixture();
    let assembler = fixture.assembler(MosaicConfig::default()).await;

    let query = kvp(&[
        ("crs", "EPSG:4326"),
        ("bbox", "0,0,2,2"),
        ("width", "10"),
        ("height", "10"),
        ("sorting", "rank D"),
        ("overview_policy", "QUALITY"),
        ("max_allowed_tiles", "1"),
    ]);
    let coverage = assembler
        .read(ReadParams::from_kvp(&query).unwrap())
        .await
        .unwrap()
        .into_coverage()
        .unwrap();

    assert_eq!((coverage.raster.width, coverage.raster.height), (10, 10));
    assert_eq!(coverage.crs, CrsCode::Epsg4326);
    assert_eq!(coverage.bbox, bbox((0.0, 0.0, 2.0, 2.0)));
    assert_eq!(ids(&coverage.sources), vec!["b"]);
    assert!(coverage.raster.bands[0].iter().all(|&v| v == 2.0));
    assert_eq!(fixture.decoder.decode_count(), 1);
}

#[tokio::test]
async fn test_kvp_rejects_invalid_values() {
    let fixture = overlapping_fixture();
    let assembler = fixture.assembler(MosaicConfig::default()).await;

    let zero_tiles = ReadParams::from_kvp(&kvp(&[("MAX_ALLOWED_TILES", "0")])).unwrap();
    assert!(matches!(
        assembler.read(zero_tiles).await,
        Err(MosaicError::InvalidRequest { .. })
    ));

    let unknown_sort = ReadParams::from_kvp(&kvp(&[("SORTING", "missing D")])).unwrap();
    assert!(matches!(
        assembler.read(unknown_sort).await,
        Err(MosaicError::InvalidRequest { ref param, .. }) if param == "SORTING"
    ));

    assert!(ReadParams::from_kvp(&kvp(&[("BBOX", "0,0,1,1")])).is_err());
}

#[tokio::test]
async fn test_count_granules_matches_read() {
    let fixture = quad_fixture();
    let assembler = fixture.assembler(MosaicConfig::default()).await;
    let params = ReadParams {
        grid_geometry: Some(grid(CrsCode::Epsg4326, (0.5, 2.5, 1.5, 3.5), 10, 10)),
        ..Default::default()
    };
    assert_eq!(assembler.count_granules(params.clone()).await.unwrap(), 1);
    let coverage = assembler.read(params).await.unwrap().into_coverage().unwrap();
    assert_eq!(ids(&coverage.sources), vec!["t0"]);
}

// ============================================================================
// Dimensions
// ============================================================================

/// Two full-extent granules a day apart holding 1 and 2.
fn time_series_fixture() -> Fixture {
    let fixture = Fixture::new(CrsCode::Epsg4326);
    for (id, value, time) in [("today", 1.0, REFERENCE_TIME), ("tomorrow", 2.0, NEXT_DAY)] {
        let base = Raster::new(20, 20, vec![test_utils::create_constant_grid(20, 20, value)]);
        let record = fixture
            .prepare(id, CrsCode::Epsg4326, extents::UNIT_SQUARE_4, base)
            .with_attribute("time", parse_iso8601(time).unwrap());
        fixture.insert(record);
    }
    fixture
}

#[tokio::test]
async fn test_time_parameter_selects_slice() {
    let fixture = time_series_fixture();
    let config = MosaicConfig {
        time_attribute: Some("time".into()),
        ..Default::default()
    };
    let assembler = fixture.assembler(config).await;

    let query = |crs: &str, time: &str| {
        let query = kvp(&[
            ("CRS", crs),
            ("BBOX", "0,0,4,4"),
            ("WIDTH", "20"),
            ("HEIGHT", "20"),
            ("TIME", time),
        ]);
        ReadParams::from_kvp(&query).unwrap()
    };

    let coverage = assembler
        .read(query(crs::EPSG_4326, NEXT_DAY))
        .await
        .unwrap()
        .into_coverage()
        .unwrap();
    assert_eq!(ids(&coverage.sources), vec!["tomorrow"]);
    assert!(coverage.raster.bands[0].iter().all(|&v| v == 2.0));

    let coverage = assembler
        .read(query(crs::CRS_84, REFERENCE_TIME))
        .await
        .unwrap()
        .into_coverage()
        .unwrap();
    assert_eq!(ids(&coverage.sources), vec!["today"]);

    let outcome = assembler.read(query(crs::EPSG_4326, "2024-02-01T00:00:00Z")).await.unwrap();
    assert_eq!(outcome, MosaicOutcome::Empty(EmptyReason::NoGranulesSelected));
}

#[tokio::test]
async fn test_time_without_time_attribute_is_rejected() {
    let fixture = time_series_fixture();
    let assembler = fixture.assembler(MosaicConfig::default()).await;
    let params = ReadParams::from_kvp(&kvp(&[("TIME", REFERENCE_TIME)])).unwrap();
    assert!(matches!(
        assembler.read(params).await,
        Err(MosaicError::InvalidRequest { ref param, .. }) if param == "TIME"
    ));
}
