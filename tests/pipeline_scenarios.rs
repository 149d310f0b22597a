//! Crate-level integration tests driving [`hydrotools::Pipeline`] end to
//! end over the concrete scenarios that don't already have an in-module
//! unit test covering the full multi-stage wiring (the single-pit case
//! lives in `src/lib.rs`, the nodata-adjacent breach case in
//! `src/stages/breach.rs`).

use std::sync::Arc;

use hydrotools::config::PipelineConfig;
use hydrotools::grid::DIR_UNDEFINED;
use hydrotools::progress::CountingProgress;
use hydrotools::raster::{AttributeValue, DType, MemRaster, MemVector};
use hydrotools::stages::accumulation::ACC_NODATA;
use hydrotools::stages::basins::{DrainagePoint, BASIN_NODATA};
use hydrotools::stages::flow_length::FLOW_LENGTH_NODATA;
use hydrotools::Pipeline;

/// Monotone 5x5 slope draining to the corner (scenario 2): every
/// non-corner cell points toward `(0,0)`, which keeps an isolated code-8
/// direction (it is the raster's single local minimum, not part of any
/// equal-elevation flat region) and must still accumulate the full cell
/// count as a terminal sink rather than error.
#[test]
fn monotone_slope_accumulates_to_total_cell_count_through_the_pipeline() {
    let rows: [&[f64]; 5] = [
        &[0.0, 1.0, 2.0, 3.0, 4.0],
        &[1.0, 2.0, 3.0, 4.0, 5.0],
        &[2.0, 3.0, 4.0, 5.0, 6.0],
        &[3.0, 4.0, 5.0, 6.0, 7.0],
        &[4.0, 5.0, 6.0, 7.0, 8.0],
    ];
    let dem = MemRaster::from_rows(&rows, DType::F32, -1.0);
    let (w, h) = (dem.w, dem.h);

    let mut cfg = PipelineConfig::default();
    cfg.chunk_size = 0;
    let pipeline = Pipeline::new(cfg);

    let raw_dirs = MemRaster::new(w, h, DType::U8, -1.0);
    pipeline.flow_direction(&dem, &raw_dirs).unwrap();
    assert_eq!(raw_dirs.get(0, 0), DIR_UNDEFINED as f64);

    let resolved_dirs = MemRaster::new(w, h, DType::U8, -1.0);
    pipeline.resolve_flats(&dem, &raw_dirs, &resolved_dirs).unwrap();
    // Flat resolution leaves (0,0) untouched: it has no equal-elevation
    // neighbor, so it was never part of a connected flat region.
    assert_eq!(resolved_dirs.get(0, 0), DIR_UNDEFINED as f64);

    let acc = MemRaster::new(w, h, DType::I64, ACC_NODATA);
    pipeline.accumulate(&resolved_dirs, &acc).unwrap();
    assert_eq!(acc.get(0, 0), 25.0);
}

/// 1x10 flat strip with lower neighbors at both ends (scenario 3): cells
/// closer to the west exit drain west, cells closer to the east exit drain
/// east, and no code-8 cells remain anywhere in the flat itself.
#[test]
fn long_flat_drains_toward_both_lower_ends_through_the_pipeline() {
    let rows: [&[f64]; 3] = [
        &[9.0, 9.0, 9.0, 9.0, 9.0, 9.0, 9.0, 9.0, 9.0, 9.0],
        &[8.0, 10.0, 10.0, 10.0, 10.0, 10.0, 10.0, 10.0, 10.0, 7.0],
        &[9.0, 9.0, 9.0, 9.0, 9.0, 9.0, 9.0, 9.0, 9.0, 9.0],
    ];
    let dem = MemRaster::from_rows(&rows, DType::F32, -1.0);
    let (w, h) = (dem.w, dem.h);

    let mut cfg = PipelineConfig::default();
    cfg.chunk_size = 0;
    let pipeline = Pipeline::new(cfg);

    let raw_dirs = MemRaster::new(w, h, DType::U8, -1.0);
    pipeline.flow_direction(&dem, &raw_dirs).unwrap();

    let resolved_dirs = MemRaster::new(w, h, DType::U8, -1.0);
    pipeline.resolve_flats(&dem, &raw_dirs, &resolved_dirs).unwrap();

    for col in 1..9 {
        assert_ne!(resolved_dirs.get(col, 1), DIR_UNDEFINED as f64, "flat cell at col {col} still undefined");
    }
    assert_eq!(resolved_dirs.get(1, 1), 4.0, "cell nearest the west exit should drain west");
    assert_eq!(resolved_dirs.get(8, 1), 0.0, "cell nearest the east exit should drain east");
}

/// Two 3x3 tiles' worth of a Y-shaped confluence (scenario 5): a single
/// interior cell is the confluence where two upstream branches merge.
/// Splitting the raster into tiles must not change the stitched stream
/// network: the same number of reaches and exactly one confluence node
/// must survive stitching, regardless of where the tile seam falls.
#[test]
fn y_confluence_survives_tiling_and_stitching() {
    let rows: [&[f64]; 3] = [&[9.0, 8.0, 9.0], &[9.0, 5.0, 6.0], &[9.0, 7.0, 9.0]];
    let dem = MemRaster::from_rows(&rows, DType::F32, -1.0);
    let (w, h) = (dem.w, dem.h);

    let run = |chunk_size: usize| -> (Vec<hydrotools::raster::VectorFeature>, Vec<hydrotools::raster::VectorFeature>) {
        let mut cfg = PipelineConfig::default();
        cfg.chunk_size = 0;
        cfg.threshold = 1;
        let pipeline = Pipeline::new(cfg.clone());

        let raw_dirs = MemRaster::new(w, h, DType::U8, -1.0);
        pipeline.flow_direction(&dem, &raw_dirs).unwrap();
        let resolved_dirs = MemRaster::new(w, h, DType::U8, -1.0);
        pipeline.resolve_flats(&dem, &raw_dirs, &resolved_dirs).unwrap();
        let acc = MemRaster::new(w, h, DType::I64, ACC_NODATA);
        pipeline.accumulate(&resolved_dirs, &acc).unwrap();

        cfg.chunk_size = chunk_size;
        let pipeline = Pipeline::new(cfg);
        let streams = MemVector::new("streams");
        let junctions = MemVector::new("junctions");
        pipeline.extract_streams(&resolved_dirs, &acc, &streams, &junctions).unwrap();
        (streams.into_features(), junctions.into_features())
    };

    let (streams_whole, junctions_whole) = run(0);
    let (streams_tiled, junctions_tiled) = run(2);

    assert_eq!(streams_whole.len(), streams_tiled.len());

    let confluence_count = |feats: &[hydrotools::raster::VectorFeature]| {
        feats
            .iter()
            .filter(|j| j.attributes.iter().any(|(k, v)| k == "type" && *v == AttributeValue::Text("confluence".into())))
            .count()
    };
    assert_eq!(confluence_count(&junctions_whole), 1);
    assert_eq!(confluence_count(&junctions_tiled), 1);
}

/// Two independent sub-watersheds draining opposite directions into a
/// shared nodata-coded outlet cell (scenario 6), each with its own
/// projected-meters drainage point: the per-basin farthest cell and the
/// emitted longest-path polyline must each stay within that basin.
#[test]
fn two_basin_flow_length_and_longest_path_through_the_pipeline() {
    // E, E, nodata-outlet, W, W
    let dir_rows: [&[f64]; 1] = [&[0.0, 0.0, 9.0, 4.0, 4.0]];
    let dirs = MemRaster::from_rows(&dir_rows, DType::U8, -1.0);
    let (w, h) = (dirs.w, dirs.h);

    let mut cfg = PipelineConfig::default();
    cfg.chunk_size = 0;
    cfg.all_basins = false;
    let progress = Arc::new(CountingProgress::default());
    let pipeline = Pipeline::new(cfg).with_progress(progress.clone());

    let raw_points = [
        DrainagePoint { col: 1, row: 0, basin_id: 1 },
        DrainagePoint { col: 3, row: 0, basin_id: 2 },
    ];
    let points = pipeline.snap_drainage_points(&raw_points, w, h, None).unwrap();
    assert_eq!(points.len(), 2);

    let basins = MemRaster::new(w, h, DType::I64, BASIN_NODATA);
    pipeline.label_basins(&dirs, &basins, &points).unwrap();
    assert_eq!(basins.get(0, 0), 1.0);
    assert_eq!(basins.get(1, 0), 1.0);
    assert_eq!(basins.get(3, 0), 2.0);
    assert_eq!(basins.get(4, 0), 2.0);

    let adjacency = pipeline.basin_adjacency(&basins, &dirs).unwrap();

    let length = MemRaster::new(w, h, DType::F32, FLOW_LENGTH_NODATA);
    let result = pipeline.flow_length(&dirs, &points, &length).unwrap();
    assert_eq!(result.max_by_basin[&1].col, 0);
    assert_eq!(result.max_by_basin[&1].length, 1.0);
    assert_eq!(result.max_by_basin[&2].col, 4);
    assert_eq!(result.max_by_basin[&2].length, 1.0);

    let paths = MemVector::new("longest_flow_path");
    pipeline.longest_flow_path(&dirs, &[1, 2], &adjacency, &result, &paths).unwrap();
    let feats = paths.into_features();
    assert_eq!(feats.len(), 2);

    let basin1_path = feats.iter().find(|f| f.attributes[0].1 == AttributeValue::Int(1)).unwrap();
    assert_eq!(basin1_path.geometry.first().copied().unwrap(), (0.5, 0.5));
    assert_eq!(basin1_path.geometry.last().copied().unwrap(), (2.5, 0.5));

    let basin2_path = feats.iter().find(|f| f.attributes[0].1 == AttributeValue::Int(2)).unwrap();
    assert_eq!(basin2_path.geometry.first().copied().unwrap(), (4.5, 0.5));
    assert_eq!(basin2_path.geometry.last().copied().unwrap(), (2.5, 0.5));

    assert!(progress.updates.load(std::sync::atomic::Ordering::Relaxed) > 0);
}
