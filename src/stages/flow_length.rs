//! Flow length & longest flow path (spec §4.9): a multi-source upstream
//! BFS from user drainage points assigns each cell a basin claim and an
//! upstream flow-length, relaxing (and re-queueing) whenever a cheaper
//! basin reaches a cell by a longer path than it was previously given;
//! [`longest_flow_path`] then walks the basin-adjacency graph built by
//! [`crate::stages::basins::basin_adjacency`] to trace, per outlet basin,
//! the single longest path anywhere in its upstream tree.
//!
//! Unlike fill/flat/accumulation/basins, this stage has no documented
//! tiled local/global split (spec §4.9 describes it purely as a BFS over
//! the whole flow graph) and is run here as a single in-memory pass over
//! the full raster, matching the crate's untiled (`chunk_size <= 1`) mode.

use std::collections::{HashMap, VecDeque};

use crate::config::PipelineConfig;
use crate::error::Result;
use crate::grid::{neighbors8, step, Grid, DIR_NODATA, DIR_UNDEFINED};
use crate::progress::ProgressSink;
use crate::raster::{is_nodata, AttributeValue, Crs, GeoTransform, RasterSink, RasterSource, VectorFeature, VectorSink};
use crate::stages::basins::DrainagePoint;
use crate::tile::CancellationToken;

pub const FLOW_LENGTH_NODATA: f64 = -1.0;

/// Mean Earth radius in map units matching the spec's spherical-Earth
/// simplification for geographic CRS (Open Question (c)).
const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Step distance between two cell centers: planar Euclidean for a
/// projected CRS, Haversine (spherical) for a geographic one, treating
/// cell-center coordinates as (longitude, latitude) degrees.
fn step_distance(crs: Crs, a: (f64, f64), b: (f64, f64)) -> f64 {
    if crs.is_projected {
        let dx = b.0 - a.0;
        let dy = b.1 - a.1;
        (dx * dx + dy * dy).sqrt()
    } else {
        let (lon1, lat1) = (a.0.to_radians(), a.1.to_radians());
        let (lon2, lat2) = (b.0.to_radians(), b.1.to_radians());
        let dlat = lat2 - lat1;
        let dlon = lon2 - lon1;
        let h = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);
        2.0 * EARTH_RADIUS_M * h.sqrt().asin()
    }
}

/// Per-basin running maximum: the farthest-upstream cell claimed so far
/// and its length.
#[derive(Clone, Copy, Debug)]
pub struct BasinMax {
    pub col: usize,
    pub row: usize,
    pub length: f64,
}

pub struct FlowLengthResult {
    /// Per-basin-id farthest upstream cell and its length.
    pub max_by_basin: HashMap<i64, BasinMax>,
}

/// Runs the upstream multi-source BFS end to end, writing the flow-length
/// raster and returning the per-basin maxima used by [`longest_flow_path`].
pub fn flow_length(
    dir_source: &dyn RasterSource,
    drainage_points: &[DrainagePoint],
    length_sink: &dyn RasterSink,
    _cfg: &PipelineConfig,
    progress: &dyn ProgressSink,
    cancel: &CancellationToken,
) -> Result<FlowLengthResult> {
    let w = dir_source.width();
    let h = dir_source.height();
    let gt = dir_source.geotransform();
    let crs = dir_source.crs();
    let dir_nodata = dir_source.nodata();

    tracing::info!(stage = "flow_length", drainage_points = drainage_points.len(), "computing upstream flow length");

    let dirs_flat = dir_source.read_window(0, 0, w, h)?;
    let dirs = Grid { data: dirs_flat, w, h };

    let downstream = |x: usize, y: usize| -> Option<(usize, usize)> {
        let code = dirs.get(x, y);
        if is_nodata(code, dir_nodata) || code == DIR_NODATA as f64 || code == DIR_UNDEFINED as f64 {
            return None;
        }
        step(x, y, code as u8, w, h)
    };

    let mut length = Grid::filled(w, h, FLOW_LENGTH_NODATA);
    let mut basin_of: Grid<i64> = Grid::new(w, h);
    let mut queue: VecDeque<(usize, usize)> = VecDeque::new();
    let mut max_by_basin: HashMap<i64, BasinMax> = HashMap::new();

    for dp in drainage_points {
        if dp.col >= w || dp.row >= h {
            continue;
        }
        length.set(dp.col, dp.row, 0.0);
        basin_of.set(dp.col, dp.row, dp.basin_id);
        max_by_basin.insert(dp.basin_id, BasinMax { col: dp.col, row: dp.row, length: 0.0 });
        queue.push_back((dp.col, dp.row));
    }

    while let Some((cx, cy)) = queue.pop_front() {
        cancel.check()?;
        let l_c = length.get(cx, cy);
        let basin = basin_of.get(cx, cy);
        let center_c = gt.cell_center(cx, cy);
        for (_, nx, ny) in neighbors8(cx, cy, w, h) {
            // n is upstream of c iff its direction points back at c.
            if downstream(nx, ny) != Some((cx, cy)) {
                continue;
            }
            let d = step_distance(crs, center_c, gt.cell_center(nx, ny));
            let candidate = l_c + d;
            let existing_basin = basin_of.get(nx, ny);
            let existing_len = length.get(nx, ny);
            if existing_len == FLOW_LENGTH_NODATA {
                basin_of.set(nx, ny, basin);
                length.set(nx, ny, candidate);
                queue.push_back((nx, ny));
            } else if existing_basin == basin && candidate > existing_len {
                length.set(nx, ny, candidate);
                queue.push_back((nx, ny));
            } else {
                continue;
            }
            let entry = max_by_basin.entry(basin).or_insert(BasinMax { col: nx, row: ny, length: candidate });
            if candidate > entry.length {
                *entry = BasinMax { col: nx, row: ny, length: candidate };
            }
        }
    }
    progress.on_progress("flow_length:bfs", 1, 1);

    let mut out = vec![FLOW_LENGTH_NODATA; w * h];
    for y in 0..h {
        for x in 0..w {
            let v = length.get(x, y);
            out[y * w + x] = if v == FLOW_LENGTH_NODATA { FLOW_LENGTH_NODATA } else { v };
        }
    }
    length_sink.write_window(0, 0, w, &out)?;
    progress.on_progress("flow_length:finalize", 1, 1);

    Ok(FlowLengthResult { max_by_basin })
}

/// Finds every basin transitively upstream of `outlet_basin` (including
/// itself) by following `(upstream, downstream)` adjacency edges
/// backwards.
fn upstream_closure(outlet_basin: i64, adjacency: &[(i64, i64)]) -> Vec<i64> {
    let mut upstream_of: HashMap<i64, Vec<i64>> = HashMap::new();
    for &(up, down) in adjacency {
        upstream_of.entry(down).or_default().push(up);
    }
    let mut seen = vec![outlet_basin];
    let mut stack = vec![outlet_basin];
    while let Some(b) = stack.pop() {
        if let Some(parents) = upstream_of.get(&b) {
            for &p in parents {
                if !seen.contains(&p) {
                    seen.push(p);
                    stack.push(p);
                }
            }
        }
    }
    seen
}

/// Traces the longest flow path for each outlet basin: among that basin's
/// transitively-upstream basins (including itself), picks the one with the
/// greatest recorded [`BasinMax`], then walks flow directions downstream
/// from that cell to the outlet (spec §4.9).
pub fn longest_flow_path(
    dir_source: &dyn RasterSource,
    outlet_basins: &[i64],
    adjacency: &[(i64, i64)],
    result: &FlowLengthResult,
    sink: &dyn VectorSink,
) -> Result<()> {
    let w = dir_source.width();
    let h = dir_source.height();
    let gt = dir_source.geotransform();
    let dir_nodata = dir_source.nodata();
    let dirs_flat = dir_source.read_window(0, 0, w, h)?;
    let dirs = Grid { data: dirs_flat, w, h };

    let downstream = |x: usize, y: usize| -> Option<(usize, usize)> {
        let code = dirs.get(x, y);
        if is_nodata(code, dir_nodata) || code == DIR_NODATA as f64 || code == DIR_UNDEFINED as f64 {
            return None;
        }
        step(x, y, code as u8, w, h)
    };

    for (fid, &outlet) in outlet_basins.iter().enumerate() {
        let upstream_set = upstream_closure(outlet, adjacency);
        let Some(best) = upstream_set
            .iter()
            .filter_map(|b| result.max_by_basin.get(b))
            .max_by(|a, b| a.length.partial_cmp(&b.length).unwrap_or(std::cmp::Ordering::Equal))
        else {
            continue;
        };

        let mut points = vec![gt.cell_center(best.col, best.row)];
        let mut cur = (best.col, best.row);
        let cap = w * h + 1;
        for _ in 0..cap {
            match downstream(cur.0, cur.1) {
                Some(next) => {
                    points.push(gt.cell_center(next.0, next.1));
                    cur = next;
                }
                None => break,
            }
        }

        sink.write_feature(VectorFeature {
            fid: fid as u64,
            geometry: points,
            attributes: vec![
                ("basin_id".to_string(), AttributeValue::Int(outlet)),
                ("length".to_string(), AttributeValue::Real(best.length)),
            ],
        })?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::NoopProgress;
    use crate::raster::{DType, MemRaster, MemVector};
    use crate::stages::basins::basin_adjacency;
    use crate::stages::flow_dir::flow_dir;

    fn direction_raster(rows: &[&[f64]]) -> MemRaster {
        let dem = MemRaster::from_rows(rows, DType::F32, -1.0);
        let dirs = MemRaster::new(dem.w, dem.h, DType::U8, -1.0);
        let mut cfg = PipelineConfig::default();
        cfg.chunk_size = 0;
        flow_dir(&dem, &dirs, &cfg, &NoopProgress, &CancellationToken::new()).unwrap();
        let snap = dirs.snapshot();
        let rows: Vec<&[f64]> = snap.chunks(dem.w).collect();
        MemRaster::from_rows(&rows, DType::U8, -1.0)
    }

    #[test]
    fn drainage_point_has_zero_length() {
        let rows: [&[f64]; 1] = [&[4.0, 3.0, 2.0, 1.0, 0.0]];
        let dirs = direction_raster(&rows);
        let points = [DrainagePoint { col: 4, row: 0, basin_id: 1 }];
        let sink = MemRaster::new(5, 1, DType::F32, FLOW_LENGTH_NODATA);
        let cfg = PipelineConfig::default();
        flow_length(&dirs, &points, &sink, &cfg, &NoopProgress, &CancellationToken::new()).unwrap();
        assert_eq!(sink.get(4, 0), 0.0);
    }

    #[test]
    fn length_increases_monotonically_upstream() {
        let rows: [&[f64]; 1] = [&[4.0, 3.0, 2.0, 1.0, 0.0]];
        let dirs = direction_raster(&rows);
        let points = [DrainagePoint { col: 4, row: 0, basin_id: 1 }];
        let sink = MemRaster::new(5, 1, DType::F32, FLOW_LENGTH_NODATA);
        let cfg = PipelineConfig::default();
        flow_length(&dirs, &points, &sink, &cfg, &NoopProgress, &CancellationToken::new()).unwrap();
        let snap = sink.snapshot();
        for i in 1..snap.len() {
            assert!(snap[i - 1] > snap[i], "length should strictly decrease toward the outlet");
        }
        assert_eq!(snap[4], 0.0);
    }

    #[test]
    fn two_basins_stay_disjoint() {
        // Two independent monotone ramps draining to opposite ends; each
        // basin should only claim its own half.
        let rows: [&[f64]; 1] = [&[2.0, 1.0, 0.0, 1.0, 2.0]];
        let dirs_dem = MemRaster::from_rows(&rows, DType::F32, -1.0);
        let _ = &dirs_dem;
        // Build explicit directions: cells 0,1 -> east (dir 0) toward cell
        // 2 is wrong since 2 is the minimum; instead assign manually via a
        // small custom direction raster to avoid relying on D8 ties.
        let dir_rows: [&[f64]; 1] = [&[0.0, 0.0, 9.0, 4.0, 4.0]]; // E,E,nodata-outlet,W,W
        let dirs = MemRaster::from_rows(&dir_rows, DType::U8, -1.0);
        let points = [
            DrainagePoint { col: 1, row: 0, basin_id: 1 },
            DrainagePoint { col: 3, row: 0, basin_id: 2 },
        ];
        let sink = MemRaster::new(5, 1, DType::F32, FLOW_LENGTH_NODATA);
        let cfg = PipelineConfig::default();
        let result = flow_length(&dirs, &points, &sink, &cfg, &NoopProgress, &CancellationToken::new()).unwrap();
        let snap = sink.snapshot();
        assert_eq!(snap[0], 1.0); // basin 1 claims cell 0, one step upstream
        assert_eq!(snap[4], 1.0); // basin 2 claims cell 4
        assert_eq!(snap[2], FLOW_LENGTH_NODATA); // the outlet cell itself is unclaimed
        assert_eq!(result.max_by_basin[&1].length, 1.0);
        assert_eq!(result.max_by_basin[&2].length, 1.0);
    }

    #[test]
    fn longest_flow_path_traces_from_farthest_cell_to_outlet() {
        let rows: [&[f64]; 1] = [&[4.0, 3.0, 2.0, 1.0, 0.0]];
        let dirs = direction_raster(&rows);
        let points = [DrainagePoint { col: 4, row: 0, basin_id: 7 }];
        let sink = MemRaster::new(5, 1, DType::F32, FLOW_LENGTH_NODATA);
        let cfg = PipelineConfig::default();
        let result = flow_length(&dirs, &points, &sink, &cfg, &NoopProgress, &CancellationToken::new()).unwrap();

        let basins = MemRaster::new(5, 1, DType::I64, -1.0);
        basins.write_window(0, 0, 5, &[7.0, 7.0, 7.0, 7.0, 7.0]).unwrap();
        let cancel = CancellationToken::new();
        let adjacency = basin_adjacency(&basins, &dirs, &cfg, &cancel).unwrap();

        let lines = MemVector::new("longest_flow_path");
        longest_flow_path(&dirs, &[7], &adjacency, &result, &lines).unwrap();
        let feats = lines.into_features();
        assert_eq!(feats.len(), 1);
        assert_eq!(feats[0].geometry.first().copied().unwrap(), (0.5, 0.5));
        assert_eq!(feats[0].geometry.last().copied().unwrap(), (4.5, 0.5));
    }
}
