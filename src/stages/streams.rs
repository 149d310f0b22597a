//! Stream network extraction (spec §4.7): classifies stream cells from an
//! accumulation threshold, classifies nodes (source/confluence/outlet) from
//! one-hop neighbor context (exact, since D8 inflow only looks one cell
//! out), traces reaches tile-locally, and stitches partial reaches that
//! terminate on a tile's interior edge via a spatial hash on their endpoint
//! coordinates.

use std::collections::HashMap;

use crate::config::PipelineConfig;
use crate::error::Result;
use crate::grid::{neighbors8, step, Grid, DIR_NODATA, DIR_UNDEFINED};
use crate::progress::ProgressSink;
use crate::raster::{is_nodata, AttributeValue, GeoTransform, RasterSource, VectorFeature, VectorSink};
use crate::tile::{self, CancellationToken, TileSpec};

/// Why a reach endpoint doesn't continue as a stream cell beyond it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NodeKind {
    Source,
    Confluence,
    Outlet,
}

impl NodeKind {
    fn tag(self) -> &'static str {
        match self {
            NodeKind::Source => "source",
            NodeKind::Confluence => "confluence",
            NodeKind::Outlet => "outlet",
        }
    }
}

/// A reach endpoint is either a true network node or a stub left by the
/// tile boundary, to be stitched away during the global phase.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum EndKind {
    Node(NodeKind),
    Stub,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Side {
    Start,
    End,
}

/// A reach traced within (at most one halo cell beyond) a single tile,
/// ordered upstream-first.
#[derive(Clone, Debug)]
struct RawSegment {
    points: Vec<(f64, f64)>,
    start_kind: EndKind,
    end_kind: EndKind,
}

struct LocalStreams {
    segments: Vec<RawSegment>,
}

/// Traces every reach reachable within one tile's buffered window.
///
/// Node classification (source: zero inflow, confluence: >=2 inflow) is
/// exact even tile-locally, because D8 inflow only ever looks one cell out
/// and the buffer carries a full halo ring. A cell with exactly one
/// contributor that happens to live in the halo is not a true node, but it
/// is still where this tile must start a trace: the neighboring tile owns
/// that contributor and will terminate its own trace here as a stub.
fn trace_local(
    spec: &TileSpec,
    dirs: &Grid<f64>,
    is_stream: &Grid<bool>,
    acc: &Grid<f64>,
    acc_nodata: f64,
    gt: &GeoTransform,
    raster_w: usize,
    raster_h: usize,
) -> Vec<RawSegment> {
    let bw = dirs.w;
    let bh = dirs.h;

    let flows_into = |nx: usize, ny: usize, x: usize, y: usize| -> bool {
        if !is_stream.get(nx, ny) {
            return false;
        }
        let code = dirs.get(nx, ny);
        if code == DIR_NODATA as f64 || code == DIR_UNDEFINED as f64 {
            return false;
        }
        step(nx, ny, code as u8, bw, bh) == Some((x, y))
    };

    let global_inflow_count = |x: usize, y: usize| -> usize {
        neighbors8(x, y, bw, bh).filter(|&(_, nx, ny)| flows_into(nx, ny, x, y)).count()
    };
    let interior_inflow_count = |x: usize, y: usize| -> usize {
        neighbors8(x, y, bw, bh)
            .filter(|&(_, nx, ny)| spec.is_interior(nx, ny) && flows_into(nx, ny, x, y))
            .count()
    };

    let classify_node = |x: usize, y: usize| -> Option<NodeKind> {
        match global_inflow_count(x, y) {
            0 => Some(NodeKind::Source),
            n if n >= 2 => Some(NodeKind::Confluence),
            _ => None,
        }
    };

    let is_trace_start = |x: usize, y: usize| -> bool {
        if !spec.is_interior(x, y) || !is_stream.get(x, y) {
            return false;
        }
        match global_inflow_count(x, y) {
            1 => interior_inflow_count(x, y) == 0,
            _ => true,
        }
    };

    let mut segments = Vec::new();

    for ly in 0..bh {
        for lx in 0..bw {
            if !is_trace_start(lx, ly) {
                continue;
            }
            let start_kind = classify_node(lx, ly).map(EndKind::Node).unwrap_or(EndKind::Stub);
            let mut points = Vec::new();
            let mut cur = (lx, ly);
            let end_kind;
            loop {
                let Some((gx, gy)) = spec.to_global(cur.0, cur.1, raster_w, raster_h) else {
                    end_kind = EndKind::Node(NodeKind::Outlet);
                    break;
                };
                points.push(gt.cell_center(gx, gy));

                let code = dirs.get(cur.0, cur.1);
                if code == DIR_NODATA as f64 || code == DIR_UNDEFINED as f64 {
                    end_kind = EndKind::Node(NodeKind::Outlet);
                    break;
                }
                let Some(next) = step(cur.0, cur.1, code as u8, bw, bh) else {
                    end_kind = EndKind::Node(NodeKind::Outlet);
                    break;
                };
                if next.0 >= acc.w || next.1 >= acc.h || is_nodata(acc.get(next.0, next.1), acc_nodata) {
                    // Covers both a genuinely off-raster neighbor (padded
                    // nodata) and an in-raster cell below the stream
                    // threshold's support.
                    end_kind = EndKind::Node(NodeKind::Outlet);
                    break;
                }
                if !spec.is_interior(next.0, next.1) {
                    // Crosses into the halo with valid data beyond: a tile
                    // boundary stub. The halo cell's coordinate is pushed
                    // too, so the neighboring tile's own trace (which owns
                    // that cell as interior) shares the identical point.
                    if let Some((gx2, gy2)) = spec.to_global(next.0, next.1, raster_w, raster_h) {
                        points.push(gt.cell_center(gx2, gy2));
                    }
                    end_kind = EndKind::Stub;
                    break;
                }
                if !is_stream.get(next.0, next.1) {
                    end_kind = EndKind::Node(NodeKind::Outlet);
                    break;
                }
                if is_trace_start(next.0, next.1) {
                    if let Some((gx2, gy2)) = spec.to_global(next.0, next.1, raster_w, raster_h) {
                        points.push(gt.cell_center(gx2, gy2));
                    }
                    end_kind = classify_node(next.0, next.1).map(EndKind::Node).unwrap_or(EndKind::Stub);
                    break;
                }
                cur = next;
            }
            if points.len() >= 2 {
                segments.push(RawSegment { points, start_kind, end_kind });
            }
        }
    }
    segments
}

fn concat_drop_dup(mut a: Vec<(f64, f64)>, b: Vec<(f64, f64)>) -> Vec<(f64, f64)> {
    const EPS: f64 = 1e-9;
    if let (Some(&last), Some(&first)) = (a.last(), b.first()) {
        if (last.0 - first.0).abs() < EPS && (last.1 - first.1).abs() < EPS {
            a.extend_from_slice(&b[1..]);
            return a;
        }
    }
    a.extend_from_slice(&b);
    a
}

fn quantize(p: (f64, f64)) -> (i64, i64) {
    ((p.0 * 1.0e6).round() as i64, (p.1 * 1.0e6).round() as i64)
}

fn merge_pair(a: RawSegment, a_side: Side, b: RawSegment, b_side: Side) -> RawSegment {
    match (a_side, b_side) {
        (Side::End, Side::Start) => RawSegment {
            points: concat_drop_dup(a.points, b.points),
            start_kind: a.start_kind,
            end_kind: b.end_kind,
        },
        (Side::Start, Side::End) => RawSegment {
            points: concat_drop_dup(b.points, a.points),
            start_kind: b.start_kind,
            end_kind: a.end_kind,
        },
        (Side::Start, Side::Start) => {
            let mut rev_a = a.points;
            rev_a.reverse();
            RawSegment {
                points: concat_drop_dup(rev_a, b.points),
                start_kind: a.end_kind,
                end_kind: b.end_kind,
            }
        }
        (Side::End, Side::End) => {
            let mut rev_b = b.points;
            rev_b.reverse();
            RawSegment {
                points: concat_drop_dup(a.points, rev_b),
                start_kind: a.start_kind,
                end_kind: b.start_kind,
            }
        }
    }
}

/// Repeatedly stitches stub-to-stub pairs (spec §4.7 orientation table)
/// until no bucket holds exactly two stub endpoints from distinct
/// segments.
fn stitch(mut segments: Vec<Option<RawSegment>>) -> Vec<RawSegment> {
    loop {
        let mut buckets: HashMap<(i64, i64), Vec<(usize, Side)>> = HashMap::new();
        for (idx, seg) in segments.iter().enumerate() {
            let Some(seg) = seg else { continue };
            if seg.start_kind == EndKind::Stub {
                buckets.entry(quantize(seg.points[0])).or_default().push((idx, Side::Start));
            }
            if seg.end_kind == EndKind::Stub {
                buckets.entry(quantize(*seg.points.last().unwrap())).or_default().push((idx, Side::End));
            }
        }
        let mut merged_any = false;
        for entries in buckets.values() {
            if entries.len() != 2 {
                continue;
            }
            let (ia, sa) = entries[0];
            let (ib, sb) = entries[1];
            if ia == ib {
                continue;
            }
            let (Some(a), Some(b)) = (segments[ia].take(), segments[ib].take()) else {
                continue;
            };
            segments[ia] = Some(merge_pair(a, sa, b, sb));
            merged_any = true;
        }
        if !merged_any {
            break;
        }
    }
    segments.into_iter().flatten().collect()
}

/// Runs stream extraction end to end, writing a `streams` LineString layer
/// and a `junctions` Point layer (spec §4.7).
pub fn extract_streams(
    dir_source: &dyn RasterSource,
    acc_source: &dyn RasterSource,
    streams_sink: &dyn VectorSink,
    junctions_sink: &dyn VectorSink,
    cfg: &PipelineConfig,
    progress: &dyn ProgressSink,
    cancel: &CancellationToken,
) -> Result<()> {
    let w = dir_source.width();
    let h = dir_source.height();
    let gt = dir_source.geotransform();
    let acc_nodata = acc_source.nodata();
    let halo = 1usize;
    let tiles = tile::split_tiles(w, h, cfg.chunk_size, halo);
    let total = tiles.len();

    tracing::info!(stage = "streams", tiles = total, threshold = cfg.threshold, "extracting stream network");

    let locals = tile::run_tiles(&tiles, cancel, |spec| {
        let dirs = tile::read_tile_buffer(dir_source, spec)?;
        let acc = tile::read_tile_buffer(acc_source, spec)?;
        let is_stream = {
            let mut m = Grid::<bool>::new(dirs.w, dirs.h);
            for y in 0..dirs.h {
                for x in 0..dirs.w {
                    let a = acc.get(x, y);
                    m.set(x, y, !is_nodata(a, acc_nodata) && a >= cfg.threshold as f64);
                }
            }
            m
        };
        let segments = trace_local(spec, &dirs, &is_stream, &acc, acc_nodata, &gt, w, h);
        Ok(LocalStreams { segments })
    })?;
    progress.on_progress("streams:local", total, total);

    let all_segments: Vec<Option<RawSegment>> = locals.into_iter().flat_map(|l| l.segments).map(Some).collect();
    let stitched = stitch(all_segments);
    progress.on_progress("streams:global", total, total);

    let mut junction_coords: Vec<((i64, i64), (f64, f64), NodeKind)> = Vec::new();
    for seg in &stitched {
        if let EndKind::Node(kind) = seg.start_kind {
            junction_coords.push((quantize(seg.points[0]), seg.points[0], kind));
        }
        if let EndKind::Node(kind) = seg.end_kind {
            let p = *seg.points.last().unwrap();
            junction_coords.push((quantize(p), p, kind));
        }
    }
    junction_coords.sort_by_key(|(q, _, _)| *q);
    junction_coords.dedup_by_key(|(q, _, _)| *q);

    for (fid, seg) in stitched.iter().enumerate() {
        streams_sink.write_feature(VectorFeature {
            fid: fid as u64,
            geometry: seg.points.clone(),
            attributes: vec![],
        })?;
    }
    for (fid, (_, p, kind)) in junction_coords.iter().enumerate() {
        junctions_sink.write_feature(VectorFeature {
            fid: fid as u64,
            geometry: vec![*p],
            attributes: vec![("type".to_string(), AttributeValue::Text(kind.tag().to_string()))],
        })?;
    }
    progress.on_progress("streams:finalize", total, total);

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::NoopProgress;
    use crate::raster::{DType, MemRaster, MemVector};
    use crate::stages::accumulation::{accumulate, ACC_NODATA};
    use crate::stages::flow_dir::flow_dir;

    fn run(rows: &[&[f64]], threshold: i64, chunk_size: usize) -> (Vec<VectorFeature>, Vec<VectorFeature>) {
        let dem = MemRaster::from_rows(rows, DType::F32, -1.0);
        let dirs = MemRaster::new(dem.w, dem.h, DType::U8, -1.0);
        let mut cfg = PipelineConfig::default();
        cfg.chunk_size = 0;
        flow_dir(&dem, &dirs, &cfg, &NoopProgress, &CancellationToken::new()).unwrap();

        let dir_snapshot = dirs.snapshot();
        let dir_rows: Vec<&[f64]> = dir_snapshot.chunks(dem.w).collect();
        let dir_in = MemRaster::from_rows(&dir_rows, DType::U8, -1.0);
        let acc = MemRaster::new(dem.w, dem.h, DType::I64, ACC_NODATA);
        accumulate(&dir_in, &acc, &cfg, &NoopProgress, &CancellationToken::new()).unwrap();

        let acc_snapshot = acc.snapshot();
        let acc_rows: Vec<&[f64]> = acc_snapshot.chunks(dem.w).collect();
        let acc_in = MemRaster::from_rows(&acc_rows, DType::I64, ACC_NODATA);

        cfg.chunk_size = chunk_size;
        cfg.threshold = threshold;
        let streams = MemVector::new("streams");
        let junctions = MemVector::new("junctions");
        extract_streams(&dir_in, &acc_in, &streams, &junctions, &cfg, &NoopProgress, &CancellationToken::new()).unwrap();
        (streams.into_features(), junctions.into_features())
    }

    #[test]
    fn monotone_slope_has_a_single_reach_to_the_outlet() {
        let rows: [&[f64]; 5] = [
            &[0.0, 1.0, 2.0, 3.0, 4.0],
            &[1.0, 2.0, 3.0, 4.0, 5.0],
            &[2.0, 3.0, 4.0, 5.0, 6.0],
            &[3.0, 4.0, 5.0, 6.0, 7.0],
            &[4.0, 5.0, 6.0, 7.0, 8.0],
        ];
        let (streams, junctions) = run(&rows, 1, 0);
        assert!(!streams.is_empty());
        assert!(junctions
            .iter()
            .any(|j| j.attributes.iter().any(|(k, v)| k == "type" && *v == AttributeValue::Text("outlet".into()))));
    }

    #[test]
    fn y_confluence_is_detected_untiled() {
        // Two branches merge into one trunk flowing west off the raster.
        let rows: [&[f64]; 3] = [&[9.0, 8.0, 9.0], &[9.0, 5.0, 6.0], &[9.0, 7.0, 9.0]];
        let (_, junctions) = run(&rows, 1, 0);
        assert!(junctions
            .iter()
            .any(|j| j.attributes.iter().any(|(k, v)| k == "type" && *v == AttributeValue::Text("confluence".into()))));
    }

    #[test]
    fn tiled_stitching_preserves_total_traced_cells() {
        let rows: [&[f64]; 8] = [
            &[0.0, 1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0],
            &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0],
            &[2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0, 9.0],
            &[3.0, 4.0, 5.0, 6.0, 7.0, 8.0, 9.0, 10.0],
            &[4.0, 5.0, 6.0, 7.0, 8.0, 9.0, 10.0, 11.0],
            &[5.0, 6.0, 7.0, 8.0, 9.0, 10.0, 11.0, 12.0],
            &[6.0, 7.0, 8.0, 9.0, 10.0, 11.0, 12.0, 13.0],
            &[7.0, 8.0, 9.0, 10.0, 11.0, 12.0, 13.0, 14.0],
        ];
        let (whole, _) = run(&rows, 1, 0);
        let (tiled, _) = run(&rows, 1, 4);
        // Every stitched reach's point count minus 1 (edges, not cells)
        // summed across all reaches matches regardless of how tiling split
        // the trace into pieces before stitching.
        let whole_edges: usize = whole.iter().map(|f| f.geometry.len() - 1).sum();
        let tiled_edges: usize = tiled.iter().map(|f| f.geometry.len() - 1).sum();
        assert_eq!(whole_edges, tiled_edges);
    }
}
