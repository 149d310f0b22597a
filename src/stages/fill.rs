//! Priority-flood depression fill (spec §4.2).
//!
//! Barnes-Lehman-Mulla priority-flood: a local per-tile flood assigns
//! watershed labels and a tentative fill elevation; a global phase unions
//! the per-tile spill graphs (plus explicit cross-tile and raster-edge
//! edges) and solves for each label's true pour-point elevation via a
//! minimax-path priority-flood over the graph itself; finalize raises each
//! cell to `max(original, fillElev[label])`.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, VecDeque};

use crate::config::PipelineConfig;
use crate::error::Result;
use crate::grid::{neighbors8, Grid};
use crate::progress::ProgressSink;
use crate::raster::{is_nodata, RasterSink, RasterSource};
use crate::tile::{self, CancellationToken};

/// Label reserved for cells seeded directly from a tile's own border ring
/// (its halo, or a true nodata "free drain" cell under `fill_holes=false`).
const EDGE_LABEL: i64 = 1;
const FIRST_REAL_LABEL: i64 = 2;

/// A single tile's local-phase output: per-buffered-cell label and
/// tentative fill elevation, plus the within-tile spill edges between two
/// real (non-edge) labels.
struct LocalFillResult {
    label: Grid<i64>,
    elev: Grid<f64>,
    spill_edges: Vec<(i64, i64, f64)>,
}

/// Ordered min-heap entry: elevation first (so `BinaryHeap`, which is a
/// max-heap, pops the smallest elevation first via `Reverse`-style `Ord`),
/// ties broken by insertion order for determinism (spec §9).
struct HeapEntry {
    elev: f64,
    seq: u64,
    x: usize,
    y: usize,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.elev == other.elev && self.seq == other.seq
    }
}
impl Eq for HeapEntry {}
impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .elev
            .partial_cmp(&self.elev)
            .unwrap_or(Ordering::Equal)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

fn local_priority_flood(buf: &Grid<f64>, nodata: f64, fill_holes: bool) -> LocalFillResult {
    let w = buf.w;
    let h = buf.h;
    let mut elev = buf.clone();
    let mut label = Grid::<i64>::new(w, h);
    let mut heap: BinaryHeap<HeapEntry> = BinaryHeap::new();
    let mut pit_queue: VecDeque<(usize, usize)> = VecDeque::new();
    let mut seq: u64 = 0;

    let is_border = |x: usize, y: usize| x == 0 || y == 0 || x == w - 1 || y == h - 1;

    // Fill-holes: nodata cells take the min elevation of their valid
    // 8-neighbors instead of acting as free drains.
    if fill_holes {
        for y in 0..h {
            for x in 0..w {
                if is_nodata(buf.get(x, y), nodata) {
                    let mut m = f64::INFINITY;
                    for (_, nx, ny) in neighbors8(x, y, w, h) {
                        let v = buf.get(nx, ny);
                        if !is_nodata(v, nodata) {
                            m = m.min(v);
                        }
                    }
                    if m.is_finite() {
                        elev.set(x, y, m);
                    }
                }
            }
        }
    }

    for y in 0..h {
        for x in 0..w {
            let on_border = is_border(x, y);
            let free_drain = !fill_holes && is_nodata(buf.get(x, y), nodata);
            if on_border || free_drain {
                if !fill_holes && is_nodata(buf.get(x, y), nodata) {
                    elev.set(x, y, f64::NEG_INFINITY);
                }
                label.set(x, y, EDGE_LABEL);
                seq += 1;
                heap.push(HeapEntry { elev: elev.get(x, y), seq, x, y });
            }
        }
    }

    let mut next_label = FIRST_REAL_LABEL;
    let mut spill_edges: Vec<(i64, i64, f64)> = Vec::new();
    let mut edge_index: HashMap<(i64, i64), usize> = HashMap::new();

    let record_spill = |a: i64, b: i64, spill: f64, edges: &mut Vec<(i64, i64, f64)>, index: &mut HashMap<(i64, i64), usize>| {
        if a == EDGE_LABEL || b == EDGE_LABEL || a == b {
            return;
        }
        let key = if a < b { (a, b) } else { (b, a) };
        match index.get(&key) {
            Some(&i) => {
                if spill < edges[i].2 {
                    edges[i].2 = spill;
                }
            }
            None => {
                index.insert(key, edges.len());
                edges.push((key.0, key.1, spill));
            }
        }
    };

    while let Some((x, y)) = pit_queue.pop_front().or_else(|| heap.pop().map(|e| (e.x, e.y))) {
        let cur_label = label.get(x, y);
        let cur_z = elev.get(x, y);
        for (_, nx, ny) in neighbors8(x, y, w, h) {
            let n_label = label.get(nx, ny);
            if n_label == 0 {
                label.set(nx, ny, if cur_label == EDGE_LABEL { next_label } else { cur_label });
                if cur_label == EDGE_LABEL {
                    next_label += 1;
                }
                let n_z = elev.get(nx, ny);
                if n_z <= cur_z {
                    elev.set(nx, ny, cur_z);
                    pit_queue.push_back((nx, ny));
                } else {
                    seq += 1;
                    heap.push(HeapEntry { elev: n_z, seq, x: nx, y: ny });
                }
            } else if n_label != cur_label {
                let spill = cur_z.max(elev.get(nx, ny));
                record_spill(cur_label, n_label, spill, &mut spill_edges, &mut edge_index);
            }
        }
    }

    LocalFillResult { label, elev, spill_edges }
}

const OUTSIDE: u64 = u64::MAX;

fn gid(tile_idx: usize, label: i64) -> u64 {
    debug_assert!(label >= FIRST_REAL_LABEL);
    ((tile_idx as u64) << 32) | label as u64
}

/// Runs the priority-flood fill stage end to end: local phase on every
/// tile, a single-threaded global minimax solve, then a parallel finalize
/// pass writing the conditioned elevation to `sink`.
pub fn fill(
    source: &dyn RasterSource,
    sink: &dyn RasterSink,
    cfg: &PipelineConfig,
    progress: &dyn ProgressSink,
    cancel: &CancellationToken,
) -> Result<()> {
    let w = source.width();
    let h = source.height();
    let nodata = source.nodata();
    let halo = 1usize;
    let tiles = tile::split_tiles(w, h, cfg.chunk_size, halo);
    let total = tiles.len();

    tracing::info!(stage = "fill", tiles = total, "starting priority-flood fill");

    let locals = tile::run_tiles(&tiles, cancel, |spec| {
        let buf = tile::read_tile_buffer(source, spec)?;
        Ok(local_priority_flood(&buf, nodata, cfg.fill_holes))
    })?;
    progress.on_progress("fill:local", total, total);

    // Global phase: union within-tile spill edges, connect true raster-edge
    // cells to a single OUTSIDE vertex, and connect adjacent interior cells
    // across tile seams directly (bypassing each tile's own edge label, so
    // two unrelated border-touching watersheds in one tile never appear
    // connected through it).
    let mut adjacency: HashMap<u64, Vec<(u64, f64)>> = HashMap::new();
    let add_edge = |a: u64, b: u64, w: f64, adjacency: &mut HashMap<u64, Vec<(u64, f64)>>| {
        adjacency.entry(a).or_default().push((b, w));
        adjacency.entry(b).or_default().push((a, w));
    };

    for (idx, (spec, local)) in tiles.iter().zip(locals.iter()).enumerate() {
        for &(a, b, spill) in &local.spill_edges {
            add_edge(gid(idx, a), gid(idx, b), spill, &mut adjacency);
        }
        // Raster-true-edge connections: border-ring cells with no global
        // coordinate (outside the raster) connect their interior neighbor
        // to OUTSIDE.
        let bw = spec.buffered_w();
        let bh = spec.buffered_h();
        for ly in 0..bh {
            for lx in 0..bw {
                if lx != 0 && ly != 0 && lx != bw - 1 && ly != bh - 1 {
                    continue;
                }
                if spec.to_global(lx, ly, w, h).is_some() {
                    continue;
                }
                for (_, nx, ny) in neighbors8(lx, ly, bw, bh) {
                    if local.label.get(nx, ny) >= FIRST_REAL_LABEL {
                        let spill = local.elev.get(lx, ly).max(local.elev.get(nx, ny));
                        add_edge(gid(idx, local.label.get(nx, ny)), OUTSIDE, spill, &mut adjacency);
                    }
                }
            }
        }
    }

    // Cross-tile edges: adjacent tiles' shared interior-perimeter columns
    // or rows, cell by cell (plus diagonal corners).
    let mut by_rc: HashMap<(usize, usize), usize> = HashMap::new();
    for (idx, spec) in tiles.iter().enumerate() {
        by_rc.insert((spec.tile_row, spec.tile_col), idx);
    }
    for (idx_a, spec_a) in tiles.iter().enumerate() {
        let right = by_rc.get(&(spec_a.tile_row, spec_a.tile_col + 1)).copied();
        let down = by_rc.get(&(spec_a.tile_row + 1, spec_a.tile_col)).copied();
        let down_right = by_rc.get(&(spec_a.tile_row + 1, spec_a.tile_col + 1)).copied();
        let down_left = if spec_a.tile_col == 0 {
            None
        } else {
            by_rc.get(&(spec_a.tile_row + 1, spec_a.tile_col - 1)).copied()
        };

        let a = &locals[idx_a];
        if let Some(idx_b) = right {
            let b = &locals[idx_b];
            let spec_b = &tiles[idx_b];
            let ax = spec_a.halo + spec_a.interior_w - 1;
            let bx = spec_b.halo;
            for row in 0..spec_a.interior_h.min(spec_b.interior_h) {
                let ay = spec_a.halo + row;
                let by = spec_b.halo + row;
                connect_pair(idx_a, a, ax, ay, idx_b, b, bx, by, &mut adjacency);
            }
        }
        if let Some(idx_b) = down {
            let b = &locals[idx_b];
            let spec_b = &tiles[idx_b];
            let ay = spec_a.halo + spec_a.interior_h - 1;
            let by = spec_b.halo;
            for col in 0..spec_a.interior_w.min(spec_b.interior_w) {
                let ax = spec_a.halo + col;
                let bx = spec_b.halo + col;
                connect_pair(idx_a, a, ax, ay, idx_b, b, bx, by, &mut adjacency);
            }
        }
        if let Some(idx_b) = down_right {
            let b = &locals[idx_b];
            let ax = spec_a.halo + spec_a.interior_w - 1;
            let ay = spec_a.halo + spec_a.interior_h - 1;
            let bx = tiles[idx_b].halo;
            let by = tiles[idx_b].halo;
            connect_pair(idx_a, a, ax, ay, idx_b, b, bx, by, &mut adjacency);
        }
        if let Some(idx_b) = down_left {
            let b = &locals[idx_b];
            let ax = spec_a.halo;
            let ay = spec_a.halo + spec_a.interior_h - 1;
            let bx = tiles[idx_b].halo + tiles[idx_b].interior_w - 1;
            let by = tiles[idx_b].halo;
            connect_pair(idx_a, a, ax, ay, idx_b, b, bx, by, &mut adjacency);
        }
    }

    // Graph priority-flood: minimax distance from OUTSIDE to every vertex.
    let mut dist: HashMap<u64, f64> = HashMap::new();
    let mut gheap: BinaryHeap<HeapEntry> = BinaryHeap::new();
    let mut seq = 0u64;
    dist.insert(OUTSIDE, f64::NEG_INFINITY);
    gheap.push(HeapEntry { elev: f64::NEG_INFINITY, seq, x: 0, y: 0 });
    let mut order: Vec<u64> = vec![OUTSIDE];
    while let Some(entry) = gheap.pop() {
        let u = order[entry.seq as usize];
        if entry.elev > *dist.get(&u).unwrap_or(&f64::INFINITY) {
            continue;
        }
        if let Some(neighbors) = adjacency.get(&u) {
            for &(v, edge_w) in neighbors {
                let nd = edge_w.max(entry.elev);
                if nd < *dist.get(&v).unwrap_or(&f64::INFINITY) {
                    dist.insert(v, nd);
                    seq += 1;
                    order.push(v);
                    gheap.push(HeapEntry { elev: nd, seq, x: 0, y: 0 });
                }
            }
        }
    }

    // Finalize: raise each interior cell to max(original, fillElev[label]).
    tile::run_tiles(&tiles, cancel, |spec| {
        let idx = by_rc[&(spec.tile_row, spec.tile_col)];
        let local = &locals[idx];
        let mut out = vec![0.0f64; spec.interior_w * spec.interior_h];
        for row in 0..spec.interior_h {
            for col in 0..spec.interior_w {
                let lx = spec.halo + col;
                let ly = spec.halo + row;
                let original = local.elev.get(lx, ly);
                let label = local.label.get(lx, ly);
                let raw = source.read_window(spec.origin_x + col, spec.origin_y + row, 1, 1)?[0];
                if is_nodata(raw, nodata) {
                    out[row * spec.interior_w + col] = nodata;
                    continue;
                }
                let fill_elev = dist.get(&gid(idx, label)).copied().unwrap_or(f64::NEG_INFINITY);
                out[row * spec.interior_w + col] = original.max(fill_elev).max(raw);
            }
        }
        tile::write_tile_interior(sink, spec, &out)?;
        Ok(())
    })?;
    progress.on_progress("fill:finalize", total, total);

    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn connect_pair(
    idx_a: usize,
    a: &LocalFillResult,
    ax: usize,
    ay: usize,
    idx_b: usize,
    b: &LocalFillResult,
    bx: usize,
    by: usize,
    adjacency: &mut HashMap<u64, Vec<(u64, f64)>>,
) {
    let la = a.label.get(ax, ay);
    let lb = b.label.get(bx, by);
    if la < FIRST_REAL_LABEL || lb < FIRST_REAL_LABEL {
        return;
    }
    let spill = a.elev.get(ax, ay).max(b.elev.get(bx, by));
    let ga = gid(idx_a, la);
    let gb = gid(idx_b, lb);
    adjacency.entry(ga).or_default().push((gb, spill));
    adjacency.entry(gb).or_default().push((ga, spill));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::NoopProgress;
    use crate::raster::{DType, MemRaster};

    fn run_fill(rows: &[&[f64]], nodata: f64, fill_holes: bool, chunk_size: usize) -> Vec<f64> {
        let src = MemRaster::from_rows(rows, DType::F32, nodata);
        let sink = MemRaster::new(src.w, src.h, DType::F32, nodata);
        let mut cfg = PipelineConfig::default();
        cfg.chunk_size = chunk_size;
        cfg.fill_holes = fill_holes;
        fill(&src, &sink, &cfg, &NoopProgress, &CancellationToken::new()).unwrap();
        sink.snapshot()
    }

    #[test]
    fn single_pit_is_raised_to_rim() {
        // Spec scenario 1: 3x3 single pit.
        let rows: [&[f64]; 3] = [&[9.0, 9.0, 9.0], &[9.0, 5.0, 9.0], &[9.0, 9.0, 9.0]];
        let out = run_fill(&rows, -1.0, false, 0);
        assert_eq!(out[1 * 3 + 1], 9.0);
        for (i, &v) in out.iter().enumerate() {
            if i != 4 {
                assert_eq!(v, 9.0);
            }
        }
    }

    #[test]
    fn fill_never_lowers_a_cell() {
        let rows: [&[f64]; 4] = [
            &[5.0, 4.0, 3.0, 2.0],
            &[6.0, 1.0, 2.0, 3.0],
            &[7.0, 2.0, 0.5, 4.0],
            &[8.0, 9.0, 10.0, 11.0],
        ];
        let src_raw: Vec<f64> = rows.iter().flat_map(|r| r.iter().copied()).collect();
        let out = run_fill(&rows, -1.0, false, 0);
        for (o, s) in out.iter().zip(src_raw.iter()) {
            assert!(o >= s, "fill lowered a cell: {o} < {s}");
        }
    }

    #[test]
    fn tiled_fill_matches_single_tile_reference() {
        let rows: [&[f64]; 8] = [
            &[9.0, 9.0, 9.0, 9.0, 9.0, 9.0, 9.0, 9.0],
            &[9.0, 5.0, 6.0, 9.0, 9.0, 3.0, 4.0, 9.0],
            &[9.0, 6.0, 7.0, 9.0, 9.0, 4.0, 5.0, 9.0],
            &[9.0, 9.0, 9.0, 9.0, 9.0, 9.0, 9.0, 9.0],
            &[9.0, 9.0, 9.0, 9.0, 9.0, 9.0, 9.0, 9.0],
            &[9.0, 2.0, 3.0, 9.0, 9.0, 1.0, 2.0, 9.0],
            &[9.0, 3.0, 4.0, 9.0, 9.0, 2.0, 3.0, 9.0],
            &[9.0, 9.0, 9.0, 9.0, 9.0, 9.0, 9.0, 9.0],
        ];
        let whole = run_fill(&rows, -1.0, false, 0);
        let tiled = run_fill(&rows, -1.0, false, 4);
        assert_eq!(whole, tiled);
    }

    #[test]
    fn fill_holes_fills_nodata_interior() {
        let rows: [&[f64]; 3] = [&[9.0, 9.0, 9.0], &[9.0, -1.0, 9.0], &[9.0, 9.0, 9.0]];
        let out = run_fill(&rows, -1.0, true, 0);
        assert_eq!(out[4], 9.0);
    }

    #[test]
    fn nodata_cells_stay_nodata_in_output() {
        let rows: [&[f64]; 3] = [&[9.0, 9.0, 9.0], &[9.0, -1.0, 9.0], &[9.0, 9.0, 9.0]];
        let out = run_fill(&rows, -1.0, false, 0);
        assert_eq!(out[4], -1.0);
    }

    #[test]
    fn applying_fill_twice_is_idempotent() {
        let rows: [&[f64]; 4] = [
            &[5.0, 4.0, 3.0, 2.0],
            &[6.0, 1.0, 2.0, 3.0],
            &[7.0, 2.0, 0.5, 4.0],
            &[8.0, 9.0, 10.0, 11.0],
        ];
        let once = run_fill(&rows, -1.0, false, 0);
        let once_rows: Vec<&[f64]> = once.chunks(4).collect();
        let twice = run_fill(&once_rows, -1.0, false, 0);
        assert_eq!(once, twice);
    }
}
