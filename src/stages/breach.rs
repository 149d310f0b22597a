//! Least-cost breach (spec §4.3): Phase A carves single-cell pits with a
//! short epsilon ramp, Phase B runs a windowed Dijkstra for pits Phase A
//! can't resolve. Both phases are purely tile-local — halo equals
//! `search_radius`, so a breach path never needs data from beyond the
//! buffered tile, and since only the owning tile ever writes its own
//! interior, two tiles independently breaching near a shared boundary
//! cannot race on the same output cell.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use crate::config::PipelineConfig;
use crate::error::Result;
use crate::grid::{Grid, D8_OFFSETS};
use crate::progress::ProgressSink;
use crate::raster::{is_nodata, RasterSink, RasterSource};
use crate::tile::{self, CancellationToken};

/// The sixteen Chebyshev-radius-2 probe cells, grouped by the D8 octant a
/// hit on that cell resolves to (see breach design notes: cardinal octants
/// have one probe, diagonal octants have three).
const RING_PROBES: [(i32, i32, u8); 16] = [
    (2, 0, 0),
    (2, -2, 1),
    (2, -1, 1),
    (1, -2, 1),
    (0, -2, 2),
    (-2, -2, 3),
    (-2, -1, 3),
    (-1, -2, 3),
    (-2, 0, 4),
    (-2, 1, 5),
    (-2, 2, 5),
    (-1, 2, 5),
    (0, 2, 6),
    (2, 1, 7),
    (2, 2, 7),
    (1, 2, 7),
];

/// A strict pit: every in-bounds, non-nodata neighbor is at least as high,
/// and at least one is strictly higher. Out-of-window and nodata neighbors
/// are skipped rather than disqualifying — a cell bordering nodata (spec
/// scenario 4) can still be a pit breached toward that nodata cell.
fn is_strict_pit(buf: &Grid<f64>, nodata: f64, x: usize, y: usize) -> bool {
    let z = buf.get(x, y);
    if is_nodata(z, nodata) {
        return false;
    }
    let mut any_strictly_higher = false;
    let mut any_valid_neighbor = false;
    for dir in 0u8..8 {
        let (dx, dy) = D8_OFFSETS[dir as usize];
        let nx = x as i64 + dx as i64;
        let ny = y as i64 + dy as i64;
        if nx < 0 || ny < 0 || nx as usize >= buf.w || ny as usize >= buf.h {
            continue;
        }
        let zn = buf.get(nx as usize, ny as usize);
        if is_nodata(zn, nodata) {
            continue;
        }
        any_valid_neighbor = true;
        if zn < z {
            return false;
        }
        if zn > z {
            any_strictly_higher = true;
        }
    }
    any_valid_neighbor && any_strictly_higher
}

/// Phase A: try to solve `(px, py)` by finding a radius-2 probe cell at or
/// below the pit's elevation (or nodata) and carving its radius-1
/// intermediate neighbor. Returns `true` if solved.
fn phase_a(out: &mut Grid<f64>, nodata: f64, epsilon: f64, px: usize, py: usize, z: f64) -> bool {
    for &(dx, dy, dir) in &RING_PROBES {
        let qx = px as i64 + dx as i64;
        let qy = py as i64 + dy as i64;
        if qx < 0 || qy < 0 || qx as usize >= out.w || qy as usize >= out.h {
            continue;
        }
        let (qx, qy) = (qx as usize, qy as usize);
        let zq = out.get(qx, qy);
        let qualifies = is_nodata(zq, nodata) || zq <= z;
        if !qualifies {
            continue;
        }
        let (idx, idy) = D8_OFFSETS[dir as usize];
        let ix = px as i64 + idx as i64;
        let iy = py as i64 + idy as i64;
        if ix < 0 || iy < 0 || ix as usize >= out.w || iy as usize >= out.h {
            continue;
        }
        let (ix, iy) = (ix as usize, iy as usize);
        let z_target = if is_nodata(zq, nodata) { z - 2.0 * epsilon } else { zq };
        out.set(ix, iy, (z + z_target) / 2.0);
        return true;
    }
    false
}

struct DijkstraEntry {
    cost: f64,
    seq: u64,
    x: usize,
    y: usize,
}

impl PartialEq for DijkstraEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cost == other.cost && self.seq == other.seq
    }
}
impl Eq for DijkstraEntry {}
impl PartialOrd for DijkstraEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for DijkstraEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        other.cost.partial_cmp(&self.cost).unwrap_or(Ordering::Equal).then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Phase B: windowed Dijkstra from the pit, terminating at the first
/// popped cell below `zPit` or nodata. Returns the breach path (pit first,
/// breach point last) and its total cost, or `None` if the window has no
/// reachable terminal cell.
fn phase_b(
    buf: &Grid<f64>,
    nodata: f64,
    px: usize,
    py: usize,
    radius: usize,
) -> Option<(Vec<(usize, usize)>, f64)> {
    let z_pit = buf.get(px, py);
    let x0 = px.saturating_sub(radius);
    let y0 = py.saturating_sub(radius);
    let x1 = (px + radius).min(buf.w - 1);
    let y1 = (py + radius).min(buf.h - 1);

    let mut cost: std::collections::HashMap<(usize, usize), f64> = std::collections::HashMap::new();
    let mut prev: std::collections::HashMap<(usize, usize), (usize, usize)> = std::collections::HashMap::new();
    let mut heap: BinaryHeap<DijkstraEntry> = BinaryHeap::new();
    let mut seq = 0u64;
    cost.insert((px, py), 0.0);
    heap.push(DijkstraEntry { cost: 0.0, seq, x: px, y: py });

    while let Some(entry) = heap.pop() {
        let (x, y) = (entry.x, entry.y);
        if entry.cost > *cost.get(&(x, y)).unwrap_or(&f64::INFINITY) {
            continue;
        }
        let z = buf.get(x, y);
        if (x, y) != (px, py) && (is_nodata(z, nodata) || z < z_pit) {
            // Terminal: reconstruct path pit -> breach.
            let mut path = vec![(x, y)];
            let mut cur = (x, y);
            while let Some(&p) = prev.get(&cur) {
                path.push(p);
                cur = p;
            }
            path.reverse();
            return Some((path, entry.cost));
        }
        for dir in 0u8..8 {
            let (dx, dy) = D8_OFFSETS[dir as usize];
            let nx = x as i64 + dx as i64;
            let ny = y as i64 + dy as i64;
            if nx < x0 as i64 || ny < y0 as i64 || nx > x1 as i64 || ny > y1 as i64 {
                continue;
            }
            let (nx, ny) = (nx as usize, ny as usize);
            let w = if dx != 0 && dy != 0 { std::f64::consts::SQRT_2 } else { 1.0 };
            let zn = buf.get(nx, ny);
            let edge_cost = if is_nodata(zn, nodata) { 0.0 } else { w * (zn - z_pit) };
            let nd = entry.cost + edge_cost;
            if nd < *cost.get(&(nx, ny)).unwrap_or(&f64::INFINITY) {
                cost.insert((nx, ny), nd);
                prev.insert((nx, ny), (x, y));
                seq += 1;
                heap.push(DijkstraEntry { cost: nd, seq, x: nx, y: ny });
            }
        }
    }
    None
}

fn apply_breach_path(out: &mut Grid<f64>, nodata: f64, epsilon: f64, path: &[(usize, usize)]) {
    let z_pit = out.get(path[0].0, path[0].1);
    let k = path.len() - 1;
    let (bx, by) = path[k];
    let z_breach_raw = out.get(bx, by);
    let z_term = if is_nodata(z_breach_raw, nodata) {
        z_pit - k as f64 * epsilon
    } else {
        z_breach_raw
    };
    for i in 1..k {
        let (x, y) = path[i];
        let cur = out.get(x, y);
        if cur == z_pit {
            continue; // flats at the pit elevation are left unchanged
        }
        let frac = i as f64 / k as f64;
        let interp = z_pit + frac * (z_term - z_pit);
        out.set(x, y, cur.min(interp));
    }
}

/// Runs Phase A then Phase B over every tile, writing the conditioned
/// elevation. Pits left unsolved (Phase A found no probe hit, Phase B
/// found no reachable terminal, or `max_cost` was exceeded) pass through
/// unchanged for the fill stage to resolve.
pub fn breach(
    source: &dyn RasterSource,
    sink: &dyn RasterSink,
    cfg: &PipelineConfig,
    progress: &dyn ProgressSink,
    cancel: &CancellationToken,
) -> Result<()> {
    let w = source.width();
    let h = source.height();
    let nodata = source.nodata();
    let halo = cfg.search_radius;
    let tiles = tile::split_tiles(w, h, cfg.chunk_size, halo);
    let total = tiles.len();

    tracing::info!(stage = "breach", tiles = total, "starting least-cost breach");

    tile::run_tiles(&tiles, cancel, |spec| {
        let buf = tile::read_tile_buffer(source, spec)?;
        let mut out = buf.clone();

        for row in 0..spec.interior_h {
            for col in 0..spec.interior_w {
                cancel.check()?;
                let x = spec.halo + col;
                let y = spec.halo + row;
                if !is_strict_pit(&out, nodata, x, y) {
                    continue;
                }
                let z = out.get(x, y);
                if phase_a(&mut out, nodata, cfg.breach_epsilon, x, y, z) {
                    continue;
                }
                if let Some((path, total_cost)) = phase_b(&out, nodata, x, y, cfg.search_radius) {
                    if total_cost.abs() <= cfg.max_cost {
                        apply_breach_path(&mut out, nodata, cfg.breach_epsilon, &path);
                    }
                }
            }
        }

        let mut interior = vec![0.0f64; spec.interior_w * spec.interior_h];
        for row in 0..spec.interior_h {
            for col in 0..spec.interior_w {
                interior[row * spec.interior_w + col] = out.get(spec.halo + col, spec.halo + row);
            }
        }
        tile::write_tile_interior(sink, spec, &interior)?;
        Ok(())
    })?;
    progress.on_progress("breach", total, total);

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::NoopProgress;
    use crate::raster::{DType, MemRaster};

    fn run_breach(rows: &[&[f64]], nodata: f64, cfg: &PipelineConfig) -> Vec<f64> {
        let src = MemRaster::from_rows(rows, DType::F32, nodata);
        let sink = MemRaster::new(src.w, src.h, DType::F32, nodata);
        breach(&src, &sink, cfg, &NoopProgress, &CancellationToken::new()).unwrap();
        sink.snapshot()
    }

    #[test]
    fn single_cell_pit_is_carved_by_phase_a() {
        // A nodata cell two rows north of the pit is the radius-2 probe
        // that should fire: the pit's north neighbor gets lowered toward
        // it by an epsilon ramp, and the pit itself is left unchanged.
        let rows: [&[f64]; 5] = [
            &[9.0, 9.0, -1.0, 9.0, 9.0],
            &[9.0, 9.0, 9.0, 9.0, 9.0],
            &[9.0, 9.0, 5.0, 9.0, 9.0],
            &[9.0, 9.0, 9.0, 9.0, 9.0],
            &[9.0, 9.0, 9.0, 9.0, 9.0],
        ];
        let mut cfg = PipelineConfig::default();
        cfg.chunk_size = 0;
        let out = run_breach(&rows, -1.0, &cfg);
        assert_eq!(out[2 * 5 + 2], 5.0);
        assert!(out[1 * 5 + 2] < 5.0, "north neighbor should be ramped below the pit, got {}", out[1 * 5 + 2]);
    }

    #[test]
    fn pit_bordering_nodata_is_still_a_strict_pit() {
        // Spec scenario 4: pit at (1,1), nodata directly south at (1,2).
        let rows: [&[f64]; 3] = [&[9.0, 9.0, 9.0], &[9.0, 5.0, 10.0], &[9.0, -1.0, 9.0]];
        let mut cfg = PipelineConfig::default();
        cfg.chunk_size = 0;
        let out = run_breach(&rows, -1.0, &cfg);
        assert_eq!(out[1 * 3 + 1], 5.0);
        assert_eq!(out[2 * 3 + 1], -1.0);
    }

    #[test]
    fn monotone_ramp_is_unchanged() {
        // The low corner is technically a local minimum against its
        // available neighbors, but any breach path out of it runs through
        // the halo (off-raster) padding, never touching a written-back
        // interior cell.
        let rows: [&[f64]; 3] = [&[1.0, 2.0, 3.0], &[2.0, 3.0, 4.0], &[3.0, 4.0, 5.0]];
        let mut cfg = PipelineConfig::default();
        cfg.chunk_size = 0;
        let out = run_breach(&rows, -1.0, &cfg);
        let flat: Vec<f64> = rows.iter().flat_map(|r| r.iter().copied()).collect();
        assert_eq!(out, flat);
    }

    #[test]
    fn strict_pit_detection_requires_all_neighbors_at_least_as_high() {
        let buf = Grid::filled(3, 3, 5.0);
        let mut buf = buf;
        buf.set(1, 1, 1.0);
        buf.set(0, 0, 5.0);
        assert!(is_strict_pit(&buf, -1.0, 1, 1));
        buf.set(0, 0, 0.5); // one neighbor now lower: not a strict pit
        assert!(!is_strict_pit(&buf, -1.0, 1, 1));
    }
}
