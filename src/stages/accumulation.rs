//! Flow accumulation (spec §4.6): a per-tile topological sort computes each
//! cell's *local* accumulation assuming zero inflow from beyond the tile;
//! a perimeter link graph then resolves how much additional flow each
//! perimeter cell receives from outside its own tile (the "offset"); a
//! finalize pass adds that offset to every cell downstream of where it
//! enters.

use std::collections::{HashMap, HashSet, VecDeque};

use crate::config::PipelineConfig;
use crate::error::{PipelineError, Result};
use crate::grid::{neighbors8, step, Grid, DIR_NODATA, DIR_UNDEFINED};
use crate::progress::ProgressSink;
use crate::raster::{RasterSink, RasterSource};
use crate::tile::{self, CancellationToken, TileSpec};

/// Nodata sentinel for the accumulation raster (spec §6).
pub const ACC_NODATA: f64 = -1.0;

struct LocalAcc {
    dirs: Grid<f64>,
    acc: Grid<f64>,
}

/// Topologically sorts a tile's interior, counting inflow only from other
/// interior cells (a halo-sourced inflow is, by construction, unknown
/// locally and is instead added later as the perimeter offset). Direction
/// codes classify cells directly: `9` is nodata and terminates a walk.
/// `8` (undefined) terminates a walk too, but is only tolerated as a lone
/// cell with no code-8 neighbor — flat resolution only ever leaves code 8
/// on cells that were never part of a connected equal-elevation flat
/// region (spec §4.5's flat regions are defined over such cells), so an
/// isolated code-8 cell is a genuine local minimum with no lower or
/// equal-elevation neighbor to drain into, not a flat resolution failure.
/// A code-8 cell adjacent to another code-8 cell means flat resolution
/// left an actual flat region unresolved, which is still a hard error.
fn local_accumulate(dirs: &Grid<f64>, spec: &TileSpec) -> Result<Grid<f64>> {
    let bw = dirs.w;
    let bh = dirs.h;
    let mut inflow = Grid::<i32>::new(bw, bh);

    for ly in 0..bh {
        for lx in 0..bw {
            if !spec.is_interior(lx, ly) {
                continue;
            }
            let code = dirs.get(lx, ly);
            if code == DIR_UNDEFINED as f64 {
                let in_unresolved_flat = neighbors8(lx, ly, bw, bh).any(|(_, nx, ny)| dirs.get(nx, ny) == DIR_UNDEFINED as f64);
                if in_unresolved_flat {
                    return Err(PipelineError::invalid_input(lx, ly, "flow direction is undefined (code 8) within an unresolved flat region; accumulation requires resolved flats"));
                }
                continue;
            }
            if code == DIR_NODATA as f64 {
                continue;
            }
            if let Some((nx, ny)) = step(lx, ly, code as u8, bw, bh) {
                if spec.is_interior(nx, ny) {
                    inflow.set(nx, ny, inflow.get(nx, ny) + 1);
                }
            }
        }
    }

    let mut acc = Grid::<f64>::new(bw, bh);
    let mut queue: VecDeque<(usize, usize)> = VecDeque::new();
    let mut remaining = 0usize;
    for ly in 0..bh {
        for lx in 0..bw {
            if !spec.is_interior(lx, ly) {
                continue;
            }
            let code = dirs.get(lx, ly);
            if code == DIR_NODATA as f64 {
                continue;
            }
            remaining += 1;
            if inflow.get(lx, ly) == 0 {
                queue.push_back((lx, ly));
            }
        }
    }

    let mut processed = 0usize;
    while let Some((lx, ly)) = queue.pop_front() {
        processed += 1;
        let total = acc.get(lx, ly) + 1.0;
        acc.set(lx, ly, total);
        let code = dirs.get(lx, ly);
        if code == DIR_NODATA as f64 || code == DIR_UNDEFINED as f64 {
            continue;
        }
        if let Some((nx, ny)) = step(lx, ly, code as u8, bw, bh) {
            if spec.is_interior(nx, ny) {
                acc.set(nx, ny, acc.get(nx, ny) + total);
                let left = inflow.get(nx, ny) - 1;
                inflow.set(nx, ny, left);
                if left == 0 {
                    queue.push_back((nx, ny));
                }
            }
        }
    }

    if processed != remaining {
        return Err(PipelineError::InvalidInput {
            coord: crate::error::CellCoord { col: spec.origin_x, row: spec.origin_y },
            msg: "cycle detected in flow direction graph".into(),
        });
    }

    Ok(acc)
}

/// Outcome of following the flow-direction chain from a perimeter cell.
enum ExitResult {
    /// Reached another interior-perimeter cell without leaving the tile.
    NextPerimeter(usize, usize),
    /// Left the tile interior into a neighboring tile's interior cell
    /// (global coordinates).
    External(usize, usize),
    /// Hit nodata (or an off-raster halo cell) before reaching either of
    /// the above.
    Terminal,
}

/// Follows the direction chain from `(start_x, start_y)` (an interior
/// cell, usually on the perimeter) until it reaches another perimeter
/// cell, leaves the tile, or terminates. Returns every interior cell
/// visited (including the start, excluding a `NextPerimeter` target — that
/// cell is handled by its own walk, spec §4.6).
fn walk_downstream(dirs: &Grid<f64>, spec: &TileSpec, start: (usize, usize), raster_w: usize, raster_h: usize) -> Result<(Vec<(usize, usize)>, ExitResult)> {
    let bw = dirs.w;
    let bh = dirs.h;
    let mut visited = vec![start];
    let mut seen: HashSet<(usize, usize)> = std::iter::once(start).collect();
    let mut current = start;
    let cap = bw * bh + 1;
    for _ in 0..cap {
        let code = dirs.get(current.0, current.1);
        if code == DIR_NODATA as f64 || code == DIR_UNDEFINED as f64 {
            return Ok((visited, ExitResult::Terminal));
        }
        let next = match step(current.0, current.1, code as u8, bw, bh) {
            Some(n) => n,
            None => return Ok((visited, ExitResult::Terminal)),
        };
        if !spec.is_interior(next.0, next.1) {
            return match spec.to_global(next.0, next.1, raster_w, raster_h) {
                Some(g) => Ok((visited, ExitResult::External(g.0, g.1))),
                None => Ok((visited, ExitResult::Terminal)),
            };
        }
        if spec.is_perimeter(next.0, next.1) {
            return Ok((visited, ExitResult::NextPerimeter(next.0, next.1)));
        }
        if !seen.insert(next) {
            return Err(PipelineError::InvalidInput {
                coord: crate::error::CellCoord { col: spec.origin_x, row: spec.origin_y },
                msg: "cycle detected while tracing downstream within a tile".into(),
            });
        }
        current = next;
        visited.push(current);
    }
    Err(PipelineError::InvalidInput {
        coord: crate::error::CellCoord { col: spec.origin_x, row: spec.origin_y },
        msg: "downstream trace exceeded tile bounds (cycle?)".into(),
    })
}

enum EdgeKind {
    Internal,
    External,
}

/// Runs flow accumulation end to end (spec §4.6).
pub fn accumulate(
    dir_source: &dyn RasterSource,
    acc_sink: &dyn RasterSink,
    cfg: &PipelineConfig,
    progress: &dyn ProgressSink,
    cancel: &CancellationToken,
) -> Result<()> {
    let w = dir_source.width();
    let h = dir_source.height();
    let halo = 1usize;
    let tiles = tile::split_tiles(w, h, cfg.chunk_size, halo);
    let total = tiles.len();

    tracing::info!(stage = "accumulation", tiles = total, "starting flow accumulation");

    let locals = tile::run_tiles(&tiles, cancel, |spec| {
        let dirs = tile::read_tile_buffer(dir_source, spec)?;
        let acc = local_accumulate(&dirs, spec)?;
        Ok(LocalAcc { dirs, acc })
    })?;
    progress.on_progress("accumulation:local", total, total);

    // Global phase: build the perimeter link graph.
    let mut local_acc_map: HashMap<(usize, usize), f64> = HashMap::new();
    let mut vertices: Vec<(usize, usize)> = Vec::new();
    let mut out_edges: HashMap<(usize, usize), Vec<((usize, usize), EdgeKind)>> = HashMap::new();
    let mut indegree: HashMap<(usize, usize), usize> = HashMap::new();

    for (spec, local) in tiles.iter().zip(locals.iter()) {
        for ly in 0..local.dirs.h {
            for lx in 0..local.dirs.w {
                if !spec.is_perimeter(lx, ly) {
                    continue;
                }
                let code = local.dirs.get(lx, ly);
                if code == DIR_NODATA as f64 {
                    continue;
                }
                let Some(g) = spec.to_global(lx, ly, w, h) else { continue };
                vertices.push(g);
                local_acc_map.insert(g, local.acc.get(lx, ly));
                indegree.entry(g).or_insert(0);

                let (_, exit) = walk_downstream(&local.dirs, spec, (lx, ly), w, h)?;
                match exit {
                    ExitResult::NextPerimeter(nx, ny) => {
                        if let Some(ng) = spec.to_global(nx, ny, w, h) {
                            out_edges.entry(g).or_default().push((ng, EdgeKind::Internal));
                            *indegree.entry(ng).or_insert(0) += 1;
                        }
                    }
                    ExitResult::External(gx, gy) => {
                        out_edges.entry(g).or_default().push(((gx, gy), EdgeKind::External));
                        *indegree.entry((gx, gy)).or_insert(0) += 1;
                    }
                    ExitResult::Terminal => {}
                }
            }
        }
    }
    vertices.sort_unstable();
    vertices.dedup();

    let mut offset: HashMap<(usize, usize), f64> = HashMap::new();
    let mut queue: VecDeque<(usize, usize)> = vertices.iter().filter(|v| indegree[v] == 0).copied().collect();
    let mut remaining_indeg = indegree.clone();
    let mut processed = 0usize;
    while let Some(v) = queue.pop_front() {
        processed += 1;
        let true_v = local_acc_map.get(&v).copied().unwrap_or(0.0) + offset.get(&v).copied().unwrap_or(0.0);
        if let Some(edges) = out_edges.get(&v) {
            for (to, kind) in edges {
                let contribution = match kind {
                    EdgeKind::Internal => offset.get(&v).copied().unwrap_or(0.0),
                    EdgeKind::External => true_v,
                };
                *offset.entry(*to).or_insert(0.0) += contribution;
                let left = remaining_indeg.get_mut(to).expect("indegree tracked for every edge target");
                *left -= 1;
                if *left == 0 {
                    queue.push_back(*to);
                }
            }
        }
    }
    if processed != vertices.len() {
        return Err(PipelineError::PreconditionViolation(
            "cycle detected in cross-tile flow accumulation graph".into(),
        ));
    }
    progress.on_progress("accumulation:global", total, total);

    // Finalize: add each perimeter cell's resolved offset to every cell on
    // its downstream walk.
    let local_by_pos: HashMap<(usize, usize), usize> =
        tiles.iter().enumerate().map(|(i, t)| ((t.tile_row, t.tile_col), i)).collect();
    tile::run_tiles(&tiles, cancel, |spec| {
        let idx = local_by_pos[&(spec.tile_row, spec.tile_col)];
        let local = &locals[idx];
        let mut acc = local.acc.clone();

        for ly in 0..local.dirs.h {
            for lx in 0..local.dirs.w {
                if !spec.is_perimeter(lx, ly) {
                    continue;
                }
                let Some(g) = spec.to_global(lx, ly, w, h) else { continue };
                let off = offset.get(&g).copied().unwrap_or(0.0);
                if off == 0.0 {
                    continue;
                }
                let (visited, _) = walk_downstream(&local.dirs, spec, (lx, ly), w, h)?;
                for (vx, vy) in visited {
                    acc.set(vx, vy, acc.get(vx, vy) + off);
                }
            }
        }

        let mut out = vec![0.0f64; spec.interior_w * spec.interior_h];
        for row in 0..spec.interior_h {
            for col in 0..spec.interior_w {
                let lx = spec.halo + col;
                let ly = spec.halo + row;
                let code = local.dirs.get(lx, ly);
                out[row * spec.interior_w + col] = if code == DIR_NODATA as f64 { ACC_NODATA } else { acc.get(lx, ly) };
            }
        }
        tile::write_tile_interior(acc_sink, spec, &out)?;
        Ok(())
    })?;
    progress.on_progress("accumulation:finalize", total, total);

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::NoopProgress;
    use crate::raster::{DType, MemRaster};
    use crate::stages::flow_dir::flow_dir;

    fn run_full(rows: &[&[f64]], nodata: f64, chunk_size: usize) -> Vec<f64> {
        let dem = MemRaster::from_rows(rows, DType::F32, nodata);
        let dirs = MemRaster::new(dem.w, dem.h, DType::U8, nodata);
        let mut cfg = PipelineConfig::default();
        cfg.chunk_size = 0;
        flow_dir(&dem, &dirs, &cfg, &NoopProgress, &CancellationToken::new()).unwrap();

        let dir_snapshot = dirs.snapshot();
        let dir_rows: Vec<&[f64]> = dir_snapshot.chunks(dem.w).collect();
        let dir_in = MemRaster::from_rows(&dir_rows, DType::U8, nodata);
        let acc = MemRaster::new(dem.w, dem.h, DType::I64, ACC_NODATA);
        cfg.chunk_size = chunk_size;
        accumulate(&dir_in, &acc, &cfg, &NoopProgress, &CancellationToken::new()).unwrap();
        acc.snapshot()
    }

    #[test]
    fn monotone_slope_accumulates_to_total_cell_count() {
        // Spec scenario 2: monotone 5x5 slope draining to (0,0).
        let rows: [&[f64]; 5] = [
            &[0.0, 1.0, 2.0, 3.0, 4.0],
            &[1.0, 2.0, 3.0, 4.0, 5.0],
            &[2.0, 3.0, 4.0, 5.0, 6.0],
            &[3.0, 4.0, 5.0, 6.0, 7.0],
            &[4.0, 5.0, 6.0, 7.0, 8.0],
        ];
        let out = run_full(&rows, -1.0, 0);
        assert_eq!(out[0], 25.0);
    }

    #[test]
    fn every_valid_cell_has_minimum_accumulation_one() {
        let rows: [&[f64]; 3] = [&[3.0, 2.0, 1.0], &[3.0, 2.0, 1.0], &[3.0, 2.0, 1.0]];
        let out = run_full(&rows, -1.0, 0);
        for &v in &out {
            assert!(v >= 1.0);
        }
    }

    #[test]
    fn tiled_accumulation_matches_single_tile_reference() {
        let rows: [&[f64]; 8] = [
            &[0.0, 1.0, 2.0, 3.0, 7.0, 6.0, 5.0, 4.0],
            &[1.0, 2.0, 3.0, 4.0, 6.0, 5.0, 4.0, 3.0],
            &[2.0, 3.0, 4.0, 5.0, 5.0, 4.0, 3.0, 2.0],
            &[3.0, 4.0, 5.0, 6.0, 4.0, 3.0, 2.0, 1.0],
            &[4.0, 5.0, 6.0, 7.0, 3.0, 2.0, 1.0, 0.5],
            &[5.0, 6.0, 7.0, 8.0, 2.0, 1.0, 0.8, 0.4],
            &[6.0, 7.0, 8.0, 9.0, 1.0, 0.9, 0.6, 0.3],
            &[7.0, 8.0, 9.0, 10.0, 0.5, 0.4, 0.3, 0.1],
        ];
        let whole = run_full(&rows, -1.0, 0);
        let tiled = run_full(&rows, -1.0, 4);
        assert_eq!(whole, tiled);
    }

    #[test]
    fn nodata_cells_propagate_to_nodata_accumulation() {
        let rows: [&[f64]; 3] = [&[5.0, 5.0, 5.0], &[5.0, -1.0, 5.0], &[5.0, 5.0, 5.0]];
        let out = run_full(&rows, -1.0, 0);
        assert_eq!(out[4], ACC_NODATA);
    }

    #[test]
    fn code_eight_is_rejected_as_invalid_input() {
        let dem = MemRaster::new(3, 3, DType::F32, -1.0);
        let dirs = MemRaster::from_rows(
            &[&[8.0, 8.0, 8.0][..], &[8.0, 8.0, 8.0][..], &[8.0, 8.0, 8.0][..]],
            DType::U8,
            -1.0,
        );
        let _ = dem;
        let acc = MemRaster::new(3, 3, DType::I64, ACC_NODATA);
        let cfg = PipelineConfig::default();
        let err = accumulate(&dirs, &acc, &cfg, &NoopProgress, &CancellationToken::new()).unwrap_err();
        assert!(matches!(err, PipelineError::InvalidInput { .. }));
    }
}
