//! Basin labeling (spec §4.8): seeds every tile-local outlet with a fresh
//! label, walks the upstream tree from each seed splitting off a new label
//! whenever a user drainage point is crossed, links per-tile labels into a
//! forest across tile boundaries, and resolves each label forward to either
//! a user basin ID or a terminal outlet.
//!
//! Basin adjacency (used by flow length, spec §4.9) is derived separately,
//! directly from the *resolved* raster rather than the tile-local label
//! graph: a basin boundary can fall in the middle of a tile wherever a
//! drainage point splits the network, not only at tile seams.

use std::collections::{HashMap, HashSet};

use crate::config::PipelineConfig;
use crate::error::Result;
use crate::grid::{neighbors8, step, Grid, DIR_NODATA, DIR_UNDEFINED};
use crate::progress::ProgressSink;
use crate::raster::{is_nodata, AttributeValue, RasterSink, RasterSource, VectorFeature, VectorSink};
use crate::tile::{self, CancellationToken, TileSpec};

/// A user-specified drainage point: the outlet of a named basin.
#[derive(Clone, Copy, Debug)]
pub struct DrainagePoint {
    pub col: usize,
    pub row: usize,
    pub basin_id: i64,
}

pub const BASIN_NODATA: f64 = -1.0;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Kind {
    Auto,
    User(i64),
}

/// Tile-local synthetic label id: `(tile index, local counter)` packed the
/// same way fill's cross-tile solve packs its pit ids.
#[inline]
fn gid(tile_idx: usize, local: u32) -> u64 {
    ((tile_idx as u64) << 32) | local as u64
}

/// Snaps drainage points to the max-accumulation cell within `snap_radius`
/// (Open Question (a)), dropping points that fall outside the raster or, if
/// no valid accumulation cell is found near them, those left stranded on
/// nodata. Reports the dropped count via `progress`.
pub fn snap_drainage_points(
    points: &[DrainagePoint],
    w: usize,
    h: usize,
    acc: Option<&dyn RasterSource>,
    snap_radius: usize,
    progress: &dyn ProgressSink,
) -> Result<Vec<DrainagePoint>> {
    let mut out = Vec::with_capacity(points.len());
    let mut dropped = 0usize;
    for p in points {
        if p.col >= w || p.row >= h {
            dropped += 1;
            continue;
        }
        let Some(acc) = acc else {
            out.push(*p);
            continue;
        };
        if snap_radius == 0 {
            let v = acc.read_window(p.col, p.row, 1, 1)?[0];
            if is_nodata(v, acc.nodata()) {
                dropped += 1;
            } else {
                out.push(*p);
            }
            continue;
        }
        let r = snap_radius as i64;
        let x0 = (p.col as i64 - r).max(0) as usize;
        let y0 = (p.row as i64 - r).max(0) as usize;
        let x1 = ((p.col as i64 + r + 1).min(w as i64)) as usize;
        let y1 = ((p.row as i64 + r + 1).min(h as i64)) as usize;
        let ww = x1 - x0;
        let hh = y1 - y0;
        let window = acc.read_window(x0, y0, ww, hh)?;
        let nodata = acc.nodata();
        let mut best: Option<(f64, usize, usize)> = None;
        for row in 0..hh {
            for col in 0..ww {
                let v = window[row * ww + col];
                if is_nodata(v, nodata) {
                    continue;
                }
                let better = match best {
                    None => true,
                    Some((bv, by, bx)) => v > bv || (v == bv && (y0 + row, x0 + col) < (by, bx)),
                };
                if better {
                    best = Some((v, y0 + row, x0 + col));
                }
            }
        }
        match best {
            Some((_, row, col)) => out.push(DrainagePoint { col, row, basin_id: p.basin_id }),
            None => dropped += 1,
        }
    }
    if dropped > 0 {
        progress.on_dropped_points(dropped);
    }
    Ok(out)
}

struct LocalBasins {
    label: Grid<u64>,
    kind: HashMap<u64, Kind>,
    local_edges: Vec<(u64, u64)>,
}

fn local_outlets_and_bfs(
    spec: &TileSpec,
    dirs: &Grid<f64>,
    tile_idx: usize,
    points_here: &HashMap<(usize, usize), i64>,
) -> LocalBasins {
    let bw = dirs.w;
    let bh = dirs.h;
    let mut label = Grid::<u64>::new(bw, bh);
    let mut kind: HashMap<u64, Kind> = HashMap::new();
    let mut local_edges = Vec::new();
    let mut next_local: u32 = 1;

    let downstream = |x: usize, y: usize| -> Option<(usize, usize)> {
        let code = dirs.get(x, y);
        if code == DIR_NODATA as f64 || code == DIR_UNDEFINED as f64 {
            return None;
        }
        step(x, y, code as u8, bw, bh)
    };

    let mut queue = std::collections::VecDeque::new();
    for ly in spec.halo..spec.halo + spec.interior_h {
        for lx in spec.halo..spec.halo + spec.interior_w {
            let is_outlet = match downstream(lx, ly) {
                Some(next) => !spec.is_interior(next.0, next.1),
                None => true,
            };
            if !is_outlet {
                continue;
            }
            let id = gid(tile_idx, next_local);
            next_local += 1;
            let k = match points_here.get(&(lx, ly)) {
                Some(&bid) => Kind::User(bid),
                None => Kind::Auto,
            };
            kind.insert(id, k);
            label.set(lx, ly, id);
            queue.push_back((lx, ly));
        }
    }

    while let Some((cx, cy)) = queue.pop_front() {
        let lc = label.get(cx, cy);
        for (_, nx, ny) in neighbors8(cx, cy, bw, bh) {
            if !spec.is_interior(nx, ny) || label.get(nx, ny) != 0 {
                continue;
            }
            if let Some(next) = downstream(nx, ny) {
                if next != (cx, cy) {
                    continue;
                }
            } else {
                continue;
            }
            if let Some(&bid) = points_here.get(&(nx, ny)) {
                let new_id = gid(tile_idx, next_local);
                next_local += 1;
                kind.insert(new_id, Kind::User(bid));
                label.set(nx, ny, new_id);
                local_edges.push((new_id, lc));
                queue.push_back((nx, ny));
            } else {
                label.set(nx, ny, lc);
                queue.push_back((nx, ny));
            }
        }
    }

    LocalBasins { label, kind, local_edges }
}

fn resolve(
    id: u64,
    kind: &HashMap<u64, Kind>,
    out_edges: &HashMap<u64, u64>,
    all_basins: bool,
    next_terminal_id: &mut i64,
    cache: &mut HashMap<u64, Option<i64>>,
) -> Option<i64> {
    if let Some(&v) = cache.get(&id) {
        return v;
    }
    let mut chain = vec![id];
    let mut cur = id;
    let resolved = loop {
        if let Some(&v) = cache.get(&cur) {
            break v;
        }
        match kind.get(&cur) {
            Some(Kind::User(u)) => break Some(*u),
            _ => match out_edges.get(&cur) {
                Some(&next) => {
                    chain.push(next);
                    cur = next;
                }
                None => {
                    break if all_basins {
                        let v = *next_terminal_id;
                        *next_terminal_id += 1;
                        Some(v)
                    } else {
                        None
                    };
                }
            },
        }
    };
    for v in chain {
        cache.insert(v, resolved);
    }
    resolved
}

/// Runs basin labeling end to end (spec §4.8). `drainage_points` should
/// already be snapped via [`snap_drainage_points`].
pub fn label_basins(
    dir_source: &dyn RasterSource,
    basin_sink: &dyn RasterSink,
    drainage_points: &[DrainagePoint],
    cfg: &PipelineConfig,
    progress: &dyn ProgressSink,
    cancel: &CancellationToken,
) -> Result<()> {
    let w = dir_source.width();
    let h = dir_source.height();
    let halo = 1usize;
    let tiles = tile::split_tiles(w, h, cfg.chunk_size, halo);
    let total = tiles.len();

    tracing::info!(stage = "basins", tiles = total, drainage_points = drainage_points.len(), "labeling basins");

    let mut by_point_tile: Vec<HashMap<(usize, usize), i64>> = vec![HashMap::new(); tiles.len()];
    for (idx, spec) in tiles.iter().enumerate() {
        for dp in drainage_points {
            if dp.col >= spec.origin_x
                && dp.col < spec.origin_x + spec.interior_w
                && dp.row >= spec.origin_y
                && dp.row < spec.origin_y + spec.interior_h
            {
                let lx = dp.col - spec.origin_x + spec.halo;
                let ly = dp.row - spec.origin_y + spec.halo;
                by_point_tile[idx].insert((lx, ly), dp.basin_id);
            }
        }
    }

    let dirs_per_tile: Vec<Grid<f64>> = tiles
        .iter()
        .map(|spec| {
            cancel.check()?;
            tile::read_tile_buffer(dir_source, spec)
        })
        .collect::<Result<Vec<_>>>()?;

    let locals: Vec<LocalBasins> = tiles
        .iter()
        .enumerate()
        .zip(dirs_per_tile.iter())
        .map(|((idx, spec), dirs)| local_outlets_and_bfs(spec, dirs, idx, &by_point_tile[idx]))
        .collect();
    progress.on_progress("basins:local", total, total);

    let mut kind: HashMap<u64, Kind> = HashMap::new();
    let mut out_edges: HashMap<u64, u64> = HashMap::new();
    for l in &locals {
        kind.extend(l.kind.iter().map(|(&k, &v)| (k, v)));
        for &(src, dst) in &l.local_edges {
            out_edges.insert(src, dst);
        }
    }

    let by_rc: HashMap<(usize, usize), usize> =
        tiles.iter().enumerate().map(|(i, s)| ((s.tile_row, s.tile_col), i)).collect();

    let mut connect_pair = |a_idx: usize, b_idx: usize| {
        let (spec_a, dirs_a, label_a) = (&tiles[a_idx], &dirs_per_tile[a_idx], &locals[a_idx].label);
        let (spec_b, label_b) = (&tiles[b_idx], &locals[b_idx].label);
        for ly in 0..spec_a.interior_h + 2 * spec_a.halo {
            for lx in 0..spec_a.interior_w + 2 * spec_a.halo {
                if !spec_a.is_perimeter(lx, ly) {
                    continue;
                }
                let Some((gx, gy)) = spec_a.to_global(lx, ly, w, h) else { continue };
                for (_, nx, ny) in neighbors8(lx, ly, dirs_a.w, dirs_a.h) {
                    let Some((ngx, ngy)) = spec_a.to_global(nx, ny, w, h) else { continue };
                    if !spec_b.is_interior(
                        (ngx as i64 - spec_b.origin_x as i64 + spec_b.halo as i64) as usize,
                        (ngy as i64 - spec_b.origin_y as i64 + spec_b.halo as i64) as usize,
                    ) {
                        continue;
                    }
                    let code = dirs_a.get(lx, ly);
                    if code == DIR_NODATA as f64 || code == DIR_UNDEFINED as f64 {
                        continue;
                    }
                    if let Some(next) = step(lx, ly, code as u8, dirs_a.w, dirs_a.h) {
                        if spec_a.to_global(next.0, next.1, w, h) == Some((ngx, ngy)) {
                            let blx = (ngx as i64 - spec_b.origin_x as i64 + spec_b.halo as i64) as usize;
                            let bly = (ngy as i64 - spec_b.origin_y as i64 + spec_b.halo as i64) as usize;
                            out_edges.insert(label_a.get(lx, ly), label_b.get(blx, bly));
                        }
                    }
                }
            }
        }
    };

    for spec in &tiles {
        let (r, c) = (spec.tile_row, spec.tile_col);
        if let Some(&right) = by_rc.get(&(r, c + 1)) {
            let a = by_rc[&(r, c)];
            connect_pair(a, right);
            connect_pair(right, a);
        }
        if let Some(&down) = by_rc.get(&(r + 1, c)) {
            let a = by_rc[&(r, c)];
            connect_pair(a, down);
            connect_pair(down, a);
        }
        if let Some(&dr) = by_rc.get(&(r + 1, c + 1)) {
            let a = by_rc[&(r, c)];
            connect_pair(a, dr);
            connect_pair(dr, a);
        }
        if c > 0 {
            if let Some(&dl) = by_rc.get(&(r + 1, c - 1)) {
                let a = by_rc[&(r, c)];
                connect_pair(a, dl);
                connect_pair(dl, a);
            }
        }
    }
    progress.on_progress("basins:global", total, total);

    let mut resolved_cache: HashMap<u64, Option<i64>> = HashMap::new();
    let mut next_terminal_id: i64 = 1_000_000_000;
    let all_ids: Vec<u64> = kind.keys().copied().collect();
    let mut resolved: HashMap<u64, Option<i64>> = HashMap::new();
    for id in all_ids {
        let v = resolve(id, &kind, &out_edges, cfg.all_basins, &mut next_terminal_id, &mut resolved_cache);
        resolved.insert(id, v);
    }

    tiles
        .iter()
        .enumerate()
        .try_for_each(|(idx, spec)| -> Result<()> {
            cancel.check()?;
            let label = &locals[idx].label;
            let mut out = vec![BASIN_NODATA; spec.interior_w * spec.interior_h];
            for row in 0..spec.interior_h {
                for col in 0..spec.interior_w {
                    let lx = spec.halo + col;
                    let ly = spec.halo + row;
                    let id = label.get(lx, ly);
                    out[row * spec.interior_w + col] = resolved.get(&id).copied().flatten().map(|v| v as f64).unwrap_or(BASIN_NODATA);
                }
            }
            tile::write_tile_interior(basin_sink, spec, &out)
        })?;
    progress.on_progress("basins:finalize", total, total);

    Ok(())
}

/// Derives a basin adjacency edge list `(upstream_basin, downstream_basin)`
/// directly from the resolved basin raster and the flow direction raster:
/// for every cell whose basin differs from its downstream neighbor's, that
/// pair is an edge. Basin boundaries can fall anywhere a drainage point
/// split the network, not only at tile seams, so this is a plain
/// single-hop scan rather than a cross-tile graph solve (spec §4.9 reuses
/// this for longest-flowpath basin grouping).
pub fn basin_adjacency(
    basin_source: &dyn RasterSource,
    dir_source: &dyn RasterSource,
    cfg: &PipelineConfig,
    cancel: &CancellationToken,
) -> Result<Vec<(i64, i64)>> {
    let w = basin_source.width();
    let h = basin_source.height();
    let basin_nodata = basin_source.nodata();
    let dir_nodata = dir_source.nodata();
    let tiles = tile::split_tiles(w, h, cfg.chunk_size, 1);

    let edge_sets = tile::run_tiles(&tiles, cancel, |spec| {
        let basins = tile::read_tile_buffer(basin_source, spec)?;
        let dirs = tile::read_tile_buffer(dir_source, spec)?;
        let mut edges = std::collections::HashSet::new();
        for row in 0..spec.interior_h {
            for col in 0..spec.interior_w {
                let lx = spec.halo + col;
                let ly = spec.halo + row;
                let b = basins.get(lx, ly);
                if is_nodata(b, basin_nodata) {
                    continue;
                }
                let code = dirs.get(lx, ly);
                if code == DIR_NODATA as f64 || code == DIR_UNDEFINED as f64 || is_nodata(code, dir_nodata) {
                    continue;
                }
                if let Some((nx, ny)) = step(lx, ly, code as u8, dirs.w, dirs.h) {
                    let nb = basins.get(nx, ny);
                    if is_nodata(nb, basin_nodata) {
                        continue;
                    }
                    if nb != b {
                        edges.insert((b as i64, nb as i64));
                    }
                }
            }
        }
        Ok(edges)
    })?;

    let mut all: std::collections::HashSet<(i64, i64)> = std::collections::HashSet::new();
    for set in edge_sets {
        all.extend(set);
    }
    Ok(all.into_iter().collect())
}

/// Clockwise 8-neighbor offsets `(drow, dcol)` starting at North, used by
/// [`moore_boundary`].
const MOORE_DIRS: [(i64, i64); 8] = [
    (-1, 0),
    (-1, 1),
    (0, 1),
    (1, 1),
    (1, 0),
    (1, -1),
    (0, -1),
    (-1, -1),
];

/// Traces the 8-connected boundary of the `true` region in `mask` that
/// contains `start`, via Moore-neighbor contour tracing (spec §4.8
/// "Polygonization"): starting from `start` with a virtual backtrack
/// pointing west, repeatedly walk to the next foreground pixel found by
/// scanning clockwise from just past the backtrack direction, until the
/// walk returns to `start`. Returns the ordered ring of pixel `(row, col)`
/// coordinates (not yet closed — the caller repeats the first point to
/// close the ring). A single isolated foreground pixel yields a one-element
/// ring.
fn moore_boundary(mask: &Grid<bool>, start: (usize, usize)) -> Vec<(usize, usize)> {
    let mut boundary = vec![start];
    let mut current = start;
    let mut backtrack_dir = 6usize; // west
    loop {
        let mut found = None;
        for k in 1..=8 {
            let dir_idx = (backtrack_dir + k) % 8;
            let (dr, dc) = MOORE_DIRS[dir_idx];
            let nr = current.0 as i64 + dr;
            let nc = current.1 as i64 + dc;
            if nr < 0 || nc < 0 || nr as usize >= mask.h || nc as usize >= mask.w {
                continue;
            }
            if mask.get(nc as usize, nr as usize) {
                found = Some((dir_idx, (nr as usize, nc as usize)));
                break;
            }
        }
        let Some((dir_idx, next)) = found else {
            break;
        };
        if next == start {
            break;
        }
        boundary.push(next);
        backtrack_dir = (dir_idx + 4) % 8;
        current = next;
        if boundary.len() > mask.w * mask.h + 1 {
            break; // safety bound; should be unreachable for a well-formed mask
        }
    }
    boundary
}

/// Polygonizes a resolved basin raster (spec §4.8 "Polygonization"): for
/// every distinct basin id present, traces one exterior ring around its
/// cells via [`moore_boundary`] and emits it as a `VectorFeature` with a
/// `basin_id` attribute. Whole-raster and not tiled: this is an optional
/// finishing step on top of the already-finalized raster, not one of the
/// core tiled algorithms (§3's global-graph stages).
pub fn polygonize_basins(basin_source: &dyn RasterSource, sink: &dyn VectorSink, cancel: &CancellationToken) -> Result<()> {
    let w = basin_source.width();
    let h = basin_source.height();
    let nodata = basin_source.nodata();
    let gt = basin_source.geotransform();
    let values = basin_source.read_window(0, 0, w, h)?;

    let mut ids: Vec<i64> = values
        .iter()
        .filter(|&&v| !is_nodata(v, nodata))
        .map(|&v| v as i64)
        .collect::<HashSet<_>>()
        .into_iter()
        .collect();
    ids.sort_unstable();

    for (fid, id) in ids.into_iter().enumerate() {
        cancel.check()?;
        let mut mask = Grid::<bool>::new(w, h);
        let mut start = None;
        for row in 0..h {
            for col in 0..w {
                if values[row * w + col] as i64 == id {
                    mask.set(col, row, true);
                    if start.is_none() {
                        start = Some((row, col));
                    }
                }
            }
        }
        let Some(start) = start else { continue };
        let ring = moore_boundary(&mask, start);
        let mut geometry: Vec<(f64, f64)> = ring.iter().map(|&(row, col)| gt.cell_center(col, row)).collect();
        if let Some(&first) = geometry.first() {
            geometry.push(first);
        }
        sink.write_feature(VectorFeature {
            fid: fid as u64,
            geometry,
            attributes: vec![("basin_id".to_string(), AttributeValue::Int(id))],
        })?;
    }
    Ok(())
}
