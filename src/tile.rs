//! Tile splitting and the scheduler that drives every stage's local/global/
//! finalize phases (spec §4.1, §5).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use rayon::prelude::*;

use crate::error::{PipelineError, Result};
use crate::grid::Grid;
use crate::raster::{RasterSink, RasterSource};

/// How a stage intends to touch a tile's interior.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AccessMode {
    ReadOnly,
    ReadModifyWrite,
    WriteNew,
}

/// A single tile's geometry: its place in the tile grid, its interior
/// extent in raster space, and the halo width its owning stage declared.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TileSpec {
    pub tile_row: usize,
    pub tile_col: usize,
    /// Interior origin, in raster cell coordinates.
    pub origin_x: usize,
    pub origin_y: usize,
    pub interior_w: usize,
    pub interior_h: usize,
    pub halo: usize,
}

impl TileSpec {
    /// Width/height of the buffered (interior + halo) tile.
    pub fn buffered_w(&self) -> usize {
        self.interior_w + 2 * self.halo
    }

    pub fn buffered_h(&self) -> usize {
        self.interior_h + 2 * self.halo
    }

    /// Translate a buffered-tile-local coordinate to raster-global
    /// coordinates. Returns `None` for halo cells that fall outside the
    /// raster (these are the padded cells).
    pub fn to_global(&self, lx: usize, ly: usize, raster_w: usize, raster_h: usize) -> Option<(usize, usize)> {
        let gx = self.origin_x as i64 + lx as i64 - self.halo as i64;
        let gy = self.origin_y as i64 + ly as i64 - self.halo as i64;
        if gx < 0 || gy < 0 || gx as usize >= raster_w || gy as usize >= raster_h {
            None
        } else {
            Some((gx as usize, gy as usize))
        }
    }

    /// Whether buffered-local coordinate `(lx, ly)` lies in the tile's
    /// interior (as opposed to its halo).
    pub fn is_interior(&self, lx: usize, ly: usize) -> bool {
        lx >= self.halo && lx < self.halo + self.interior_w && ly >= self.halo && ly < self.halo + self.interior_h
    }

    /// True when `(lx, ly)` sits on the tile's interior perimeter — the
    /// ring of interior cells adjacent to the halo or raster edge. Several
    /// stages (accumulation, streams, flat resolution) drive their global
    /// phase off exactly this set.
    pub fn is_perimeter(&self, lx: usize, ly: usize) -> bool {
        if !self.is_interior(lx, ly) {
            return false;
        }
        lx == self.halo
            || ly == self.halo
            || lx == self.halo + self.interior_w - 1
            || ly == self.halo + self.interior_h - 1
    }
}

/// Splits a `raster_w x raster_h` raster into row-major tiles of interior
/// side `chunk_size` (clipped at the raster edge) with the given halo.
/// `chunk_size <= 1` yields a single tile covering the whole raster
/// (spec §6, in-memory single-tile mode).
pub fn split_tiles(raster_w: usize, raster_h: usize, chunk_size: usize, halo: usize) -> Vec<TileSpec> {
    let s = if chunk_size <= 1 { raster_w.max(raster_h).max(1) } else { chunk_size };
    let mut tiles = Vec::new();
    let mut tile_row = 0;
    let mut y = 0;
    while y < raster_h {
        let interior_h = s.min(raster_h - y);
        let mut tile_col = 0;
        let mut x = 0;
        while x < raster_w {
            let interior_w = s.min(raster_w - x);
            tiles.push(TileSpec {
                tile_row,
                tile_col,
                origin_x: x,
                origin_y: y,
                interior_w,
                interior_h,
                halo,
            });
            x += interior_w;
            tile_col += 1;
        }
        y += interior_h;
        tile_row += 1;
    }
    tiles
}

/// Reads a tile's buffered (interior + halo) window from `source`,
/// returning `nodata` for halo cells that fall outside the raster.
pub fn read_tile_buffer(source: &dyn RasterSource, spec: &TileSpec) -> Result<Grid<f64>> {
    let w = source.width();
    let h = source.height();
    let nodata = source.nodata();
    let bw = spec.buffered_w();
    let bh = spec.buffered_h();
    let mut buf = Grid::filled(bw, bh, nodata);

    // Largest contiguous in-bounds rectangle of the buffered window, read in
    // one call and copied in; remaining halo cells stay at `nodata`.
    let gx0 = spec.origin_x as i64 - spec.halo as i64;
    let gy0 = spec.origin_y as i64 - spec.halo as i64;
    let clip_x0 = gx0.max(0) as usize;
    let clip_y0 = gy0.max(0) as usize;
    let clip_x1 = ((gx0 + bw as i64).min(w as i64)).max(0) as usize;
    let clip_y1 = ((gy0 + bh as i64).min(h as i64)).max(0) as usize;
    if clip_x1 > clip_x0 && clip_y1 > clip_y0 {
        let cw = clip_x1 - clip_x0;
        let ch = clip_y1 - clip_y0;
        let rows = source.read_window(clip_x0, clip_y0, cw, ch)?;
        let local_x0 = (clip_x0 as i64 - gx0) as usize;
        let local_y0 = (clip_y0 as i64 - gy0) as usize;
        for row in 0..ch {
            let src_start = row * cw;
            let dst_start = (local_y0 + row) * bw + local_x0;
            buf.data[dst_start..dst_start + cw].copy_from_slice(&rows[src_start..src_start + cw]);
        }
    }
    Ok(buf)
}

/// Writes a tile's interior back to `sink`. `interior` must be row-major
/// `interior_w x interior_h`.
pub fn write_tile_interior(sink: &dyn RasterSink, spec: &TileSpec, interior: &[f64]) -> Result<()> {
    debug_assert_eq!(interior.len(), spec.interior_w * spec.interior_h);
    sink.write_window(spec.origin_x, spec.origin_y, spec.interior_w, interior)
}

/// Cooperative cancellation flag checked between tiles and inner loops of
/// long-running kernels (spec §5).
#[derive(Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(false)))
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(PipelineError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Drives a stage's local phase across every tile in parallel, then its
/// finalize phase likewise, with the caller responsible for the
/// single-threaded global phase in between (spec §4.1, §5). Tile results
/// are collected into a `Vec` indexed by `tiles`' row-major order
/// regardless of completion order, satisfying the deterministic-iteration
/// requirement without extra bookkeeping.
pub fn run_tiles<T, F>(tiles: &[TileSpec], cancel: &CancellationToken, f: F) -> Result<Vec<T>>
where
    T: Send,
    F: Fn(&TileSpec) -> Result<T> + Sync,
{
    tiles
        .par_iter()
        .map(|spec| {
            cancel.check()?;
            f(spec)
        })
        .collect()
}
