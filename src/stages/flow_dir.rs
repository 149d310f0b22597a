//! D8 flow direction (spec §4.4). Purely local: halo of 1, no global phase.

use crate::config::PipelineConfig;
use crate::error::Result;
use crate::grid::{neighbors8, DIR_NODATA, DIR_UNDEFINED};
use crate::progress::ProgressSink;
use crate::raster::{is_nodata, RasterSink, RasterSource};
use crate::tile::{self, CancellationToken};

/// Direction of steepest positive slope out of `(x, y)`, or [`DIR_UNDEFINED`]
/// if no neighbor is lower.
fn steepest_direction(buf: &crate::grid::Grid<f64>, nodata: f64, x: usize, y: usize) -> u8 {
    let z = buf.get(x, y);
    let mut best_dir = DIR_UNDEFINED;
    let mut best_slope = 0.0f64;
    for (dir, nx, ny) in neighbors8(x, y, buf.w, buf.h) {
        let zn = buf.get(nx, ny);
        if is_nodata(zn, nodata) {
            continue;
        }
        let d = crate::grid::D8_DIST[dir as usize];
        let slope = (z - zn) / d;
        if slope > best_slope {
            best_slope = slope;
            best_dir = dir;
        }
    }
    best_dir
}

pub fn flow_dir(
    source: &dyn RasterSource,
    sink: &dyn RasterSink,
    cfg: &PipelineConfig,
    progress: &dyn ProgressSink,
    cancel: &CancellationToken,
) -> Result<()> {
    let w = source.width();
    let h = source.height();
    let nodata = source.nodata();
    let tiles = tile::split_tiles(w, h, cfg.chunk_size, 1);
    let total = tiles.len();

    tracing::info!(stage = "flow_dir", tiles = total, "computing D8 flow direction");

    tile::run_tiles(&tiles, cancel, |spec| {
        let buf = tile::read_tile_buffer(source, spec)?;
        let mut out = vec![0.0f64; spec.interior_w * spec.interior_h];
        for row in 0..spec.interior_h {
            for col in 0..spec.interior_w {
                let lx = spec.halo + col;
                let ly = spec.halo + row;
                let z = buf.get(lx, ly);
                let code = if is_nodata(z, nodata) {
                    DIR_NODATA
                } else {
                    steepest_direction(&buf, nodata, lx, ly)
                };
                out[row * spec.interior_w + col] = code as f64;
            }
        }
        tile::write_tile_interior(sink, spec, &out)?;
        Ok(())
    })?;
    progress.on_progress("flow_dir", total, total);

    Ok(())
}
