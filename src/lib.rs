//! Hydrological terrain analysis on Digital Elevation Models: depression
//! removal (fill + breach), D8 flow direction and flat resolution, flow
//! accumulation, stream network extraction, basin labeling, and upstream
//! flow-length with longest-flowpath tracing.
//!
//! The crate has no opinion on where rasters and vectors live — every
//! stage is a free function over the [`raster::RasterSource`] /
//! [`raster::RasterSink`] / [`raster::VectorSink`] traits (see `raster`).
//! [`Pipeline`] is a thin convenience that threads one [`config::PipelineConfig`],
//! one [`progress::ProgressSink`], and one [`tile::CancellationToken`]
//! through each stage so callers don't have to repeat them at every call
//! site; it adds no behavior beyond what calling the stage functions
//! directly would give you.

pub mod config;
pub mod error;
pub mod grid;
pub mod progress;
pub mod raster;
pub mod stages;
pub mod tile;

use std::sync::Arc;

use config::PipelineConfig;
use error::Result;
use progress::{NoopProgress, ProgressSink};
use raster::{RasterSink, RasterSource, VectorSink};
use stages::basins::DrainagePoint;
use stages::flow_length::FlowLengthResult;
use tile::CancellationToken;

/// Bundles the config/progress/cancellation every stage function takes,
/// and exposes one method per stage so a caller can drive the whole
/// pipeline without re-threading those three arguments at every call.
pub struct Pipeline {
    pub cfg: PipelineConfig,
    progress: Arc<dyn ProgressSink>,
    cancel: CancellationToken,
}

impl Pipeline {
    pub fn new(cfg: PipelineConfig) -> Self {
        Self {
            cfg,
            progress: Arc::new(NoopProgress),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_progress(mut self, progress: Arc<dyn ProgressSink>) -> Self {
        self.progress = progress;
        self
    }

    /// A clone of the pipeline's cancellation token; call `.cancel()` on
    /// it from another thread to stop the pipeline between tiles.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Conditions a DEM: least-cost breach (spec §4.3) into `breach_scratch`,
    /// then priority-flood fill (spec §4.2) of whatever breach left
    /// unsolved into `conditioned`.
    pub fn condition_dem(
        &self,
        dem: &dyn RasterSource,
        breach_scratch: &(impl RasterSource + RasterSink),
        conditioned: &dyn RasterSink,
    ) -> Result<()> {
        stages::breach::breach(dem, breach_scratch, &self.cfg, self.progress.as_ref(), &self.cancel)?;
        stages::fill::fill(breach_scratch, conditioned, &self.cfg, self.progress.as_ref(), &self.cancel)
    }

    /// D8 flow direction (spec §4.4) on a conditioned DEM.
    pub fn flow_direction(&self, conditioned: &dyn RasterSource, dirs: &dyn RasterSink) -> Result<()> {
        stages::flow_dir::flow_dir(conditioned, dirs, &self.cfg, self.progress.as_ref(), &self.cancel)
    }

    /// Flat resolution (spec §4.5): replaces undefined (code 8) directions
    /// with synthetic gradients. No-op-equivalent input (no code 8 cells)
    /// is a valid, cheap call.
    pub fn resolve_flats(&self, conditioned: &dyn RasterSource, raw_dirs: &dyn RasterSource, resolved_dirs: &dyn RasterSink) -> Result<()> {
        stages::flat::resolve_flats(conditioned, raw_dirs, resolved_dirs, &self.cfg, self.progress.as_ref(), &self.cancel)
    }

    /// Flow accumulation (spec §4.6). `dirs` must have no code-8 cells and
    /// no cycles (run [`Pipeline::resolve_flats`] first if needed).
    pub fn accumulate(&self, dirs: &dyn RasterSource, acc: &dyn RasterSink) -> Result<()> {
        stages::accumulation::accumulate(dirs, acc, &self.cfg, self.progress.as_ref(), &self.cancel)
    }

    /// Stream network extraction (spec §4.7): writes `streams` (LineString)
    /// and `junctions` (Point) features.
    pub fn extract_streams(
        &self,
        dirs: &dyn RasterSource,
        acc: &dyn RasterSource,
        streams_sink: &dyn VectorSink,
        junctions_sink: &dyn VectorSink,
    ) -> Result<()> {
        stages::streams::extract_streams(dirs, acc, streams_sink, junctions_sink, &self.cfg, self.progress.as_ref(), &self.cancel)
    }

    /// Snaps drainage points to the max-accumulation cell within
    /// `cfg.snap_radius`, dropping points outside the raster or stranded
    /// on nodata (spec §4.8, Open Question (a)).
    pub fn snap_drainage_points(
        &self,
        points: &[DrainagePoint],
        w: usize,
        h: usize,
        acc: Option<&dyn RasterSource>,
    ) -> Result<Vec<DrainagePoint>> {
        stages::basins::snap_drainage_points(points, w, h, acc, self.cfg.snap_radius, self.progress.as_ref())
    }

    /// Basin labeling (spec §4.8). `drainage_points` should already be
    /// snapped via [`Pipeline::snap_drainage_points`].
    pub fn label_basins(&self, dirs: &dyn RasterSource, basins_sink: &dyn RasterSink, drainage_points: &[DrainagePoint]) -> Result<()> {
        stages::basins::label_basins(dirs, basins_sink, drainage_points, &self.cfg, self.progress.as_ref(), &self.cancel)
    }

    /// Derives `(upstream_basin, downstream_basin)` edges from a resolved
    /// basin raster, used by longest-flowpath grouping (spec §4.9).
    pub fn basin_adjacency(&self, basins: &dyn RasterSource, dirs: &dyn RasterSource) -> Result<Vec<(i64, i64)>> {
        stages::basins::basin_adjacency(basins, dirs, &self.cfg, &self.cancel)
    }

    /// Polygonizes a resolved basin raster into one boundary ring per basin
    /// id (spec §4.8 "Polygonization", optional and additive on top of the
    /// raster finalize).
    pub fn polygonize_basins(&self, basins: &dyn RasterSource, sink: &dyn VectorSink) -> Result<()> {
        stages::basins::polygonize_basins(basins, sink, &self.cancel)
    }

    /// Upstream flow length (spec §4.9): multi-source BFS from
    /// `drainage_points`, writing a flow-length raster and returning the
    /// per-basin farthest cell needed by [`Pipeline::longest_flow_path`].
    pub fn flow_length(
        &self,
        dirs: &dyn RasterSource,
        drainage_points: &[DrainagePoint],
        length_sink: &dyn RasterSink,
    ) -> Result<FlowLengthResult> {
        stages::flow_length::flow_length(dirs, drainage_points, length_sink, &self.cfg, self.progress.as_ref(), &self.cancel)
    }

    /// Longest-flowpath polylines (spec §4.9): one per outlet basin.
    pub fn longest_flow_path(
        &self,
        dirs: &dyn RasterSource,
        outlet_basins: &[i64],
        adjacency: &[(i64, i64)],
        result: &FlowLengthResult,
        sink: &dyn VectorSink,
    ) -> Result<()> {
        stages::flow_length::longest_flow_path(dirs, outlet_basins, adjacency, result, sink)
    }
}
