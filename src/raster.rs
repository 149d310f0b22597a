//! Raster/vector collaborator traits (spec §6).
//!
//! The core never talks to a concrete geospatial library. It only requires
//! an implementation of [`RasterSource`]/[`RasterSink`] (and, for stream and
//! basin vector output, [`VectorSource`]/[`VectorSink`]). [`MemRaster`] and
//! [`MemVector`] are in-memory reference implementations used by this
//! crate's own tests and by the demo CLI (see `src/bin/hydrotool.rs`); they
//! are not meant to replace a real raster library in production use.

use std::sync::Mutex;

use crate::error::{PipelineError, Result};

/// Whether `v` should be treated as the raster's nodata sentinel. The spec
/// treats `nodata ≡ NaN` for all comparisons, so both an explicit `NaN` and
/// the declared sentinel value compare equal to nodata.
#[inline]
pub fn is_nodata(v: f64, nodata: f64) -> bool {
    v.is_nan() || v == nodata
}

/// Cell data type tag, mirroring the on-disk layouts the pipeline produces
/// (spec §6).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DType {
    F32,
    I64,
    U8,
}

/// Affine geotransform: `(x0, dx, 0, y0, 0, dy)`. Only axis-aligned
/// transforms (no rotation/shear) are supported, matching the spec.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct GeoTransform {
    pub x0: f64,
    pub dx: f64,
    pub y0: f64,
    pub dy: f64,
}

impl GeoTransform {
    pub fn identity() -> Self {
        Self { x0: 0.0, dx: 1.0, y0: 0.0, dy: 1.0 }
    }

    /// World-space center of cell `(col, row)`.
    pub fn cell_center(&self, col: usize, row: usize) -> (f64, f64) {
        (
            self.x0 + (col as f64 + 0.5) * self.dx,
            self.y0 + (row as f64 + 0.5) * self.dy,
        )
    }
}

/// Coordinate reference system metadata relevant to the core: whether
/// distances should be computed as planar Euclidean (projected) or
/// Haversine over a sphere (geographic).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Crs {
    pub is_projected: bool,
}

impl Crs {
    pub const PROJECTED: Crs = Crs { is_projected: true };
    pub const GEOGRAPHIC: Crs = Crs { is_projected: false };
}

/// Read-only source of a single-band raster.
pub trait RasterSource: Send + Sync {
    fn width(&self) -> usize;
    fn height(&self) -> usize;
    fn dtype(&self) -> DType;
    fn nodata(&self) -> f64;
    fn geotransform(&self) -> GeoTransform;
    fn crs(&self) -> Crs;

    /// Read a `w x h` window starting at `(x, y)` as row-major `f64`
    /// (callers downcast per `dtype` as needed). Out-of-range windows are a
    /// caller bug in this abstraction's contract, not a recoverable error,
    /// matching how the spec treats halo padding as the scheduler's job
    /// (§4.1), not the source's.
    fn read_window(&self, x: usize, y: usize, w: usize, h: usize) -> Result<Vec<f64>>;
}

/// Thread-safe sink for a single-band raster.
pub trait RasterSink: Send + Sync {
    fn write_window(&self, x: usize, y: usize, w: usize, data: &[f64]) -> Result<()>;
}

/// A point or polyline vector feature with an FID and string/number
/// attributes (spec §6). Geometry is kept in `Vec<(f64, f64)>` world-space
/// coordinates: a single point for point features, an ordered polyline
/// otherwise.
#[derive(Clone, Debug, PartialEq)]
pub struct VectorFeature {
    pub fid: u64,
    pub geometry: Vec<(f64, f64)>,
    pub attributes: Vec<(String, AttributeValue)>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum AttributeValue {
    Text(String),
    Int(i64),
    Real(f64),
}

pub trait VectorSource: Send + Sync {
    fn layer_name(&self) -> &str;
    fn features(&self) -> Result<Vec<VectorFeature>>;
}

pub trait VectorSink: Send + Sync {
    fn layer_name(&self) -> &str;
    fn write_feature(&self, feature: VectorFeature) -> Result<()>;
}

/// In-memory `RasterSource`/`RasterSink` used by tests and the demo CLI.
pub struct MemRaster {
    pub w: usize,
    pub h: usize,
    pub dtype: DType,
    pub nodata: f64,
    pub geotransform: GeoTransform,
    pub crs: Crs,
    data: Mutex<Vec<f64>>,
}

impl MemRaster {
    pub fn new(w: usize, h: usize, dtype: DType, nodata: f64) -> Self {
        Self {
            w,
            h,
            dtype,
            nodata,
            geotransform: GeoTransform::identity(),
            crs: Crs::PROJECTED,
            data: Mutex::new(vec![nodata; w * h]),
        }
    }

    pub fn from_rows(rows: &[&[f64]], dtype: DType, nodata: f64) -> Self {
        let h = rows.len();
        let w = rows.first().map(|r| r.len()).unwrap_or(0);
        let mut data = Vec::with_capacity(w * h);
        for row in rows {
            assert_eq!(row.len(), w, "ragged MemRaster rows");
            data.extend_from_slice(row);
        }
        Self {
            w,
            h,
            dtype,
            nodata,
            geotransform: GeoTransform::identity(),
            crs: Crs::PROJECTED,
            data: Mutex::new(data),
        }
    }

    pub fn with_geotransform(mut self, gt: GeoTransform) -> Self {
        self.geotransform = gt;
        self
    }

    pub fn with_crs(mut self, crs: Crs) -> Self {
        self.crs = crs;
        self
    }

    pub fn snapshot(&self) -> Vec<f64> {
        self.data.lock().expect("MemRaster mutex poisoned").clone()
    }

    pub fn get(&self, x: usize, y: usize) -> f64 {
        self.data.lock().expect("MemRaster mutex poisoned")[y * self.w + x]
    }
}

impl RasterSource for MemRaster {
    fn width(&self) -> usize {
        self.w
    }

    fn height(&self) -> usize {
        self.h
    }

    fn dtype(&self) -> DType {
        self.dtype
    }

    fn nodata(&self) -> f64 {
        self.nodata
    }

    fn geotransform(&self) -> GeoTransform {
        self.geotransform
    }

    fn crs(&self) -> Crs {
        self.crs
    }

    fn read_window(&self, x: usize, y: usize, w: usize, h: usize) -> Result<Vec<f64>> {
        if x + w > self.w || y + h > self.h {
            return Err(PipelineError::Internal(format!(
                "read_window out of range: ({x},{y},{w},{h}) on {}x{} raster",
                self.w, self.h
            )));
        }
        let guard = self.data.lock().expect("MemRaster mutex poisoned");
        let mut out = Vec::with_capacity(w * h);
        for row in y..y + h {
            let start = row * self.w + x;
            out.extend_from_slice(&guard[start..start + w]);
        }
        Ok(out)
    }
}

impl RasterSink for MemRaster {
    fn write_window(&self, x: usize, y: usize, w: usize, data: &[f64]) -> Result<()> {
        let h = data.len() / w.max(1);
        if x + w > self.w || y + h > self.h {
            return Err(PipelineError::Internal(format!(
                "write_window out of range: ({x},{y},{w},{h}) on {}x{} raster",
                self.w, self.h
            )));
        }
        let mut guard = self.data.lock().expect("MemRaster mutex poisoned");
        for (row_i, row) in data.chunks(w).enumerate() {
            let start = (y + row_i) * self.w + x;
            guard[start..start + w].copy_from_slice(row);
        }
        Ok(())
    }
}

/// In-memory `VectorSink`/`VectorSource` pair, keyed by layer name.
pub struct MemVector {
    name: String,
    features: Mutex<Vec<VectorFeature>>,
}

impl MemVector {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            features: Mutex::new(Vec::new()),
        }
    }

    pub fn into_features(self) -> Vec<VectorFeature> {
        self.features.into_inner().expect("MemVector mutex poisoned")
    }
}

impl VectorSource for MemVector {
    fn layer_name(&self) -> &str {
        &self.name
    }

    fn features(&self) -> Result<Vec<VectorFeature>> {
        Ok(self.features.lock().expect("MemVector mutex poisoned").clone())
    }
}

impl VectorSink for MemVector {
    fn layer_name(&self) -> &str {
        &self.name
    }

    fn write_feature(&self, feature: VectorFeature) -> Result<()> {
        self.features.lock().expect("MemVector mutex poisoned").push(feature);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mem_raster_round_trips_a_window() {
        let r = MemRaster::new(4, 4, DType::F32, -1.0);
        r.write_window(1, 1, 2, &[1.0, 2.0, 3.0, 4.0]).unwrap();
        let got = r.read_window(1, 1, 2, 2).unwrap();
        assert_eq!(got, vec![1.0, 2.0, 3.0, 4.0]);
        assert_eq!(r.get(0, 0), -1.0);
    }

    #[test]
    fn mem_raster_rejects_out_of_range_window() {
        let r = MemRaster::new(2, 2, DType::F32, -1.0);
        assert!(r.read_window(1, 1, 2, 2).is_err());
    }

    #[test]
    fn mem_vector_collects_features_in_write_order() {
        let v = MemVector::new("streams");
        v.write_feature(VectorFeature {
            fid: 0,
            geometry: vec![(0.0, 0.0), (1.0, 1.0)],
            attributes: vec![],
        })
        .unwrap();
        let feats = v.features().unwrap();
        assert_eq!(feats.len(), 1);
        assert_eq!(feats[0].fid, 0);
    }
}
