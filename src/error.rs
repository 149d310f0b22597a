//! Error taxonomy shared by every stage of the pipeline.

use std::fmt;

/// A cell coordinate in raster space, used to anchor error messages to a
/// specific offending location.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CellCoord {
    pub col: usize,
    pub row: usize,
}

impl fmt::Display for CellCoord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(col={}, row={})", self.col, self.row)
    }
}

/// The global tile origin a tile-local failure occurred in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileOrigin {
    pub tile_row: usize,
    pub tile_col: usize,
}

impl fmt::Display for TileOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tile[{}, {}]", self.tile_row, self.tile_col)
    }
}

/// Unified error type for the hydrology pipeline.
///
/// I/O and format errors are fatal and abort the whole pipeline. Invalid
/// input errors carry the offending coordinate or feature id. Precondition
/// violations flag a stage invoked with data that does not satisfy its
/// documented contract (e.g. flow accumulation on a direction raster that
/// still contains undefined cells).
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("raster/vector I/O failed: {0}")]
    Io(String),

    #[error("invalid raster or vector metadata: {0}")]
    Format(String),

    #[error("invalid input at {coord}: {msg}")]
    InvalidInput { coord: CellCoord, msg: String },

    #[error("invalid input feature (fid={fid}): {msg}")]
    InvalidFeature { fid: u64, msg: String },

    #[error("precondition violated: {0}")]
    PreconditionViolation(String),

    #[error("stage {stage} failed on {origin}: {msg}")]
    TileFailure {
        stage: &'static str,
        origin: TileOrigin,
        msg: String,
    },

    #[error("operation cancelled")]
    Cancelled,

    #[error("internal error: {0}")]
    Internal(String),
}

impl PipelineError {
    pub fn invalid_input(col: usize, row: usize, msg: impl Into<String>) -> Self {
        PipelineError::InvalidInput {
            coord: CellCoord { col, row },
            msg: msg.into(),
        }
    }

    pub fn tile_failure(stage: &'static str, tile_row: usize, tile_col: usize, msg: impl Into<String>) -> Self {
        PipelineError::TileFailure {
            stage,
            origin: TileOrigin { tile_row, tile_col },
            msg: msg.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;
