//! Pipeline-level configuration.
//!
//! Options are loaded in layers: built-in [`PipelineConfig::default`] values,
//! an optional TOML file, environment overrides prefixed `WBH_`, and finally
//! explicit builder setters. Later layers win.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, Result};

/// All tunable parameters recognized by the pipeline (spec §6).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Tile side `s` in cells. `<= 1` selects in-memory single-tile mode.
    pub chunk_size: usize,
    /// Breach Dijkstra window radius; also the halo width for that stage.
    pub search_radius: usize,
    /// Breach Dijkstra acceptance cap (total path cost).
    pub max_cost: f64,
    /// Enables flat resolution after D8 flow direction.
    pub resolve_flats: bool,
    /// Per-stage cap on tile side for flat resolution.
    pub flat_chunk_max: usize,
    /// Treat nodata as fillable interior during priority-flood.
    pub fill_holes: bool,
    /// Accumulation threshold for stream classification.
    pub threshold: i64,
    /// Drainage-point snap window, in cells.
    pub snap_radius: usize,
    /// Label non-user outlets too.
    pub all_basins: bool,
    /// Scratch space for tile spills.
    pub working_dir: Option<String>,
    /// Epsilon used for nodata breach gradients (Open Question (b): tunable).
    pub breach_epsilon: f64,
    /// Number of worker threads; `0` defers to rayon's default (hardware
    /// thread count).
    pub num_threads: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            chunk_size: 512,
            search_radius: 8,
            max_cost: 1.0e6,
            resolve_flats: true,
            flat_chunk_max: 1024,
            fill_holes: false,
            threshold: 1000,
            snap_radius: 0,
            all_basins: false,
            working_dir: None,
            breach_epsilon: 1.0e-5,
            num_threads: 0,
        }
    }
}

impl PipelineConfig {
    /// Start from defaults, then apply an optional TOML file on disk.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut cfg = Self::default();
        if let Some(path) = path {
            cfg = cfg.merge_toml_file(path)?;
        }
        cfg.merge_env();
        cfg.validate()?;
        Ok(cfg)
    }

    /// Parse a TOML document and overlay it on top of `self`.
    pub fn merge_toml_str(self, text: &str) -> Result<Self> {
        let overlay: PipelineConfigOverlay = toml::from_str(text)
            .map_err(|e| PipelineError::Format(format!("invalid pipeline config TOML: {e}")))?;
        Ok(overlay.apply(self))
    }

    fn merge_toml_file(self, path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| PipelineError::Io(format!("reading config {}: {e}", path.display())))?;
        self.merge_toml_str(&text)
    }

    /// Overlay `WBH_*` environment variables (e.g. `WBH_CHUNK_SIZE=256`).
    fn merge_env(&mut self) {
        macro_rules! env_parse {
            ($field:ident, $name:literal) => {
                if let Ok(v) = std::env::var(concat!("WBH_", $name)) {
                    if let Ok(parsed) = v.parse() {
                        self.$field = parsed;
                    }
                }
            };
        }
        env_parse!(chunk_size, "CHUNK_SIZE");
        env_parse!(search_radius, "SEARCH_RADIUS");
        env_parse!(max_cost, "MAX_COST");
        env_parse!(resolve_flats, "RESOLVE_FLATS");
        env_parse!(flat_chunk_max, "FLAT_CHUNK_MAX");
        env_parse!(fill_holes, "FILL_HOLES");
        env_parse!(threshold, "THRESHOLD");
        env_parse!(snap_radius, "SNAP_RADIUS");
        env_parse!(all_basins, "ALL_BASINS");
        env_parse!(breach_epsilon, "BREACH_EPSILON");
        env_parse!(num_threads, "NUM_THREADS");
        if let Ok(v) = std::env::var("WBH_WORKING_DIR") {
            self.working_dir = Some(v);
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.threshold < 1 {
            return Err(PipelineError::PreconditionViolation(
                "threshold must be >= 1".into(),
            ));
        }
        if self.max_cost < 0.0 {
            return Err(PipelineError::PreconditionViolation(
                "max_cost must be >= 0".into(),
            ));
        }
        if self.breach_epsilon <= 0.0 {
            return Err(PipelineError::PreconditionViolation(
                "breach_epsilon must be > 0".into(),
            ));
        }
        Ok(())
    }

    /// Whether the pipeline should operate tile-by-tile or treat the whole
    /// raster as a single in-memory tile (spec §6: `chunk_size <= 1`).
    pub fn tiled(&self) -> bool {
        self.chunk_size > 1
    }
}

/// Mirrors [`PipelineConfig`] but with every field optional, used to overlay
/// a partial TOML document on top of existing values.
#[derive(Deserialize, Default)]
struct PipelineConfigOverlay {
    chunk_size: Option<usize>,
    search_radius: Option<usize>,
    max_cost: Option<f64>,
    resolve_flats: Option<bool>,
    flat_chunk_max: Option<usize>,
    fill_holes: Option<bool>,
    threshold: Option<i64>,
    snap_radius: Option<usize>,
    all_basins: Option<bool>,
    working_dir: Option<String>,
    breach_epsilon: Option<f64>,
    num_threads: Option<usize>,
}

impl PipelineConfigOverlay {
    fn apply(self, mut base: PipelineConfig) -> PipelineConfig {
        macro_rules! overlay {
            ($field:ident) => {
                if let Some(v) = self.$field {
                    base.$field = v;
                }
            };
        }
        overlay!(chunk_size);
        overlay!(search_radius);
        overlay!(max_cost);
        overlay!(resolve_flats);
        overlay!(flat_chunk_max);
        overlay!(fill_holes);
        overlay!(threshold);
        overlay!(snap_radius);
        overlay!(all_basins);
        overlay!(working_dir);
        overlay!(breach_epsilon);
        overlay!(num_threads);
        base
    }
}
