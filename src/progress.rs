//! Progress reporting (spec §6), kept interface-typed rather than a global
//! registry so embedders can wire it to whatever UI or logging they have.

use std::sync::atomic::{AtomicUsize, Ordering};

/// Receives `(stage, done, total)` updates as a stage processes tiles.
pub trait ProgressSink: Send + Sync {
    fn on_progress(&self, stage: &str, done: usize, total: usize);

    /// Drainage points dropped because they fell outside the raster or on
    /// nodata after snapping (Open Question (a)).
    fn on_dropped_points(&self, _count: usize) {}
}

/// Discards every update; the default when no caller-supplied sink exists.
pub struct NoopProgress;

impl ProgressSink for NoopProgress {
    fn on_progress(&self, _stage: &str, _done: usize, _total: usize) {}
}

/// Forwards updates to `tracing` at debug level, with dropped-point counts
/// at warn level. Used by the demo CLI.
pub struct TracingProgress;

impl ProgressSink for TracingProgress {
    fn on_progress(&self, stage: &str, done: usize, total: usize) {
        tracing::debug!(stage, done, total, "stage progress");
    }

    fn on_dropped_points(&self, count: usize) {
        if count > 0 {
            tracing::warn!(count, "drainage points dropped (outside raster or on nodata)");
        }
    }
}

/// Accumulates updates for later inspection; useful in tests.
#[derive(Default)]
pub struct CountingProgress {
    pub dropped_points: AtomicUsize,
    pub updates: AtomicUsize,
}

impl ProgressSink for CountingProgress {
    fn on_progress(&self, _stage: &str, _done: usize, _total: usize) {
        self.updates.fetch_add(1, Ordering::Relaxed);
    }

    fn on_dropped_points(&self, count: usize) {
        self.dropped_points.fetch_add(count, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;

    #[test]
    fn counting_progress_accumulates() {
        let p = CountingProgress::default();
        p.on_progress("fill", 1, 4);
        p.on_progress("fill", 2, 4);
        p.on_dropped_points(3);
        assert_eq!(p.updates.load(Ordering::Relaxed), 2);
        assert_eq!(p.dropped_points.load(Ordering::Relaxed), 3);
    }
}
