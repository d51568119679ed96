//! Phase bookkeeping for the stacking driver
//!
//! ```text
//! [Discover] → [Initialize] → [Measure] → [Execute] → [Finalize]
//!                                ↓            ↑
//!                             [Skip] ---------┘   (no PSF matching)
//! ```
//!
//! Discover, Initialize and Finalize run on the root only. Measure and
//! Execute are scattered over the worker ranks.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PhaseType {
    /// Select frames with complete calibration products
    Discover,
    /// Resolve input files and lay out the tile grid
    Initialize,
    /// Measure warped PSF widths for PSF matching
    Measure,
    /// Co-add each tile
    Execute,
    /// Close out the stack
    Finalize,
}

impl std::fmt::Display for PhaseType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PhaseType::Discover => write!(f, "Discover"),
            PhaseType::Initialize => write!(f, "Initialize"),
            PhaseType::Measure => write!(f, "Measure"),
            PhaseType::Execute => write!(f, "Execute"),
            PhaseType::Finalize => write!(f, "Finalize"),
        }
    }
}

/// Metrics collected while a phase ran on the root
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PhaseMetrics {
    /// Duration in seconds
    pub duration_secs: f64,
    /// Number of items processed
    pub items_processed: usize,
    /// Number of items that produced a result
    pub items_successful: usize,
    /// Number of items skipped as recoverable failures
    pub items_failed: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseRecord {
    pub phase: PhaseType,
    pub started_at: DateTime<Utc>,
    pub metrics: PhaseMetrics,
}

/// Measures one phase; finish with the item counts
pub(crate) struct PhaseTimer {
    phase: PhaseType,
    started_at: DateTime<Utc>,
    started: Instant,
}

impl PhaseTimer {
    pub(crate) fn start(phase: PhaseType) -> Self {
        tracing::info!("Phase {} started", phase);
        Self {
            phase,
            started_at: Utc::now(),
            started: Instant::now(),
        }
    }

    pub(crate) fn finish(self, processed: usize, successful: usize) -> PhaseRecord {
        let metrics = PhaseMetrics {
            duration_secs: self.started.elapsed().as_secs_f64(),
            items_processed: processed,
            items_successful: successful,
            items_failed: processed.saturating_sub(successful),
        };
        tracing::info!(
            "Phase {} finished in {:.1}s ({}/{} items)",
            self.phase,
            metrics.duration_secs,
            metrics.items_successful,
            metrics.items_processed
        );
        PhaseRecord {
            phase: self.phase,
            started_at: self.started_at,
            metrics,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timer_counts_failures() {
        let before = Utc::now();
        let record = PhaseTimer::start(PhaseType::Measure).finish(10, 7);
        assert!(record.started_at >= before);
        assert_eq!(record.phase, PhaseType::Measure);
        assert_eq!(record.metrics.items_processed, 10);
        assert_eq!(record.metrics.items_successful, 7);
        assert_eq!(record.metrics.items_failed, 3);
        assert!(record.metrics.duration_secs >= 0.0);
    }

    #[test]
    fn test_phase_display() {
        assert_eq!(PhaseType::Initialize.to_string(), "Initialize");
        assert_eq!(PhaseType::Finalize.to_string(), "Finalize");
    }
}
