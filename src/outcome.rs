//! The closed set of per-event projection outcomes, plus the tally
//! the catch-up runner logs per batch.

use std::fmt;

/// What happened when one event was applied to the read model.
///
/// `StaleOcc` is an expected outcome of redelivery and out-of-order
/// arrival, never an error. `Unknown` means the cache returned a
/// shape the guard script does not produce; it is counted and logged
/// loudly but does not halt the runner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProjectionOutcome {
    Applied,
    StaleOcc,
    Deduplicated,
    SkippedHint,
    Unknown,
}

impl ProjectionOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Applied => "applied",
            Self::StaleOcc => "stale_occ",
            Self::Deduplicated => "deduplicated",
            Self::SkippedHint => "skipped_hint",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ProjectionOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-outcome counters accumulated over a batch or a whole run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OutcomeTally {
    pub applied: u64,
    pub stale_occ: u64,
    pub deduplicated: u64,
    pub skipped_hint: u64,
    pub unknown: u64,
}

impl OutcomeTally {
    pub fn record(&mut self, outcome: ProjectionOutcome) {
        match outcome {
            ProjectionOutcome::Applied => self.applied += 1,
            ProjectionOutcome::StaleOcc => self.stale_occ += 1,
            ProjectionOutcome::Deduplicated => self.deduplicated += 1,
            ProjectionOutcome::SkippedHint => self.skipped_hint += 1,
            ProjectionOutcome::Unknown => self.unknown += 1,
        }
    }

    pub fn total(&self) -> u64 {
        self.applied + self.stale_occ + self.deduplicated + self.skipped_hint + self.unknown
    }
}

impl fmt::Display for OutcomeTally {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "applied={} stale_occ={} deduplicated={} skipped_hint={} unknown={}",
            self.applied, self.stale_occ, self.deduplicated, self.skipped_hint, self.unknown
        )
    }
}
