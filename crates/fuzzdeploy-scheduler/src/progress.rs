//! Campaign progress from side-channel counters
//!
//! Workers never report progress directly. Each job's expected and completed
//! unit counts are read from its output tree, and the tracker folds them into
//! an aggregate that never goes backwards.

use fuzzdeploy_core::{CampaignLayout, JobKey, StageConfig};
use std::sync::Arc;
use tracing::{debug, warn};

/// Source of per-job unit counts
pub trait ProgressSource: Send + Sync {
    /// Units the job is expected to produce; `None` when unreadable
    fn expected(&self, key: &JobKey) -> Option<u64>;

    /// Units the job has produced so far; `None` when unreadable
    fn completed(&self, key: &JobKey) -> Option<u64>;

    /// Whether a previous run already produced everything
    fn is_satisfied(&self, key: &JobKey) -> bool {
        match (self.expected(key), self.completed(key)) {
            (Some(expected), Some(completed)) => expected == completed,
            _ => false,
        }
    }
}

/// Counts read from a stage's directory tree
pub struct StageProgress {
    layout: CampaignLayout,
    stage: StageConfig,
}

impl StageProgress {
    pub fn new(layout: CampaignLayout, stage: StageConfig) -> Self {
        Self { layout, stage }
    }
}

impl ProgressSource for StageProgress {
    fn expected(&self, key: &JobKey) -> Option<u64> {
        match self.layout.count(&self.stage.expected, &self.stage.name, key) {
            Ok(count) => Some(count),
            Err(e) => {
                warn!(job = %key, error = %e, "Expected unit count unavailable");
                None
            }
        }
    }

    fn completed(&self, key: &JobKey) -> Option<u64> {
        match self.layout.count(&self.stage.completed, &self.stage.name, key) {
            Ok(count) => Some(count),
            Err(e) => {
                debug!(job = %key, error = %e, "Completed unit count unavailable");
                None
            }
        }
    }

    fn is_satisfied(&self, key: &JobKey) -> bool {
        let (Some(expected), Some(completed)) = (self.expected(key), self.completed(key)) else {
            return false;
        };
        if expected != completed {
            return false;
        }

        match &self.stage.done_marker {
            Some(marker) => match self.layout.has_marker(&self.stage.name, key, marker) {
                Ok(found) => found,
                Err(e) => {
                    warn!(job = %key, error = %e, "Done marker unreadable");
                    false
                }
            },
            None => true,
        }
    }
}

/// Progress of one job
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressUnit {
    pub key: JobKey,
    /// Units expected, read once at campaign start
    pub expected: u64,
    /// Highest completed count observed so far
    pub completed: u64,
}

/// Snapshot of aggregate campaign progress
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProgressSnapshot {
    pub completed: u64,
    pub total: u64,
}

impl ProgressSnapshot {
    /// Fraction complete in [0.0, 1.0]
    pub fn fraction(&self) -> f64 {
        if self.total == 0 {
            return 1.0;
        }
        (self.completed as f64 / self.total as f64).min(1.0)
    }
}

impl std::fmt::Display for ProgressSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} / {}", self.completed, self.total)
    }
}

/// Tracks aggregate progress across all jobs of a campaign
pub struct ProgressTracker {
    source: Arc<dyn ProgressSource>,
    units: Vec<ProgressUnit>,
    total: u64,
    aggregate: u64,
}

impl ProgressTracker {
    /// Read initial counts for `keys`
    pub fn new(source: Arc<dyn ProgressSource>, keys: &[JobKey]) -> Self {
        let units: Vec<ProgressUnit> = keys
            .iter()
            .map(|key| ProgressUnit {
                key: key.clone(),
                expected: source.expected(key).unwrap_or(0),
                completed: source.completed(key).unwrap_or(0),
            })
            .collect();

        let total = Self::expected_total(&units);
        let aggregate = units.iter().map(|u| u.completed).sum();

        Self {
            source,
            units,
            total,
            aggregate,
        }
    }

    /// Sum of expected units
    pub fn expected_total(units: &[ProgressUnit]) -> u64 {
        units.iter().map(|u| u.expected).sum()
    }

    /// Re-read every unit and return how much the aggregate grew
    ///
    /// A counter that shrinks or cannot be read counts as no change.
    pub fn poll_deltas(&mut self) -> u64 {
        let mut delta = 0;

        for unit in &mut self.units {
            if unit.expected > 0 && unit.completed >= unit.expected {
                continue;
            }
            if let Some(current) = self.source.completed(&unit.key) {
                if current > unit.completed {
                    delta += current - unit.completed;
                    unit.completed = current;
                }
            }
        }

        self.aggregate += delta;
        delta
    }

    /// Current aggregate progress
    pub fn snapshot(&self) -> ProgressSnapshot {
        ProgressSnapshot {
            completed: self.aggregate,
            total: self.total,
        }
    }

    pub fn units(&self) -> &[ProgressUnit] {
        &self.units
    }
}
