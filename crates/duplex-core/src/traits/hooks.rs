use crate::types::{CompensationTask, DriftReport, WriteOutcome};

/// Outward observability surface.
///
/// Called inline on the hot path, so implementations should hand work off
/// rather than block.
pub trait ObservabilityHooks: Send + Sync {
    fn on_write_outcome(&self, outcome: &WriteOutcome) {
        let _ = outcome;
    }

    fn on_drift_detected(&self, report: &DriftReport) {
        let _ = report;
    }

    /// A compensation task ran out of retries and moved to the dead-letter set.
    fn on_compensation_exhausted(&self, task: &CompensationTask) {
        let _ = task;
    }
}

/// Hooks that do nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHooks;

impl ObservabilityHooks for NoopHooks {}
