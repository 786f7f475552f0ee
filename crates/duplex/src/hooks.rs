//! Default observability hooks.

use duplex_core::{CompensationTask, DriftReport, ObservabilityHooks, WriteOutcome};

/// Logs every hook through `tracing`. Used when no hooks are supplied.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingHooks;

impl ObservabilityHooks for TracingHooks {
    fn on_write_outcome(&self, outcome: &WriteOutcome) {
        match &outcome.error {
            None => tracing::debug!(
                store = %outcome.target,
                collection = %outcome.collection,
                id = %outcome.id,
                op = ?outcome.op,
                attempt = outcome.attempt,
                "write ok"
            ),
            Some(error) => tracing::warn!(
                store = %outcome.target,
                collection = %outcome.collection,
                id = %outcome.id,
                op = ?outcome.op,
                attempt = outcome.attempt,
                "write failed: {}",
                error
            ),
        }
    }

    fn on_drift_detected(&self, report: &DriftReport) {
        tracing::warn!(
            collection = %report.collection,
            scanned = report.scanned_count,
            primary_only = report.primary_only.len(),
            secondary_only = report.secondary_only.len(),
            mismatched = report.mismatched.len(),
            repaired = report.repaired_count,
            error = report.error.as_deref().unwrap_or(""),
            "Drift detected"
        );
    }

    fn on_compensation_exhausted(&self, task: &CompensationTask) {
        tracing::error!(
            task = %task.id,
            collection = %task.collection,
            id = %task.record_id(),
            attempts = task.attempts,
            "Compensation exhausted retries: {}",
            task.last_error.as_deref().unwrap_or("unknown error")
        );
    }
}
