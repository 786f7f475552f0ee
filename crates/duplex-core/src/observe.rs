//! Optional metrics instrumentation for Duplex.
//!
//! When the `observe` feature is enabled, key operations emit counters,
//! histograms, and gauges via the [`metrics`] crate. A downstream
//! application must install a metrics recorder (e.g. `metrics-exporter-prometheus`)
//! to collect the data.
//!
//! When the feature is **not** enabled every function in this module is a
//! zero-cost no-op.

/// Record one per-store write outcome.
///
/// - `duplex.write.outcomes_total` – counter with `target` and `outcome` labels
#[inline]
pub fn record_write_outcome(target: &'static str, success: bool) {
    #[cfg(feature = "observe")]
    {
        let outcome = if success { "ok" } else { "fail" };
        metrics::counter!("duplex.write.outcomes_total", "target" => target, "outcome" => outcome)
            .increment(1);
    }
    #[cfg(not(feature = "observe"))]
    {
        let _ = (target, success);
    }
}

/// Record end-to-end latency of a coordinated write.
///
/// - `duplex.write.duration_seconds` – histogram
#[inline]
pub fn record_write_duration(duration: std::time::Duration) {
    #[cfg(feature = "observe")]
    {
        metrics::histogram!("duplex.write.duration_seconds").record(duration.as_secs_f64());
    }
    #[cfg(not(feature = "observe"))]
    {
        let _ = duration;
    }
}

/// Record a transient-error retry against a backend.
///
/// - `duplex.backend.retries_total` – counter with `target` label
#[inline]
pub fn record_retry(target: &'static str) {
    #[cfg(feature = "observe")]
    {
        metrics::counter!("duplex.backend.retries_total", "target" => target).increment(1);
    }
    #[cfg(not(feature = "observe"))]
    {
        let _ = target;
    }
}

/// Record a compensation task lifecycle event.
///
/// - `duplex.compensation.events_total` – counter with `event` label
///   (`enqueued`, `succeeded`, `failed`, `dead_lettered`)
#[inline]
pub fn record_compensation(event: &'static str) {
    #[cfg(feature = "observe")]
    {
        metrics::counter!("duplex.compensation.events_total", "event" => event).increment(1);
    }
    #[cfg(not(feature = "observe"))]
    {
        let _ = event;
    }
}

/// Set the current compensation queue depth gauge.
///
/// - `duplex.compensation.queue_depth` – gauge
#[inline]
pub fn set_compensation_depth(depth: usize) {
    #[cfg(feature = "observe")]
    {
        metrics::gauge!("duplex.compensation.queue_depth").set(depth as f64);
    }
    #[cfg(not(feature = "observe"))]
    {
        let _ = depth;
    }
}

/// Record a reconciler pass over one collection.
///
/// - `duplex.reconcile.passes_total` – counter
/// - `duplex.reconcile.pass_duration_seconds` – histogram
/// - `duplex.reconcile.scanned_total` – counter
/// - `duplex.reconcile.drift_total` – counter
#[inline]
pub fn record_reconcile_pass(duration: std::time::Duration, scanned: u64, drift: u64) {
    #[cfg(feature = "observe")]
    {
        metrics::counter!("duplex.reconcile.passes_total").increment(1);
        metrics::histogram!("duplex.reconcile.pass_duration_seconds")
            .record(duration.as_secs_f64());
        metrics::counter!("duplex.reconcile.scanned_total").increment(scanned);
        metrics::counter!("duplex.reconcile.drift_total").increment(drift);
    }
    #[cfg(not(feature = "observe"))]
    {
        let _ = (duration, scanned, drift);
    }
}
