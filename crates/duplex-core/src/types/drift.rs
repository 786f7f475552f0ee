use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Result of one reconciler pass over one collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriftReport {
    pub collection: String,
    pub scanned_count: u64,
    pub matching_count: u64,
    /// Ids found only on the primary.
    pub primary_only: Vec<String>,
    /// Ids found only on the secondary, recorded before any repair.
    pub secondary_only: Vec<String>,
    /// Id -> names of differing fields.
    pub mismatched: BTreeMap<String, Vec<String>>,
    /// Last canonical id processed in this pass.
    pub checkpoint_id: Option<String>,
    /// Ids successfully repaired during this pass.
    pub repaired_count: u64,
    /// Whether the pass reached the end of both stores.
    pub complete: bool,
    /// Batch error that stopped the pass early, if any.
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl DriftReport {
    pub fn new(collection: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            collection: collection.into(),
            scanned_count: 0,
            matching_count: 0,
            primary_only: Vec::new(),
            secondary_only: Vec::new(),
            mismatched: BTreeMap::new(),
            checkpoint_id: None,
            repaired_count: 0,
            complete: false,
            error: None,
            started_at: now,
            finished_at: now,
        }
    }

    pub fn drift_count(&self) -> usize {
        self.primary_only.len() + self.secondary_only.len() + self.mismatched.len()
    }

    pub fn has_drift(&self) -> bool {
        self.drift_count() > 0
    }

    /// Whether `id` shows up anywhere in the drift sets.
    pub fn mentions(&self, id: &str) -> bool {
        self.primary_only.iter().any(|i| i == id)
            || self.secondary_only.iter().any(|i| i == id)
            || self.mismatched.contains_key(id)
    }
}

/// Resume point for a collection scan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileCheckpoint {
    pub collection: String,
    pub last_id: String,
    pub updated_at: DateTime<Utc>,
}

impl ReconcileCheckpoint {
    pub fn new(collection: impl Into<String>, last_id: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            last_id: last_id.into(),
            updated_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_drift_counting() {
        let mut report = DriftReport::new("users");
        assert!(!report.has_drift());

        report.primary_only.push("u1".into());
        report.secondary_only.push("u3".into());
        report
            .mismatched
            .insert("u2".into(), vec!["name".into(), "_rev".into()]);

        assert_eq!(report.drift_count(), 3);
        assert!(report.mentions("u2"));
        assert!(report.mentions("u3"));
        assert!(!report.mentions("u4"));
    }
}
