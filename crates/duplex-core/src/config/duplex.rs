use serde::{Deserialize, Serialize};

use crate::config::{RoutingConfig, TranslatorConfig};
use crate::error::{DuplexError, Result};
use crate::types::Target;

/// Which store(s) receive writes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteMode {
    PrimaryOnly,
    #[default]
    DualWrite,
    SecondaryOnly,
}

impl WriteMode {
    pub fn target(self) -> Target {
        match self {
            WriteMode::PrimaryOnly => Target::Primary,
            WriteMode::DualWrite => Target::Both,
            WriteMode::SecondaryOnly => Target::Secondary,
        }
    }
}

/// How the reconciler settles a difference between the stores.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictResolution {
    /// Overwrite the secondary with the primary's version.
    #[default]
    PrimaryWins,
    /// Overwrite the primary with the secondary's version. Explicit opt-in.
    SecondaryWins,
    /// Report only, never repair.
    Manual,
}

/// Configuration for the hybrid consistency layer
///
/// Read-only for the lifetime of a `DuplexStore`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DuplexConfig {
    /// Default: dual_write
    #[serde(default)]
    pub write_mode: WriteMode,

    /// Seconds between reconciler passes
    /// Default: 60
    #[serde(default = "default_reconcile_interval_seconds")]
    pub reconcile_interval_seconds: u64,

    /// Ids per reconciler batch; a checkpoint is persisted after each batch
    /// Default: 500
    #[serde(default = "default_reconcile_batch_size")]
    pub reconcile_batch_size: usize,

    /// Batches per pass before yielding until the next interval.
    /// Default: None (scan to the end)
    #[serde(default)]
    pub reconcile_max_batches_per_pass: Option<usize>,

    /// Collections walked by the reconciler
    #[serde(default)]
    pub collections: Vec<String>,

    /// Attempts for transient backend errors and for compensation tasks
    /// Default: 5
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Default: 50ms
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,

    /// Default: 2.0
    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,

    /// Upper bound for a single backoff delay
    /// Default: 30s
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,

    /// Fraction of the delay randomized away (0.0 - 1.0)
    /// Default: 0.2
    #[serde(default = "default_backoff_jitter")]
    pub backoff_jitter: f64,

    /// Default: primary_wins
    #[serde(default)]
    pub conflict_resolution: ConflictResolution,

    /// Visibility timeout of a claimed compensation task
    /// Default: 30s
    #[serde(default = "default_compensation_lease_ms")]
    pub compensation_lease_ms: u64,

    /// Default: 250ms
    #[serde(default = "default_compensation_poll_interval_ms")]
    pub compensation_poll_interval_ms: u64,

    /// Tasks claimed per worker cycle
    /// Default: 64
    #[serde(default = "default_compensation_batch_size")]
    pub compensation_batch_size: usize,

    /// Concurrent writes admitted by the coordinator
    /// Default: 256
    #[serde(default = "default_max_in_flight_writes")]
    pub max_in_flight_writes: usize,

    #[serde(default)]
    pub routing: RoutingConfig,

    #[serde(default)]
    pub translator: TranslatorConfig,
}

fn default_reconcile_interval_seconds() -> u64 {
    60
}

fn default_reconcile_batch_size() -> usize {
    500
}

fn default_max_retries() -> u32 {
    5
}

fn default_backoff_base_ms() -> u64 {
    50
}

fn default_backoff_factor() -> f64 {
    2.0
}

fn default_backoff_max_ms() -> u64 {
    30_000
}

fn default_backoff_jitter() -> f64 {
    0.2
}

fn default_compensation_lease_ms() -> u64 {
    30_000
}

fn default_compensation_poll_interval_ms() -> u64 {
    250
}

fn default_compensation_batch_size() -> usize {
    64
}

fn default_max_in_flight_writes() -> usize {
    256
}

impl Default for DuplexConfig {
    fn default() -> Self {
        Self {
            write_mode: WriteMode::default(),
            reconcile_interval_seconds: default_reconcile_interval_seconds(),
            reconcile_batch_size: default_reconcile_batch_size(),
            reconcile_max_batches_per_pass: None,
            collections: Vec::new(),
            max_retries: default_max_retries(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_factor: default_backoff_factor(),
            backoff_max_ms: default_backoff_max_ms(),
            backoff_jitter: default_backoff_jitter(),
            conflict_resolution: ConflictResolution::default(),
            compensation_lease_ms: default_compensation_lease_ms(),
            compensation_poll_interval_ms: default_compensation_poll_interval_ms(),
            compensation_batch_size: default_compensation_batch_size(),
            max_in_flight_writes: default_max_in_flight_writes(),
            routing: RoutingConfig::default(),
            translator: TranslatorConfig::default(),
        }
    }
}

impl DuplexConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse and validate a JSON document.
    pub fn from_json_str(s: &str) -> Result<Self> {
        let cfg: Self =
            serde_json::from_str(s).map_err(|e| DuplexError::Config(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn with_write_mode(mut self, mode: WriteMode) -> Self {
        self.write_mode = mode;
        self
    }

    pub fn with_conflict_resolution(mut self, policy: ConflictResolution) -> Self {
        self.conflict_resolution = policy;
        self
    }

    pub fn with_collection(mut self, collection: impl Into<String>) -> Self {
        self.collections.push(collection.into());
        self
    }

    pub fn with_reconcile_batch_size(mut self, size: usize) -> Self {
        self.reconcile_batch_size = size;
        self
    }

    pub fn with_reconcile_interval_seconds(mut self, secs: u64) -> Self {
        self.reconcile_interval_seconds = secs;
        self
    }

    pub fn with_max_batches_per_pass(mut self, batches: usize) -> Self {
        self.reconcile_max_batches_per_pass = Some(batches);
        self
    }

    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    /// Set base delay, growth factor and cap in one go.
    pub fn with_backoff(mut self, base_ms: u64, factor: f64, max_ms: u64) -> Self {
        self.backoff_base_ms = base_ms;
        self.backoff_factor = factor;
        self.backoff_max_ms = max_ms;
        self
    }

    pub fn with_backoff_jitter(mut self, jitter: f64) -> Self {
        self.backoff_jitter = jitter;
        self
    }

    pub fn with_compensation_lease_ms(mut self, ms: u64) -> Self {
        self.compensation_lease_ms = ms;
        self
    }

    pub fn with_compensation_poll_interval_ms(mut self, ms: u64) -> Self {
        self.compensation_poll_interval_ms = ms;
        self
    }

    pub fn with_max_in_flight_writes(mut self, max: usize) -> Self {
        self.max_in_flight_writes = max;
        self
    }

    pub fn with_routing(mut self, routing: RoutingConfig) -> Self {
        self.routing = routing;
        self
    }

    pub fn with_translator(mut self, translator: TranslatorConfig) -> Self {
        self.translator = translator;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.reconcile_batch_size == 0 {
            return Err(DuplexError::Config(
                "reconcile_batch_size must be positive".into(),
            ));
        }
        if self.reconcile_interval_seconds == 0 {
            return Err(DuplexError::Config(
                "reconcile_interval_seconds must be positive".into(),
            ));
        }
        if self.reconcile_max_batches_per_pass == Some(0) {
            return Err(DuplexError::Config(
                "reconcile_max_batches_per_pass must be positive when set".into(),
            ));
        }
        if self.max_retries == 0 {
            return Err(DuplexError::Config("max_retries must be at least 1".into()));
        }
        if !(self.backoff_factor.is_finite() && self.backoff_factor >= 1.0) {
            return Err(DuplexError::Config(format!(
                "backoff_factor must be >= 1.0, got {}",
                self.backoff_factor
            )));
        }
        if self.backoff_max_ms < self.backoff_base_ms {
            return Err(DuplexError::Config(format!(
                "backoff_max_ms ({}) is below backoff_base_ms ({})",
                self.backoff_max_ms, self.backoff_base_ms
            )));
        }
        if !(0.0..=1.0).contains(&self.backoff_jitter) {
            return Err(DuplexError::Config(format!(
                "backoff_jitter must be within 0.0..=1.0, got {}",
                self.backoff_jitter
            )));
        }
        if self.compensation_batch_size == 0 || self.max_in_flight_writes == 0 {
            return Err(DuplexError::Config(
                "compensation_batch_size and max_in_flight_writes must be positive".into(),
            ));
        }
        let t = &self.translator;
        if t.id_column.is_empty() || t.revision_column.is_empty() || t.id_column == t.revision_column
        {
            return Err(DuplexError::Config(
                "id_column and revision_column must be distinct and non-empty".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Feature;

    #[test]
    fn test_defaults_are_valid() {
        let cfg = DuplexConfig::default();
        assert_eq!(cfg.write_mode, WriteMode::DualWrite);
        assert_eq!(cfg.conflict_resolution, ConflictResolution::PrimaryWins);
        assert_eq!(cfg.write_mode.target(), Target::Both);
        cfg.validate().unwrap();
    }

    #[test]
    fn test_from_json_uses_snake_case_and_defaults() {
        let cfg = DuplexConfig::from_json_str(
            r#"{
                "write_mode": "primary_only",
                "conflict_resolution": "manual",
                "reconcile_batch_size": 10,
                "routing": { "overrides": [ { "feature": "join", "target": "primary" } ] }
            }"#,
        )
        .unwrap();

        assert_eq!(cfg.write_mode, WriteMode::PrimaryOnly);
        assert_eq!(cfg.conflict_resolution, ConflictResolution::Manual);
        assert_eq!(cfg.reconcile_batch_size, 10);
        assert_eq!(cfg.max_retries, 5);
        assert_eq!(cfg.routing.override_for(Feature::Join), Some(Target::Primary));
        assert_eq!(cfg.translator.id_column, "id");
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        assert!(DuplexConfig::default()
            .with_reconcile_batch_size(0)
            .validate()
            .is_err());
        assert!(DuplexConfig::default()
            .with_backoff(100, 0.5, 1000)
            .validate()
            .is_err());
        assert!(DuplexConfig::default()
            .with_backoff(100, 2.0, 10)
            .validate()
            .is_err());
        assert!(DuplexConfig::default()
            .with_backoff_jitter(1.5)
            .validate()
            .is_err());

        let mut cfg = DuplexConfig::default();
        cfg.translator.revision_column = "id".into();
        assert!(matches!(cfg.validate(), Err(DuplexError::Config(_))));
    }
}
