use serde::{Deserialize, Serialize};

use crate::types::{Feature, Target};

/// Forces reads that fire `feature` to `target`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureOverride {
    pub feature: Feature,
    pub target: Target,
}

/// Routing policy layered on top of the classifier rules
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingConfig {
    /// Checked in order; `is_write` overrides are ignored because writes
    /// always follow `write_mode`.
    #[serde(default)]
    pub overrides: Vec<FeatureOverride>,
}

impl RoutingConfig {
    pub fn with_override(mut self, feature: Feature, target: Target) -> Self {
        self.overrides.push(FeatureOverride { feature, target });
        self
    }

    pub fn override_for(&self, feature: Feature) -> Option<Target> {
        self.overrides
            .iter()
            .find(|o| o.feature == feature)
            .map(|o| o.target)
    }
}
