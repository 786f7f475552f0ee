use serde::{Deserialize, Serialize};
use std::fmt;

/// Which store(s) should serve an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Target {
    Primary,
    Secondary,
    Both,
}

impl Target {
    pub fn includes_primary(self) -> bool {
        matches!(self, Target::Primary | Target::Both)
    }

    pub fn includes_secondary(self) -> bool {
        matches!(self, Target::Secondary | Target::Both)
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Target::Primary => "primary",
            Target::Secondary => "secondary",
            Target::Both => "both",
        };
        f.write_str(s)
    }
}

/// One structural flag of a [`StructuralFeatureSet`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Feature {
    Join,
    GroupBy,
    Subquery,
    WindowFunction,
    Aggregate,
    Write,
}

impl Feature {
    pub const ALL: [Feature; 6] = [
        Feature::Join,
        Feature::GroupBy,
        Feature::Subquery,
        Feature::WindowFunction,
        Feature::Aggregate,
        Feature::Write,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Feature::Join => "has_join",
            Feature::GroupBy => "has_group_by",
            Feature::Subquery => "has_subquery",
            Feature::WindowFunction => "has_window_function",
            Feature::Aggregate => "is_aggregate",
            Feature::Write => "is_write",
        }
    }

    /// Features only the relational store can serve.
    pub fn is_relational(self) -> bool {
        matches!(
            self,
            Feature::Join | Feature::GroupBy | Feature::Subquery | Feature::WindowFunction
        )
    }
}

/// Closed set of structural flags computed by the query compiler.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StructuralFeatureSet {
    #[serde(default)]
    pub has_join: bool,
    #[serde(default)]
    pub has_group_by: bool,
    #[serde(default)]
    pub has_subquery: bool,
    #[serde(default)]
    pub has_window_function: bool,
    #[serde(default)]
    pub is_aggregate: bool,
    #[serde(default)]
    pub is_write: bool,
}

impl StructuralFeatureSet {
    /// A plain single-collection read.
    pub fn read() -> Self {
        Self::default()
    }

    pub fn write() -> Self {
        Self {
            is_write: true,
            ..Self::default()
        }
    }

    pub fn with(mut self, feature: Feature) -> Self {
        match feature {
            Feature::Join => self.has_join = true,
            Feature::GroupBy => self.has_group_by = true,
            Feature::Subquery => self.has_subquery = true,
            Feature::WindowFunction => self.has_window_function = true,
            Feature::Aggregate => self.is_aggregate = true,
            Feature::Write => self.is_write = true,
        }
        self
    }

    pub fn contains(&self, feature: Feature) -> bool {
        match feature {
            Feature::Join => self.has_join,
            Feature::GroupBy => self.has_group_by,
            Feature::Subquery => self.has_subquery,
            Feature::WindowFunction => self.has_window_function,
            Feature::Aggregate => self.is_aggregate,
            Feature::Write => self.is_write,
        }
    }

    /// Flags that are set, in declaration order.
    pub fn fired(&self) -> Vec<Feature> {
        Feature::ALL
            .iter()
            .copied()
            .filter(|f| self.contains(*f))
            .collect()
    }
}

/// Routing result for one operation. Never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutingDecision {
    pub target: Target,
    /// 0.0 - 1.0
    pub confidence: f64,
    pub rationale: String,
}

impl RoutingDecision {
    pub fn new(target: Target, confidence: f64, rationale: impl Into<String>) -> Self {
        Self {
            target,
            confidence: confidence.clamp(0.0, 1.0),
            rationale: rationale.into(),
        }
    }
}
