//! Routing policy: classifier rules plus configured feature overrides.

use crate::classifier::{describe, QueryClassifier};
use duplex_core::{
    DuplexConfig, Feature, RoutingConfig, RoutingDecision, StructuralFeatureSet, Target, WriteMode,
};

/// Produces the final target for an operation.
///
/// Writes always follow `write_mode`. For reads, each fired feature casts a
/// vote: an override votes for its configured target, an un-overridden
/// relational feature votes for the secondary store. If no override fired
/// the classifier's decision stands. Otherwise the target with the most votes
/// wins (ties go to the target of the first matching override in
/// configuration order) and confidence is the winning share of the votes.
#[derive(Debug, Clone, Default)]
pub struct RoutingEngine {
    classifier: QueryClassifier,
    routing: RoutingConfig,
}

impl RoutingEngine {
    pub fn new(write_mode: WriteMode, routing: RoutingConfig) -> Self {
        Self {
            classifier: QueryClassifier::new(write_mode),
            routing,
        }
    }

    pub fn from_config(config: &DuplexConfig) -> Self {
        Self::new(config.write_mode, config.routing.clone())
    }

    pub fn classifier(&self) -> &QueryClassifier {
        &self.classifier
    }

    /// Target set for writes under the configured write mode.
    pub fn write_target(&self) -> Target {
        self.classifier.write_mode().target()
    }

    pub fn route(&self, features: &StructuralFeatureSet) -> RoutingDecision {
        let base = self.classifier.classify(features);
        if features.is_write {
            return base;
        }

        // Overrides that apply, in configuration order.
        let overrides: Vec<(Feature, Target)> = self
            .routing
            .overrides
            .iter()
            .filter(|o| o.feature != Feature::Write && features.contains(o.feature))
            .map(|o| (o.feature, o.target))
            .collect();
        if overrides.is_empty() {
            return base;
        }

        let mut votes: Vec<(Feature, Target)> = Vec::new();
        for feature in features.fired() {
            if let Some(target) = self.routing.override_for(feature) {
                votes.push((feature, target));
            } else if feature.is_relational() {
                votes.push((feature, Target::Secondary));
            }
        }

        let count = |target: Target| votes.iter().filter(|(_, t)| *t == target).count();
        let mut target = overrides[0].1;
        for (_, candidate) in &votes {
            if count(*candidate) > count(target) {
                target = *candidate;
            }
        }
        let confidence = count(target) as f64 / votes.len() as f64;

        let forced: Vec<Feature> = overrides.iter().map(|(f, _)| *f).collect();
        tracing::trace!(
            target_store = %target,
            confidence,
            "routing override applied to {}",
            describe(&forced)
        );

        RoutingDecision::new(
            target,
            confidence,
            format!(
                "{}; override on {} -> {}",
                base.rationale,
                describe(&forced),
                target
            ),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_without_overrides_matches_classifier() {
        let engine = RoutingEngine::default();
        let join = StructuralFeatureSet::read().with(Feature::Join);
        assert_eq!(engine.route(&join), engine.classifier().classify(&join));
        assert_eq!(engine.write_target(), Target::Both);
    }

    #[test]
    fn test_single_override_is_unanimous() {
        let engine = RoutingEngine::new(
            WriteMode::DualWrite,
            RoutingConfig::default().with_override(Feature::Join, Target::Primary),
        );
        let decision = engine.route(&StructuralFeatureSet::read().with(Feature::Join));
        assert_eq!(decision.target, Target::Primary);
        assert_eq!(decision.confidence, 1.0);
        assert!(decision.rationale.contains("override on has_join"));
    }

    #[test]
    fn test_conflicting_votes_lower_confidence() {
        let engine = RoutingEngine::new(
            WriteMode::DualWrite,
            RoutingConfig::default()
                .with_override(Feature::Join, Target::Primary)
                .with_override(Feature::Aggregate, Target::Primary),
        );

        // join -> primary, aggregate -> primary, group_by -> secondary
        let features = StructuralFeatureSet::read()
            .with(Feature::Join)
            .with(Feature::Aggregate)
            .with(Feature::GroupBy);
        let decision = engine.route(&features);
        assert_eq!(decision.target, Target::Primary);
        assert!((decision.confidence - 2.0 / 3.0).abs() < 1e-9);

        // join -> primary vs group_by -> secondary: tie goes to the override
        let tie = StructuralFeatureSet::read()
            .with(Feature::Join)
            .with(Feature::GroupBy);
        let decision = engine.route(&tie);
        assert_eq!(decision.target, Target::Primary);
        assert_eq!(decision.confidence, 0.5);
    }

    #[test]
    fn test_writes_ignore_overrides() {
        let engine = RoutingEngine::new(
            WriteMode::PrimaryOnly,
            RoutingConfig::default()
                .with_override(Feature::Join, Target::Secondary)
                .with_override(Feature::Write, Target::Secondary),
        );
        let decision = engine.route(&StructuralFeatureSet::write().with(Feature::Join));
        assert_eq!(decision.target, Target::Primary);
    }

    #[test]
    fn test_route_is_deterministic_for_every_feature_set() {
        let engine = RoutingEngine::new(
            WriteMode::DualWrite,
            RoutingConfig::default()
                .with_override(Feature::Subquery, Target::Primary)
                .with_override(Feature::Aggregate, Target::Secondary),
        );
        for bits in 0u8..64 {
            let features = Feature::ALL
                .iter()
                .enumerate()
                .filter(|(i, _)| bits & (1 << i) != 0)
                .fold(StructuralFeatureSet::read(), |set, (_, f)| set.with(*f));
            let a = engine.route(&features);
            assert_eq!(a, engine.route(&features));
            assert!((0.0..=1.0).contains(&a.confidence));
        }
    }
}
