//! Pure mapping from structural features to a routing decision.

use duplex_core::{Feature, RoutingDecision, StructuralFeatureSet, Target, WriteMode};

/// Classifies an operation by its structural features.
///
/// No I/O and no mutable state: the same feature set always yields the same
/// decision. Rules, first match wins:
///
/// 1. `is_write` goes where `write_mode` says
/// 2. any relational feature (join, group by, subquery, window function)
///    goes to the secondary store
/// 3. everything else goes to the primary store
#[derive(Debug, Clone, Copy, Default)]
pub struct QueryClassifier {
    write_mode: WriteMode,
}

impl QueryClassifier {
    pub fn new(write_mode: WriteMode) -> Self {
        Self { write_mode }
    }

    pub fn write_mode(&self) -> WriteMode {
        self.write_mode
    }

    pub fn classify(&self, features: &StructuralFeatureSet) -> RoutingDecision {
        let fired = features.fired();

        if features.is_write {
            let target = self.write_mode.target();
            return RoutingDecision::new(
                target,
                1.0,
                format!(
                    "{} -> {} (write_mode={})",
                    describe(&fired),
                    target,
                    write_mode_name(self.write_mode)
                ),
            );
        }

        if fired.iter().any(|f| f.is_relational()) {
            return RoutingDecision::new(
                Target::Secondary,
                1.0,
                format!("{} -> secondary (relational)", describe(&fired)),
            );
        }

        let rationale = if fired.is_empty() {
            "no structural features -> primary".to_string()
        } else {
            format!("{} -> primary", describe(&fired))
        };
        RoutingDecision::new(Target::Primary, 1.0, rationale)
    }
}

pub(crate) fn describe(fired: &[Feature]) -> String {
    fired
        .iter()
        .map(|f| f.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

fn write_mode_name(mode: WriteMode) -> &'static str {
    match mode {
        WriteMode::PrimaryOnly => "primary_only",
        WriteMode::DualWrite => "dual_write",
        WriteMode::SecondaryOnly => "secondary_only",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Every one of the 64 combinations of the six flags.
    fn all_feature_sets() -> Vec<StructuralFeatureSet> {
        (0u8..64)
            .map(|bits| {
                Feature::ALL
                    .iter()
                    .enumerate()
                    .filter(|(i, _)| bits & (1 << i) != 0)
                    .fold(StructuralFeatureSet::read(), |set, (_, f)| set.with(*f))
            })
            .collect()
    }

    #[test]
    fn test_classify_is_total_and_deterministic() {
        let classifier = QueryClassifier::default();
        for features in all_feature_sets() {
            let first = classifier.classify(&features);
            let second = classifier.classify(&features);
            assert_eq!(first, second);
            assert_eq!(first.confidence, 1.0);

            let expected = if features.is_write {
                Target::Both
            } else if features.fired().iter().any(|f| f.is_relational()) {
                Target::Secondary
            } else {
                Target::Primary
            };
            assert_eq!(first.target, expected, "features: {:?}", features);

            for flag in features.fired() {
                assert!(first.rationale.contains(flag.as_str()));
            }
        }
    }

    #[test]
    fn test_write_follows_write_mode() {
        let write = StructuralFeatureSet::write().with(Feature::Join);
        assert_eq!(
            QueryClassifier::new(WriteMode::PrimaryOnly)
                .classify(&write)
                .target,
            Target::Primary
        );
        assert_eq!(
            QueryClassifier::new(WriteMode::SecondaryOnly)
                .classify(&write)
                .target,
            Target::Secondary
        );
        let decision = QueryClassifier::new(WriteMode::DualWrite).classify(&write);
        assert_eq!(decision.target, Target::Both);
        assert!(decision.rationale.contains("dual_write"));
    }

    #[test]
    fn test_aggregate_alone_stays_on_primary() {
        let decision = QueryClassifier::default()
            .classify(&StructuralFeatureSet::read().with(Feature::Aggregate));
        assert_eq!(decision.target, Target::Primary);
        assert!(decision.rationale.contains("is_aggregate"));

        let plain = QueryClassifier::default().classify(&StructuralFeatureSet::read());
        assert_eq!(plain.target, Target::Primary);
    }
}
