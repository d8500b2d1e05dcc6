//! Cutpoint selection under a specificity floor.

use crate::evaluate::EvaluationError;
use crate::evaluate::roc::{ConfusionCounts, RocPoint, roc_curve};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Cutpoint {
    /// Scores at or above this value are called positive.
    pub threshold: f64,
    pub sensitivity: f64,
    pub specificity: f64,
    pub counts: ConfusionCounts,
}

impl From<RocPoint> for Cutpoint {
    fn from(point: RocPoint) -> Self {
        Self {
            threshold: point.threshold,
            sensitivity: point.sensitivity,
            specificity: point.specificity,
            counts: point.counts,
        }
    }
}

/// Threshold with the highest sensitivity among those whose specificity is at
/// least `min_specificity`. Ties go to the higher specificity, then to the
/// lower threshold.
///
/// The `+∞` threshold has specificity 1, so a feasible threshold always exists.
pub fn optimal_cutpoint(
    scores: &[f64],
    positive: &[bool],
    min_specificity: f64,
) -> Result<Cutpoint, EvaluationError> {
    let curve = roc_curve(scores, positive)?;
    let mut best: Option<RocPoint> = None;
    for point in curve.into_iter().filter(|p| p.specificity >= min_specificity) {
        let better = match &best {
            None => true,
            Some(current) => {
                point.sensitivity > current.sensitivity
                    || (point.sensitivity == current.sensitivity
                        && (point.specificity > current.specificity
                            || (point.specificity == current.specificity
                                && point.threshold < current.threshold)))
            }
        };
        if better {
            best = Some(point);
        }
    }
    best.map(Cutpoint::from)
        .ok_or(EvaluationError::NoFeasibleCutpoint { min_specificity })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evaluate::roc::confusion_at;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    #[test]
    fn separable_scores_reach_full_sensitivity() {
        let scores = [5.0, 10.0, 15.0, 60.0, 70.0];
        let positive = [false, false, false, true, true];
        let cut = optimal_cutpoint(&scores, &positive, 0.94).unwrap();
        assert_eq!(cut.threshold, 60.0);
        assert_eq!(cut.sensitivity, 1.0);
        assert_eq!(cut.specificity, 1.0);
    }

    #[test]
    fn specificity_floor_is_respected() {
        let mut rng = StdRng::seed_from_u64(7);
        let positive: Vec<bool> = (0..300).map(|i| i < 120).collect();
        let scores: Vec<f64> = positive
            .iter()
            .map(|&p| rng.gen_range(0.0..60.0) + if p { 25.0 } else { 0.0 })
            .collect();
        for floor in [0.5, 0.8, 0.94, 0.99, 1.0] {
            let cut = optimal_cutpoint(&scores, &positive, floor).unwrap();
            assert!(cut.specificity >= floor);
            assert_eq!(cut.counts, confusion_at(&scores, &positive, cut.threshold));
        }
    }

    #[test]
    fn unreachable_sensitivity_falls_back_to_calling_nobody_positive() {
        // The highest-scoring subject is a control, so any finite threshold
        // loses specificity below 1.
        let scores = [90.0, 10.0, 20.0];
        let positive = [false, true, true];
        let cut = optimal_cutpoint(&scores, &positive, 1.0).unwrap();
        assert!(cut.threshold.is_infinite());
        assert_eq!(cut.sensitivity, 0.0);
    }

    #[test]
    fn ties_prefer_higher_specificity_then_lower_threshold() {
        // Thresholds 50 and 40 both catch one of two cases; 40 also flags a
        // control, so 50 wins on specificity.
        let scores = [50.0, 40.0, 10.0, 30.0];
        let positive = [true, false, true, false];
        let cut = optimal_cutpoint(&scores, &positive, 0.0).unwrap();
        assert_eq!(cut.threshold, 10.0);
        let cut = optimal_cutpoint(&scores, &positive, 0.5).unwrap();
        assert_eq!(cut.threshold, 50.0);
        assert_eq!(cut.specificity, 1.0);
    }
}
