//! ROC analysis of continuous scores against a binary outcome.
//!
//! The classification rule is `score >= threshold ⇒ positive`. Thresholds are
//! the distinct observed scores plus `+∞`, the rule that calls nobody positive.

use crate::evaluate::EvaluationError;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfusionCounts {
    pub true_pos: usize,
    pub false_pos: usize,
    pub true_neg: usize,
    pub false_neg: usize,
}

impl ConfusionCounts {
    pub fn sensitivity(&self) -> f64 {
        let positives = self.true_pos + self.false_neg;
        if positives == 0 {
            f64::NAN
        } else {
            self.true_pos as f64 / positives as f64
        }
    }

    pub fn specificity(&self) -> f64 {
        let negatives = self.true_neg + self.false_pos;
        if negatives == 0 {
            f64::NAN
        } else {
            self.true_neg as f64 / negatives as f64
        }
    }
}

/// Counts of the rule `score >= threshold` against the outcome.
pub fn confusion_at(scores: &[f64], positive: &[bool], threshold: f64) -> ConfusionCounts {
    let mut counts = ConfusionCounts::default();
    for (&score, &is_case) in scores.iter().zip(positive) {
        match (score >= threshold, is_case) {
            (true, true) => counts.true_pos += 1,
            (true, false) => counts.false_pos += 1,
            (false, false) => counts.true_neg += 1,
            (false, true) => counts.false_neg += 1,
        }
    }
    counts
}

pub(crate) fn check_classes(scores: &[f64], positive: &[bool]) -> Result<(usize, usize), EvaluationError> {
    if scores.len() != positive.len() {
        return Err(EvaluationError::LengthMismatch {
            scores: scores.len(),
            outcomes: positive.len(),
        });
    }
    let cases = positive.iter().filter(|&&p| p).count();
    let controls = positive.len() - cases;
    if cases == 0 || controls == 0 {
        return Err(EvaluationError::DegenerateClasses { cases, controls });
    }
    Ok((cases, controls))
}

/// Area under the ROC curve (Mann–Whitney U with mid-ranks for ties).
pub fn auc(scores: &[f64], positive: &[bool]) -> Result<f64, EvaluationError> {
    let (cases, controls) = check_classes(scores, positive)?;
    let mut order: Vec<usize> = (0..scores.len()).collect();
    order.sort_by(|&a, &b| scores[a].total_cmp(&scores[b]));

    let mut case_rank_sum = 0.0;
    let mut start = 0;
    while start < order.len() {
        let mut end = start + 1;
        while end < order.len() && scores[order[end]] == scores[order[start]] {
            end += 1;
        }
        // Ranks are 1-based; tied scores share the mean of their ranks.
        let mid_rank = (start + end + 1) as f64 / 2.0;
        let tied_cases = order[start..end].iter().filter(|&&i| positive[i]).count();
        case_rank_sum += mid_rank * tied_cases as f64;
        start = end;
    }
    let u = case_rank_sum - (cases * (cases + 1)) as f64 / 2.0;
    Ok(u / (cases * controls) as f64)
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RocPoint {
    pub threshold: f64,
    pub sensitivity: f64,
    pub specificity: f64,
    pub counts: ConfusionCounts,
}

/// Every candidate threshold with its operating point, from `+∞` down to the
/// smallest observed score.
pub fn roc_curve(scores: &[f64], positive: &[bool]) -> Result<Vec<RocPoint>, EvaluationError> {
    let (cases, controls) = check_classes(scores, positive)?;
    let mut order: Vec<usize> = (0..scores.len()).collect();
    order.sort_by(|&a, &b| scores[b].total_cmp(&scores[a]));

    let mut counts = ConfusionCounts {
        true_pos: 0,
        false_pos: 0,
        true_neg: controls,
        false_neg: cases,
    };
    let point = |threshold: f64, counts: ConfusionCounts| RocPoint {
        threshold,
        sensitivity: counts.sensitivity(),
        specificity: counts.specificity(),
        counts,
    };
    let mut curve = vec![point(f64::INFINITY, counts)];
    let mut start = 0;
    while start < order.len() {
        let threshold = scores[order[start]];
        let mut end = start;
        while end < order.len() && scores[order[end]] == threshold {
            if positive[order[end]] {
                counts.true_pos += 1;
                counts.false_neg -= 1;
            } else {
                counts.false_pos += 1;
                counts.true_neg -= 1;
            }
            end += 1;
        }
        curve.push(point(threshold, counts));
        start = end;
    }
    Ok(curve)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    #[test]
    fn perfect_separation_has_unit_auc() {
        let scores = [10.0, 20.0, 30.0, 70.0, 80.0, 90.0];
        let positive = [false, false, false, true, true, true];
        assert_abs_diff_eq!(auc(&scores, &positive).unwrap(), 1.0, epsilon = 1e-12);
        let reversed: Vec<bool> = positive.iter().map(|p| !p).collect();
        assert_abs_diff_eq!(auc(&scores, &reversed).unwrap(), 0.0, epsilon = 1e-12);
    }

    #[test]
    fn ties_count_one_half() {
        let scores = [50.0, 50.0, 50.0, 50.0];
        let positive = [true, false, true, false];
        assert_abs_diff_eq!(auc(&scores, &positive).unwrap(), 0.5, epsilon = 1e-12);

        // One case above both controls, one case tied with a control.
        let scores = [1.0, 2.0, 2.0, 3.0];
        let positive = [false, false, true, true];
        assert_abs_diff_eq!(auc(&scores, &positive).unwrap(), 0.875, epsilon = 1e-12);
    }

    #[test]
    fn random_scores_have_auc_near_one_half() {
        let mut rng = StdRng::seed_from_u64(42);
        let scores: Vec<f64> = (0..4000).map(|_| rng.gen_range(0.0..100.0)).collect();
        let positive: Vec<bool> = (0..4000).map(|i| i % 2 == 0).collect();
        let value = auc(&scores, &positive).unwrap();
        assert!((value - 0.5).abs() < 0.03, "auc {value}");
    }

    #[test]
    fn single_class_is_degenerate() {
        let err = auc(&[1.0, 2.0], &[true, true]).unwrap_err();
        assert_eq!(
            err,
            EvaluationError::DegenerateClasses {
                cases: 2,
                controls: 0
            }
        );
    }

    #[test]
    fn roc_curve_walks_from_nobody_to_everybody_positive() {
        let scores = [0.1, 0.4, 0.35, 0.8];
        let positive = [false, false, true, true];
        let curve = roc_curve(&scores, &positive).unwrap();
        assert_eq!(curve.len(), 5);
        assert!(curve[0].threshold.is_infinite());
        assert_eq!(curve[0].sensitivity, 0.0);
        assert_eq!(curve[0].specificity, 1.0);
        let last = curve[curve.len() - 1];
        assert_eq!(last.threshold, 0.1);
        assert_eq!(last.sensitivity, 1.0);
        assert_eq!(last.specificity, 0.0);
        for p in &curve {
            assert_eq!(p.counts, confusion_at(&scores, &positive, p.threshold));
        }
    }
}
