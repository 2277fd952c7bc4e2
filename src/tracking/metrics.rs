//! Scoring utilities for resolved predictions.
//!
//! Samples are `(predicted, label)` pairs with `label` 1.0 for a correct
//! outcome and 0.0 otherwise.

use serde::Serialize;

const EPS: f64 = 1e-6;

/// Confidence deciles used by the reliability diagram.
const BUCKETS: usize = 10;

/// One confidence decile of a reliability diagram.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ReliabilityBucket {
    pub lower: f64,
    pub upper: f64,
    pub count: usize,
    pub mean_confidence: f64,
    /// Observed correctness rate in the bucket
    pub accuracy: f64,
}

fn clamp_prob(p: f64) -> f64 {
    p.clamp(EPS, 1.0 - EPS)
}

fn logloss(p: f64, y: f64) -> f64 {
    let p = clamp_prob(p);
    -(y * p.ln() + (1.0 - y) * (1.0 - p).ln())
}

/// Mean squared error of the predicted probabilities; 0.0 for no samples.
pub fn brier_score(samples: &[(f64, f64)]) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }
    samples.iter().map(|(p, y)| (p.clamp(0.0, 1.0) - y).powi(2)).sum::<f64>() / samples.len() as f64
}

/// Mean binary cross-entropy; 0.0 for no samples.
pub fn log_loss(samples: &[(f64, f64)]) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }
    samples.iter().map(|(p, y)| logloss(*p, *y)).sum::<f64>() / samples.len() as f64
}

fn bucket_index(confidence: f64) -> usize {
    ((confidence.clamp(0.0, 1.0) * BUCKETS as f64) as usize).min(BUCKETS - 1)
}

/// Non-empty confidence deciles, lowest first. A confidence of exactly 1.0
/// falls in the top decile.
pub fn reliability_buckets(samples: &[(f64, f64)]) -> Vec<ReliabilityBucket> {
    let mut sums = [(0usize, 0.0f64, 0.0f64); BUCKETS];
    for (confidence, label) in samples {
        let slot = &mut sums[bucket_index(*confidence)];
        slot.0 += 1;
        slot.1 += confidence.clamp(0.0, 1.0);
        slot.2 += label;
    }
    sums.iter()
        .enumerate()
        .filter(|(_, (count, _, _))| *count > 0)
        .map(|(i, (count, conf_sum, label_sum))| ReliabilityBucket {
            lower: i as f64 / BUCKETS as f64,
            upper: (i + 1) as f64 / BUCKETS as f64,
            count: *count,
            mean_confidence: conf_sum / *count as f64,
            accuracy: label_sum / *count as f64,
        })
        .collect()
}

/// 1 − count-weighted mean |confidence − accuracy| over confidence deciles.
/// 1.0 is perfectly calibrated; 0.0 when there are no samples.
pub fn confidence_calibration(buckets: &[ReliabilityBucket]) -> f64 {
    let total: usize = buckets.iter().map(|b| b.count).sum();
    if total == 0 {
        return 0.0;
    }
    let gap: f64 = buckets
        .iter()
        .map(|b| b.count as f64 * (b.mean_confidence - b.accuracy).abs())
        .sum::<f64>()
        / total as f64;
    (1.0 - gap).clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn scores_of_perfect_and_inverted_forecasts() {
        let perfect = [(1.0, 1.0), (0.0, 0.0)];
        let inverted = [(0.0, 1.0), (1.0, 0.0)];
        assert_relative_eq!(brier_score(&perfect), 0.0, epsilon = 1e-12);
        assert_relative_eq!(brier_score(&inverted), 1.0, epsilon = 1e-12);
        assert!(log_loss(&perfect) < 1e-5);
        assert!(log_loss(&inverted) > 10.0);
        assert!(log_loss(&inverted).is_finite());
    }

    #[test]
    fn coin_flip_baseline() {
        let samples = [(0.5, 1.0), (0.5, 0.0)];
        assert_relative_eq!(brier_score(&samples), 0.25, epsilon = 1e-12);
        assert_relative_eq!(log_loss(&samples), std::f64::consts::LN_2, epsilon = 1e-6);
    }

    #[test]
    fn buckets_group_by_decile() {
        let samples = [(0.05, 0.0), (0.72, 1.0), (0.78, 0.0), (1.0, 1.0)];
        let buckets = reliability_buckets(&samples);
        assert_eq!(buckets.len(), 3);
        assert_eq!(buckets[1].count, 2);
        assert_relative_eq!(buckets[1].mean_confidence, 0.75, epsilon = 1e-12);
        assert_relative_eq!(buckets[1].accuracy, 0.5, epsilon = 1e-12);
        assert_relative_eq!(buckets[2].lower, 0.9, epsilon = 1e-12);
    }

    #[test]
    fn calibration_rewards_matching_confidence() {
        // 80% confident, right 8 times out of 10.
        let calibrated: Vec<(f64, f64)> = (0..10).map(|i| (0.8, if i < 8 { 1.0 } else { 0.0 })).collect();
        // 80% confident, right 3 times out of 10.
        let overconfident: Vec<(f64, f64)> = (0..10).map(|i| (0.8, if i < 3 { 1.0 } else { 0.0 })).collect();
        let good = confidence_calibration(&reliability_buckets(&calibrated));
        let bad = confidence_calibration(&reliability_buckets(&overconfident));
        assert_relative_eq!(good, 1.0, epsilon = 1e-12);
        assert_relative_eq!(bad, 0.5, epsilon = 1e-12);
    }

    #[test]
    fn empty_inputs_score_zero() {
        assert_eq!(brier_score(&[]), 0.0);
        assert_eq!(log_loss(&[]), 0.0);
        assert!(reliability_buckets(&[]).is_empty());
        assert_eq!(confidence_calibration(&[]), 0.0);
    }
}
