//! Statistical primitives for correlation estimation.
//!
//! - Pearson and Spearman coefficients
//! - Fisher z-transform confidence intervals
//! - Non-linearity scoring (rank/linear divergence plus quadratic-fit excess)

use crate::db::models::ConfidenceInterval;

/// Two-sided 95% normal critical value.
const Z_95: f64 = 1.959_964;

/// Keeps atanh finite at |r| = 1.
const R_LIMIT: f64 = 0.999_999;

const EPS: f64 = 1e-12;

/// Pearson correlation coefficient. `None` when fewer than two samples or
/// either side has zero variance.
pub fn pearson(pairs: &[(f64, f64)]) -> Option<f64> {
    let n = pairs.len();
    if n < 2 {
        return None;
    }
    let nf = n as f64;
    let mean_x = pairs.iter().map(|(x, _)| x).sum::<f64>() / nf;
    let mean_y = pairs.iter().map(|(_, y)| y).sum::<f64>() / nf;

    let mut cov = 0.0;
    let mut var_x = 0.0;
    let mut var_y = 0.0;
    for (x, y) in pairs {
        let dx = x - mean_x;
        let dy = y - mean_y;
        cov += dx * dy;
        var_x += dx * dx;
        var_y += dy * dy;
    }
    if var_x < EPS || var_y < EPS {
        return None;
    }
    let r = cov / (var_x.sqrt() * var_y.sqrt());
    r.is_finite().then(|| r.clamp(-1.0, 1.0))
}

/// Fractional ranks (1-based); ties receive their average rank.
fn ranks(values: &[f64]) -> Vec<f64> {
    let mut order: Vec<usize> = (0..values.len()).collect();
    order.sort_by(|&a, &b| {
        values[a]
            .partial_cmp(&values[b])
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut out = vec![0.0; values.len()];
    let mut i = 0;
    while i < order.len() {
        let mut j = i;
        while j + 1 < order.len() && values[order[j + 1]] == values[order[i]] {
            j += 1;
        }
        let avg = (i + j) as f64 / 2.0 + 1.0;
        for &idx in &order[i..=j] {
            out[idx] = avg;
        }
        i = j + 1;
    }
    out
}

/// Spearman rank correlation.
pub fn spearman(pairs: &[(f64, f64)]) -> Option<f64> {
    let xs: Vec<f64> = pairs.iter().map(|(x, _)| *x).collect();
    let ys: Vec<f64> = pairs.iter().map(|(_, y)| *y).collect();
    let ranked: Vec<(f64, f64)> = ranks(&xs).into_iter().zip(ranks(&ys)).collect();
    pearson(&ranked)
}

/// 95% interval for a correlation via the Fisher z-transform.
///
/// Returns `None` when `n <= 3`, where the standard error is undefined.
pub fn fisher_interval(r: f64, n: f64) -> Option<ConfidenceInterval> {
    if !r.is_finite() || !n.is_finite() || n <= 3.0 {
        return None;
    }
    let z = r.clamp(-R_LIMIT, R_LIMIT).atanh();
    let se = 1.0 / (n - 3.0).sqrt();
    let lower = (z - Z_95 * se).tanh();
    let upper = (z + Z_95 * se).tanh();
    if !lower.is_finite() || !upper.is_finite() {
        return None;
    }
    let r = r.clamp(-1.0, 1.0);
    Some(ConfidenceInterval {
        lower: lower.clamp(-1.0, 1.0).min(r),
        upper: upper.clamp(-1.0, 1.0).max(r),
    })
}

/// Fixed-width interval around `r`, clamped to [-1, 1].
pub fn fixed_interval(r: f64, half_width: f64) -> ConfidenceInterval {
    let r = r.clamp(-1.0, 1.0);
    ConfidenceInterval {
        lower: (r - half_width).clamp(-1.0, 1.0),
        upper: (r + half_width).clamp(-1.0, 1.0),
    }
}

/// Confidence from sample size: 0.5 at the minimum sample size, rising
/// toward 1.0 as data accumulates.
pub fn sample_confidence(n: u64, min_sample_size: usize) -> f64 {
    if n == 0 {
        return 0.0;
    }
    let n = n as f64;
    (n / (n + min_sample_size.max(1) as f64)).clamp(0.0, 1.0)
}

/// R² of the least-squares fit y ≈ a + b·x + c·x². Falls back to the linear
/// R² when the quadratic system is singular (e.g. binary indicators).
fn quadratic_r2(pairs: &[(f64, f64)], linear_r: f64) -> f64 {
    let linear_r2 = linear_r * linear_r;
    let n = pairs.len() as f64;
    let mean_x = pairs.iter().map(|(x, _)| x).sum::<f64>() / n;
    let mean_y = pairs.iter().map(|(_, y)| y).sum::<f64>() / n;

    // Centred design: u = x - mean_x, v = u² - mean(u²)
    let us: Vec<f64> = pairs.iter().map(|(x, _)| x - mean_x).collect();
    let mean_u2 = us.iter().map(|u| u * u).sum::<f64>() / n;
    let (mut suu, mut suv, mut svv, mut suy, mut svy, mut syy) = (0.0, 0.0, 0.0, 0.0, 0.0, 0.0);
    for (u, (_, y)) in us.iter().zip(pairs) {
        let v = u * u - mean_u2;
        let dy = y - mean_y;
        suu += u * u;
        suv += u * v;
        svv += v * v;
        suy += u * dy;
        svy += v * dy;
        syy += dy * dy;
    }
    let det = suu * svv - suv * suv;
    if det.abs() < EPS * (suu * svv).max(1.0) || syy < EPS {
        return linear_r2;
    }
    let b = (suy * svv - svy * suv) / det;
    let c = (svy * suu - suy * suv) / det;
    let explained = b * suy + c * svy;
    (explained / syy).clamp(linear_r2, 1.0)
}

/// How strongly the dependence departs from linear, 0.0–1.0.
///
/// Combines the gap between rank and linear correlation (monotone
/// non-linearity) with the extra variance a quadratic term explains
/// (non-monotone dependence such as U-shapes).
pub fn non_linearity_score(pairs: &[(f64, f64)]) -> f64 {
    let Some(r) = pearson(pairs) else {
        return 0.0;
    };
    let rank_gap = spearman(pairs).map(|s| (s.abs() - r.abs()).abs()).unwrap_or(0.0);
    let quad_excess = quadratic_r2(pairs, r) - r * r;
    (rank_gap + quad_excess).clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn pearson_perfect_and_inverse() {
        let up: Vec<(f64, f64)> = (0..10).map(|i| (i as f64, 2.0 * i as f64 + 1.0)).collect();
        let down: Vec<(f64, f64)> = (0..10).map(|i| (i as f64, -(i as f64))).collect();
        assert_relative_eq!(pearson(&up).unwrap(), 1.0, epsilon = 1e-9);
        assert_relative_eq!(pearson(&down).unwrap(), -1.0, epsilon = 1e-9);
    }

    #[test]
    fn pearson_degenerate_inputs() {
        assert!(pearson(&[(1.0, 2.0)]).is_none());
        assert!(pearson(&[(1.0, 2.0), (1.0, 3.0), (1.0, 4.0)]).is_none());
    }

    #[test]
    fn spearman_handles_ties() {
        let pairs = vec![(1.0, 1.0), (1.0, 1.0), (2.0, 2.0), (3.0, 3.0)];
        assert_relative_eq!(spearman(&pairs).unwrap(), 1.0, epsilon = 1e-9);
        assert_eq!(ranks(&[3.0, 1.0, 1.0]), vec![3.0, 1.5, 1.5]);
    }

    #[test]
    fn fisher_interval_brackets_estimate() {
        for &r in &[-1.0, -0.7, 0.0, 0.35, 0.99, 1.0] {
            for &n in &[4.0, 10.0, 50.0, 1000.0] {
                let ci = fisher_interval(r, n).unwrap();
                assert!(ci.lower <= r && r <= ci.upper, "r={} n={} ci={:?}", r, n, ci);
                assert!(ci.lower >= -1.0 && ci.upper <= 1.0);
            }
        }
    }

    #[test]
    fn fisher_interval_narrows_with_samples() {
        let small = fisher_interval(0.5, 10.0).unwrap();
        let large = fisher_interval(0.5, 500.0).unwrap();
        assert!(large.upper - large.lower < small.upper - small.lower);
    }

    #[test]
    fn fisher_interval_unstable_for_tiny_samples() {
        assert!(fisher_interval(0.5, 3.0).is_none());
        assert!(fisher_interval(0.5, 2.5).is_none());
    }

    #[test]
    fn fixed_interval_is_clamped() {
        let ci = fixed_interval(0.9, 0.3);
        assert_relative_eq!(ci.lower, 0.6, epsilon = 1e-12);
        assert_relative_eq!(ci.upper, 1.0, epsilon = 1e-12);
    }

    #[test]
    fn sample_confidence_grows_with_n() {
        assert_eq!(sample_confidence(0, 20), 0.0);
        assert_relative_eq!(sample_confidence(20, 20), 0.5, epsilon = 1e-12);
        assert!(sample_confidence(200, 20) > sample_confidence(40, 20));
    }

    #[test]
    fn linear_data_scores_low_non_linearity() {
        let pairs: Vec<(f64, f64)> = (0..30).map(|i| (i as f64, 3.0 * i as f64)).collect();
        assert!(non_linearity_score(&pairs) < 0.05);
    }

    #[test]
    fn u_shape_scores_high_non_linearity() {
        let pairs: Vec<(f64, f64)> = (-15..=15)
            .map(|i| {
                let x = i as f64;
                (x, x * x)
            })
            .collect();
        assert!(pearson(&pairs).unwrap().abs() < 0.05);
        assert!(non_linearity_score(&pairs) > 0.9);
    }

    #[test]
    fn binary_indicators_do_not_break_quadratic_fit() {
        let pairs = vec![(1.0, 1.0), (1.0, 0.0), (0.0, 0.0), (0.0, 1.0), (1.0, 1.0)];
        let score = non_linearity_score(&pairs);
        assert!((0.0..=1.0).contains(&score));
    }
}
