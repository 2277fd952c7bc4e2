//! Joint probability of several binary factors under pairwise correlation.
//!
//! For two Bernoulli indicators with marginals p, q and correlation ρ:
//!
//!   P(A ∧ B) = p·q + ρ·σ_A·σ_B = p·q · (1 + ρ · √((1-p)(1-q) / (p·q)))
//!
//! The multi-factor estimate multiplies the marginals by one such
//! correction per pair, then clamps into the Fréchet bounds
//! [max(0, Σp − (n−1)), min p]. Strong positive correlation therefore
//! saturates at the smallest marginal and strong negative correlation
//! drives the estimate toward the lower bound.

use super::optimizer::Matrix;

/// Keeps the coupling finite for marginals near zero.
const MAX_COUPLING: f64 = 50.0;

const EPS: f64 = 1e-9;

/// Scaled Bernoulli covariance factor √((1-p_i)(1-p_j) / (p_i·p_j)).
pub fn coupling(p_i: f64, p_j: f64) -> f64 {
    let p_i = p_i.clamp(EPS, 1.0);
    let p_j = p_j.clamp(EPS, 1.0);
    (((1.0 - p_i) * (1.0 - p_j)) / (p_i * p_j))
        .sqrt()
        .min(MAX_COUPLING)
}

/// Fréchet bounds on the probability that all events hold.
pub fn frechet_bounds(probabilities: &[f64]) -> (f64, f64) {
    let n = probabilities.len() as f64;
    let sum: f64 = probabilities.iter().sum();
    let lower = (sum - (n - 1.0)).max(0.0);
    let upper = probabilities.iter().copied().fold(1.0, f64::min);
    (lower, upper.max(lower))
}

/// Joint probability of all factors given marginals and a valid
/// correlation matrix of matching dimension. Always in [0, 1].
pub fn joint_probability(probabilities: &[f64], correlation: &Matrix) -> f64 {
    let n = probabilities.len();
    if n == 0 {
        return 1.0;
    }
    let probs: Vec<f64> = probabilities.iter().map(|p| p.clamp(0.0, 1.0)).collect();
    if probs.iter().any(|&p| p <= 0.0) {
        return 0.0;
    }

    let mut joint: f64 = probs.iter().product();
    for i in 0..n {
        for j in (i + 1)..n {
            let rho = correlation
                .get(i)
                .and_then(|row| row.get(j))
                .copied()
                .filter(|v| v.is_finite())
                .unwrap_or(0.0)
                .clamp(-1.0, 1.0);
            joint *= (1.0 + rho * coupling(probs[i], probs[j])).max(0.0);
        }
    }

    let (lower, upper) = frechet_bounds(&probs);
    if !joint.is_finite() {
        return upper;
    }
    joint.clamp(lower, upper).clamp(0.0, 1.0)
}
