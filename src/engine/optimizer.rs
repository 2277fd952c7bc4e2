//! Correlation matrix repair.
//!
//! Matrices assembled from independently estimated pairwise edges carry no
//! guarantee of global consistency. `repair` is the deterministic baseline
//! (symmetrise, clamp, unit diagonal); `optimize` refines a matrix with an
//! annealing local search that minimises distance to a target while
//! penalising indefiniteness.
//!
//! Every matrix leaving this module has passed through `repair`, so the
//! structural invariants hold even when the search is cut short.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::debug;

use crate::config::OptimizerConfig;
use crate::error::{EngineError, EngineResult};

pub type Matrix = Vec<Vec<f64>>;

/// Pivots below this are treated as zero when measuring indefiniteness.
const PIVOT_FLOOR: f64 = 1e-10;

const SYMMETRY_TOLERANCE: f64 = 1e-12;

/// Weight of the pull toward the starting matrix when no target is given.
const ANCHOR_WEIGHT: f64 = 0.1;

#[derive(Debug, Clone)]
pub struct OptimizationResult {
    pub matrix: Matrix,
    pub energy: f64,
    pub iterations: usize,
    pub converged: bool,
}

pub fn identity(n: usize) -> Matrix {
    (0..n)
        .map(|i| (0..n).map(|j| if i == j { 1.0 } else { 0.0 }).collect())
        .collect()
}

/// Entry (i, j) of a possibly ragged matrix; missing or non-finite → 0.
fn entry(m: &[Vec<f64>], i: usize, j: usize) -> f64 {
    m.get(i)
        .and_then(|row| row.get(j))
        .copied()
        .filter(|v| v.is_finite())
        .unwrap_or(0.0)
}

/// Baseline repair: average (i,j)/(j,i), clamp to [-1, 1], unit diagonal.
/// The dimension is the number of rows.
pub fn repair(m: &[Vec<f64>]) -> Matrix {
    let n = m.len();
    let mut out = identity(n);
    for i in 0..n {
        for j in (i + 1)..n {
            let v = ((entry(m, i, j) + entry(m, j, i)) / 2.0).clamp(-1.0, 1.0);
            out[i][j] = v;
            out[j][i] = v;
        }
    }
    out
}

/// Structural check: square, finite, symmetric, unit diagonal, bounded.
pub fn validate(m: &[Vec<f64>]) -> EngineResult<()> {
    let n = m.len();
    for (i, row) in m.iter().enumerate() {
        if row.len() != n {
            return Err(EngineError::MatrixValidation(format!(
                "row {} has {} columns, expected {}",
                i,
                row.len(),
                n
            )));
        }
        for (j, &v) in row.iter().enumerate() {
            if !v.is_finite() {
                return Err(EngineError::MatrixValidation(format!("non-finite entry at ({}, {})", i, j)));
            }
            if i == j && v != 1.0 {
                return Err(EngineError::MatrixValidation(format!("diagonal ({}, {}) = {}", i, j, v)));
            }
            if !(-1.0..=1.0).contains(&v) {
                return Err(EngineError::MatrixValidation(format!("entry ({}, {}) = {} out of range", i, j, v)));
            }
            if (v - m[j][i]).abs() > SYMMETRY_TOLERANCE {
                return Err(EngineError::MatrixValidation(format!("asymmetric at ({}, {})", i, j)));
            }
        }
    }
    Ok(())
}

/// Total negative pivot mass of an LDLᵀ factorisation; 0.0 for a positive
/// semi-definite matrix.
pub fn indefiniteness(m: &[Vec<f64>]) -> f64 {
    let n = m.len();
    let mut l = vec![vec![0.0; n]; n];
    let mut d = vec![0.0; n];
    let mut deficit = 0.0;
    for j in 0..n {
        let mut dj = entry(m, j, j) - (0..j).map(|k| l[j][k] * l[j][k] * d[k]).sum::<f64>();
        if dj < 0.0 {
            deficit += -dj;
        }
        dj = dj.max(PIVOT_FLOOR);
        d[j] = dj;
        for i in (j + 1)..n {
            let s: f64 = (0..j).map(|k| l[i][k] * l[j][k] * d[k]).sum();
            l[i][j] = (entry(m, i, j) - s) / dj;
        }
    }
    deficit
}

pub struct MatrixOptimizer {
    config: OptimizerConfig,
}

impl MatrixOptimizer {
    pub fn new(config: OptimizerConfig) -> Self {
        MatrixOptimizer { config }
    }

    /// Energy of `x`: squared distance to the target (or, without one, a
    /// boundary penalty plus a pull toward the starting matrix) plus the
    /// weighted indefiniteness.
    fn energy(&self, x: &Matrix, target: Option<&Matrix>, anchor: &Matrix) -> f64 {
        let n = x.len();
        let mut e = 0.0;
        for i in 0..n {
            for j in (i + 1)..n {
                let v = x[i][j];
                match target {
                    Some(t) => e += (v - t[i][j]).powi(2),
                    None => {
                        let over = (v.abs() - self.config.boundary_margin).max(0.0);
                        e += over * over + ANCHOR_WEIGHT * (v - anchor[i][j]).powi(2);
                    }
                }
            }
        }
        e + self.config.psd_penalty_weight * indefiniteness(x)
    }

    /// Annealing refinement of `candidate`, optionally toward `target`.
    ///
    /// Deterministic for a given seed, candidate and target.
    pub fn optimize(&self, candidate: &[Vec<f64>], target: Option<&[Vec<f64>]>) -> OptimizationResult {
        let start = repair(candidate);
        let n = start.len();
        let target = target.map(|t| {
            let mut t = repair(t);
            t.resize_with(n, Vec::new);
            repair(&t)
        });
        let target = target.as_ref();

        let mut current = start.clone();
        let mut current_e = self.energy(&current, target, &start);
        let mut best = current.clone();
        let mut best_e = current_e;

        if n < 2 || best_e <= self.config.convergence_threshold {
            return OptimizationResult {
                matrix: best,
                energy: best_e,
                iterations: 0,
                converged: true,
            };
        }

        let mut rng = StdRng::seed_from_u64(self.config.seed);
        let mut temperature = self.config.initial_temperature;
        let mut stalled = 0usize;
        let mut iterations = 0usize;
        let mut converged = false;

        for iter in 0..self.config.max_iterations {
            iterations = iter + 1;

            let i = rng.gen_range(0..n);
            let mut j = rng.gen_range(0..n - 1);
            if j >= i {
                j += 1;
            }
            let step = self.config.max_step
                * (temperature / self.config.initial_temperature).max(0.01);
            let old = current[i][j];
            let new = (old + rng.gen_range(-step..=step)).clamp(-1.0, 1.0);
            current[i][j] = new;
            current[j][i] = new;

            let e = self.energy(&current, target, &start);
            let delta = e - current_e;
            let accept = delta <= 0.0 || rng.gen::<f64>() < (-delta / temperature).exp();
            if accept {
                current_e = e;
            } else {
                current[i][j] = old;
                current[j][i] = old;
            }

            if current_e < best_e - self.config.convergence_threshold {
                best_e = current_e;
                best.clone_from(&current);
                stalled = 0;
            } else {
                stalled += 1;
            }

            if best_e <= self.config.convergence_threshold || stalled >= self.config.patience {
                converged = true;
                break;
            }
            temperature *= self.config.cooling_rate;
        }

        debug!(
            "Matrix optimizer: n={}, iterations={}, energy={:.6}, converged={}",
            n, iterations, best_e, converged
        );

        OptimizationResult {
            matrix: repair(&best),
            energy: best_e,
            iterations,
            converged,
        }
    }
}
