use futures_util::future::join_all;
use moka::future::Cache;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use super::joint::joint_probability;
use super::optimizer::{self, identity, Matrix, MatrixOptimizer};
use super::stats;
use super::transfer::TransferLearningAdapter;
use crate::config::{CorrelationConfig, OptimizerConfig};
use crate::db::models::{ConfidenceInterval, CorrelationEdge, Domain, EdgeMethod, Factor};
use crate::db::{CorrelationStore, ObservationSource};
use crate::error::{EngineError, EngineResult};

/// Half-width of the interval used when Fisher-z is undefined.
const FALLBACK_INTERVAL_HALF_WIDTH: f64 = 0.3;

#[derive(Debug, Clone, Copy, Default)]
pub struct MatrixOptions {
    /// Estimate missing edges from observations, then transfer learning.
    /// When false, missing pairs are filled with 0 (independence).
    pub calculate_if_missing: bool,
}

/// A validated correlation matrix for an ordered factor set.
#[derive(Debug, Clone, Serialize)]
pub struct CorrelationMatrix {
    pub factors: Vec<String>,
    pub matrix: Matrix,
    /// Share of pairs backed by native edges with enough samples (0.0–1.0)
    pub data_quality: f64,
    pub dimensions: usize,
    /// One edge per pair (i < j), in row-major pair order
    pub edges: Vec<CorrelationEdge>,
    /// Worst edge method used, `None` for fewer than two factors
    pub lowest_method: Option<EdgeMethod>,
    /// Whether the annealing repair had to run
    pub annealed: bool,
}

impl CorrelationMatrix {
    /// Independence matrix used when the store cannot be reached.
    fn fallback(factors: Vec<String>, domain: &Domain) -> Self {
        let n = factors.len();
        let edges: Vec<CorrelationEdge> = pair_indices(n)
            .into_iter()
            .map(|(i, j)| {
                CorrelationEdge::independent(&factors[i], &factors[j], domain.clone(), EdgeMethod::Fallback)
            })
            .collect();
        CorrelationMatrix {
            lowest_method: (!edges.is_empty()).then_some(EdgeMethod::Fallback),
            factors,
            matrix: identity(n),
            data_quality: 0.0,
            dimensions: n,
            edges,
            annealed: false,
        }
    }

    pub fn calculation_method(&self) -> &'static str {
        self.lowest_method
            .map(|m| m.calculation_method())
            .unwrap_or("single_factor")
    }

    /// Distinct transfer source domains behind any edge, sorted.
    pub fn transfer_sources(&self) -> Vec<Domain> {
        self.edges
            .iter()
            .flat_map(|e| e.transfer_sources.iter().cloned())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }
}

fn pair_indices(n: usize) -> Vec<(usize, usize)> {
    (0..n)
        .flat_map(|i| ((i + 1)..n).map(move |j| (i, j)))
        .collect()
}

/// One factor of a multi-factor prediction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FactorPrediction {
    pub factor: String,
    /// Independent probability estimate (0.0–1.0)
    pub probability: f64,
    /// Confidence in that estimate (0.0–1.0)
    pub confidence: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct Insight {
    pub factor_a: String,
    pub factor_b: String,
    pub correlation: f64,
    pub confidence: f64,
    pub note: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct JointProbability {
    pub joint_probability: f64,
    pub joint_confidence: f64,
    /// "single_factor" | "statistical" | "transfer_learning" | "default" | "fallback"
    pub calculation_method: String,
    pub insights: Vec<Insight>,
    pub data_quality: f64,
    pub transfer_sources: Vec<Domain>,
}

type MatrixKey = (Domain, Vec<String>, bool);

/// Builds correlation matrices and joint probabilities for factor sets.
///
/// All persisted state goes through the `CorrelationStore`. Matrices are
/// cached per (domain, factor list, options) with a TTL; concurrent requests
/// for the same uncached key share one computation.
pub struct CorrelationEngine {
    store: Arc<dyn CorrelationStore>,
    observations: Arc<dyn ObservationSource>,
    transfer: Arc<TransferLearningAdapter>,
    optimizer: MatrixOptimizer,
    config: CorrelationConfig,
    cache: Cache<MatrixKey, Arc<CorrelationMatrix>>,
}

impl CorrelationEngine {
    pub fn new(
        store: Arc<dyn CorrelationStore>,
        observations: Arc<dyn ObservationSource>,
        transfer: Arc<TransferLearningAdapter>,
        config: CorrelationConfig,
        optimizer_config: OptimizerConfig,
    ) -> Self {
        let cache = Cache::builder()
            .max_capacity(config.cache_capacity)
            .time_to_live(config.cache_ttl)
            .build();
        CorrelationEngine {
            store,
            observations,
            transfer,
            optimizer: MatrixOptimizer::new(optimizer_config),
            config,
            cache,
        }
    }

    /// Drop every cached matrix, e.g. after affinities changed.
    pub fn invalidate_cache(&self) {
        self.cache.invalidate_all();
    }

    // ── Matrix construction ──────────────────────────────────────────────────

    /// Correlation matrix for an ordered factor set. Duplicate keys are
    /// collapsed, keeping the first occurrence.
    pub async fn get_correlation_matrix(
        &self,
        factors: &[Factor],
        domain: &Domain,
        options: MatrixOptions,
    ) -> EngineResult<Arc<CorrelationMatrix>> {
        let mut seen = HashSet::new();
        let keys: Vec<String> = factors
            .iter()
            .filter(|f| seen.insert(f.key.clone()))
            .map(|f| f.key.clone())
            .collect();

        let key = (domain.clone(), keys.clone(), options.calculate_if_missing);
        self.cache
            .try_get_with(key, self.build_matrix(keys, domain, options))
            .await
            .map_err(|e| (*e).clone())
    }

    async fn build_matrix(
        &self,
        keys: Vec<String>,
        domain: &Domain,
        options: MatrixOptions,
    ) -> EngineResult<Arc<CorrelationMatrix>> {
        let n = keys.len();
        let pairs = pair_indices(n);

        // Per-pair lookups run concurrently; all complete before repair.
        let lookups = pairs
            .iter()
            .map(|&(i, j)| self.resolve_edge(&keys[i], &keys[j], domain, options));
        let edges = join_all(lookups)
            .await
            .into_iter()
            .collect::<EngineResult<Vec<_>>>()?;

        let mut raw = identity(n);
        for (&(i, j), edge) in pairs.iter().zip(&edges) {
            raw[i][j] = edge.coefficient;
            raw[j][i] = edge.coefficient;
        }
        let (matrix, annealed) = self.repair_matrix(&raw);

        let native = edges.iter().filter(|e| self.is_native(e)).count();
        let data_quality = if pairs.is_empty() {
            1.0
        } else {
            native as f64 / pairs.len() as f64
        };
        let lowest_method = edges.iter().map(|e| e.method).max();

        debug!(
            "Correlation matrix for {} factor(s) in {}: quality={:.2}, method={:?}",
            n, domain, data_quality, lowest_method
        );

        Ok(Arc::new(CorrelationMatrix {
            factors: keys,
            matrix,
            data_quality,
            dimensions: n,
            edges,
            lowest_method,
            annealed,
        }))
    }

    /// Statistical edge with strictly more samples than the threshold.
    fn is_native(&self, edge: &CorrelationEdge) -> bool {
        edge.method == EdgeMethod::Statistical && edge.sample_size > self.config.min_sample_size as u64
    }

    /// Baseline repair, plus annealing when the result is not positive
    /// semi-definite.
    fn repair_matrix(&self, raw: &Matrix) -> (Matrix, bool) {
        let baseline = optimizer::repair(raw);
        let deficit = optimizer::indefiniteness(&baseline);
        if deficit <= self.config.psd_tolerance {
            return (baseline, false);
        }
        let result = self.optimizer.optimize(&baseline, Some(&baseline));
        info!(
            "Indefinite correlation matrix (deficit {:.4}) repaired: energy={:.4}, iterations={}, converged={}",
            deficit, result.energy, result.iterations, result.converged
        );
        debug_assert!(optimizer::validate(&result.matrix).is_ok());
        (result.matrix, true)
    }

    /// Current edge for a pair, or an estimated / transferred / default one.
    async fn resolve_edge(
        &self,
        a: &str,
        b: &str,
        domain: &Domain,
        options: MatrixOptions,
    ) -> EngineResult<CorrelationEdge> {
        if let Some(mut edge) = self.store.get_edge(a, b, domain).await? {
            edge.sanitize();
            return Ok(edge);
        }
        if !options.calculate_if_missing {
            return Ok(CorrelationEdge::independent(a, b, domain.clone(), EdgeMethod::Default));
        }
        Ok(self.calculate_missing_edge(a, b, domain).await)
    }

    /// Statistical estimate, else transfer learning, else independence.
    /// Never fails: degradations are recorded in the edge method.
    async fn calculate_missing_edge(&self, a: &str, b: &str, domain: &Domain) -> CorrelationEdge {
        let mut degraded = false;

        match timeout(self.config.estimation_timeout, self.estimate_edge(a, b, domain)).await {
            Ok(Ok(edge)) => return self.persist(edge).await,
            Ok(Err(EngineError::InsufficientData { required, actual })) => {
                debug!(
                    "Insufficient native data for {} ~ {} in {} ({}/{}), trying transfer",
                    a, b, domain, actual, required
                );
            }
            Ok(Err(e)) => {
                warn!("Statistical estimation failed for {} ~ {} in {}: {}", a, b, domain, e);
                degraded = true;
            }
            Err(_) => {
                warn!("{} for {} ~ {} in {}", EngineError::Timeout("statistical estimation"), a, b, domain);
                degraded = true;
            }
        }

        match timeout(self.config.transfer_timeout, self.transfer_edge(a, b, domain)).await {
            Ok(Ok(edge)) => return self.persist(edge).await,
            Ok(Err(EngineError::TransferUnavailable { .. })) => {
                debug!("No transfer source for {} ~ {} in {}", a, b, domain);
            }
            Ok(Err(e)) => {
                warn!("Transfer learning failed for {} ~ {} in {}: {}", a, b, domain, e);
                degraded = true;
            }
            Err(_) => {
                warn!("{} for {} ~ {} in {}", EngineError::Timeout("transfer learning"), a, b, domain);
                degraded = true;
            }
        }

        let method = if degraded {
            EdgeMethod::Fallback
        } else {
            EdgeMethod::Default
        };
        CorrelationEdge::independent(a, b, domain.clone(), method)
    }

    /// Store an edge; on failure the computed edge is still used.
    async fn persist(&self, edge: CorrelationEdge) -> CorrelationEdge {
        match self.store.upsert_edge(&edge).await {
            Ok(stored) => stored,
            Err(e) => {
                warn!(
                    "Failed to persist edge {} ~ {} in {}: {}",
                    edge.factor_a, edge.factor_b, edge.domain, e
                );
                edge
            }
        }
    }

    /// Estimate an edge from historical co-occurrence samples.
    pub async fn estimate_edge(&self, a: &str, b: &str, domain: &Domain) -> EngineResult<CorrelationEdge> {
        let samples = self.observations.co_occurrences(a, b, domain).await?;
        let required = self.config.min_sample_size;
        let insufficient = EngineError::InsufficientData {
            required,
            actual: samples.len(),
        };
        if samples.len() < required {
            return Err(insufficient);
        }
        // A factor that never varies carries no correlation information.
        let coefficient = stats::pearson(&samples).ok_or(insufficient)?;

        let n = samples.len() as u64;
        let mut edge = CorrelationEdge::new(a, b, domain.clone(), coefficient, EdgeMethod::Statistical);
        edge.sample_size = n;
        edge.confidence = stats::sample_confidence(n, required);
        edge.interval = self.confidence_interval(coefficient, n as f64);
        edge.non_linearity = stats::non_linearity_score(&samples);
        edge.sanitize();
        debug_assert!(edge.interval.contains(edge.coefficient));
        Ok(edge)
    }

    async fn transfer_edge(&self, a: &str, b: &str, domain: &Domain) -> EngineResult<CorrelationEdge> {
        let sources = self.transfer.find_transfer_sources(a, b, domain).await?;
        let estimate = self.transfer.calculate_transfer_correlation(
            a,
            b,
            domain,
            &sources,
            self.transfer.default_options(),
        )?;
        let mut edge = CorrelationEdge::new(a, b, domain.clone(), estimate.correlation, EdgeMethod::Transfer);
        edge.confidence = estimate.confidence;
        edge.sample_size = estimate.effective_sample_size.round().max(0.0) as u64;
        edge.interval = estimate.interval;
        edge.transfer_sources = estimate.source_domains();
        edge.sanitize();
        Ok(edge)
    }

    /// 95% interval for a coefficient estimated from `sample_size` samples.
    pub fn confidence_interval(&self, coefficient: f64, sample_size: f64) -> ConfidenceInterval {
        stats::fisher_interval(coefficient, sample_size)
            .unwrap_or_else(|| stats::fixed_interval(coefficient, FALLBACK_INTERVAL_HALF_WIDTH))
    }

    // ── Joint probability ────────────────────────────────────────────────────

    /// Probability that every factor holds, accounting for their
    /// correlation. Only invalid input fails; sparse data or an unreachable
    /// store degrade the method and confidence instead.
    pub async fn calculate_multi_factor_probability(
        &self,
        predictions: &[FactorPrediction],
        domain: &Domain,
    ) -> EngineResult<JointProbability> {
        validate_predictions(predictions)?;

        if predictions.len() == 1 {
            let p = &predictions[0];
            return Ok(JointProbability {
                joint_probability: p.probability,
                joint_confidence: p.confidence,
                calculation_method: "single_factor".to_string(),
                insights: Vec::new(),
                data_quality: 1.0,
                transfer_sources: Vec::new(),
            });
        }

        let factors: Vec<Factor> = predictions
            .iter()
            .map(|p| Factor::new(&p.factor, domain.clone()))
            .collect();
        let options = MatrixOptions {
            calculate_if_missing: true,
        };
        let matrix = match self.get_correlation_matrix(&factors, domain, options).await {
            Ok(m) => m,
            Err(e) => {
                warn!(
                    "Correlation matrix unavailable for {} factor(s) in {}, assuming independence: {}",
                    factors.len(),
                    domain,
                    e
                );
                Arc::new(CorrelationMatrix::fallback(
                    factors.iter().map(|f| f.key.clone()).collect(),
                    domain,
                ))
            }
        };

        let probabilities: Vec<f64> = predictions.iter().map(|p| p.probability).collect();
        let joint = joint_probability(&probabilities, &matrix.matrix);

        Ok(JointProbability {
            joint_probability: joint,
            joint_confidence: self.joint_confidence(predictions, &matrix),
            calculation_method: matrix.calculation_method().to_string(),
            insights: self.insights(&matrix),
            data_quality: matrix.data_quality,
            transfer_sources: matrix.transfer_sources(),
        })
    }

    /// Confidence-weighted average of per-factor confidences, scaled down by
    /// the share of pairs resting on default/fallback edges. A factor's
    /// weight grows with the number of native edges it takes part in.
    fn joint_confidence(&self, predictions: &[FactorPrediction], matrix: &CorrelationMatrix) -> f64 {
        let n = predictions.len();
        let pairs = pair_indices(n);
        let mut weights = vec![1.0; n];
        let mut low_quality = 0usize;
        for (&(i, j), edge) in pairs.iter().zip(&matrix.edges) {
            if self.is_native(edge) {
                weights[i] += 1.0;
                weights[j] += 1.0;
            }
            if edge.method.is_low_quality() {
                low_quality += 1;
            }
        }
        let total: f64 = weights.iter().sum();
        let weighted = predictions
            .iter()
            .zip(&weights)
            .map(|(p, w)| p.confidence * w)
            .sum::<f64>()
            / total;
        let low_fraction = if pairs.is_empty() {
            0.0
        } else {
            low_quality as f64 / pairs.len() as f64
        };
        (weighted * (1.0 - self.config.low_quality_confidence_penalty * low_fraction)).clamp(0.0, 1.0)
    }

    fn insights(&self, matrix: &CorrelationMatrix) -> Vec<Insight> {
        let pairs = pair_indices(matrix.dimensions);
        let mut insights: Vec<Insight> = pairs
            .iter()
            .zip(&matrix.edges)
            .filter_map(|(&(i, j), edge)| {
                let rho = matrix.matrix[i][j];
                if rho.abs() <= self.config.significance_threshold
                    || edge.confidence < self.config.min_insight_confidence
                {
                    return None;
                }
                let a = &matrix.factors[i];
                let b = &matrix.factors[j];
                let strength = if rho.abs() >= 0.7 { "Strong" } else { "Moderate" };
                let note = if rho > 0.0 {
                    format!(
                        "{} positive correlation ({:+.2}): {} and {} tend to hold together",
                        strength, rho, a, b
                    )
                } else {
                    format!(
                        "{} negative correlation ({:+.2}): {} holding makes {} less likely",
                        strength, rho, a, b
                    )
                };
                Some(Insight {
                    factor_a: a.clone(),
                    factor_b: b.clone(),
                    correlation: rho,
                    confidence: edge.confidence,
                    note,
                })
            })
            .collect();
        insights.sort_by(|x, y| {
            y.correlation
                .abs()
                .partial_cmp(&x.correlation.abs())
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        insights.truncate(self.config.max_insights);
        insights
    }
}

fn validate_predictions(predictions: &[FactorPrediction]) -> EngineResult<()> {
    if predictions.is_empty() {
        return Err(EngineError::InvalidInput("at least one factor is required".into()));
    }
    let mut seen = HashSet::new();
    for p in predictions {
        if p.factor.trim().is_empty() {
            return Err(EngineError::InvalidInput("factor key is empty".into()));
        }
        if !seen.insert(p.factor.trim()) {
            return Err(EngineError::InvalidInput(format!("duplicate factor '{}'", p.factor)));
        }
        if !(0.0..=1.0).contains(&p.probability) {
            return Err(EngineError::InvalidInput(format!(
                "probability for '{}' must be in [0, 1], got {}",
                p.factor, p.probability
            )));
        }
        if !(0.0..=1.0).contains(&p.confidence) {
            return Err(EngineError::InvalidInput(format!(
                "confidence for '{}' must be in [0, 1], got {}",
                p.factor, p.confidence
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TransferConfig;
    use crate::db::models::{ConfidenceAdjustment, DomainAffinity, Observation, Outcome, Prediction};
    use crate::db::{Database, PredictionFilter, ResolveStatus};
    use approx::assert_relative_eq;
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn nba() -> Domain {
        Domain::new("basketball", "nba")
    }
    fn wnba() -> Domain {
        Domain::new("basketball", "wnba")
    }

    fn engine_with(db: &Database, config: CorrelationConfig) -> CorrelationEngine {
        let store: Arc<dyn CorrelationStore> = Arc::new(db.clone());
        let transfer = Arc::new(TransferLearningAdapter::new(
            store.clone(),
            vec![nba(), wnba()],
            TransferConfig::default(),
        ));
        CorrelationEngine::new(
            store,
            Arc::new(db.clone()),
            transfer,
            config,
            OptimizerConfig::default(),
        )
    }

    fn engine(db: &Database) -> CorrelationEngine {
        engine_with(db, CorrelationConfig::default())
    }

    fn stored_edge(db: &Database, a: &str, b: &str, domain: Domain, coef: f64, n: u64) {
        let mut edge = CorrelationEdge::new(a, b, domain, coef, EdgeMethod::Statistical);
        edge.sample_size = n;
        edge.confidence = 0.9;
        db.upsert_edge(&edge).unwrap();
    }

    fn prediction(factor: &str, p: f64, c: f64) -> FactorPrediction {
        FactorPrediction {
            factor: factor.into(),
            probability: p,
            confidence: c,
        }
    }

    fn factors(keys: &[&str]) -> Vec<Factor> {
        keys.iter().map(|k| Factor::new(k, nba())).collect()
    }

    #[tokio::test]
    async fn single_factor_passes_through() {
        let db = Database::open(":memory:").unwrap();
        let result = engine(&db)
            .calculate_multi_factor_probability(&[prediction("lakers_win", 0.62, 0.8)], &nba())
            .await
            .unwrap();
        assert_eq!(result.joint_probability, 0.62);
        assert_eq!(result.calculation_method, "single_factor");
    }

    #[tokio::test]
    async fn independent_pair_gives_product() {
        let db = Database::open(":memory:").unwrap();
        stored_edge(&db, "lakers_win", "lebron_points_25_plus", nba(), 0.0, 200);
        let result = engine(&db)
            .calculate_multi_factor_probability(
                &[
                    prediction("lakers_win", 0.6, 0.8),
                    prediction("lebron_points_25_plus", 0.5, 0.7),
                ],
                &nba(),
            )
            .await
            .unwrap();
        assert_relative_eq!(result.joint_probability, 0.30, epsilon = 1e-9);
        assert_eq!(result.calculation_method, "statistical");
        assert_relative_eq!(result.data_quality, 1.0, epsilon = 1e-12);
        assert!(result.insights.is_empty());
    }

    #[tokio::test]
    async fn correlated_pair_exceeds_independence_within_min_marginal() {
        let db = Database::open(":memory:").unwrap();
        stored_edge(&db, "lakers_win", "lebron_points_25_plus", nba(), 0.9, 200);
        let result = engine(&db)
            .calculate_multi_factor_probability(
                &[
                    prediction("lakers_win", 0.6, 0.8),
                    prediction("lebron_points_25_plus", 0.5, 0.7),
                ],
                &nba(),
            )
            .await
            .unwrap();
        assert!(result.joint_probability > 0.30);
        assert!(result.joint_probability <= 0.5);
        assert_eq!(result.insights.len(), 1);
        assert!(result.insights[0].note.contains("positive"));
        assert!((0.0..=1.0).contains(&result.joint_confidence));
    }

    #[tokio::test]
    async fn missing_edge_without_calculation_lowers_quality() {
        let db = Database::open(":memory:").unwrap();
        stored_edge(&db, "a_win", "b_points", nba(), 0.3, 100);
        stored_edge(&db, "a_win", "c_rebounds", nba(), 0.2, 100);
        let matrix = engine(&db)
            .get_correlation_matrix(
                &factors(&["a_win", "b_points", "c_rebounds"]),
                &nba(),
                MatrixOptions::default(),
            )
            .await
            .unwrap();
        assert_eq!(matrix.dimensions, 3);
        assert!(matrix.data_quality < 1.0);
        assert_relative_eq!(matrix.data_quality, 2.0 / 3.0, epsilon = 1e-12);
        assert_eq!(matrix.calculation_method(), "default");
        assert_eq!(matrix.matrix[1][2], 0.0);
        optimizer::validate(&matrix.matrix).unwrap();
    }

    #[tokio::test]
    async fn repeated_lookups_are_bit_identical() {
        let db = Database::open(":memory:").unwrap();
        stored_edge(&db, "a_win", "b_points", nba(), 0.9, 100);
        stored_edge(&db, "a_win", "c_rebounds", nba(), 0.9, 100);
        stored_edge(&db, "b_points", "c_rebounds", nba(), -0.9, 100);
        let engine = engine(&db);
        let fs = factors(&["a_win", "b_points", "c_rebounds"]);
        let first = engine
            .get_correlation_matrix(&fs, &nba(), MatrixOptions::default())
            .await
            .unwrap();
        engine.invalidate_cache();
        let second = engine
            .get_correlation_matrix(&fs, &nba(), MatrixOptions::default())
            .await
            .unwrap();
        assert!(first.annealed);
        assert_eq!(first.matrix, second.matrix);
        optimizer::validate(&first.matrix).unwrap();
        let raw = vec![
            vec![1.0, 0.9, 0.9],
            vec![0.9, 1.0, -0.9],
            vec![0.9, -0.9, 1.0],
        ];
        assert!(optimizer::indefiniteness(&first.matrix) < optimizer::indefiniteness(&raw));
    }

    #[tokio::test]
    async fn estimates_missing_edge_from_observations() {
        let db = Database::open(":memory:").unwrap();
        for i in 0..40 {
            let a = (i % 2) as f64;
            let b = if i % 5 == 0 { 1.0 - a } else { a };
            for (factor, value) in [("a_win", a), ("b_points", b)] {
                db.insert_observation(&Observation {
                    event_id: format!("g{}", i),
                    factor: factor.into(),
                    domain: nba(),
                    value,
                    observed_at: Utc::now(),
                })
                .unwrap();
            }
        }
        let engine = engine(&db);
        let matrix = engine
            .get_correlation_matrix(
                &factors(&["a_win", "b_points"]),
                &nba(),
                MatrixOptions {
                    calculate_if_missing: true,
                },
            )
            .await
            .unwrap();
        assert_eq!(matrix.calculation_method(), "statistical");
        assert!(matrix.matrix[0][1] > 0.4);
        assert_relative_eq!(matrix.data_quality, 1.0, epsilon = 1e-12);

        let stored = db.get_edge("a_win", "b_points", &nba()).unwrap().unwrap();
        assert_eq!(stored.sample_size, 40);
        assert!(stored.interval.contains(stored.coefficient));
    }

    #[tokio::test]
    async fn sparse_domain_borrows_from_transfer_source() {
        let db = Database::open(":memory:").unwrap();
        stored_edge(&db, "lakers_win", "lebron_points_25_plus", nba(), 0.5, 200);
        let engine = engine(&db);
        let result = engine
            .calculate_multi_factor_probability(
                &[
                    prediction("lakers_win", 0.6, 0.8),
                    prediction("lebron_points_25_plus", 0.5, 0.8),
                ],
                &wnba(),
            )
            .await
            .unwrap();
        assert_eq!(result.calculation_method, "transfer_learning");
        assert_eq!(result.transfer_sources, vec![nba()]);
        assert!(result.joint_probability > 0.30);
        assert!(result.data_quality < 1.0);

        let stored = db
            .get_edge("lakers_win", "lebron_points_25_plus", &wnba())
            .unwrap()
            .unwrap();
        assert_eq!(stored.method, EdgeMethod::Transfer);
        assert!(stored.confidence < 0.9);
    }

    #[tokio::test]
    async fn no_data_anywhere_defaults_to_independence() {
        let db = Database::open(":memory:").unwrap();
        db.upsert_domain_affinity(&DomainAffinity {
            source: nba(),
            target: wnba(),
            affinity: 0.1,
            updated_at: Utc::now(),
        })
        .unwrap();
        let result = engine(&db)
            .calculate_multi_factor_probability(
                &[prediction("x_win", 0.6, 0.8), prediction("y_points", 0.5, 0.8)],
                &wnba(),
            )
            .await
            .unwrap();
        assert_eq!(result.calculation_method, "default");
        assert_relative_eq!(result.joint_probability, 0.30, epsilon = 1e-9);
        // One low-quality pair out of one: confidence halved.
        assert_relative_eq!(result.joint_confidence, 0.4, epsilon = 1e-9);
    }

    struct SlowObservations;

    #[async_trait]
    impl ObservationSource for SlowObservations {
        async fn co_occurrences(&self, _a: &str, _b: &str, _d: &Domain) -> EngineResult<Vec<(f64, f64)>> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(vec![])
        }
    }

    #[tokio::test]
    async fn estimation_timeout_degrades_to_fallback() {
        let db = Database::open(":memory:").unwrap();
        let store: Arc<dyn CorrelationStore> = Arc::new(db.clone());
        let transfer = Arc::new(TransferLearningAdapter::new(
            store.clone(),
            vec![nba(), wnba()],
            TransferConfig::default(),
        ));
        let config = CorrelationConfig {
            estimation_timeout: Duration::from_millis(20),
            ..CorrelationConfig::default()
        };
        let engine = CorrelationEngine::new(
            store,
            Arc::new(SlowObservations),
            transfer,
            config,
            OptimizerConfig::default(),
        );
        let result = engine
            .calculate_multi_factor_probability(
                &[prediction("x_win", 0.6, 0.8), prediction("y_points", 0.5, 0.8)],
                &nba(),
            )
            .await
            .unwrap();
        assert_eq!(result.calculation_method, "fallback");
        assert!((0.0..=1.0).contains(&result.joint_probability));
    }

    /// Counts lookups and answers slowly enough for callers to overlap.
    #[derive(Default)]
    struct CountingObservations {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ObservationSource for CountingObservations {
        async fn co_occurrences(&self, _a: &str, _b: &str, _d: &Domain) -> EngineResult<Vec<(f64, f64)>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(50)).await;
            Ok(vec![])
        }
    }

    #[tokio::test]
    async fn concurrent_identical_requests_share_one_build() {
        let db = Database::open(":memory:").unwrap();
        let store: Arc<dyn CorrelationStore> = Arc::new(db.clone());
        let transfer = Arc::new(TransferLearningAdapter::new(
            store.clone(),
            vec![nba(), wnba()],
            TransferConfig::default(),
        ));
        let observations = Arc::new(CountingObservations::default());
        let engine = CorrelationEngine::new(
            store,
            observations.clone(),
            transfer,
            CorrelationConfig::default(),
            OptimizerConfig::default(),
        );
        let fs = factors(&["lakers_win", "lebron_points_25_plus"]);
        let options = MatrixOptions {
            calculate_if_missing: true,
        };

        let domain = nba();
        let (first, second) = tokio::join!(
            engine.get_correlation_matrix(&fs, &domain, options),
            engine.get_correlation_matrix(&fs, &domain, options),
        );
        let (first, second) = (first.unwrap(), second.unwrap());
        assert_eq!(observations.calls.load(Ordering::SeqCst), 1);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.calculation_method(), "default");
    }

    /// A store whose every call fails, as if the database were down.
    struct DownStore;

    fn down<T>() -> EngineResult<T> {
        Err(EngineError::StoreUnavailable("connection refused".into()))
    }

    #[async_trait]
    impl CorrelationStore for DownStore {
        async fn get_edge(&self, _a: &str, _b: &str, _d: &Domain) -> EngineResult<Option<CorrelationEdge>> {
            down()
        }
        async fn upsert_edge(&self, _edge: &CorrelationEdge) -> EngineResult<CorrelationEdge> {
            down()
        }
        async fn list_edges(&self, _d: &Domain) -> EngineResult<Vec<CorrelationEdge>> {
            down()
        }
        async fn list_edges_for_factor(&self, _f: &str, _d: &Domain) -> EngineResult<Vec<CorrelationEdge>> {
            down()
        }
        async fn get_domain_affinity(&self, _s: &Domain, _t: &Domain) -> EngineResult<Option<f64>> {
            down()
        }
        async fn upsert_domain_affinity(&self, _a: &DomainAffinity) -> EngineResult<()> {
            down()
        }
        async fn insert_prediction(&self, _p: &Prediction) -> EngineResult<()> {
            down()
        }
        async fn get_prediction(&self, _id: &str) -> EngineResult<Option<Prediction>> {
            down()
        }
        async fn resolve_prediction(
            &self,
            _id: &str,
            _outcome: Outcome,
            _details: Option<&str>,
            _at: DateTime<Utc>,
        ) -> EngineResult<ResolveStatus> {
            down()
        }
        async fn list_resolved_predictions(&self, _f: &PredictionFilter) -> EngineResult<Vec<Prediction>> {
            down()
        }
        async fn claim_affinity_outcomes(&self, _ids: &[String]) -> EngineResult<Vec<String>> {
            down()
        }
        async fn list_resolved_models(&self) -> EngineResult<Vec<(Domain, String)>> {
            down()
        }
        async fn get_confidence_adjustment(
            &self,
            _d: &Domain,
            _model: &str,
        ) -> EngineResult<Option<ConfidenceAdjustment>> {
            down()
        }
        async fn upsert_confidence_adjustment(&self, _a: &ConfidenceAdjustment) -> EngineResult<()> {
            down()
        }
    }

    #[tokio::test]
    async fn unreachable_store_assumes_independence() {
        let store: Arc<dyn CorrelationStore> = Arc::new(DownStore);
        let transfer = Arc::new(TransferLearningAdapter::new(
            store.clone(),
            vec![nba(), wnba()],
            TransferConfig::default(),
        ));
        let engine = CorrelationEngine::new(
            store,
            Arc::new(CountingObservations::default()),
            transfer,
            CorrelationConfig::default(),
            OptimizerConfig::default(),
        );

        let fs = factors(&["lakers_win", "lebron_points_25_plus"]);
        let matrix = engine
            .get_correlation_matrix(&fs, &nba(), MatrixOptions::default())
            .await;
        assert!(matches!(matrix, Err(EngineError::StoreUnavailable(_))));

        let result = engine
            .calculate_multi_factor_probability(
                &[
                    prediction("lakers_win", 0.6, 0.8),
                    prediction("lebron_points_25_plus", 0.5, 0.7),
                ],
                &nba(),
            )
            .await
            .unwrap();
        assert_eq!(result.calculation_method, "fallback");
        assert_relative_eq!(result.joint_probability, 0.6 * 0.5, epsilon = 1e-9);
        assert_eq!(result.data_quality, 0.0);
        assert!(result.insights.is_empty());
        // Plain mean of 0.75, halved because every pair fell back.
        assert_relative_eq!(result.joint_confidence, 0.375, epsilon = 1e-9);
        assert!(result.joint_confidence < 0.7);
    }

    #[tokio::test]
    async fn data_quality_counts_edges_above_sample_threshold() {
        let db = Database::open(":memory:").unwrap();
        stored_edge(&db, "a_win", "b_points", nba(), 0.2, 20);
        stored_edge(&db, "a_win", "c_rebounds", nba(), 0.2, 21);
        stored_edge(&db, "b_points", "c_rebounds", nba(), 0.2, 21);
        let engine = engine(&db);

        let at_threshold = engine
            .get_correlation_matrix(&factors(&["a_win", "b_points"]), &nba(), MatrixOptions::default())
            .await
            .unwrap();
        assert_eq!(at_threshold.data_quality, 0.0);

        let all = engine
            .get_correlation_matrix(
                &factors(&["a_win", "b_points", "c_rebounds"]),
                &nba(),
                MatrixOptions::default(),
            )
            .await
            .unwrap();
        assert_relative_eq!(all.data_quality, 2.0 / 3.0, epsilon = 1e-12);
    }

    #[tokio::test]
    async fn insights_are_sorted_and_capped() {
        let db = Database::open(":memory:").unwrap();
        let keys = ["a_win", "b_points", "c_rebounds", "d_assists"];
        let coefs = [0.5, 0.45, -0.6, 0.42, -0.41, -0.3];
        let mut k = 0;
        for i in 0..keys.len() {
            for j in (i + 1)..keys.len() {
                stored_edge(&db, keys[i], keys[j], nba(), coefs[k], 100);
                k += 1;
            }
        }
        let config = CorrelationConfig {
            max_insights: 3,
            ..CorrelationConfig::default()
        };
        let engine = engine_with(&db, config);
        let preds: Vec<FactorPrediction> = keys.iter().map(|k| prediction(k, 0.5, 0.8)).collect();
        let result = engine.calculate_multi_factor_probability(&preds, &nba()).await.unwrap();
        assert_eq!(result.insights.len(), 3);
        let mags: Vec<f64> = result.insights.iter().map(|i| i.correlation.abs()).collect();
        assert!(mags.windows(2).all(|w| w[0] >= w[1]));
        assert!(result.insights[0].note.contains("negative"));
    }

    #[tokio::test]
    async fn rejects_invalid_predictions() {
        let db = Database::open(":memory:").unwrap();
        let engine = engine(&db);
        assert!(engine.calculate_multi_factor_probability(&[], &nba()).await.is_err());
        let out_of_range = [prediction("a", 1.2, 0.5), prediction("b", 0.5, 0.5)];
        assert!(matches!(
            engine.calculate_multi_factor_probability(&out_of_range, &nba()).await,
            Err(EngineError::InvalidInput(_))
        ));
        let duplicate = [prediction("a", 0.2, 0.5), prediction("a", 0.5, 0.5)];
        assert!(engine.calculate_multi_factor_probability(&duplicate, &nba()).await.is_err());
    }

    #[test]
    fn confidence_interval_brackets_point() {
        let db = Database::open(":memory:").unwrap();
        let engine = engine(&db);
        for &(r, n) in &[(0.4, 2.0), (0.4, 50.0), (-0.95, 10.0)] {
            let ci = engine.confidence_interval(r, n);
            assert!(ci.lower <= r && r <= ci.upper);
        }
    }
}
