use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};
use uuid::Uuid;

use super::metrics::{brier_score, confidence_calibration, log_loss, reliability_buckets, ReliabilityBucket};
use crate::config::CalibrationConfig;
use crate::db::models::{ConfidenceAdjustment, Domain, Outcome, Prediction};
use crate::db::{CorrelationStore, PredictionFilter, ResolveStatus};
use crate::engine::{JointProbability, TransferLearningAdapter, TransferOutcome};
use crate::error::{EngineError, EngineResult};

/// Brier score of always predicting 0.5, used when a domain has no
/// non-transfer predictions to compare against.
const UNINFORMED_BRIER: f64 = 0.25;

/// A prediction to start tracking.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PredictionRequest {
    pub factors: Vec<String>,
    pub domain: Domain,
    pub model: String,
    pub probability: f64,
    /// Raw confidence before the stored adjustment is applied
    pub confidence: f64,
    pub calculation_method: String,
    #[serde(default)]
    pub transfer_sources: Vec<Domain>,
}

impl PredictionRequest {
    pub fn from_joint(factors: Vec<String>, domain: Domain, model: &str, joint: &JointProbability) -> Self {
        PredictionRequest {
            factors,
            domain,
            model: model.to_string(),
            probability: joint.joint_probability,
            confidence: joint.joint_confidence,
            calculation_method: joint.calculation_method.clone(),
            transfer_sources: joint.transfer_sources.clone(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct AccuracyFilter {
    pub domain: Option<Domain>,
    pub model: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AccuracyMetric {
    /// Fraction of resolved predictions that were correct
    pub accuracy: f64,
    pub total_predictions: usize,
    pub confidence_calibration: f64,
    pub brier_score: f64,
    pub log_loss: f64,
    pub buckets: Vec<ReliabilityBucket>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CalibrationSummary {
    pub models_calibrated: usize,
    /// Mean adjustment factor promoted in this run (1.0 when none)
    pub avg_adjustment: f64,
    pub total_predictions_analyzed: usize,
    pub duration_seconds: f64,
    pub affinities_updated: usize,
}

/// Owns the prediction lifecycle: track, resolve, score and recalibrate.
pub struct AccuracyTracker {
    store: Arc<dyn CorrelationStore>,
    transfer: Arc<TransferLearningAdapter>,
    config: CalibrationConfig,
}

impl AccuracyTracker {
    pub fn new(store: Arc<dyn CorrelationStore>, transfer: Arc<TransferLearningAdapter>, config: CalibrationConfig) -> Self {
        AccuracyTracker {
            store,
            transfer,
            config,
        }
    }

    /// Persist a pending prediction with the current confidence adjustment
    /// for its domain/model applied.
    pub async fn track_prediction(&self, request: PredictionRequest) -> EngineResult<Prediction> {
        if request.factors.is_empty() {
            return Err(EngineError::InvalidInput("a prediction needs at least one factor".into()));
        }
        if !(0.0..=1.0).contains(&request.probability) || !(0.0..=1.0).contains(&request.confidence) {
            return Err(EngineError::InvalidInput(format!(
                "probability and confidence must be in [0, 1], got {} / {}",
                request.probability, request.confidence
            )));
        }

        let factor = self
            .store
            .get_confidence_adjustment(&request.domain, &request.model)
            .await?
            .map(|adj| adj.factor)
            .unwrap_or(1.0);

        let prediction = Prediction {
            tracking_id: Uuid::new_v4().to_string(),
            factors: request.factors,
            domain: request.domain,
            model: request.model,
            probability: request.probability,
            raw_confidence: request.confidence,
            confidence: (request.confidence * factor).clamp(0.0, 1.0),
            calculation_method: request.calculation_method,
            transfer_sources: request.transfer_sources,
            created_at: Utc::now(),
            outcome: Outcome::Pending,
            outcome_at: None,
            details: None,
            affinity_applied: false,
        };
        self.store.insert_prediction(&prediction).await?;
        debug!(
            "Tracking prediction {} ({} / {}): p={:.3}, confidence {:.3} -> {:.3}",
            prediction.tracking_id,
            prediction.domain,
            prediction.model,
            prediction.probability,
            prediction.raw_confidence,
            prediction.confidence
        );
        Ok(prediction)
    }

    /// Close a pending prediction. Fails if the id is unknown or the
    /// prediction was already resolved.
    pub async fn record_outcome(
        &self,
        tracking_id: &str,
        correct: bool,
        details: Option<&str>,
    ) -> EngineResult<Prediction> {
        let outcome = Outcome::from_result(correct);
        match self
            .store
            .resolve_prediction(tracking_id, outcome, details, Utc::now())
            .await?
        {
            ResolveStatus::NotFound => return Err(EngineError::NotFound(tracking_id.to_string())),
            ResolveStatus::AlreadyResolved => {
                return Err(EngineError::AlreadyResolved(tracking_id.to_string()))
            }
            ResolveStatus::Resolved => {}
        }
        info!("Prediction {} resolved as {}", tracking_id, outcome.as_str());
        self.store
            .get_prediction(tracking_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(tracking_id.to_string()))
    }

    pub async fn calculate_accuracy(&self, filter: &AccuracyFilter) -> EngineResult<AccuracyMetric> {
        let predictions = self
            .store
            .list_resolved_predictions(&PredictionFilter {
                domain: filter.domain.clone(),
                model: filter.model.clone(),
                ..PredictionFilter::default()
            })
            .await?;
        Ok(score(&predictions))
    }

    /// Recompute the confidence adjustment of every domain/model over the
    /// recent window, then feed transfer-backed outcomes into the domain
    /// affinities. Each outcome reaches the affinities at most once, however
    /// many runs see it inside the window.
    pub async fn run_full_model_calibration(&self) -> EngineResult<CalibrationSummary> {
        let started = Instant::now();
        let since = Utc::now() - chrono::Duration::days(self.config.window_days);

        let mut adjustments = Vec::new();
        let mut analyzed = 0usize;
        let mut by_domain: BTreeMap<Domain, Vec<Prediction>> = BTreeMap::new();

        for (domain, model) in self.store.list_resolved_models().await? {
            let window = self
                .store
                .list_resolved_predictions(&PredictionFilter {
                    domain: Some(domain.clone()),
                    model: Some(model.clone()),
                    since: Some(since),
                    limit: Some(self.config.window_size),
                })
                .await?;
            analyzed += window.len();

            if window.len() < self.config.min_samples {
                debug!(
                    "Calibration skipped for {} / {}: {} resolved prediction(s), {} required",
                    domain,
                    model,
                    window.len(),
                    self.config.min_samples
                );
            } else {
                let adjustment = self.adjustment_for(&domain, &model, &window);
                self.store.upsert_confidence_adjustment(&adjustment).await?;
                info!(
                    "Calibration promoted for {} / {}: samples={}, accuracy={:.3}, mean_p={:.3}, factor={:.3}",
                    domain,
                    model,
                    adjustment.samples,
                    adjustment.accuracy,
                    adjustment.mean_probability,
                    adjustment.factor
                );
                adjustments.push(adjustment.factor);
            }

            by_domain.entry(domain).or_default().extend(window);
        }

        let unapplied: Vec<String> = by_domain
            .values()
            .flatten()
            .filter(|p| p.is_transfer_backed() && !p.affinity_applied)
            .map(|p| p.tracking_id.clone())
            .collect();
        let claimed: HashSet<String> = if unapplied.is_empty() {
            HashSet::new()
        } else {
            self.store.claim_affinity_outcomes(&unapplied).await?.into_iter().collect()
        };
        let outcomes: Vec<TransferOutcome> = by_domain
            .iter()
            .flat_map(|(domain, predictions)| transfer_outcomes(domain, predictions, &claimed))
            .collect();
        let affinities_updated = if outcomes.is_empty() {
            0
        } else {
            self.transfer.update_domain_affinities(&outcomes).await?.len()
        };

        let avg_adjustment = if adjustments.is_empty() {
            1.0
        } else {
            adjustments.iter().sum::<f64>() / adjustments.len() as f64
        };
        let summary = CalibrationSummary {
            models_calibrated: adjustments.len(),
            avg_adjustment,
            total_predictions_analyzed: analyzed,
            duration_seconds: started.elapsed().as_secs_f64(),
            affinities_updated,
        };
        info!(
            "Calibration run complete: {} model(s), avg adjustment {:.3}, {} prediction(s), {} affinity update(s) in {:.2}s",
            summary.models_calibrated,
            summary.avg_adjustment,
            summary.total_predictions_analyzed,
            summary.affinities_updated,
            summary.duration_seconds
        );
        Ok(summary)
    }

    /// Empirical accuracy over mean predicted probability, clamped.
    fn adjustment_for(&self, domain: &Domain, model: &str, window: &[Prediction]) -> ConfidenceAdjustment {
        let n = window.len() as f64;
        let accuracy = window.iter().map(Prediction::label).sum::<f64>() / n;
        let mean_probability = window.iter().map(|p| p.probability).sum::<f64>() / n;
        let factor = if mean_probability > 0.0 {
            accuracy / mean_probability
        } else {
            self.config.max_adjustment
        };
        ConfidenceAdjustment {
            domain: domain.clone(),
            model: model.to_string(),
            factor: factor.clamp(self.config.min_adjustment, self.config.max_adjustment),
            samples: window.len() as i64,
            accuracy,
            mean_probability,
            calibrated_at: Utc::now(),
        }
    }
}

/// Accuracy, calibration and scoring rules over resolved predictions.
fn score(predictions: &[Prediction]) -> AccuracyMetric {
    let predictions: Vec<&Prediction> = predictions.iter().filter(|p| p.outcome.is_terminal()).collect();
    let by_probability: Vec<(f64, f64)> = predictions.iter().map(|p| (p.probability, p.label())).collect();
    let by_confidence: Vec<(f64, f64)> = predictions.iter().map(|p| (p.confidence, p.label())).collect();
    let buckets = reliability_buckets(&by_confidence);
    let correct = predictions.iter().filter(|p| p.outcome == Outcome::Correct).count();
    AccuracyMetric {
        accuracy: if predictions.is_empty() {
            0.0
        } else {
            correct as f64 / predictions.len() as f64
        },
        total_predictions: predictions.len(),
        confidence_calibration: confidence_calibration(&buckets),
        brier_score: brier_score(&by_probability),
        log_loss: log_loss(&by_probability),
        buckets,
    }
}

/// One outcome per (claimed transfer-backed prediction, source domain).
/// Improvement is measured against the domain's own non-transfer Brier score.
fn transfer_outcomes(domain: &Domain, predictions: &[Prediction], claimed: &HashSet<String>) -> Vec<TransferOutcome> {
    let (borrowed, native): (Vec<&Prediction>, Vec<&Prediction>) =
        predictions.iter().partition(|p| p.is_transfer_backed());
    let borrowed: Vec<&Prediction> = borrowed
        .into_iter()
        .filter(|p| claimed.contains(&p.tracking_id))
        .collect();
    if borrowed.is_empty() {
        return Vec::new();
    }
    let baseline = if native.is_empty() {
        UNINFORMED_BRIER
    } else {
        brier_score(&native.iter().map(|p| (p.probability, p.label())).collect::<Vec<_>>())
    };

    borrowed
        .iter()
        .flat_map(|p| {
            let error = (p.probability - p.label()).abs();
            let improvement = baseline - error * error;
            p.transfer_sources.iter().map(move |source| TransferOutcome {
                source: source.clone(),
                target: domain.clone(),
                transfer_error: error,
                improvement,
            })
        })
        .collect()
}
