use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::models::*;
use super::Database;
use crate::error::{EngineError, EngineResult};

/// Outcome of a conditional prediction close.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolveStatus {
    Resolved,
    NotFound,
    AlreadyResolved,
}

/// Selects resolved predictions for accuracy and calibration queries.
#[derive(Debug, Clone, Default)]
pub struct PredictionFilter {
    pub domain: Option<Domain>,
    pub model: Option<String>,
    /// Only predictions resolved at or after this instant
    pub since: Option<DateTime<Utc>>,
    /// Most recent N predictions only
    pub limit: Option<usize>,
}

/// Persistent storage for correlation edges, domain affinities, predictions
/// and confidence adjustments.
///
/// Implementations must tolerate concurrent readers and writers; edge writes
/// are upserts keyed by (factor_a, factor_b, domain).
#[async_trait]
pub trait CorrelationStore: Send + Sync {
    async fn get_edge(&self, a: &str, b: &str, domain: &Domain) -> EngineResult<Option<CorrelationEdge>>;

    /// Returns the stored edge with its new version.
    async fn upsert_edge(&self, edge: &CorrelationEdge) -> EngineResult<CorrelationEdge>;

    async fn list_edges(&self, domain: &Domain) -> EngineResult<Vec<CorrelationEdge>>;

    async fn list_edges_for_factor(&self, factor: &str, domain: &Domain) -> EngineResult<Vec<CorrelationEdge>>;

    async fn get_domain_affinity(&self, source: &Domain, target: &Domain) -> EngineResult<Option<f64>>;

    async fn upsert_domain_affinity(&self, affinity: &DomainAffinity) -> EngineResult<()>;

    async fn insert_prediction(&self, prediction: &Prediction) -> EngineResult<()>;

    async fn get_prediction(&self, tracking_id: &str) -> EngineResult<Option<Prediction>>;

    async fn resolve_prediction(
        &self,
        tracking_id: &str,
        outcome: Outcome,
        details: Option<&str>,
        at: DateTime<Utc>,
    ) -> EngineResult<ResolveStatus>;

    async fn list_resolved_predictions(&self, filter: &PredictionFilter) -> EngineResult<Vec<Prediction>>;

    /// Atomically flag resolved predictions as applied to the domain
    /// affinities, returning only the ids newly flagged by this call.
    async fn claim_affinity_outcomes(&self, tracking_ids: &[String]) -> EngineResult<Vec<String>>;

    async fn list_resolved_models(&self) -> EngineResult<Vec<(Domain, String)>>;

    async fn get_confidence_adjustment(
        &self,
        domain: &Domain,
        model: &str,
    ) -> EngineResult<Option<ConfidenceAdjustment>>;

    async fn upsert_confidence_adjustment(&self, adjustment: &ConfidenceAdjustment) -> EngineResult<()>;
}

/// Supplier of historical co-occurrence samples for statistical estimation.
#[async_trait]
pub trait ObservationSource: Send + Sync {
    /// Paired (value_a, value_b) samples from events where both factors were observed.
    async fn co_occurrences(&self, a: &str, b: &str, domain: &Domain) -> EngineResult<Vec<(f64, f64)>>;
}

#[async_trait]
impl CorrelationStore for Database {
    async fn get_edge(&self, a: &str, b: &str, domain: &Domain) -> EngineResult<Option<CorrelationEdge>> {
        Database::get_edge(self, a, b, domain).map_err(EngineError::store)
    }

    async fn upsert_edge(&self, edge: &CorrelationEdge) -> EngineResult<CorrelationEdge> {
        Database::upsert_edge(self, edge).map_err(EngineError::store)
    }

    async fn list_edges(&self, domain: &Domain) -> EngineResult<Vec<CorrelationEdge>> {
        Database::list_edges(self, domain).map_err(EngineError::store)
    }

    async fn list_edges_for_factor(&self, factor: &str, domain: &Domain) -> EngineResult<Vec<CorrelationEdge>> {
        Database::list_edges_for_factor(self, factor, domain).map_err(EngineError::store)
    }

    async fn get_domain_affinity(&self, source: &Domain, target: &Domain) -> EngineResult<Option<f64>> {
        Database::get_domain_affinity(self, source, target).map_err(EngineError::store)
    }

    async fn upsert_domain_affinity(&self, affinity: &DomainAffinity) -> EngineResult<()> {
        Database::upsert_domain_affinity(self, affinity).map_err(EngineError::store)
    }

    async fn insert_prediction(&self, prediction: &Prediction) -> EngineResult<()> {
        Database::insert_prediction(self, prediction).map_err(EngineError::store)
    }

    async fn get_prediction(&self, tracking_id: &str) -> EngineResult<Option<Prediction>> {
        Database::get_prediction(self, tracking_id).map_err(EngineError::store)
    }

    async fn resolve_prediction(
        &self,
        tracking_id: &str,
        outcome: Outcome,
        details: Option<&str>,
        at: DateTime<Utc>,
    ) -> EngineResult<ResolveStatus> {
        Database::resolve_prediction(self, tracking_id, outcome, details, at).map_err(EngineError::store)
    }

    async fn list_resolved_predictions(&self, filter: &PredictionFilter) -> EngineResult<Vec<Prediction>> {
        Database::list_resolved_predictions(self, filter).map_err(EngineError::store)
    }

    async fn claim_affinity_outcomes(&self, tracking_ids: &[String]) -> EngineResult<Vec<String>> {
        Database::claim_affinity_outcomes(self, tracking_ids).map_err(EngineError::store)
    }

    async fn list_resolved_models(&self) -> EngineResult<Vec<(Domain, String)>> {
        Database::list_resolved_models(self).map_err(EngineError::store)
    }

    async fn get_confidence_adjustment(
        &self,
        domain: &Domain,
        model: &str,
    ) -> EngineResult<Option<ConfidenceAdjustment>> {
        Database::get_confidence_adjustment(self, domain, model).map_err(EngineError::store)
    }

    async fn upsert_confidence_adjustment(&self, adjustment: &ConfidenceAdjustment) -> EngineResult<()> {
        Database::upsert_confidence_adjustment(self, adjustment).map_err(EngineError::store)
    }
}

#[async_trait]
impl ObservationSource for Database {
    async fn co_occurrences(&self, a: &str, b: &str, domain: &Domain) -> EngineResult<Vec<(f64, f64)>> {
        Database::co_occurrences(self, a, b, domain).map_err(EngineError::store)
    }
}
