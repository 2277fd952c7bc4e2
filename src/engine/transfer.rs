//! Cross-domain transfer of correlation estimates.
//!
//! When a target league lacks native samples for a factor pair, analogous
//! pairs from other configured leagues are blended in. A source domain is
//! ranked by a weighted sum of three similarities:
//!
//! - **type**: the same pair exists (1.0) or a pair with the same factor
//!   types exists (0.75)
//! - **pattern**: how closely the correlation neighbourhoods of the two
//!   pairs agree
//! - **temporal**: overlap of the two sports' season calendars
//!
//! Sources whose learned affinity to the target is too low are skipped. The
//! affinities themselves are nudged by `update_domain_affinities` as
//! prediction outcomes come in.

use chrono::Utc;
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, info};

use super::stats::{fisher_interval, fixed_interval};
use crate::config::TransferConfig;
use crate::db::models::{ConfidenceInterval, CorrelationEdge, Domain, DomainAffinity, EdgeMethod, FactorType};
use crate::db::CorrelationStore;
use crate::error::{EngineError, EngineResult};

/// Type similarity when the source holds an edge for the very same pair.
const EXACT_PAIR_SIMILARITY: f64 = 1.0;
/// Type similarity for a different pair with matching factor types.
const STRUCTURAL_PAIR_SIMILARITY: f64 = 0.75;
/// Pattern similarity when either neighbourhood is empty.
const NEUTRAL_PATTERN_SIMILARITY: f64 = 0.5;

/// A candidate source domain with its analogous edge.
#[derive(Debug, Clone)]
pub struct TransferSource {
    pub domain: Domain,
    pub similarity: f64,
    pub type_similarity: f64,
    pub pattern_similarity: f64,
    pub temporal_similarity: f64,
    /// Learned source → target affinity
    pub affinity: f64,
    /// The source's own estimate for its analogous pair
    pub edge: CorrelationEdge,
}

#[derive(Debug, Clone, Copy)]
pub struct TransferOptions {
    /// Shrinks the blended correlation toward independence (0.0–1.0)
    pub transfer_strength: f64,
}

/// Blended correlation borrowed from other domains.
#[derive(Debug, Clone)]
pub struct TransferEstimate {
    pub correlation: f64,
    pub confidence: f64,
    pub effective_sample_size: f64,
    pub interval: ConfidenceInterval,
    /// Normalised per-source weights (sum to 1.0)
    pub weights: Vec<(Domain, f64)>,
}

impl TransferEstimate {
    pub fn source_domains(&self) -> Vec<Domain> {
        self.weights.iter().map(|(d, _)| d.clone()).collect()
    }
}

/// Observed quality of a past transfer from `source` into `target`.
#[derive(Debug, Clone)]
pub struct TransferOutcome {
    pub source: Domain,
    pub target: Domain,
    /// Mean absolute error of transfer-backed predictions (0.0–1.0)
    pub transfer_error: f64,
    /// Brier-score improvement over the target's native predictions
    pub improvement: f64,
}

// ── Season calendars ─────────────────────────────────────────────────────────

/// Regular-season plus playoff months by (sport, league). League-specific
/// rows come first and win over the sport-wide row.
const SEASONS: &[(&str, Option<&str>, &[u32])] = &[
    ("basketball", Some("wnba"), &[5, 6, 7, 8, 9, 10]),
    ("basketball", None, &[10, 11, 12, 1, 2, 3, 4, 5, 6]),
    ("football", None, &[9, 10, 11, 12, 1, 2]),
    ("american_football", None, &[9, 10, 11, 12, 1, 2]),
    ("soccer", Some("mls"), &[2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12]),
    ("soccer", None, &[8, 9, 10, 11, 12, 1, 2, 3, 4, 5]),
    ("baseball", None, &[3, 4, 5, 6, 7, 8, 9, 10]),
    ("ice_hockey", None, &[10, 11, 12, 1, 2, 3, 4, 5, 6]),
    ("tennis", None, &[1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11]),
];

const ALL_MONTHS: &[u32] = &[1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12];

fn season_months(domain: &Domain) -> &'static [u32] {
    SEASONS
        .iter()
        .find(|(sport, league, _)| {
            *sport == domain.sport && league.map_or(true, |l| l == domain.league)
        })
        .map(|(_, _, months)| *months)
        .unwrap_or(ALL_MONTHS)
}

/// Jaccard overlap of two domains' season months.
pub fn temporal_similarity(a: &Domain, b: &Domain) -> f64 {
    let ma = season_months(a);
    let mb = season_months(b);
    let inter = ma.iter().filter(|m| mb.contains(m)).count();
    let union = ma.len() + mb.len() - inter;
    if union == 0 {
        0.0
    } else {
        inter as f64 / union as f64
    }
}

/// Neighbour correlations keyed by (side, neighbour factor), side 0 for the
/// first factor of the pair and 1 for the second.
type Neighbourhood = HashMap<(u8, String), f64>;

fn neighbourhood(edges_a: &[CorrelationEdge], edges_b: &[CorrelationEdge], a: &str, b: &str) -> Neighbourhood {
    let mut out = Neighbourhood::new();
    for (side, factor, edges) in [(0u8, a, edges_a), (1u8, b, edges_b)] {
        for edge in edges {
            if let Some(partner) = edge.partner(factor) {
                if partner != a && partner != b {
                    out.insert((side, partner.to_string()), edge.coefficient);
                }
            }
        }
    }
    out
}

/// Agreement of two neighbourhoods in [0, 1]. Shared neighbours are
/// compared directly; otherwise the mean coefficients are compared.
fn pattern_similarity(target: &Neighbourhood, source: &Neighbourhood) -> f64 {
    if target.is_empty() || source.is_empty() {
        return NEUTRAL_PATTERN_SIMILARITY;
    }
    let shared: Vec<f64> = target
        .iter()
        .filter_map(|(k, t)| source.get(k).map(|s| (t - s).abs()))
        .collect();
    if !shared.is_empty() {
        let mean_gap = shared.iter().sum::<f64>() / shared.len() as f64;
        return (1.0 - mean_gap / 2.0).clamp(0.0, 1.0);
    }
    let mean = |n: &Neighbourhood| n.values().sum::<f64>() / n.len() as f64;
    (1.0 - (mean(target) - mean(source)).abs() / 2.0).clamp(0.0, 1.0)
}

fn types_match(edge: &CorrelationEdge, type_a: FactorType, type_b: FactorType) -> bool {
    let ea = FactorType::infer(&edge.factor_a);
    let eb = FactorType::infer(&edge.factor_b);
    (ea == type_a && eb == type_b) || (ea == type_b && eb == type_a)
}

pub struct TransferLearningAdapter {
    store: Arc<dyn CorrelationStore>,
    domains: Vec<Domain>,
    config: TransferConfig,
}

impl TransferLearningAdapter {
    pub fn new(store: Arc<dyn CorrelationStore>, domains: Vec<Domain>, config: TransferConfig) -> Self {
        TransferLearningAdapter {
            store,
            domains,
            config,
        }
    }

    pub fn default_options(&self) -> TransferOptions {
        TransferOptions {
            transfer_strength: self.config.transfer_strength,
        }
    }

    /// Learned affinity of `source` → `target`, or the configured default.
    pub async fn affinity(&self, source: &Domain, target: &Domain) -> EngineResult<f64> {
        Ok(self
            .store
            .get_domain_affinity(source, target)
            .await?
            .unwrap_or(self.config.default_domain_affinity))
    }

    /// Best native edge in `domain` analogous to (a, b), with its type
    /// similarity. The returned edge is oriented so `factor_a` plays the role
    /// of `a`.
    async fn analogous_edge(
        &self,
        a: &str,
        b: &str,
        domain: &Domain,
    ) -> EngineResult<Option<(CorrelationEdge, f64)>> {
        if let Some(edge) = self.store.get_edge(a, b, domain).await? {
            if edge.method == EdgeMethod::Statistical && edge.sample_size > 0 {
                let mut edge = edge;
                if edge.factor_a != a {
                    std::mem::swap(&mut edge.factor_a, &mut edge.factor_b);
                }
                return Ok(Some((edge, EXACT_PAIR_SIMILARITY)));
            }
        }

        let type_a = FactorType::infer(a);
        let type_b = FactorType::infer(b);
        if type_a == FactorType::Unclassified || type_b == FactorType::Unclassified {
            return Ok(None);
        }

        let best = self
            .store
            .list_edges(domain)
            .await?
            .into_iter()
            .filter(|e| e.method == EdgeMethod::Statistical && e.sample_size > 0)
            .filter(|e| types_match(e, type_a, type_b))
            .max_by(|x, y| {
                x.confidence
                    .partial_cmp(&y.confidence)
                    .unwrap_or(Ordering::Equal)
                    .then(x.sample_size.cmp(&y.sample_size))
                    .then(y.factor_a.cmp(&x.factor_a))
                    .then(y.factor_b.cmp(&x.factor_b))
            });

        Ok(best.map(|mut edge| {
            if FactorType::infer(&edge.factor_a) != type_a {
                std::mem::swap(&mut edge.factor_a, &mut edge.factor_b);
            }
            (edge, STRUCTURAL_PAIR_SIMILARITY)
        }))
    }

    /// Rank candidate source domains for the pair (a, b) in `target`.
    ///
    /// Returns at most `max_sources` sources, best first. An empty list means
    /// no domain is eligible.
    pub async fn find_transfer_sources(&self, a: &str, b: &str, target: &Domain) -> EngineResult<Vec<TransferSource>> {
        let target_nb = neighbourhood(
            &self.store.list_edges_for_factor(a, target).await?,
            &self.store.list_edges_for_factor(b, target).await?,
            a,
            b,
        );

        let mut sources = Vec::new();
        for domain in self.domains.iter().filter(|d| *d != target) {
            let affinity = self.affinity(domain, target).await?;
            if affinity < self.config.min_domain_affinity {
                debug!(
                    "Transfer source {} skipped for {}: affinity {:.3} below minimum",
                    domain, target, affinity
                );
                continue;
            }
            let Some((edge, type_similarity)) = self.analogous_edge(a, b, domain).await? else {
                continue;
            };

            let source_nb = neighbourhood(
                &self.store.list_edges_for_factor(&edge.factor_a, domain).await?,
                &self.store.list_edges_for_factor(&edge.factor_b, domain).await?,
                &edge.factor_a,
                &edge.factor_b,
            );
            let pattern_similarity = pattern_similarity(&target_nb, &source_nb);
            let temporal_similarity = temporal_similarity(target, domain);
            let similarity = self.config.type_weight * type_similarity
                + self.config.pattern_weight * pattern_similarity
                + self.config.temporal_weight * temporal_similarity;

            sources.push(TransferSource {
                domain: domain.clone(),
                similarity,
                type_similarity,
                pattern_similarity,
                temporal_similarity,
                affinity,
                edge,
            });
        }

        sources.sort_by(|x, y| {
            y.similarity
                .partial_cmp(&x.similarity)
                .unwrap_or(Ordering::Equal)
                .then_with(|| x.domain.cmp(&y.domain))
        });
        sources.truncate(self.config.max_sources);
        debug!(
            "Transfer sources for {} ~ {} in {}: {:?}",
            a,
            b,
            target,
            sources
                .iter()
                .map(|s| format!(
                    "{} sim={:.3} (type {:.2}, pattern {:.2}, season {:.2})",
                    s.domain, s.similarity, s.type_similarity, s.pattern_similarity, s.temporal_similarity
                ))
                .collect::<Vec<_>>()
        );
        Ok(sources)
    }

    /// Blend the sources' correlations into one discounted estimate.
    ///
    /// Weight per source is its similarity share times its edge confidence
    /// times its learned affinity, renormalised to sum to 1.
    pub fn calculate_transfer_correlation(
        &self,
        a: &str,
        b: &str,
        target: &Domain,
        sources: &[TransferSource],
        options: TransferOptions,
    ) -> EngineResult<TransferEstimate> {
        if sources.is_empty() {
            return Err(EngineError::TransferUnavailable {
                factor_a: a.to_string(),
                factor_b: b.to_string(),
                domain: target.to_string(),
            });
        }

        let sim_total: f64 = sources.iter().map(|s| s.similarity.max(0.0)).sum();
        let shares: Vec<f64> = sources
            .iter()
            .map(|s| {
                if sim_total > 0.0 {
                    s.similarity.max(0.0) / sim_total
                } else {
                    1.0 / sources.len() as f64
                }
            })
            .collect();
        let raw: Vec<f64> = sources
            .iter()
            .zip(&shares)
            .map(|(s, share)| share * s.edge.confidence * s.affinity)
            .collect();
        let raw_total: f64 = raw.iter().sum();
        let weights: Vec<f64> = if raw_total > 0.0 {
            raw.iter().map(|w| w / raw_total).collect()
        } else {
            shares
        };

        let blended: f64 = sources.iter().zip(&weights).map(|(s, w)| w * s.edge.coefficient).sum();
        let confidence: f64 = sources.iter().zip(&weights).map(|(s, w)| w * s.edge.confidence).sum();
        let samples: f64 = sources
            .iter()
            .zip(&weights)
            .map(|(s, w)| w * s.edge.sample_size as f64)
            .sum();

        let multiplier = self.config.confidence_multiplier;
        let correlation = (blended * options.transfer_strength.clamp(0.0, 1.0)).clamp(-1.0, 1.0);
        let effective_sample_size = samples * multiplier;
        let interval = fisher_interval(correlation, effective_sample_size)
            .unwrap_or_else(|| fixed_interval(correlation, self.config.fallback_interval_half_width));

        Ok(TransferEstimate {
            correlation,
            confidence: (confidence * multiplier).clamp(0.0, 1.0),
            effective_sample_size,
            interval,
            weights: sources.iter().map(|s| s.domain.clone()).zip(weights).collect(),
        })
    }

    /// Per-outcome affinity change, bounded by the configured step.
    fn outcome_delta(&self, outcome: &TransferOutcome) -> f64 {
        let step = self.config.affinity_step;
        if outcome.transfer_error > self.config.large_error_threshold {
            -step
        } else if outcome.improvement > self.config.strong_improvement_threshold {
            step
        } else {
            (self.config.proportional_rate * (outcome.improvement - 0.5 * outcome.transfer_error))
                .clamp(-step, step)
        }
    }

    /// Apply a batch of transfer outcomes to the stored affinities.
    ///
    /// Outcomes for the same (source, target) pair are averaged so each pair
    /// moves by at most one step per batch. Returns the updated affinities.
    pub async fn update_domain_affinities(&self, outcomes: &[TransferOutcome]) -> EngineResult<Vec<DomainAffinity>> {
        let mut grouped: BTreeMap<(Domain, Domain), Vec<f64>> = BTreeMap::new();
        for outcome in outcomes {
            if outcome.source == outcome.target {
                continue;
            }
            grouped
                .entry((outcome.source.clone(), outcome.target.clone()))
                .or_default()
                .push(self.outcome_delta(outcome));
        }

        let step = self.config.affinity_step;
        let mut updated = Vec::with_capacity(grouped.len());
        for ((source, target), deltas) in grouped {
            let delta = (deltas.iter().sum::<f64>() / deltas.len() as f64).clamp(-step, step);
            let current = self.affinity(&source, &target).await?;
            let affinity = (current + delta).clamp(self.config.affinity_floor, self.config.affinity_ceiling);
            let record = DomainAffinity {
                source,
                target,
                affinity,
                updated_at: Utc::now(),
            };
            self.store.upsert_domain_affinity(&record).await?;
            info!(
                "Domain affinity {} -> {}: {:.3} -> {:.3} ({} outcome(s))",
                record.source,
                record.target,
                current,
                affinity,
                deltas.len()
            );
            updated.push(record);
        }
        Ok(updated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use approx::assert_relative_eq;

    fn nba() -> Domain {
        Domain::new("basketball", "nba")
    }
    fn wnba() -> Domain {
        Domain::new("basketball", "wnba")
    }
    fn ncaab() -> Domain {
        Domain::new("basketball", "ncaab")
    }
    fn mlb() -> Domain {
        Domain::new("baseball", "mlb")
    }

    fn native_edge(a: &str, b: &str, domain: Domain, coef: f64, conf: f64, n: u64) -> CorrelationEdge {
        let mut edge = CorrelationEdge::new(a, b, domain, coef, EdgeMethod::Statistical);
        edge.confidence = conf;
        edge.sample_size = n;
        edge
    }

    fn adapter(db: &Database) -> TransferLearningAdapter {
        TransferLearningAdapter::new(
            Arc::new(db.clone()),
            vec![nba(), wnba(), ncaab(), mlb()],
            TransferConfig::default(),
        )
    }

    #[test]
    fn temporal_similarity_reflects_season_overlap() {
        assert_relative_eq!(temporal_similarity(&nba(), &ncaab()), 1.0, epsilon = 1e-12);
        assert!(temporal_similarity(&nba(), &wnba()) < temporal_similarity(&nba(), &ncaab()));
        let unknown = Domain::new("curling", "wcf");
        assert!(temporal_similarity(&unknown, &nba()) > 0.0);
    }

    #[test]
    fn pattern_similarity_prefers_agreeing_neighbours() {
        let mut target = Neighbourhood::new();
        target.insert((0, "x".into()), 0.6);
        let mut close = Neighbourhood::new();
        close.insert((0, "x".into()), 0.5);
        let mut far = Neighbourhood::new();
        far.insert((0, "x".into()), -0.6);
        assert!(pattern_similarity(&target, &close) > pattern_similarity(&target, &far));
        assert_relative_eq!(
            pattern_similarity(&target, &Neighbourhood::new()),
            NEUTRAL_PATTERN_SIMILARITY,
            epsilon = 1e-12
        );
    }

    #[tokio::test]
    async fn finds_exact_and_structural_sources() {
        let db = Database::open(":memory:").unwrap();
        db.upsert_edge(&native_edge("lakers_win", "lebron_points_25_plus", nba(), 0.5, 0.9, 200))
            .unwrap();
        db.upsert_edge(&native_edge("duke_win", "star_points_20_plus", ncaab(), 0.3, 0.7, 80))
            .unwrap();

        let adapter = adapter(&db);
        let sources = adapter
            .find_transfer_sources("lakers_win", "lebron_points_25_plus", &wnba())
            .await
            .unwrap();
        assert_eq!(sources.len(), 2);
        assert_eq!(sources[0].domain, nba());
        assert_relative_eq!(sources[0].type_similarity, 1.0, epsilon = 1e-12);
        assert_relative_eq!(sources[1].type_similarity, 0.75, epsilon = 1e-12);
        // Structural analog is oriented to the requested roles.
        assert_eq!(sources[1].edge.factor_a, "duke_win");
        assert!(sources.iter().all(|s| s.domain != wnba()));
    }

    #[tokio::test]
    async fn low_affinity_domains_are_filtered() {
        let db = Database::open(":memory:").unwrap();
        db.upsert_edge(&native_edge("lakers_win", "lebron_points_25_plus", nba(), 0.5, 0.9, 200))
            .unwrap();
        db.upsert_domain_affinity(&DomainAffinity {
            source: nba(),
            target: wnba(),
            affinity: 0.15,
            updated_at: Utc::now(),
        })
        .unwrap();
        let sources = adapter(&db)
            .find_transfer_sources("lakers_win", "lebron_points_25_plus", &wnba())
            .await
            .unwrap();
        assert!(sources.is_empty());
    }

    #[tokio::test]
    async fn transfer_weights_sum_to_one_and_discount_confidence() {
        let db = Database::open(":memory:").unwrap();
        db.upsert_edge(&native_edge("lakers_win", "lebron_points_25_plus", nba(), 0.5, 0.9, 200))
            .unwrap();
        db.upsert_edge(&native_edge("duke_win", "star_points_20_plus", ncaab(), 0.3, 0.7, 80))
            .unwrap();
        let adapter = adapter(&db);
        let sources = adapter
            .find_transfer_sources("lakers_win", "lebron_points_25_plus", &wnba())
            .await
            .unwrap();
        let est = adapter
            .calculate_transfer_correlation(
                "lakers_win",
                "lebron_points_25_plus",
                &wnba(),
                &sources,
                adapter.default_options(),
            )
            .unwrap();

        let total: f64 = est.weights.iter().map(|(_, w)| w).sum();
        assert_relative_eq!(total, 1.0, epsilon = 1e-9);
        assert!(est.correlation > 0.3 && est.correlation < 0.5);
        assert!(est.confidence < 0.9 * 0.8 + 1e-9);
        assert!(est.effective_sample_size < 200.0 * 0.8);
        assert!(est.interval.contains(est.correlation));
        assert_eq!(est.source_domains().len(), 2);
    }

    #[test]
    fn transfer_unavailable_without_sources() {
        let db = Database::open(":memory:").unwrap();
        let err = adapter(&db)
            .calculate_transfer_correlation("a", "b", &wnba(), &[], TransferOptions { transfer_strength: 1.0 })
            .unwrap_err();
        assert!(matches!(err, EngineError::TransferUnavailable { .. }));
    }

    #[test]
    fn tiny_effective_sample_uses_fixed_interval() {
        let db = Database::open(":memory:").unwrap();
        let adapter = adapter(&db);
        let source = TransferSource {
            domain: nba(),
            similarity: 0.8,
            type_similarity: 1.0,
            pattern_similarity: 0.5,
            temporal_similarity: 1.0,
            affinity: 0.5,
            edge: native_edge("a_win", "b_points", nba(), 0.9, 0.6, 3),
        };
        let est = adapter
            .calculate_transfer_correlation("a_win", "b_points", &wnba(), &[source], adapter.default_options())
            .unwrap();
        assert_relative_eq!(est.interval.lower, 0.6, epsilon = 1e-9);
        assert_relative_eq!(est.interval.upper, 1.0, epsilon = 1e-9);
    }

    #[tokio::test]
    async fn affinity_updates_are_bounded() {
        let db = Database::open(":memory:").unwrap();
        let adapter = adapter(&db);
        let outcomes = vec![
            TransferOutcome {
                source: nba(),
                target: wnba(),
                transfer_error: 0.7,
                improvement: -0.1,
            },
            TransferOutcome {
                source: ncaab(),
                target: wnba(),
                transfer_error: 0.1,
                improvement: 0.3,
            },
            TransferOutcome {
                source: mlb(),
                target: wnba(),
                transfer_error: 0.2,
                improvement: 0.05,
            },
        ];
        let updated = adapter.update_domain_affinities(&outcomes).await.unwrap();
        assert_eq!(updated.len(), 3);

        let nba_aff = adapter.affinity(&nba(), &wnba()).await.unwrap();
        let ncaab_aff = adapter.affinity(&ncaab(), &wnba()).await.unwrap();
        let mlb_aff = adapter.affinity(&mlb(), &wnba()).await.unwrap();
        assert_relative_eq!(nba_aff, 0.45, epsilon = 1e-9);
        assert_relative_eq!(ncaab_aff, 0.55, epsilon = 1e-9);
        assert_relative_eq!(mlb_aff, 0.5 + 0.1 * (0.05 - 0.1), epsilon = 1e-9);
    }

    #[tokio::test]
    async fn affinity_never_leaves_bounds() {
        let db = Database::open(":memory:").unwrap();
        let adapter = adapter(&db);
        let bad = TransferOutcome {
            source: nba(),
            target: wnba(),
            transfer_error: 0.9,
            improvement: -0.5,
        };
        for _ in 0..20 {
            adapter.update_domain_affinities(&[bad.clone()]).await.unwrap();
        }
        assert_relative_eq!(adapter.affinity(&nba(), &wnba()).await.unwrap(), 0.1, epsilon = 1e-9);
    }
}
