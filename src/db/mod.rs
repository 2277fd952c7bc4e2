use anyhow::Result;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::sync::{Arc, Mutex, MutexGuard};

pub mod models;
pub mod store;

use models::*;
pub use store::{CorrelationStore, ObservationSource, PredictionFilter, ResolveStatus};

/// Thread-safe SQLite connection pool (single connection with mutex)
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open (or create) the SQLite database at the given path.
    /// `":memory:"` gives a private in-memory database.
    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
        let db = Database {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.run_migrations()?;
        Ok(db)
    }

    /// Run schema migrations (idempotent)
    fn run_migrations(&self) -> Result<()> {
        let conn = self.lock()?;
        conn.execute_batch(SCHEMA_SQL)?;

        // Databases created before affinity feedback was tracked per prediction.
        let has_flag: bool = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM pragma_table_info('predictions') WHERE name='affinity_applied')",
            [],
            |row| row.get(0),
        )?;
        if !has_flag {
            conn.execute_batch(
                "ALTER TABLE predictions ADD COLUMN affinity_applied INTEGER NOT NULL DEFAULT 0",
            )?;
        }
        Ok(())
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow::anyhow!("database connection mutex poisoned"))
    }

    // ── Factors ───────────────────────────────────────────────────────────────

    /// Register a factor. Existing rows are never modified.
    pub fn register_factor(&self, factor: &Factor) -> Result<()> {
        let conn = self.lock()?;
        insert_factor(&conn, &factor.key, &factor.domain)?;
        Ok(())
    }

    pub fn get_factor(&self, key: &str, domain: &Domain) -> Result<Option<Factor>> {
        let conn = self.lock()?;
        let factor = conn
            .query_row(
                "SELECT key, sport, league FROM factors WHERE key=?1 AND sport=?2 AND league=?3",
                params![key, domain.sport, domain.league],
                |row| {
                    let key: String = row.get(0)?;
                    let sport: String = row.get(1)?;
                    let league: String = row.get(2)?;
                    Ok(Factor::new(&key, Domain::new(&sport, &league)))
                },
            )
            .optional()?;
        Ok(factor)
    }

    // ── Correlation edges ─────────────────────────────────────────────────────

    /// Current edge for a factor pair, in either order.
    pub fn get_edge(&self, a: &str, b: &str, domain: &Domain) -> Result<Option<CorrelationEdge>> {
        let (a, b) = CorrelationEdge::canonical_pair(a, b);
        let conn = self.lock()?;
        let edge = conn
            .query_row(
                &format!(
                    "{} WHERE factor_a=?1 AND factor_b=?2 AND sport=?3 AND league=?4",
                    EDGE_SELECT
                ),
                params![a, b, domain.sport, domain.league],
                map_edge,
            )
            .optional()?;
        Ok(edge.map(sanitized))
    }

    /// Insert or replace the current edge for its (pair, domain) key. Every
    /// write bumps the version and is appended to the history table.
    pub fn upsert_edge(&self, edge: &CorrelationEdge) -> Result<CorrelationEdge> {
        let mut edge = edge.clone();
        edge.sanitize();
        let sources = serde_json::to_string(&edge.transfer_sources)?;

        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        insert_factor(&tx, &edge.factor_a, &edge.domain)?;
        insert_factor(&tx, &edge.factor_b, &edge.domain)?;
        tx.execute(
            "INSERT INTO correlation_edges (
                factor_a, factor_b, sport, league, coefficient, confidence,
                sample_size, ci_lower, ci_upper, non_linearity, method,
                transfer_sources, version, last_updated
             ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,1,?13)
             ON CONFLICT(factor_a, factor_b, sport, league) DO UPDATE SET
                coefficient=excluded.coefficient,
                confidence=excluded.confidence,
                sample_size=excluded.sample_size,
                ci_lower=excluded.ci_lower,
                ci_upper=excluded.ci_upper,
                non_linearity=excluded.non_linearity,
                method=excluded.method,
                transfer_sources=excluded.transfer_sources,
                version=correlation_edges.version + 1,
                last_updated=excluded.last_updated",
            params![
                edge.factor_a,
                edge.factor_b,
                edge.domain.sport,
                edge.domain.league,
                edge.coefficient,
                edge.confidence,
                edge.sample_size as i64,
                edge.interval.lower,
                edge.interval.upper,
                edge.non_linearity,
                edge.method.as_str(),
                sources,
                edge.last_updated,
            ],
        )?;
        let version: i64 = tx.query_row(
            "SELECT version FROM correlation_edges
             WHERE factor_a=?1 AND factor_b=?2 AND sport=?3 AND league=?4",
            params![edge.factor_a, edge.factor_b, edge.domain.sport, edge.domain.league],
            |row| row.get(0),
        )?;
        tx.execute(
            "INSERT INTO correlation_edge_history (
                factor_a, factor_b, sport, league, coefficient, confidence,
                sample_size, ci_lower, ci_upper, non_linearity, method,
                transfer_sources, version, last_updated
             ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14)",
            params![
                edge.factor_a,
                edge.factor_b,
                edge.domain.sport,
                edge.domain.league,
                edge.coefficient,
                edge.confidence,
                edge.sample_size as i64,
                edge.interval.lower,
                edge.interval.upper,
                edge.non_linearity,
                edge.method.as_str(),
                sources,
                version,
                edge.last_updated,
            ],
        )?;
        tx.commit()?;
        edge.version = version;
        Ok(edge)
    }

    /// All current edges in a domain.
    pub fn list_edges(&self, domain: &Domain) -> Result<Vec<CorrelationEdge>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "{} WHERE sport=?1 AND league=?2 ORDER BY factor_a, factor_b",
            EDGE_SELECT
        ))?;
        let edges = stmt
            .query_map(params![domain.sport, domain.league], map_edge)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(edges.into_iter().map(sanitized).collect())
    }

    /// Current edges touching `factor` in a domain.
    pub fn list_edges_for_factor(&self, factor: &str, domain: &Domain) -> Result<Vec<CorrelationEdge>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "{} WHERE (factor_a=?1 OR factor_b=?1) AND sport=?2 AND league=?3
             ORDER BY factor_a, factor_b",
            EDGE_SELECT
        ))?;
        let edges = stmt
            .query_map(params![factor, domain.sport, domain.league], map_edge)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(edges.into_iter().map(sanitized).collect())
    }

    /// Every stored version of an edge, oldest first.
    pub fn edge_history(&self, a: &str, b: &str, domain: &Domain) -> Result<Vec<CorrelationEdge>> {
        let (a, b) = CorrelationEdge::canonical_pair(a, b);
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT factor_a, factor_b, sport, league, coefficient, confidence,
                    sample_size, ci_lower, ci_upper, non_linearity, method,
                    transfer_sources, version, last_updated
             FROM correlation_edge_history
             WHERE factor_a=?1 AND factor_b=?2 AND sport=?3 AND league=?4
             ORDER BY version ASC",
        )?;
        let edges = stmt
            .query_map(params![a, b, domain.sport, domain.league], map_edge)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(edges.into_iter().map(sanitized).collect())
    }

    // ── Domain affinities ─────────────────────────────────────────────────────

    pub fn get_domain_affinity(&self, source: &Domain, target: &Domain) -> Result<Option<f64>> {
        let conn = self.lock()?;
        let affinity = conn
            .query_row(
                "SELECT affinity FROM domain_affinities
                 WHERE source_sport=?1 AND source_league=?2
                   AND target_sport=?3 AND target_league=?4",
                params![source.sport, source.league, target.sport, target.league],
                |row| row.get(0),
            )
            .optional()?;
        Ok(affinity)
    }

    pub fn upsert_domain_affinity(&self, affinity: &DomainAffinity) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO domain_affinities (
                source_sport, source_league, target_sport, target_league, affinity, updated_at
             ) VALUES (?1,?2,?3,?4,?5,?6)
             ON CONFLICT(source_sport, source_league, target_sport, target_league) DO UPDATE SET
                affinity=excluded.affinity,
                updated_at=excluded.updated_at",
            params![
                affinity.source.sport,
                affinity.source.league,
                affinity.target.sport,
                affinity.target.league,
                affinity.affinity,
                affinity.updated_at,
            ],
        )?;
        Ok(())
    }

    // ── Predictions ───────────────────────────────────────────────────────────

    pub fn insert_prediction(&self, p: &Prediction) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO predictions (
                tracking_id, factors, sport, league, model, probability,
                raw_confidence, confidence, calculation_method, transfer_sources,
                created_at, outcome, outcome_at, details, affinity_applied
             ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15)",
            params![
                p.tracking_id,
                serde_json::to_string(&p.factors)?,
                p.domain.sport,
                p.domain.league,
                p.model,
                p.probability,
                p.raw_confidence,
                p.confidence,
                p.calculation_method,
                serde_json::to_string(&p.transfer_sources)?,
                p.created_at,
                p.outcome.as_str(),
                p.outcome_at,
                p.details,
                p.affinity_applied,
            ],
        )?;
        Ok(())
    }

    pub fn get_prediction(&self, tracking_id: &str) -> Result<Option<Prediction>> {
        let conn = self.lock()?;
        let prediction = conn
            .query_row(
                &format!("{} WHERE tracking_id=?1", PREDICTION_SELECT),
                params![tracking_id],
                map_prediction,
            )
            .optional()?;
        Ok(prediction)
    }

    /// Close a pending prediction. The conditional update makes concurrent
    /// resolutions of the same id race-free: at most one of them succeeds.
    pub fn resolve_prediction(
        &self,
        tracking_id: &str,
        outcome: Outcome,
        details: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<ResolveStatus> {
        let conn = self.lock()?;
        let changed = conn.execute(
            "UPDATE predictions SET outcome=?1, outcome_at=?2, details=?3
             WHERE tracking_id=?4 AND outcome='pending'",
            params![outcome.as_str(), at, details, tracking_id],
        )?;
        if changed == 1 {
            return Ok(ResolveStatus::Resolved);
        }
        let exists: bool = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM predictions WHERE tracking_id=?1)",
            params![tracking_id],
            |row| row.get(0),
        )?;
        Ok(if exists {
            ResolveStatus::AlreadyResolved
        } else {
            ResolveStatus::NotFound
        })
    }

    /// Resolved predictions matching the filter, most recently resolved first.
    pub fn list_resolved_predictions(&self, filter: &PredictionFilter) -> Result<Vec<Prediction>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "{} WHERE outcome != 'pending'
               AND (?1 IS NULL OR sport=?1)
               AND (?2 IS NULL OR league=?2)
               AND (?3 IS NULL OR model=?3)
               AND (?4 IS NULL OR outcome_at >= ?4)
             ORDER BY outcome_at DESC
             LIMIT ?5",
            PREDICTION_SELECT
        ))?;
        let limit = filter.limit.map(|l| l as i64).unwrap_or(-1);
        let predictions = stmt
            .query_map(
                params![
                    filter.domain.as_ref().map(|d| d.sport.clone()),
                    filter.domain.as_ref().map(|d| d.league.clone()),
                    filter.model,
                    filter.since,
                    limit,
                ],
                map_prediction,
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(predictions)
    }

    /// Mark resolved predictions as fed into the domain affinities. Returns
    /// the ids this call claimed; ids that were pending, unknown or already
    /// claimed are left out, so each outcome is applied at most once.
    pub fn claim_affinity_outcomes(&self, tracking_ids: &[String]) -> Result<Vec<String>> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let mut claimed = Vec::new();
        {
            let mut stmt = tx.prepare(
                "UPDATE predictions SET affinity_applied=1
                 WHERE tracking_id=?1 AND outcome != 'pending' AND affinity_applied=0",
            )?;
            for id in tracking_ids {
                if stmt.execute(params![id])? == 1 {
                    claimed.push(id.clone());
                }
            }
        }
        tx.commit()?;
        Ok(claimed)
    }

    /// Distinct (domain, model) keys that have at least one resolved prediction.
    pub fn list_resolved_models(&self) -> Result<Vec<(Domain, String)>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT DISTINCT sport, league, model FROM predictions
             WHERE outcome != 'pending' ORDER BY sport, league, model",
        )?;
        let keys = stmt
            .query_map([], |row| {
                let sport: String = row.get(0)?;
                let league: String = row.get(1)?;
                let model: String = row.get(2)?;
                Ok((Domain::new(&sport, &league), model))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(keys)
    }

    // ── Confidence adjustments ────────────────────────────────────────────────

    pub fn get_confidence_adjustment(
        &self,
        domain: &Domain,
        model: &str,
    ) -> Result<Option<ConfidenceAdjustment>> {
        let conn = self.lock()?;
        let adjustment = conn
            .query_row(
                "SELECT sport, league, model, factor, samples, accuracy,
                        mean_probability, calibrated_at
                 FROM confidence_adjustments WHERE sport=?1 AND league=?2 AND model=?3",
                params![domain.sport, domain.league, model],
                map_adjustment,
            )
            .optional()?;
        Ok(adjustment)
    }

    pub fn upsert_confidence_adjustment(&self, adj: &ConfidenceAdjustment) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO confidence_adjustments (
                sport, league, model, factor, samples, accuracy, mean_probability, calibrated_at
             ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8)
             ON CONFLICT(sport, league, model) DO UPDATE SET
                factor=excluded.factor,
                samples=excluded.samples,
                accuracy=excluded.accuracy,
                mean_probability=excluded.mean_probability,
                calibrated_at=excluded.calibrated_at",
            params![
                adj.domain.sport,
                adj.domain.league,
                adj.model,
                adj.factor,
                adj.samples,
                adj.accuracy,
                adj.mean_probability,
                adj.calibrated_at,
            ],
        )?;
        Ok(())
    }

    // ── Raw observations ──────────────────────────────────────────────────────

    pub fn insert_observation(&self, obs: &Observation) -> Result<i64> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO factor_observations (event_id, factor, sport, league, value, observed_at)
             VALUES (?1,?2,?3,?4,?5,?6)
             ON CONFLICT(event_id, factor, sport, league) DO UPDATE SET
                value=excluded.value,
                observed_at=excluded.observed_at",
            params![
                obs.event_id,
                obs.factor,
                obs.domain.sport,
                obs.domain.league,
                obs.value,
                obs.observed_at,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Paired values of two factors over every event where both were observed.
    pub fn co_occurrences(&self, a: &str, b: &str, domain: &Domain) -> Result<Vec<(f64, f64)>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT oa.value, ob.value
             FROM factor_observations oa
             JOIN factor_observations ob
               ON oa.event_id = ob.event_id AND oa.sport = ob.sport AND oa.league = ob.league
             WHERE oa.factor=?1 AND ob.factor=?2 AND oa.sport=?3 AND oa.league=?4
             ORDER BY oa.observed_at, oa.event_id",
        )?;
        let pairs = stmt
            .query_map(params![a, b, domain.sport, domain.league], |row| {
                Ok((row.get(0)?, row.get(1)?))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(pairs)
    }
}

// ── SQL helpers ────────────────────────────────────────────────────────────────

const EDGE_SELECT: &str = "SELECT factor_a, factor_b, sport, league, coefficient, confidence,
        sample_size, ci_lower, ci_upper, non_linearity, method,
        transfer_sources, version, last_updated
 FROM correlation_edges";

const PREDICTION_SELECT: &str = "SELECT tracking_id, factors, sport, league, model, probability,
        raw_confidence, confidence, calculation_method, transfer_sources,
        created_at, outcome, outcome_at, details, affinity_applied
 FROM predictions";

fn insert_factor(conn: &Connection, key: &str, domain: &Domain) -> rusqlite::Result<usize> {
    conn.execute(
        "INSERT OR IGNORE INTO factors (key, sport, league, factor_type) VALUES (?1,?2,?3,?4)",
        params![key, domain.sport, domain.league, FactorType::infer(key).as_str()],
    )
}

fn sanitized(mut edge: CorrelationEdge) -> CorrelationEdge {
    edge.sanitize();
    edge
}

fn text_conversion_error(
    idx: usize,
    err: impl std::error::Error + Send + Sync + 'static,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(err))
}

fn parse_text<T: std::str::FromStr<Err = String>>(idx: usize, s: &str) -> rusqlite::Result<T> {
    s.parse::<T>().map_err(|e| {
        text_conversion_error(idx, std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    })
}

fn parse_domains(idx: usize, s: &str) -> rusqlite::Result<Vec<Domain>> {
    serde_json::from_str(s).map_err(|e| text_conversion_error(idx, e))
}

fn map_edge(row: &rusqlite::Row) -> rusqlite::Result<CorrelationEdge> {
    let sport: String = row.get(2)?;
    let league: String = row.get(3)?;
    let method: String = row.get(10)?;
    let sources: String = row.get(11)?;
    let sample_size: i64 = row.get(6)?;
    Ok(CorrelationEdge {
        factor_a: row.get(0)?,
        factor_b: row.get(1)?,
        domain: Domain::new(&sport, &league),
        coefficient: row.get(4)?,
        confidence: row.get(5)?,
        sample_size: sample_size.max(0) as u64,
        interval: ConfidenceInterval {
            lower: row.get(7)?,
            upper: row.get(8)?,
        },
        non_linearity: row.get(9)?,
        method: parse_text(10, &method)?,
        transfer_sources: parse_domains(11, &sources)?,
        version: row.get(12)?,
        last_updated: row.get(13)?,
    })
}

fn map_prediction(row: &rusqlite::Row) -> rusqlite::Result<Prediction> {
    let factors: String = row.get(1)?;
    let sport: String = row.get(2)?;
    let league: String = row.get(3)?;
    let sources: String = row.get(9)?;
    let outcome: String = row.get(11)?;
    Ok(Prediction {
        tracking_id: row.get(0)?,
        factors: serde_json::from_str(&factors).map_err(|e| text_conversion_error(1, e))?,
        domain: Domain::new(&sport, &league),
        model: row.get(4)?,
        probability: row.get(5)?,
        raw_confidence: row.get(6)?,
        confidence: row.get(7)?,
        calculation_method: row.get(8)?,
        transfer_sources: parse_domains(9, &sources)?,
        created_at: row.get(10)?,
        outcome: parse_text(11, &outcome)?,
        outcome_at: row.get(12)?,
        details: row.get(13)?,
        affinity_applied: row.get(14)?,
    })
}

fn map_adjustment(row: &rusqlite::Row) -> rusqlite::Result<ConfidenceAdjustment> {
    let sport: String = row.get(0)?;
    let league: String = row.get(1)?;
    Ok(ConfidenceAdjustment {
        domain: Domain::new(&sport, &league),
        model: row.get(2)?,
        factor: row.get(3)?,
        samples: row.get(4)?,
        accuracy: row.get(5)?,
        mean_probability: row.get(6)?,
        calibrated_at: row.get(7)?,
    })
}

/// SQLite schema (idempotent CREATE IF NOT EXISTS)
pub const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS factors (
    key         TEXT    NOT NULL,
    sport       TEXT    NOT NULL,
    league      TEXT    NOT NULL,
    factor_type TEXT    NOT NULL,
    PRIMARY KEY (key, sport, league)
);

CREATE TABLE IF NOT EXISTS correlation_edges (
    factor_a         TEXT    NOT NULL,
    factor_b         TEXT    NOT NULL,
    sport            TEXT    NOT NULL,
    league           TEXT    NOT NULL,
    coefficient      REAL    NOT NULL,
    confidence       REAL    NOT NULL,
    sample_size      INTEGER NOT NULL DEFAULT 0,
    ci_lower         REAL    NOT NULL,
    ci_upper         REAL    NOT NULL,
    non_linearity    REAL    NOT NULL DEFAULT 0,
    method           TEXT    NOT NULL,
    transfer_sources TEXT    NOT NULL DEFAULT '[]',
    version          INTEGER NOT NULL DEFAULT 1,
    last_updated     TEXT    NOT NULL,
    PRIMARY KEY (factor_a, factor_b, sport, league),
    CHECK (factor_a <= factor_b)
);

CREATE TABLE IF NOT EXISTS correlation_edge_history (
    id               INTEGER PRIMARY KEY AUTOINCREMENT,
    factor_a         TEXT    NOT NULL,
    factor_b         TEXT    NOT NULL,
    sport            TEXT    NOT NULL,
    league           TEXT    NOT NULL,
    coefficient      REAL    NOT NULL,
    confidence       REAL    NOT NULL,
    sample_size      INTEGER NOT NULL,
    ci_lower         REAL    NOT NULL,
    ci_upper         REAL    NOT NULL,
    non_linearity    REAL    NOT NULL,
    method           TEXT    NOT NULL,
    transfer_sources TEXT    NOT NULL,
    version          INTEGER NOT NULL,
    last_updated     TEXT    NOT NULL
);

CREATE TABLE IF NOT EXISTS domain_affinities (
    source_sport  TEXT NOT NULL,
    source_league TEXT NOT NULL,
    target_sport  TEXT NOT NULL,
    target_league TEXT NOT NULL,
    affinity      REAL NOT NULL,
    updated_at    TEXT NOT NULL,
    PRIMARY KEY (source_sport, source_league, target_sport, target_league)
);

CREATE TABLE IF NOT EXISTS predictions (
    tracking_id        TEXT    PRIMARY KEY,
    factors            TEXT    NOT NULL,
    sport              TEXT    NOT NULL,
    league             TEXT    NOT NULL,
    model              TEXT    NOT NULL,
    probability        REAL    NOT NULL,
    raw_confidence     REAL    NOT NULL,
    confidence         REAL    NOT NULL,
    calculation_method TEXT    NOT NULL,
    transfer_sources   TEXT    NOT NULL DEFAULT '[]',
    created_at         TEXT    NOT NULL,
    outcome            TEXT    NOT NULL DEFAULT 'pending',
    outcome_at         TEXT,
    details            TEXT,
    affinity_applied   INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS confidence_adjustments (
    sport            TEXT    NOT NULL,
    league           TEXT    NOT NULL,
    model            TEXT    NOT NULL,
    factor           REAL    NOT NULL,
    samples          INTEGER NOT NULL,
    accuracy         REAL    NOT NULL,
    mean_probability REAL    NOT NULL,
    calibrated_at    TEXT    NOT NULL,
    PRIMARY KEY (sport, league, model)
);

CREATE TABLE IF NOT EXISTS factor_observations (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    event_id    TEXT    NOT NULL,
    factor      TEXT    NOT NULL,
    sport       TEXT    NOT NULL,
    league      TEXT    NOT NULL,
    value       REAL    NOT NULL,
    observed_at TEXT    NOT NULL,
    UNIQUE (event_id, factor, sport, league)
);

CREATE INDEX IF NOT EXISTS idx_edges_domain ON correlation_edges(sport, league);
CREATE INDEX IF NOT EXISTS idx_edge_history_pair ON correlation_edge_history(factor_a, factor_b, sport, league);
CREATE INDEX IF NOT EXISTS idx_predictions_scope ON predictions(sport, league, model, outcome);
CREATE INDEX IF NOT EXISTS idx_observations_factor ON factor_observations(factor, sport, league);
"#;
