use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A sport/league scope. Keys are normalised to lowercase.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Domain {
    pub sport: String,
    pub league: String,
}

impl Domain {
    pub fn new(sport: &str, league: &str) -> Self {
        Domain {
            sport: sport.trim().to_lowercase(),
            league: league.trim().to_lowercase(),
        }
    }
}

impl fmt::Display for Domain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.sport, self.league)
    }
}

impl FromStr for Domain {
    type Err = String;

    /// Parses `sport/league`, e.g. `basketball/nba`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (sport, league) = s
            .split_once('/')
            .ok_or_else(|| format!("domain must be `sport/league`, got '{}'", s))?;
        if sport.trim().is_empty() || league.trim().is_empty() {
            return Err(format!("domain has an empty sport or league: '{}'", s));
        }
        Ok(Domain::new(sport, league))
    }
}

/// Coarse factor category, inferred from the factor key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FactorType {
    Player,
    Team,
    Weather,
    Injury,
    Streak,
    Unclassified,
}

/// Keyword table checked in order; the first hit wins, so the more specific
/// categories (injury, weather, streak) come before player/team.
const TYPE_KEYWORDS: &[(FactorType, &[&str])] = &[
    (
        FactorType::Injury,
        &["injury", "injured", "questionable", "doubtful", "out", "dnp"],
    ),
    (
        FactorType::Weather,
        &["weather", "rain", "wind", "snow", "temperature", "humidity"],
    ),
    (
        FactorType::Streak,
        &["streak", "consecutive", "straight"],
    ),
    (
        FactorType::Player,
        &[
            "player", "points", "pts", "rebounds", "assists", "yards", "goals", "scorer",
            "touchdown", "td", "hits", "strikeouts", "saves", "shots",
        ],
    ),
    (
        FactorType::Team,
        &[
            "team", "win", "wins", "moneyline", "spread", "total", "over", "under", "cover",
            "margin", "clean", "sheet",
        ],
    ),
];

impl FactorType {
    /// Infer a factor type from its key, e.g. `lebron_points_25_plus` → Player.
    pub fn infer(key: &str) -> Self {
        let lowered = key.to_lowercase();
        let tokens: Vec<&str> = lowered
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
            .collect();
        for (kind, words) in TYPE_KEYWORDS {
            if tokens.iter().any(|t| words.contains(t)) {
                return *kind;
            }
        }
        FactorType::Unclassified
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FactorType::Player => "player",
            FactorType::Team => "team",
            FactorType::Weather => "weather",
            FactorType::Injury => "injury",
            FactorType::Streak => "streak",
            FactorType::Unclassified => "unclassified",
        }
    }
}

/// A single predictable proposition scoped to a domain.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Factor {
    pub key: String,
    pub domain: Domain,
    pub factor_type: FactorType,
}

impl Factor {
    pub fn new(key: &str, domain: Domain) -> Self {
        let key = key.trim().to_string();
        Factor {
            factor_type: FactorType::infer(&key),
            key,
            domain,
        }
    }
}

/// How a correlation edge was obtained, best quality first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeMethod {
    Statistical,
    Transfer,
    Default,
    Fallback,
}

impl EdgeMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            EdgeMethod::Statistical => "statistical",
            EdgeMethod::Transfer => "transfer",
            EdgeMethod::Default => "default",
            EdgeMethod::Fallback => "fallback",
        }
    }

    /// Name reported as a joint-probability `calculation_method`.
    pub fn calculation_method(&self) -> &'static str {
        match self {
            EdgeMethod::Statistical => "statistical",
            EdgeMethod::Transfer => "transfer_learning",
            EdgeMethod::Default => "default",
            EdgeMethod::Fallback => "fallback",
        }
    }

    pub fn is_low_quality(&self) -> bool {
        matches!(self, EdgeMethod::Default | EdgeMethod::Fallback)
    }
}

impl FromStr for EdgeMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "statistical" => Ok(EdgeMethod::Statistical),
            "transfer" | "transfer_learning" => Ok(EdgeMethod::Transfer),
            "default" => Ok(EdgeMethod::Default),
            "fallback" => Ok(EdgeMethod::Fallback),
            other => Err(format!("unknown edge method '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ConfidenceInterval {
    pub lower: f64,
    pub upper: f64,
}

impl ConfidenceInterval {
    pub fn contains(&self, value: f64) -> bool {
        self.lower <= value && value <= self.upper
    }
}

/// Pairwise correlation between two factors in one domain.
///
/// `factor_a < factor_b` always holds after construction or `sanitize`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CorrelationEdge {
    pub factor_a: String,
    pub factor_b: String,
    pub domain: Domain,
    /// Correlation coefficient (-1.0–1.0)
    pub coefficient: f64,
    /// Confidence in the coefficient (0.0–1.0)
    pub confidence: f64,
    pub sample_size: u64,
    pub interval: ConfidenceInterval,
    /// How far the dependence departs from linear (0.0–1.0)
    pub non_linearity: f64,
    pub method: EdgeMethod,
    /// Domains blended into a transfer edge; empty for native edges.
    pub transfer_sources: Vec<Domain>,
    pub version: i64,
    pub last_updated: DateTime<Utc>,
}

impl CorrelationEdge {
    /// Order a factor pair canonically.
    pub fn canonical_pair<'a>(a: &'a str, b: &'a str) -> (&'a str, &'a str) {
        if a <= b {
            (a, b)
        } else {
            (b, a)
        }
    }

    pub fn new(
        factor_a: &str,
        factor_b: &str,
        domain: Domain,
        coefficient: f64,
        method: EdgeMethod,
    ) -> Self {
        let (a, b) = Self::canonical_pair(factor_a, factor_b);
        let mut edge = CorrelationEdge {
            factor_a: a.to_string(),
            factor_b: b.to_string(),
            domain,
            coefficient,
            confidence: 0.0,
            sample_size: 0,
            interval: ConfidenceInterval {
                lower: coefficient,
                upper: coefficient,
            },
            non_linearity: 0.0,
            method,
            transfer_sources: Vec::new(),
            version: 0,
            last_updated: Utc::now(),
        };
        edge.sanitize();
        edge
    }

    /// Independence assumption used when no edge can be obtained.
    pub fn independent(factor_a: &str, factor_b: &str, domain: Domain, method: EdgeMethod) -> Self {
        let mut edge = Self::new(factor_a, factor_b, domain, 0.0, method);
        edge.interval = ConfidenceInterval {
            lower: -1.0,
            upper: 1.0,
        };
        edge
    }

    /// Restore every invariant: canonical ordering, bounded values and an
    /// interval that brackets the coefficient. Applied on every read.
    pub fn sanitize(&mut self) {
        if self.factor_a > self.factor_b {
            std::mem::swap(&mut self.factor_a, &mut self.factor_b);
        }
        self.coefficient = finite_or(self.coefficient, 0.0).clamp(-1.0, 1.0);
        self.confidence = finite_or(self.confidence, 0.0).clamp(0.0, 1.0);
        self.non_linearity = finite_or(self.non_linearity, 0.0).clamp(0.0, 1.0);
        let lower = finite_or(self.interval.lower, self.coefficient).clamp(-1.0, 1.0);
        let upper = finite_or(self.interval.upper, self.coefficient).clamp(-1.0, 1.0);
        self.interval = ConfidenceInterval {
            lower: lower.min(self.coefficient),
            upper: upper.max(self.coefficient),
        };
    }

    /// The other end of the edge, if `factor` is one end.
    pub fn partner(&self, factor: &str) -> Option<&str> {
        if self.factor_a == factor {
            Some(&self.factor_b)
        } else if self.factor_b == factor {
            Some(&self.factor_a)
        } else {
            None
        }
    }
}

fn finite_or(v: f64, fallback: f64) -> f64 {
    if v.is_finite() {
        v
    } else {
        fallback
    }
}

/// Learned reliability of transferring correlations from `source` to `target`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomainAffinity {
    pub source: Domain,
    pub target: Domain,
    /// 0.1–1.0
    pub affinity: f64,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Pending,
    Correct,
    Incorrect,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Pending => "pending",
            Outcome::Correct => "correct",
            Outcome::Incorrect => "incorrect",
        }
    }

    pub fn from_result(correct: bool) -> Self {
        if correct {
            Outcome::Correct
        } else {
            Outcome::Incorrect
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Outcome::Pending)
    }
}

impl FromStr for Outcome {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Outcome::Pending),
            "correct" => Ok(Outcome::Correct),
            "incorrect" => Ok(Outcome::Incorrect),
            other => Err(format!("unknown outcome '{}'", other)),
        }
    }
}

/// A tracked prediction. Closed exactly once when its outcome is recorded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    pub tracking_id: String,
    pub factors: Vec<String>,
    pub domain: Domain,
    /// Model or strategy that produced the prediction
    pub model: String,
    /// Predicted probability (0.0–1.0)
    pub probability: f64,
    /// Confidence before the stored adjustment was applied
    pub raw_confidence: f64,
    /// Confidence after calibration
    pub confidence: f64,
    /// "single_factor" | "statistical" | "transfer_learning" | "default" | "fallback"
    pub calculation_method: String,
    pub transfer_sources: Vec<Domain>,
    pub created_at: DateTime<Utc>,
    pub outcome: Outcome,
    pub outcome_at: Option<DateTime<Utc>>,
    pub details: Option<String>,
    /// Set once the outcome has been fed into the domain affinities
    #[serde(default)]
    pub affinity_applied: bool,
}

impl Prediction {
    /// Whether the prediction rested on correlations borrowed from other domains.
    pub fn is_transfer_backed(&self) -> bool {
        self.calculation_method == "transfer_learning" && !self.transfer_sources.is_empty()
    }

    /// 1.0 for a correct outcome, 0.0 otherwise.
    pub fn label(&self) -> f64 {
        if self.outcome == Outcome::Correct {
            1.0
        } else {
            0.0
        }
    }
}

/// Per domain/model confidence multiplier produced by the calibration job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfidenceAdjustment {
    pub domain: Domain,
    pub model: String,
    /// Clamped multiplier applied to raw confidence
    pub factor: f64,
    pub samples: i64,
    pub accuracy: f64,
    pub mean_probability: f64,
    pub calibrated_at: DateTime<Utc>,
}

/// One raw factor value observed for an event, supplied by the historical
/// data feed. Two factors co-occur when they share an `event_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub event_id: String,
    pub factor: String,
    pub domain: Domain,
    pub value: f64,
    pub observed_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn domain_parses_and_normalises() {
        let d: Domain = " Basketball/NBA ".trim().parse().unwrap();
        assert_eq!(d, Domain::new("basketball", "nba"));
        assert_eq!(d.to_string(), "basketball/nba");
        assert!("basketball".parse::<Domain>().is_err());
        assert!("/nba".parse::<Domain>().is_err());
    }

    #[test]
    fn factor_type_inference() {
        assert_eq!(FactorType::infer("lebron_points_25_plus"), FactorType::Player);
        assert_eq!(FactorType::infer("lakers_win"), FactorType::Team);
        assert_eq!(FactorType::infer("rain_at_kickoff"), FactorType::Weather);
        assert_eq!(FactorType::infer("star_player_injury"), FactorType::Injury);
        assert_eq!(FactorType::infer("home_win_streak_5"), FactorType::Streak);
        assert_eq!(FactorType::infer("coin_toss_heads"), FactorType::Unclassified);
    }

    #[test]
    fn edge_is_canonical_and_bounded() {
        let edge = CorrelationEdge::new(
            "z_factor",
            "a_factor",
            Domain::new("soccer", "epl"),
            1.7,
            EdgeMethod::Statistical,
        );
        assert_eq!(edge.factor_a, "a_factor");
        assert_eq!(edge.factor_b, "z_factor");
        assert_eq!(edge.coefficient, 1.0);
        assert!(edge.interval.contains(edge.coefficient));
    }

    #[test]
    fn sanitize_repairs_corrupted_edge() {
        let mut edge = CorrelationEdge::new(
            "a",
            "b",
            Domain::new("soccer", "epl"),
            0.4,
            EdgeMethod::Statistical,
        );
        edge.factor_a = "b".into();
        edge.factor_b = "a".into();
        edge.coefficient = f64::NAN;
        edge.confidence = 3.0;
        edge.interval = ConfidenceInterval {
            lower: 0.5,
            upper: -2.0,
        };
        edge.sanitize();
        assert_eq!(edge.factor_a, "a");
        assert_eq!(edge.coefficient, 0.0);
        assert_eq!(edge.confidence, 1.0);
        assert!(edge.interval.lower <= 0.0 && edge.interval.upper >= 0.0);
        assert!(edge.interval.lower >= -1.0 && edge.interval.upper <= 1.0);
    }

    #[test]
    fn edge_partner_lookup() {
        let edge = CorrelationEdge::new("a", "b", Domain::new("nfl", "nfl"), 0.1, EdgeMethod::Default);
        assert_eq!(edge.partner("a"), Some("b"));
        assert_eq!(edge.partner("b"), Some("a"));
        assert_eq!(edge.partner("c"), None);
    }

    #[test]
    fn method_quality_ordering() {
        assert!(EdgeMethod::Statistical < EdgeMethod::Transfer);
        assert!(EdgeMethod::Transfer < EdgeMethod::Default);
        assert!(EdgeMethod::Default < EdgeMethod::Fallback);
        assert_eq!(EdgeMethod::Transfer.calculation_method(), "transfer_learning");
    }
}
