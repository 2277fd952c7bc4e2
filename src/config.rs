use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;

use crate::db::models::Domain;

/// Multi-factor sports prediction engine: correlation matrices, transfer
/// learning between leagues and confidence calibration.
#[derive(Parser, Debug, Clone)]
#[command(name = "factor-correlation-engine", version, about)]
pub struct Config {
    /// SQLite database path
    #[arg(long, env = "DATABASE_PATH", default_value = "correlations.db", global = true)]
    pub database_path: String,

    /// Configured sport/league domains (transfer-learning candidates)
    #[arg(
        long,
        env = "DOMAINS",
        value_delimiter = ',',
        default_value = "basketball/nba,basketball/wnba,basketball/ncaab,football/nfl,football/ncaaf,soccer/epl,soccer/mls,baseball/mlb,ice_hockey/nhl",
        global = true
    )]
    pub domains: Vec<String>,

    /// Native sample size below which an edge is considered insufficient
    #[arg(long, env = "MIN_SAMPLE_SIZE", default_value = "20", global = true)]
    pub min_sample_size: usize,

    /// |correlation| above which a pair is reported as an insight
    #[arg(long, env = "SIGNIFICANCE_THRESHOLD", default_value = "0.4", global = true)]
    pub significance_threshold: f64,

    /// Timeout for statistical estimation of a missing edge (ms)
    #[arg(long, env = "ESTIMATION_TIMEOUT_MS", default_value = "2000", global = true)]
    pub estimation_timeout_ms: u64,

    /// Timeout for transfer-source lookup and blending (ms)
    #[arg(long, env = "TRANSFER_TIMEOUT_MS", default_value = "2000", global = true)]
    pub transfer_timeout_ms: u64,

    /// Correlation matrix cache TTL in seconds
    #[arg(long, env = "CACHE_TTL_SECS", default_value = "300", global = true)]
    pub cache_ttl_secs: u64,

    /// Minimum learned domain affinity for a domain to serve as transfer source
    #[arg(long, env = "MIN_DOMAIN_AFFINITY", default_value = "0.2", global = true)]
    pub min_domain_affinity: f64,

    /// Confidence discount applied to transferred correlations (< 1.0)
    #[arg(long, env = "TRANSFER_CONFIDENCE_MULTIPLIER", default_value = "0.8", global = true)]
    pub transfer_confidence_multiplier: f64,

    /// Maximum number of transfer source domains blended per pair
    #[arg(long, env = "MAX_TRANSFER_SOURCES", default_value = "5", global = true)]
    pub max_transfer_sources: usize,

    /// Annealing iteration budget for matrix repair
    #[arg(long, env = "OPTIMIZER_MAX_ITERATIONS", default_value = "2000", global = true)]
    pub optimizer_max_iterations: usize,

    /// Seed for the annealing move generator (keeps results reproducible)
    #[arg(long, env = "OPTIMIZER_SEED", default_value = "42", global = true)]
    pub optimizer_seed: u64,

    /// Sliding calibration window in days
    #[arg(long, env = "CALIBRATION_WINDOW_DAYS", default_value = "30", global = true)]
    pub calibration_window_days: i64,

    /// Minimum resolved predictions before a model is calibrated
    #[arg(long, env = "CALIBRATION_MIN_SAMPLES", default_value = "20", global = true)]
    pub calibration_min_samples: usize,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Print the correlation matrix for a set of factors
    Matrix {
        #[arg(long)]
        domain: String,
        /// Comma-separated factor keys
        #[arg(long, value_delimiter = ',')]
        factors: Vec<String>,
        /// Estimate missing edges from observations / transfer learning
        #[arg(long)]
        calculate_if_missing: bool,
    },
    /// Joint probability for a JSON list of {factor, probability, confidence}
    Joint {
        #[arg(long)]
        domain: String,
        #[arg(long)]
        input: PathBuf,
        /// Also track the joint prediction under this model name
        #[arg(long)]
        track: Option<String>,
    },
    /// Version history of one stored correlation edge
    History {
        #[arg(long)]
        domain: String,
        #[arg(long)]
        factor_a: String,
        #[arg(long)]
        factor_b: String,
    },
    /// Start tracking a prediction
    Track {
        #[arg(long)]
        domain: String,
        #[arg(long, value_delimiter = ',')]
        factors: Vec<String>,
        #[arg(long)]
        probability: f64,
        #[arg(long)]
        confidence: f64,
        #[arg(long, default_value = "joint")]
        model: String,
        #[arg(long, default_value = "single_factor")]
        calculation_method: String,
    },
    /// Record the outcome of a tracked prediction
    Outcome {
        #[arg(long)]
        tracking_id: String,
        /// Whether the prediction held
        #[arg(long)]
        correct: bool,
        #[arg(long)]
        details: Option<String>,
    },
    /// Accuracy and calibration metrics for resolved predictions
    Accuracy {
        #[arg(long)]
        domain: Option<String>,
        #[arg(long)]
        model: Option<String>,
    },
    /// Run the full model calibration job once
    Calibrate,
    /// Load raw factor observations from a JSON file
    ImportObservations {
        #[arg(long)]
        input: PathBuf,
    },
    /// Run the calibration job periodically until interrupted
    Run {
        #[arg(long, env = "CALIBRATION_INTERVAL_SECS", default_value = "3600")]
        interval_secs: u64,
    },
}

/// Correlation engine tuning.
#[derive(Debug, Clone)]
pub struct CorrelationConfig {
    /// Minimum samples for estimation (≥ 4); an edge counts towards data
    /// quality only with more samples than this
    pub min_sample_size: usize,
    /// |ρ| threshold for insights (0.0–1.0)
    pub significance_threshold: f64,
    /// Minimum edge confidence for insights (0.0–1.0)
    pub min_insight_confidence: f64,
    pub max_insights: usize,
    /// Share of joint confidence removed when every pair is low quality (0.0–1.0)
    pub low_quality_confidence_penalty: f64,
    pub estimation_timeout: Duration,
    pub transfer_timeout: Duration,
    pub cache_ttl: Duration,
    pub cache_capacity: u64,
    /// LDLᵀ pivot deficit tolerated before the annealing repair runs
    pub psd_tolerance: f64,
}

impl Default for CorrelationConfig {
    fn default() -> Self {
        CorrelationConfig {
            min_sample_size: 20,
            significance_threshold: 0.4,
            min_insight_confidence: 0.3,
            max_insights: 5,
            low_quality_confidence_penalty: 0.5,
            estimation_timeout: Duration::from_secs(2),
            transfer_timeout: Duration::from_secs(2),
            cache_ttl: Duration::from_secs(300),
            cache_capacity: 10_000,
            psd_tolerance: 1e-9,
        }
    }
}

/// Transfer learning tuning.
#[derive(Debug, Clone)]
pub struct TransferConfig {
    /// Similarity weights; must sum to 1.0
    pub type_weight: f64,
    pub pattern_weight: f64,
    pub temporal_weight: f64,
    /// Domains with a lower learned affinity to the target are skipped (0.0–1.0)
    pub min_domain_affinity: f64,
    /// Affinity assumed before any feedback exists (0.1–1.0)
    pub default_domain_affinity: f64,
    pub max_sources: usize,
    /// Discount on borrowed confidence and sample size (0.0–1.0, exclusive of 1.0)
    pub confidence_multiplier: f64,
    /// Shrinks the blended correlation toward independence (0.0–1.0)
    pub transfer_strength: f64,
    /// Half-width of the interval used when Fisher-z is unstable
    pub fallback_interval_half_width: f64,
    pub affinity_step: f64,
    pub affinity_floor: f64,
    pub affinity_ceiling: f64,
    pub large_error_threshold: f64,
    pub strong_improvement_threshold: f64,
    pub proportional_rate: f64,
}

impl Default for TransferConfig {
    fn default() -> Self {
        TransferConfig {
            type_weight: 0.5,
            pattern_weight: 0.3,
            temporal_weight: 0.2,
            min_domain_affinity: 0.2,
            default_domain_affinity: 0.5,
            max_sources: 5,
            confidence_multiplier: 0.8,
            transfer_strength: 1.0,
            fallback_interval_half_width: 0.3,
            affinity_step: 0.05,
            affinity_floor: 0.1,
            affinity_ceiling: 1.0,
            large_error_threshold: 0.5,
            strong_improvement_threshold: 0.2,
            proportional_rate: 0.1,
        }
    }
}

/// Annealing search tuning.
#[derive(Debug, Clone)]
pub struct OptimizerConfig {
    pub max_iterations: usize,
    pub initial_temperature: f64,
    /// Geometric cooling factor per iteration (0.0–1.0)
    pub cooling_rate: f64,
    /// Largest single-entry perturbation at the initial temperature
    pub max_step: f64,
    /// Best-energy improvement below which an iteration counts as stalled
    pub convergence_threshold: f64,
    /// Stalled iterations before the search stops
    pub patience: usize,
    pub psd_penalty_weight: f64,
    /// Off-diagonal magnitude beyond which the boundary penalty applies
    pub boundary_margin: f64,
    pub seed: u64,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        OptimizerConfig {
            max_iterations: 2000,
            initial_temperature: 1.0,
            cooling_rate: 0.995,
            max_step: 0.25,
            convergence_threshold: 1e-9,
            patience: 200,
            psd_penalty_weight: 10.0,
            boundary_margin: 0.95,
            seed: 42,
        }
    }
}

/// Accuracy calibration job tuning.
#[derive(Debug, Clone)]
pub struct CalibrationConfig {
    pub window_days: i64,
    /// Most recent resolved predictions considered per model
    pub window_size: usize,
    pub min_samples: usize,
    pub min_adjustment: f64,
    pub max_adjustment: f64,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        CalibrationConfig {
            window_days: 30,
            window_size: 500,
            min_samples: 20,
            min_adjustment: 0.5,
            max_adjustment: 1.5,
        }
    }
}

/// Immutable engine configuration, injected into every component.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub domains: Vec<Domain>,
    pub correlation: CorrelationConfig,
    pub transfer: TransferConfig,
    pub optimizer: OptimizerConfig,
    pub calibration: CalibrationConfig,
}

impl EngineConfig {
    pub fn with_domains(domains: Vec<Domain>) -> Self {
        EngineConfig {
            domains,
            correlation: CorrelationConfig::default(),
            transfer: TransferConfig::default(),
            optimizer: OptimizerConfig::default(),
            calibration: CalibrationConfig::default(),
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        let c = &self.correlation;
        if c.min_sample_size < 4 {
            anyhow::bail!("min_sample_size must be at least 4");
        }
        if !(0.0..=1.0).contains(&c.significance_threshold) {
            anyhow::bail!("significance_threshold must be between 0.0 and 1.0");
        }
        if !(0.0..=1.0).contains(&c.low_quality_confidence_penalty) {
            anyhow::bail!("low_quality_confidence_penalty must be between 0.0 and 1.0");
        }

        let t = &self.transfer;
        let weight_sum = t.type_weight + t.pattern_weight + t.temporal_weight;
        if (weight_sum - 1.0).abs() > 1e-6 {
            anyhow::bail!("transfer similarity weights must sum to 1.0 (got {:.4})", weight_sum);
        }
        if t.type_weight < 0.0 || t.pattern_weight < 0.0 || t.temporal_weight < 0.0 {
            anyhow::bail!("transfer similarity weights must be non-negative");
        }
        if !(0.0..=1.0).contains(&t.min_domain_affinity) {
            anyhow::bail!("min_domain_affinity must be between 0.0 and 1.0");
        }
        if !(t.confidence_multiplier > 0.0 && t.confidence_multiplier < 1.0) {
            anyhow::bail!("transfer confidence multiplier must be in (0.0, 1.0)");
        }
        if !(0.0..=1.0).contains(&t.transfer_strength) {
            anyhow::bail!("transfer_strength must be between 0.0 and 1.0");
        }
        if t.max_sources == 0 {
            anyhow::bail!("max_transfer_sources must be positive");
        }
        if !(t.affinity_floor < t.affinity_ceiling)
            || !(t.affinity_floor..=t.affinity_ceiling).contains(&t.default_domain_affinity)
        {
            anyhow::bail!("domain affinity bounds are inconsistent");
        }

        let o = &self.optimizer;
        if !(o.cooling_rate > 0.0 && o.cooling_rate < 1.0) {
            anyhow::bail!("optimizer cooling_rate must be in (0.0, 1.0)");
        }
        if o.initial_temperature <= 0.0 || o.max_step <= 0.0 {
            anyhow::bail!("optimizer temperature and step must be positive");
        }

        let k = &self.calibration;
        if k.window_days <= 0 || k.window_size == 0 {
            anyhow::bail!("calibration window must be positive");
        }
        if !(0.0 < k.min_adjustment && k.min_adjustment <= 1.0 && k.max_adjustment >= 1.0) {
            anyhow::bail!("calibration adjustment bounds must bracket 1.0");
        }
        Ok(())
    }
}

impl Config {
    pub fn parse_domains(&self) -> anyhow::Result<Vec<Domain>> {
        let mut domains = Vec::new();
        for raw in &self.domains {
            let domain: Domain = raw.trim().parse().map_err(anyhow::Error::msg)?;
            if !domains.contains(&domain) {
                domains.push(domain);
            }
        }
        Ok(domains)
    }

    /// Build and validate the immutable engine configuration.
    pub fn engine_config(&self) -> anyhow::Result<EngineConfig> {
        let mut cfg = EngineConfig::with_domains(self.parse_domains()?);
        cfg.correlation.min_sample_size = self.min_sample_size;
        cfg.correlation.significance_threshold = self.significance_threshold;
        cfg.correlation.estimation_timeout = Duration::from_millis(self.estimation_timeout_ms);
        cfg.correlation.transfer_timeout = Duration::from_millis(self.transfer_timeout_ms);
        cfg.correlation.cache_ttl = Duration::from_secs(self.cache_ttl_secs);
        cfg.transfer.min_domain_affinity = self.min_domain_affinity;
        cfg.transfer.confidence_multiplier = self.transfer_confidence_multiplier;
        cfg.transfer.max_sources = self.max_transfer_sources;
        cfg.optimizer.max_iterations = self.optimizer_max_iterations;
        cfg.optimizer.seed = self.optimizer_seed;
        cfg.calibration.window_days = self.calibration_window_days;
        cfg.calibration.min_samples = self.calibration_min_samples;
        cfg.validate()?;
        Ok(cfg)
    }
}
