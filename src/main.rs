use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::Parser;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

mod config;
mod db;
mod engine;
mod error;
mod tracking;

use config::{Command, Config, EngineConfig};
use db::models::{Domain, Factor, Observation};
use db::{CorrelationStore, Database};
use engine::{CorrelationEngine, FactorPrediction, MatrixOptions, TransferLearningAdapter};
use tracking::{AccuracyFilter, AccuracyTracker, PredictionRequest};

/// Wired-up engine components sharing one store.
struct App {
    db: Database,
    engine: CorrelationEngine,
    tracker: AccuracyTracker,
}

impl App {
    fn new(db: Database, config: &EngineConfig) -> Self {
        let store: Arc<dyn CorrelationStore> = Arc::new(db.clone());
        let transfer = Arc::new(TransferLearningAdapter::new(
            store.clone(),
            config.domains.clone(),
            config.transfer.clone(),
        ));
        let engine = CorrelationEngine::new(
            store.clone(),
            Arc::new(db.clone()),
            transfer.clone(),
            config.correlation.clone(),
            config.optimizer.clone(),
        );
        let tracker = AccuracyTracker::new(store, transfer, config.calibration.clone());
        App { db, engine, tracker }
    }
}

/// One line of an observation import file.
#[derive(Debug, Deserialize)]
struct ObservationRecord {
    event_id: String,
    factor: String,
    /// `sport/league`
    domain: String,
    value: f64,
    observed_at: Option<DateTime<Utc>>,
}

#[derive(Serialize)]
struct JointOutput<'a> {
    #[serde(flatten)]
    joint: &'a engine::JointProbability,
    #[serde(skip_serializing_if = "Option::is_none")]
    tracking_id: Option<String>,
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let raw = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("parsing {}", path.display()))
}

fn parse_domain(raw: &str) -> Result<Domain> {
    raw.parse().map_err(anyhow::Error::msg)
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialise tracing / logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = Config::parse();
    let engine_config = config.engine_config()?;

    let db = Database::open(&config.database_path)?;
    info!(
        "Database opened: {} ({} configured domain(s))",
        config.database_path,
        engine_config.domains.len()
    );
    let app = App::new(db, &engine_config);

    match config.command {
        Command::Matrix {
            domain,
            factors,
            calculate_if_missing,
        } => {
            let domain = parse_domain(&domain)?;
            let factors: Vec<Factor> = factors.iter().map(|k| Factor::new(k, domain.clone())).collect();
            let matrix = app
                .engine
                .get_correlation_matrix(&factors, &domain, MatrixOptions { calculate_if_missing })
                .await?;
            print_json(&*matrix)?;
        }
        Command::Joint { domain, input, track } => {
            let domain = parse_domain(&domain)?;
            let predictions: Vec<FactorPrediction> = read_json(&input)?;
            let joint = app
                .engine
                .calculate_multi_factor_probability(&predictions, &domain)
                .await?;
            let tracking_id = match track {
                Some(model) => {
                    let factors = predictions.iter().map(|p| p.factor.clone()).collect();
                    let request = PredictionRequest::from_joint(factors, domain, &model, &joint);
                    Some(app.tracker.track_prediction(request).await?.tracking_id)
                }
                None => None,
            };
            print_json(&JointOutput {
                joint: &joint,
                tracking_id,
            })?;
        }
        Command::History {
            domain,
            factor_a,
            factor_b,
        } => {
            let domain = parse_domain(&domain)?;
            let factors = [
                app.db.get_factor(&factor_a, &domain)?,
                app.db.get_factor(&factor_b, &domain)?,
            ];
            let history = app.db.edge_history(&factor_a, &factor_b, &domain)?;
            print_json(&serde_json::json!({
                "factors": factors,
                "versions": history,
            }))?;
        }
        Command::Track {
            domain,
            factors,
            probability,
            confidence,
            model,
            calculation_method,
        } => {
            let prediction = app
                .tracker
                .track_prediction(PredictionRequest {
                    factors,
                    domain: parse_domain(&domain)?,
                    model,
                    probability,
                    confidence,
                    calculation_method,
                    transfer_sources: Vec::new(),
                })
                .await?;
            print_json(&prediction)?;
        }
        Command::Outcome {
            tracking_id,
            correct,
            details,
        } => {
            let prediction = app
                .tracker
                .record_outcome(&tracking_id, correct, details.as_deref())
                .await?;
            print_json(&prediction)?;
        }
        Command::Accuracy { domain, model } => {
            let filter = AccuracyFilter {
                domain: domain.as_deref().map(parse_domain).transpose()?,
                model,
            };
            print_json(&app.tracker.calculate_accuracy(&filter).await?)?;
        }
        Command::Calibrate => {
            let summary = app.tracker.run_full_model_calibration().await?;
            app.engine.invalidate_cache();
            print_json(&summary)?;
        }
        Command::ImportObservations { input } => {
            let records: Vec<ObservationRecord> = read_json(&input)?;
            let mut imported = 0usize;
            for record in records {
                let domain = parse_domain(&record.domain)?;
                app.db.register_factor(&Factor::new(&record.factor, domain.clone()))?;
                app.db.insert_observation(&Observation {
                    event_id: record.event_id,
                    factor: record.factor.trim().to_string(),
                    domain,
                    value: record.value,
                    observed_at: record.observed_at.unwrap_or_else(Utc::now),
                })?;
                imported += 1;
            }
            info!("Imported {} observation(s) from {}", imported, input.display());
        }
        Command::Run { interval_secs } => {
            info!("Calibration loop started (every {}s)", interval_secs);
            let mut interval = tokio::time::interval(Duration::from_secs(interval_secs.max(1)));
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        match app.tracker.run_full_model_calibration().await {
                            Ok(_) => app.engine.invalidate_cache(),
                            Err(e) if e.is_retryable() => warn!("Calibration run failed, will retry: {}", e),
                            Err(e) => error!("Calibration run failed: {}", e),
                        }
                    }
                    _ = tokio::signal::ctrl_c() => {
                        info!("Shutdown requested, stopping calibration loop");
                        break;
                    }
                }
            }
        }
    }

    Ok(())
}
