use anyhow::{Context, Result};
use clap::builder::PossibleValuesParser;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::Level;

use sports_picker::config::{Config, EnvConfig};
use sports_picker::data::clob_api::{ClobApiClient, MarketSource};
use sports_picker::models::ensemble::Ensemble;
use sports_picker::models::features::{known_sports, FeatureExtractor};
use sports_picker::models::loader::ModelLoader;
use sports_picker::monitoring::report::{
    FailureReport, PredictionReport, ReportKind, ReportWriter, ScoringReport,
};
use sports_picker::pipeline::predictor::{PredictionRequest, Predictor};
use sports_picker::pipeline::scorer::Scorer;
use sports_picker::storage::{PredictionStore, SqliteStore, SupabaseStore};

#[derive(Debug, Parser)]
#[command(name = "sports-picker", version, about = "Predict and score sports prediction markets")]
struct Cli {
    /// Only consider markets for this sport
    #[arg(long, value_parser = PossibleValuesParser::new(known_sports()))]
    sport: Option<String>,

    /// Maximum markets to predict, or predictions to score
    #[arg(long, visible_alias = "max")]
    limit: Option<usize>,

    /// Don't persist predictions
    #[arg(long)]
    no_save: bool,

    /// Score pending predictions instead of predicting
    #[arg(long)]
    score: bool,

    /// Recompute rolling accuracy metrics
    #[arg(long)]
    update_metrics: bool,

    /// Show the stored accuracy summary only
    #[arg(long)]
    summary: bool,

    /// Write the JSON result here instead of stdout
    #[arg(long)]
    output: Option<PathBuf>,

    #[arg(long, default_value = "config.toml")]
    config: String,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,
}

impl Cli {
    fn report_kind(&self) -> ReportKind {
        if self.summary {
            ReportKind::Summary
        } else if self.score || self.update_metrics {
            ReportKind::Scoring
        } else {
            ReportKind::Predictions
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Logs go to stderr; stdout carries the JSON result
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_max_level(if cli.debug { Level::DEBUG } else { Level::INFO })
        .init();

    let config = Config::load_or_default(&cli.config)?;
    let env_config = EnvConfig::load()?;
    let writer = ReportWriter::new(&config.output.api_cache_dir);
    let kind = cli.report_kind();

    match execute(&cli, &config, &env_config, &writer, kind).await {
        Ok(()) => Ok(()),
        Err(e) => {
            tracing::error!("Run failed: {:#}", e);
            writer.publish(kind, &FailureReport::new(&e), cli.output.as_deref())?;
            Err(e)
        }
    }
}

async fn execute(
    cli: &Cli,
    config: &Config,
    env_config: &EnvConfig,
    writer: &ReportWriter,
    kind: ReportKind,
) -> Result<()> {
    let store = open_store(config, env_config)?;
    let source: Arc<dyn MarketSource> = Arc::new(
        ClobApiClient::new(env_config.clob_api_url.clone(), &config.market_data)
            .context("building market-data client")?,
    );
    let output = cli.output.as_deref();

    match kind {
        ReportKind::Summary => {
            let scorer = Scorer::new(source, store, config.scorer.clone());
            let report = ScoringReport {
                success: true,
                results: None,
                updated_metrics: None,
                accuracy: scorer.accuracy_summary().await?,
                timestamp: chrono::Utc::now(),
            };
            writer.publish(kind, &report, output)?;
        }
        ReportKind::Scoring => {
            let scorer = Scorer::new(source, store, config.scorer.clone());

            let results = if cli.score {
                tracing::info!("Scoring pending predictions...");
                Some(scorer.score_pending(cli.sport.as_deref(), cli.limit).await?)
            } else {
                None
            };
            let updated_metrics = if cli.update_metrics {
                tracing::info!("Updating rolling metrics...");
                Some(scorer.update_metrics().await?)
            } else {
                None
            };

            let report = ScoringReport {
                success: true,
                results,
                updated_metrics,
                accuracy: scorer.accuracy_summary().await?,
                timestamp: chrono::Utc::now(),
            };
            writer.publish(kind, &report, output)?;
        }
        ReportKind::Predictions => {
            let mut loader = ModelLoader::new(&config.models);
            if !loader.load_all() {
                tracing::warn!(
                    "No trained models found; falling back to market-based predictions"
                );
            }
            let status = loader.status();
            let ensemble = Ensemble::new(Arc::new(loader.into_models()), config.predictor.hybrid_weight);

            let backend = store.backend();
            let predictor = Predictor::new(
                source,
                store,
                FeatureExtractor::default(),
                ensemble,
                config.predictor.clone(),
            );
            let request = PredictionRequest {
                sport: cli.sport.clone(),
                max_markets: cli.limit,
                save: !cli.no_save,
            };
            tracing::info!("Running predictions (sport={:?}, limit={:?})...", request.sport, request.max_markets);

            let run = predictor.run(&request).await?;
            writer.publish(kind, &PredictionReport::new(run, status, backend), output)?;
        }
    }

    Ok(())
}

/// Supabase when credentials are configured, the local database otherwise.
fn open_store(config: &Config, env_config: &EnvConfig) -> Result<Arc<dyn PredictionStore>> {
    let local = SqliteStore::open(&config.storage.database_path)
        .with_context(|| format!("opening {}", config.storage.database_path.display()))?;

    match env_config.supabase() {
        Some((url, key)) => {
            let timeout = Duration::from_secs(config.market_data.request_timeout_secs);
            Ok(Arc::new(SupabaseStore::new(url, key, timeout, local)?))
        }
        None => {
            tracing::info!("Supabase not configured, using local storage");
            Ok(Arc::new(local))
        }
    }
}
