use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;
use crate::data::types::{ModelMetrics, Prediction};
use crate::models::loader::ModelStatus;
use crate::pipeline::predictor::PredictionRun;
use crate::pipeline::scorer::ScoreSummary;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportKind {
    Predictions,
    Scoring,
    Summary,
}

impl ReportKind {
    /// File name of the cached copy served to API consumers.
    pub fn cache_file(&self) -> &'static str {
        match self {
            ReportKind::Predictions => "predictions.json",
            ReportKind::Scoring => "scoring_results.json",
            ReportKind::Summary => "accuracy_summary.json",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PredictionReport {
    pub success: bool,
    pub count: usize,
    pub attempted: usize,
    pub skipped: usize,
    pub failed: usize,
    pub saved: usize,
    pub models: ModelStatus,
    pub store: &'static str,
    pub predictions: Vec<Prediction>,
    pub timestamp: DateTime<Utc>,
}

impl PredictionReport {
    pub fn new(mut run: PredictionRun, models: ModelStatus, store: &'static str) -> Self {
        sort_for_display(&mut run.predictions);
        Self {
            success: true,
            count: run.predicted,
            attempted: run.attempted,
            skipped: run.skipped,
            failed: run.failed,
            saved: run.saved,
            models,
            store,
            predictions: run.predictions,
            timestamp: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ScoringReport {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub results: Option<ScoreSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_metrics: Option<Vec<ModelMetrics>>,
    pub accuracy: Vec<ModelMetrics>,
    pub timestamp: DateTime<Utc>,
}

/// Report for a run whose batch could not complete.
#[derive(Debug, Clone, Serialize)]
pub struct FailureReport {
    pub success: bool,
    pub error: String,
    pub timestamp: DateTime<Utc>,
}

impl FailureReport {
    pub fn new(error: &anyhow::Error) -> Self {
        Self { success: false, error: format!("{:#}", error), timestamp: Utc::now() }
    }
}

/// Most decisive predictions first: largest `|hybrid - 0.5|`.
pub fn sort_for_display(predictions: &mut [Prediction]) {
    predictions.sort_by(|a, b| {
        let conviction = |p: &Prediction| (p.hybrid_confidence - 0.5).abs();
        conviction(b).total_cmp(&conviction(a))
    });
}

/// Writes run results as pretty JSON.
pub struct ReportWriter {
    api_cache_dir: PathBuf,
}

impl ReportWriter {
    pub fn new(api_cache_dir: impl Into<PathBuf>) -> Self {
        Self { api_cache_dir: api_cache_dir.into() }
    }

    /// Write `report` to `output` if given, otherwise to stdout, and always
    /// to the API cache.
    pub fn publish<T: Serialize>(&self, kind: ReportKind, report: &T, output: Option<&Path>) -> Result<String> {
        let json = serde_json::to_string_pretty(report)?;

        match output {
            Some(path) => {
                write_file(path, &json)?;
                info!("Results saved to {}", path.display());
            }
            None => println!("{}", json),
        }

        let cache_file = self.api_cache_dir.join(kind.cache_file());
        write_file(&cache_file, &json)?;
        info!("Cached to {}", cache_file.display());

        Ok(json)
    }
}

fn write_file(path: &Path, contents: &str) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    fs::write(path, contents).with_context(|| format!("writing {}", path.display()))
}
