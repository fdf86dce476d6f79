//! Three-stage ensemble.
//!
//! The historical and sentiment stages score the market's feature vector;
//! the hybrid stage combines them. Every stage is optional:
//!
//! 1. a meta-learner, when loaded, classifies the stage outputs;
//! 2. with no meta-learner and no stage output at all, the market's own
//!    implied probability is used;
//! 3. otherwise the stage outputs are blended with a fixed weight.
//!
//! A stage that errors at inference time counts as absent for that call.

use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, warn};
use crate::models::artifacts::ProbabilityModel;
use crate::models::features::MarketFeatures;
use crate::models::loader::LoadedModels;

pub const META_FEATURE_COUNT: usize = 6;

/// Confidence reported by a stage that has no model.
pub const NEUTRAL_CONFIDENCE: f64 = 0.5;

pub const YES: &str = "Yes";
pub const NO: &str = "No";

/// Label implied by a confidence. Exactly 0.5 is "No".
pub fn outcome_label(confidence: f64) -> &'static str {
    if confidence > 0.5 { YES } else { NO }
}

pub fn weighted(p_hist: f64, p_sent: f64, weight: f64) -> f64 {
    weight * p_hist + (1.0 - weight) * p_sent
}

pub fn meta_features(p_hist: f64, p_sent: f64) -> [f64; META_FEATURE_COUNT] {
    [
        p_hist,
        p_sent,
        p_hist - p_sent,
        (p_hist + p_sent) / 2.0,
        (p_hist - 0.5).abs(),
        (p_sent - 0.5).abs(),
    ]
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HybridSource {
    MetaLearner,
    MarketPrice,
    WeightedAverage,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EnsembleOutput {
    pub historical: f64,
    pub sentiment: f64,
    pub hybrid: f64,
    pub hybrid_source: HybridSource,
    pub label: &'static str,
}

#[derive(Clone)]
pub struct Ensemble {
    models: Arc<LoadedModels>,
    weight: f64,
}

impl Ensemble {
    pub fn new(models: Arc<LoadedModels>, weight: f64) -> Self {
        Self { models, weight }
    }

    pub fn predict(&self, features: &MarketFeatures) -> EnsembleOutput {
        let vector = self.model_input(features);

        let hist = self.run_stage("historical", self.models.historical.as_deref(), vector.as_deref());
        let sent = self.run_stage("sentiment", self.models.sentiment.as_deref(), vector.as_deref());
        let p_hist = hist.unwrap_or(NEUTRAL_CONFIDENCE);
        let p_sent = sent.unwrap_or(NEUTRAL_CONFIDENCE);

        let meta = self.models.meta_learner.as_deref().and_then(|meta| {
            match meta.predict_probability(&meta_features(p_hist, p_sent)) {
                Ok(p) => Some(p),
                Err(e) => {
                    warn!("Meta-learner error on {}: {}", features.market_id, e);
                    None
                }
            }
        });

        let (hybrid, hybrid_source) = match meta {
            Some(p) => (p, HybridSource::MetaLearner),
            None if hist.is_none() && sent.is_none() => (features.yes_price(), HybridSource::MarketPrice),
            None => (weighted(p_hist, p_sent, self.weight), HybridSource::WeightedAverage),
        };

        debug!(
            "{}: hist={:.3} sent={:.3} hybrid={:.3} ({:?})",
            features.market_id, p_hist, p_sent, hybrid, hybrid_source
        );

        EnsembleOutput {
            historical: p_hist,
            sentiment: p_sent,
            hybrid,
            hybrid_source,
            label: outcome_label(hybrid),
        }
    }

    /// Schema projection, standardised when a scaler was trained.
    /// `None` when no schema is loaded, since no stage can be fed.
    fn model_input(&self, features: &MarketFeatures) -> Option<Vec<f64>> {
        if self.models.schema.is_empty() {
            return None;
        }
        let mut vector = self.models.schema.to_vector(features);
        if let Some(scaler) = &self.models.scaler {
            scaler.transform(&mut vector);
        }
        Some(vector)
    }

    fn run_stage(
        &self,
        stage: &str,
        model: Option<&dyn ProbabilityModel>,
        vector: Option<&[f64]>,
    ) -> Option<f64> {
        let (model, vector) = (model?, vector?);
        match model.predict_probability(vector) {
            Ok(p) => Some(p),
            Err(e) => {
                warn!("{} model ({}) error: {}", stage, model.name(), e);
                None
            }
        }
    }
}
