//! Predict, settle, score and measure against one in-memory store.

use std::sync::Arc;
use crate::config::{PredictorConfig, ScorerConfig};
use crate::data::clob_api::fake::StaticMarketSource;
use crate::data::types::fixtures::market;
use crate::data::types::{Market, ModelStage};
use crate::models::ensemble::Ensemble;
use crate::models::features::FeatureExtractor;
use crate::models::loader::LoadedModels;
use crate::pipeline::predictor::{PredictionRequest, Predictor};
use crate::pipeline::scorer::Scorer;
use crate::storage::{PredictionFilter, PredictionStore, SqliteStore};

const QUESTION: &str = "NBA: Will the Lakers beat the Celtics?";

fn settled(yes: f64, no: f64) -> Market {
    let mut m = market("m1", QUESTION, Some(yes), Some(no));
    m.closed = true;
    m.accepting_orders = false;
    m
}

#[tokio::test]
async fn test_market_price_prediction_is_scored_and_measured() {
    let store = Arc::new(SqliteStore::in_memory().unwrap());
    let source = Arc::new(StaticMarketSource::new(vec![market("m1", QUESTION, Some(0.8), Some(0.2))]));

    let predictor = Predictor::new(
        source.clone(),
        store.clone(),
        FeatureExtractor::default(),
        Ensemble::new(Arc::new(LoadedModels::default()), 0.5),
        PredictorConfig::default(),
    );
    let run = predictor.run(&PredictionRequest { save: true, ..Default::default() }).await.unwrap();

    let prediction = &run.predictions[0];
    assert_eq!(prediction.hybrid_confidence, 0.8);
    assert_eq!(prediction.predicted_outcome, "Yes");
    assert!(prediction.actual_outcome.is_none());

    source.replace(vec![settled(1.0, 0.0)]);
    let scorer = Scorer::new(source.clone(), store.clone(), ScorerConfig::default());
    let summary = scorer.score_pending(None, None).await.unwrap();
    assert_eq!((summary.scored, summary.correct, summary.wrong), (1, 1, 0));

    let resolved = store.get_predictions(&PredictionFilter::resolved()).await.unwrap();
    assert_eq!(resolved.len(), 1);
    assert_eq!(resolved[0].actual_outcome.as_deref(), Some("Yes"));
    assert_eq!(resolved[0].is_correct, Some(true));
    assert!(resolved[0].resolved_at.is_some());

    let metrics = scorer.update_metrics().await.unwrap();
    let hybrid = metrics.iter().find(|m| m.model_type == ModelStage::Hybrid).unwrap();
    assert_eq!((hybrid.total_predictions, hybrid.correct_predictions), (1, 1));
    assert_eq!(hybrid.accuracy, 1.0);
    assert_eq!(hybrid.accuracy_7d, 1.0);

    // Absent stage models reported a neutral 0.5, which reads as "No"
    let historical = metrics.iter().find(|m| m.model_type == ModelStage::Historical).unwrap();
    assert_eq!((historical.total_predictions, historical.correct_predictions), (1, 0));
    assert_eq!(historical.accuracy, 0.0);

    // A second scoring pass finds nothing left and leaves the metrics unchanged
    let again = scorer.score_pending(None, None).await.unwrap();
    assert_eq!(again.total, 0);
    let recomputed = scorer.update_metrics().await.unwrap();
    assert_eq!(
        recomputed.iter().map(|m| (m.total_predictions, m.correct_predictions)).collect::<Vec<_>>(),
        metrics.iter().map(|m| (m.total_predictions, m.correct_predictions)).collect::<Vec<_>>()
    );
}
