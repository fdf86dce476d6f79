use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use crate::config::PredictorConfig;
use crate::data::clob_api::{MarketDataError, MarketSource};
use crate::data::types::{truncate_event_name, Market, MarketCacheEntry, Prediction};
use crate::models::ensemble::Ensemble;
use crate::models::features::{FeatureExtractor, OTHER_SPORT};
use crate::storage::PredictionStore;

/// Outcome of one prediction batch.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PredictionRun {
    pub predictions: Vec<Prediction>,
    /// Markets considered after filtering and the cap.
    pub attempted: usize,
    pub predicted: usize,
    /// Markets outside the supported sports.
    pub skipped: usize,
    /// Malformed markets and predictions that could not be persisted.
    pub failed: usize,
    pub saved: usize,
}

#[derive(Debug, Clone, Default)]
pub struct PredictionRequest {
    pub sport: Option<String>,
    pub max_markets: Option<usize>,
    pub save: bool,
}

pub struct Predictor {
    source: Arc<dyn MarketSource>,
    store: Arc<dyn PredictionStore>,
    extractor: FeatureExtractor,
    ensemble: Ensemble,
    config: PredictorConfig,
}

impl Predictor {
    pub fn new(
        source: Arc<dyn MarketSource>,
        store: Arc<dyn PredictionStore>,
        extractor: FeatureExtractor,
        ensemble: Ensemble,
        config: PredictorConfig,
    ) -> Self {
        Self { source, store, extractor, ensemble, config }
    }

    /// Fetch open sports markets, predict each and optionally persist.
    ///
    /// Only the market listing can fail the batch. Everything that goes
    /// wrong for a single market is logged and counted in the result.
    pub async fn run(&self, request: &PredictionRequest) -> Result<PredictionRun, MarketDataError> {
        info!("Fetching current sports markets...");
        let markets = self.source.get_sports_markets(self.config.max_pages).await?;
        let candidates = self.select_markets(markets, request);
        info!("Found {} active markets", candidates.len());

        let mut run = PredictionRun {
            attempted: candidates.len(),
            ..PredictionRun::default()
        };
        let mut scored_markets = Vec::new();

        for market in &candidates {
            if let Err(reason) = check_market(market) {
                warn!("Skipping malformed market {}: {}", market.condition_id, reason);
                run.failed += 1;
                continue;
            }

            let Some(prediction) = self.predict_market(market) else {
                debug!("No supported sport in: {}", market.question);
                run.skipped += 1;
                continue;
            };

            let prediction = if request.save {
                match self.store.save_prediction(&prediction).await {
                    Ok(saved) => {
                        run.saved += 1;
                        saved
                    }
                    Err(e) => {
                        error!("Error saving prediction for {}: {}", market.condition_id, e);
                        run.failed += 1;
                        continue;
                    }
                }
            } else {
                prediction
            };

            scored_markets.push(MarketCacheEntry::from_market(market, &prediction.sport));
            run.predictions.push(prediction);
        }
        run.predicted = run.predictions.len();

        if request.save && !scored_markets.is_empty() {
            if let Err(e) = self.store.cache_markets(&scored_markets).await {
                warn!("Failed to cache market snapshots: {}", e);
            }
        }

        info!(
            "Generated {} predictions ({} saved, {} skipped, {} failed)",
            run.predicted, run.saved, run.skipped, run.failed
        );
        Ok(run)
    }

    /// Predict a single market. `None` when its sport is not recognised.
    pub fn predict_market(&self, market: &Market) -> Option<Prediction> {
        let features = self.extractor.extract(market);
        if features.sport == OTHER_SPORT {
            return None;
        }

        let output = self.ensemble.predict(&features);

        Some(Prediction {
            id: None,
            market_id: market.condition_id.clone(),
            sport: features.sport,
            event_name: truncate_event_name(&market.question),
            predicted_outcome: output.label.to_string(),
            historical_confidence: output.historical,
            sentiment_confidence: output.sentiment,
            hybrid_confidence: output.hybrid,
            actual_outcome: None,
            is_correct: None,
            created_at: Utc::now(),
            resolved_at: None,
        })
    }

    /// Tradable markets, narrowed to one sport if requested, capped.
    fn select_markets(&self, markets: Vec<Market>, request: &PredictionRequest) -> Vec<Market> {
        let sport = request.sport.as_deref().map(str::to_lowercase);
        let cap = request.max_markets.unwrap_or(self.config.max_markets);

        markets
            .into_iter()
            .filter(|m| m.accepting_orders)
            .filter(|m| match &sport {
                Some(sport) => self.extractor.detect_sport(&m.question) == sport,
                None => true,
            })
            .take(cap)
            .collect()
    }
}

fn check_market(market: &Market) -> Result<(), String> {
    if market.condition_id.is_empty() {
        return Err("missing condition id".to_string());
    }
    if market.tokens.len() != 2 {
        return Err(format!("expected 2 outcome tokens, got {}", market.tokens.len()));
    }
    if let Some(price) = market.tokens.iter().filter_map(|t| t.price).find(|p| !(0.0..=1.0).contains(p)) {
        return Err(format!("token price {} outside [0, 1]", price));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::clob_api::fake::StaticMarketSource;
    use crate::data::types::fixtures::market;
    use crate::models::loader::LoadedModels;
    use crate::storage::{PredictionFilter, SqliteStore, StoreError};
    use async_trait::async_trait;
    use chrono::DateTime;
    use crate::data::types::ModelMetrics;

    fn predictor_with(markets: Vec<Market>, store: Arc<dyn PredictionStore>) -> Predictor {
        Predictor::new(
            Arc::new(StaticMarketSource::new(markets).with_page_size(2)),
            store,
            FeatureExtractor::default(),
            Ensemble::new(Arc::new(LoadedModels::default()), 0.5),
            PredictorConfig::default(),
        )
    }

    fn sample_markets() -> Vec<Market> {
        let mut closed = market("m3", "NBA: Will the Lakers beat the Warriors?", Some(0.5), Some(0.5));
        closed.accepting_orders = false;

        vec![
            market("m1", "NBA: Will the Lakers beat the Celtics?", Some(0.8), Some(0.2)),
            market("m2", "NFL: Will the Chiefs win the Super Bowl?", Some(0.3), Some(0.7)),
            closed,
            market("m4", "Sports: Will it rain at the Open?", Some(0.6), Some(0.4)),
            market("m5", "NBA: Will the Celtics beat the Knicks?", Some(0.5), Some(0.5)),
        ]
    }

    #[tokio::test]
    async fn test_run_preserves_order_and_counts() {
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        let predictor = predictor_with(sample_markets(), store.clone());

        let run = predictor.run(&PredictionRequest { save: true, ..Default::default() }).await.unwrap();

        let ids: Vec<&str> = run.predictions.iter().map(|p| p.market_id.as_str()).collect();
        assert_eq!(ids, vec!["m1", "m2", "m5"]);
        assert_eq!(run.attempted, 4);
        assert_eq!(run.predicted, 3);
        assert_eq!(run.skipped, 1);
        assert_eq!(run.failed, 0);
        assert_eq!(run.saved, 3);
        assert!(run.predictions.iter().all(|p| p.id.is_some()));

        // Zero-model path: hybrid is the market price, tie goes to "No"
        assert_eq!(run.predictions[0].hybrid_confidence, 0.8);
        assert_eq!(run.predictions[0].predicted_outcome, "Yes");
        assert_eq!(run.predictions[2].predicted_outcome, "No");

        let stored = store.get_predictions(&PredictionFilter::default()).await.unwrap();
        assert_eq!(stored.len(), 3);
    }

    #[tokio::test]
    async fn test_sport_filter_and_cap() {
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        let predictor = predictor_with(sample_markets(), store.clone());

        let request = PredictionRequest { sport: Some("NBA".to_string()), max_markets: Some(1), save: false };
        let run = predictor.run(&request).await.unwrap();

        assert_eq!(run.attempted, 1);
        assert_eq!(run.predictions[0].market_id, "m1");
        assert_eq!(run.saved, 0);
        assert!(run.predictions[0].id.is_none());
        assert!(store.get_predictions(&PredictionFilter::default()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_running_twice_creates_independent_records() {
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        let markets = vec![market("m1", "NBA: Will the Lakers beat the Celtics?", Some(0.8), Some(0.2))];
        let predictor = predictor_with(markets, store.clone());
        let request = PredictionRequest { save: true, ..Default::default() };

        predictor.run(&request).await.unwrap();
        predictor.run(&request).await.unwrap();

        let stored = store.get_predictions(&PredictionFilter::default()).await.unwrap();
        assert_eq!(stored.len(), 2);
        assert_ne!(stored[0].id, stored[1].id);
    }

    #[tokio::test]
    async fn test_malformed_market_does_not_abort_batch() {
        let mut broken = market("m0", "NBA: Will the Bulls beat the Heat?", Some(1.7), Some(0.2));
        broken.tokens.truncate(1);
        let markets = vec![broken, market("m1", "NBA: Will the Lakers beat the Celtics?", Some(0.8), Some(0.2))];
        let predictor = predictor_with(markets, Arc::new(SqliteStore::in_memory().unwrap()));

        let run = predictor.run(&PredictionRequest::default()).await.unwrap();
        assert_eq!(run.failed, 1);
        assert_eq!(run.predicted, 1);
    }

    struct RejectingStore;

    #[async_trait]
    impl PredictionStore for RejectingStore {
        async fn save_prediction(&self, _: &Prediction) -> Result<Prediction, StoreError> {
            Err(StoreError::Remote { status: 500, body: "down".to_string() })
        }
        async fn get_predictions(&self, _: &PredictionFilter) -> Result<Vec<Prediction>, StoreError> {
            Ok(Vec::new())
        }
        async fn resolve_prediction(&self, _: &str, _: &str, _: DateTime<Utc>) -> Result<Option<Prediction>, StoreError> {
            Ok(None)
        }
        async fn upsert_metrics(&self, _: &ModelMetrics) -> Result<(), StoreError> {
            Ok(())
        }
        async fn get_model_metrics(&self) -> Result<Vec<ModelMetrics>, StoreError> {
            Ok(Vec::new())
        }
        async fn cache_markets(&self, _: &[MarketCacheEntry]) -> Result<usize, StoreError> {
            Ok(0)
        }
        fn backend(&self) -> &'static str {
            "rejecting"
        }
    }

    #[tokio::test]
    async fn test_persistence_failure_is_counted() {
        let predictor = predictor_with(sample_markets(), Arc::new(RejectingStore));

        let run = predictor.run(&PredictionRequest { save: true, ..Default::default() }).await.unwrap();
        assert_eq!(run.failed, 3);
        assert_eq!(run.saved, 0);
        assert!(run.predictions.is_empty());
    }

    #[tokio::test]
    async fn test_listing_failure_fails_the_batch() {
        let predictor = Predictor::new(
            Arc::new(StaticMarketSource::failing()),
            Arc::new(SqliteStore::in_memory().unwrap()),
            FeatureExtractor::default(),
            Ensemble::new(Arc::new(LoadedModels::default()), 0.5),
            PredictorConfig::default(),
        );

        let err = predictor.run(&PredictionRequest::default()).await.unwrap_err();
        assert!(matches!(err, MarketDataError::RetriesExhausted { .. }));
    }

    #[test]
    fn test_predict_market_truncates_event_name() {
        let predictor = predictor_with(Vec::new(), Arc::new(SqliteStore::in_memory().unwrap()));
        let long_question = format!("NBA: {}", "x".repeat(300));
        let prediction = predictor.predict_market(&market("m1", &long_question, Some(0.8), Some(0.2))).unwrap();

        assert_eq!(prediction.event_name.chars().count(), 200);
        assert_eq!(prediction.sport, "nba");
        assert_eq!(prediction.hybrid_confidence, 0.8);
    }
}
