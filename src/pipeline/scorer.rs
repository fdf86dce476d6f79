use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, error, info};
use crate::config::ScorerConfig;
use crate::data::clob_api::{MarketDataError, MarketSource};
use crate::data::types::{accuracy, Market, ModelMetrics, ModelStage, Prediction, Token};
use crate::models::ensemble::outcome_label;
use crate::storage::{outcomes_match, PredictionFilter, PredictionStore, StoreError};

/// Price above which a token is treated as the settled winner when
/// no token reports exactly 1.0.
const NEAR_SETTLED_PRICE: f64 = 0.95;

#[derive(Debug, thiserror::Error)]
pub enum ScoreError {
    #[error(transparent)]
    MarketData(#[from] MarketDataError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ScoreSummary {
    pub total: usize,
    pub scored: usize,
    pub correct: usize,
    pub wrong: usize,
    pub still_pending: usize,
    /// Resolutions the store rejected; the predictions stay pending.
    pub failed: usize,
}

/// Winning outcome label of a settled token pair, if any.
///
/// A token priced exactly 1.0 wins; otherwise the first token priced above
/// 0.95. The label is capitalised (`"yes"` becomes `"Yes"`).
pub fn winning_outcome(tokens: &[Token]) -> Option<String> {
    tokens
        .iter()
        .find(|t| t.price == Some(1.0))
        .or_else(|| tokens.iter().find(|t| t.price.is_some_and(|p| p > NEAR_SETTLED_PRICE)))
        .map(|t| capitalize(&t.outcome))
}

/// Resolved outcome of a market, `None` while it is still open or unsettled.
pub fn resolved_outcome(market: &Market) -> Option<String> {
    if !market.closed {
        return None;
    }
    winning_outcome(&market.tokens)
}

fn capitalize(label: &str) -> String {
    let mut chars = label.trim().chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars.flat_map(char::to_lowercase)).collect(),
        None => String::new(),
    }
}

/// Metrics for one stage over a set of resolved predictions.
fn stage_metrics(stage: ModelStage, resolved: &[Prediction], as_of: DateTime<Utc>) -> ModelMetrics {
    let window = |days: i64| {
        let since = as_of - Duration::days(days);
        let (correct, total) = tally(
            stage,
            resolved.iter().filter(|p| p.resolved_at.unwrap_or(p.created_at) >= since),
        );
        accuracy(correct, total)
    };
    let (correct, total) = tally(stage, resolved.iter());

    ModelMetrics {
        model_type: stage,
        total_predictions: total,
        correct_predictions: correct,
        accuracy: accuracy(correct, total),
        accuracy_7d: window(7),
        accuracy_30d: window(30),
    }
}

/// `(correct, total)` of a stage's would-be labels against actual outcomes.
fn tally<'a>(stage: ModelStage, predictions: impl Iterator<Item = &'a Prediction>) -> (u64, u64) {
    predictions.fold((0, 0), |(correct, total), p| match &p.actual_outcome {
        Some(actual) => {
            let hit = outcomes_match(outcome_label(p.confidence(stage)), actual);
            (correct + u64::from(hit), total + 1)
        }
        None => (correct, total),
    })
}

pub struct Scorer {
    source: Arc<dyn MarketSource>,
    store: Arc<dyn PredictionStore>,
    config: ScorerConfig,
}

impl Scorer {
    pub fn new(source: Arc<dyn MarketSource>, store: Arc<dyn PredictionStore>, config: ScorerConfig) -> Self {
        Self { source, store, config }
    }

    /// Resolve pending predictions whose markets have settled.
    pub async fn score_pending(
        &self,
        sport: Option<&str>,
        limit: Option<usize>,
    ) -> Result<ScoreSummary, ScoreError> {
        info!("Fetching pending predictions...");
        let limit = limit.unwrap_or(self.config.limit);
        let pending = self.store.get_predictions(&PredictionFilter::pending(sport, limit)).await?;
        info!("Found {} pending predictions", pending.len());

        let mut summary = ScoreSummary { total: pending.len(), ..ScoreSummary::default() };
        if pending.is_empty() {
            return Ok(summary);
        }

        let wanted: HashSet<&str> = pending.iter().map(|p| p.market_id.as_str()).collect();
        info!("Checking {} unique markets...", wanted.len());
        let lookup: HashMap<String, Market> = self
            .source
            .get_sports_markets(self.config.max_pages)
            .await?
            .into_iter()
            .filter(|m| wanted.contains(m.condition_id.as_str()))
            .map(|m| (m.condition_id.clone(), m))
            .collect();

        let now = Utc::now();
        for prediction in &pending {
            let Some(market) = lookup.get(&prediction.market_id) else {
                debug!("Market {} not found", prediction.market_id);
                summary.still_pending += 1;
                continue;
            };
            let Some(outcome) = resolved_outcome(market) else {
                summary.still_pending += 1;
                continue;
            };
            let Some(id) = prediction.id.as_deref() else {
                summary.still_pending += 1;
                continue;
            };

            match self.store.resolve_prediction(id, &outcome, now).await {
                Ok(Some(resolved)) => {
                    summary.scored += 1;
                    if resolved.is_correct == Some(true) {
                        summary.correct += 1;
                    } else {
                        summary.wrong += 1;
                    }
                    info!(
                        "Scored prediction {}: predicted={}, actual={}, correct={:?}",
                        id, resolved.predicted_outcome, outcome, resolved.is_correct
                    );
                }
                Ok(None) => {
                    debug!("Prediction {} was already resolved", id);
                    summary.still_pending += 1;
                }
                Err(e) => {
                    error!("Failed to resolve prediction {}: {}", id, e);
                    summary.failed += 1;
                }
            }
        }

        info!(
            "Scored {}/{} predictions ({} correct, {} still pending)",
            summary.scored, summary.total, summary.correct, summary.still_pending
        );
        Ok(summary)
    }

    pub async fn update_metrics(&self) -> Result<Vec<ModelMetrics>, ScoreError> {
        self.update_metrics_as_of(Utc::now()).await
    }

    /// Recompute every stage's metrics from all resolved predictions.
    pub async fn update_metrics_as_of(&self, as_of: DateTime<Utc>) -> Result<Vec<ModelMetrics>, ScoreError> {
        info!("Updating model metrics...");
        let resolved = self.store.get_predictions(&PredictionFilter::resolved()).await?;
        if resolved.is_empty() {
            info!("No resolved predictions found");
        }

        let mut metrics = Vec::with_capacity(ModelStage::ALL.len());
        for stage in ModelStage::ALL {
            let m = stage_metrics(stage, &resolved, as_of);
            self.store.upsert_metrics(&m).await?;
            metrics.push(m);
        }

        info!("Updated metrics for {} models", metrics.len());
        Ok(metrics)
    }

    /// Stored metrics per stage, zeroed for stages never computed.
    pub async fn accuracy_summary(&self) -> Result<Vec<ModelMetrics>, ScoreError> {
        let stored = self.store.get_model_metrics().await?;
        Ok(ModelStage::ALL
            .iter()
            .map(|stage| {
                stored
                    .iter()
                    .find(|m| m.model_type == *stage)
                    .cloned()
                    .unwrap_or_else(|| ModelMetrics::empty(*stage))
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::clob_api::fake::StaticMarketSource;
    use crate::data::types::fixtures::{market, prediction};
    use crate::data::types::MarketCacheEntry;
    use crate::storage::SqliteStore;
    use async_trait::async_trait;

    fn token(outcome: &str, price: Option<f64>) -> Token {
        Token { token_id: format!("t-{}", outcome), outcome: outcome.to_string(), price }
    }

    fn settled(id: &str, yes: f64, no: f64) -> Market {
        let mut m = market(id, "NBA: Will the Lakers beat the Celtics?", Some(yes), Some(no));
        m.closed = true;
        m.accepting_orders = false;
        m
    }

    #[test]
    fn test_winning_outcome_examples() {
        assert_eq!(
            winning_outcome(&[token("Yes", Some(1.0)), token("No", Some(0.0))]).as_deref(),
            Some("Yes")
        );
        assert_eq!(
            winning_outcome(&[token("Yes", Some(0.97)), token("No", Some(0.03))]).as_deref(),
            Some("Yes")
        );
        assert_eq!(winning_outcome(&[token("Yes", Some(0.6)), token("No", Some(0.4))]), None);
        assert_eq!(winning_outcome(&[token("Yes", None), token("No", None)]), None);
    }

    #[test]
    fn test_exact_settlement_beats_near_settlement() {
        let tokens = [token("yes", Some(0.96)), token("no", Some(1.0))];
        assert_eq!(winning_outcome(&tokens).as_deref(), Some("No"));

        let tokens = [token("LAKERS", Some(0.99)), token("Celtics", Some(0.98))];
        assert_eq!(winning_outcome(&tokens).as_deref(), Some("Lakers"));
    }

    #[test]
    fn test_open_market_is_never_resolved() {
        let mut m = settled("m1", 1.0, 0.0);
        assert_eq!(resolved_outcome(&m).as_deref(), Some("Yes"));
        m.closed = false;
        assert_eq!(resolved_outcome(&m), None);
    }

    #[test]
    fn test_stage_metrics_use_would_be_labels() {
        let mut a = prediction("m1", "Yes", 0.7, 0.4, 0.6);
        a.actual_outcome = Some("Yes".to_string());
        let mut b = prediction("m2", "No", 0.2, 0.5, 0.5);
        b.actual_outcome = Some("Yes".to_string());
        let now = Utc::now();
        a.resolved_at = Some(now);
        b.resolved_at = Some(now - Duration::days(10));

        let resolved = [a, b];
        let hist = stage_metrics(ModelStage::Historical, &resolved, now);
        assert_eq!((hist.correct_predictions, hist.total_predictions), (1, 2));
        assert_eq!(hist.accuracy, 0.5);
        assert_eq!(hist.accuracy_7d, 1.0);
        assert_eq!(hist.accuracy_30d, 0.5);

        let sent = stage_metrics(ModelStage::Sentiment, &resolved, now);
        assert_eq!(sent.correct_predictions, 0);

        let hybrid = stage_metrics(ModelStage::Hybrid, &resolved, now);
        assert_eq!(hybrid.correct_predictions, 1);
    }

    async fn scorer_with(markets: Vec<Market>) -> (Scorer, Arc<SqliteStore>, Arc<StaticMarketSource>) {
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        let source = Arc::new(StaticMarketSource::new(markets));
        let scorer = Scorer::new(source.clone(), store.clone(), ScorerConfig::default());
        (scorer, store, source)
    }

    #[tokio::test]
    async fn test_score_pending_counts_each_case() {
        let open = market("m3", "NBA: Will the Bulls beat the Heat?", Some(0.6), Some(0.4));
        let (scorer, store, _) = scorer_with(vec![settled("m1", 1.0, 0.0), settled("m2", 0.02, 0.98), open]).await;

        store.save_prediction(&prediction("m1", "Yes", 0.6, 0.6, 0.6)).await.unwrap();
        store.save_prediction(&prediction("m2", "Yes", 0.6, 0.6, 0.6)).await.unwrap();
        store.save_prediction(&prediction("m3", "Yes", 0.6, 0.6, 0.6)).await.unwrap();
        store.save_prediction(&prediction("gone", "No", 0.4, 0.4, 0.4)).await.unwrap();

        let summary = scorer.score_pending(None, None).await.unwrap();
        assert_eq!(
            summary,
            ScoreSummary { total: 4, scored: 2, correct: 1, wrong: 1, still_pending: 2, failed: 0 }
        );
    }

    #[tokio::test]
    async fn test_scoring_twice_is_a_no_op() {
        let (scorer, store, _) = scorer_with(vec![settled("m1", 1.0, 0.0)]).await;
        store.save_prediction(&prediction("m1", "Yes", 0.6, 0.6, 0.6)).await.unwrap();

        let first = scorer.score_pending(None, None).await.unwrap();
        assert_eq!(first.scored, 1);
        let second = scorer.score_pending(None, None).await.unwrap();
        assert_eq!(second, ScoreSummary::default());

        let metrics = scorer.update_metrics().await.unwrap();
        assert!(metrics.iter().all(|m| m.total_predictions == 1));
    }

    #[tokio::test]
    async fn test_prediction_resolves_once_market_settles() {
        let open = market("m1", "NBA: Will the Lakers beat the Celtics?", Some(0.7), Some(0.3));
        let (scorer, store, source) = scorer_with(vec![open]).await;
        store.save_prediction(&prediction("m1", "Yes", 0.6, 0.6, 0.7)).await.unwrap();

        let summary = scorer.score_pending(None, None).await.unwrap();
        assert_eq!((summary.scored, summary.still_pending), (0, 1));

        source.replace(vec![settled("m1", 1.0, 0.0)]);
        let summary = scorer.score_pending(None, None).await.unwrap();
        assert_eq!((summary.scored, summary.correct), (1, 1));
    }

    #[tokio::test]
    async fn test_metrics_recomputation_is_stable() {
        let (scorer, store, _) = scorer_with(vec![settled("m1", 0.0, 1.0), settled("m2", 1.0, 0.0)]).await;
        store.save_prediction(&prediction("m1", "Yes", 0.7, 0.3, 0.6)).await.unwrap();
        store.save_prediction(&prediction("m2", "Yes", 0.7, 0.3, 0.6)).await.unwrap();
        scorer.score_pending(None, None).await.unwrap();

        let as_of = Utc::now();
        let first = scorer.update_metrics_as_of(as_of).await.unwrap();
        let second = scorer.update_metrics_as_of(as_of).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(scorer.accuracy_summary().await.unwrap(), first);
    }

    #[tokio::test]
    async fn test_summary_defaults_to_zeroed_stages() {
        let (scorer, _, _) = scorer_with(Vec::new()).await;
        let summary = scorer.accuracy_summary().await.unwrap();

        let stages: Vec<ModelStage> = summary.iter().map(|m| m.model_type).collect();
        assert_eq!(stages, ModelStage::ALL.to_vec());
        assert!(summary.iter().all(|m| m.total_predictions == 0 && m.accuracy == 0.0));
    }

    #[tokio::test]
    async fn test_sport_filter_limits_pending_set() {
        let (scorer, store, _) = scorer_with(vec![settled("m1", 1.0, 0.0), settled("m2", 1.0, 0.0)]).await;
        let mut nfl = prediction("m2", "Yes", 0.6, 0.6, 0.6);
        nfl.sport = "nfl".to_string();
        store.save_prediction(&prediction("m1", "Yes", 0.6, 0.6, 0.6)).await.unwrap();
        store.save_prediction(&nfl).await.unwrap();

        let summary = scorer.score_pending(Some("nfl"), None).await.unwrap();
        assert_eq!((summary.total, summary.scored), (1, 1));
        let pending = store.get_predictions(&PredictionFilter::pending(None, 10)).await.unwrap();
        assert_eq!(pending[0].market_id, "m1");
    }

    /// Lists pending rows but loses every resolution to another writer.
    struct RacedStore(SqliteStore);

    #[async_trait]
    impl PredictionStore for RacedStore {
        async fn save_prediction(&self, p: &Prediction) -> Result<Prediction, StoreError> {
            self.0.save_prediction(p).await
        }
        async fn get_predictions(&self, filter: &PredictionFilter) -> Result<Vec<Prediction>, StoreError> {
            self.0.get_predictions(filter).await
        }
        async fn resolve_prediction(&self, _: &str, _: &str, _: DateTime<Utc>) -> Result<Option<Prediction>, StoreError> {
            Ok(None)
        }
        async fn upsert_metrics(&self, m: &ModelMetrics) -> Result<(), StoreError> {
            self.0.upsert_metrics(m).await
        }
        async fn get_model_metrics(&self) -> Result<Vec<ModelMetrics>, StoreError> {
            self.0.get_model_metrics().await
        }
        async fn cache_markets(&self, entries: &[MarketCacheEntry]) -> Result<usize, StoreError> {
            self.0.cache_markets(entries).await
        }
        fn backend(&self) -> &'static str {
            "raced"
        }
    }

    #[tokio::test]
    async fn test_lost_resolution_race_stays_accounted() {
        let store = Arc::new(RacedStore(SqliteStore::in_memory().unwrap()));
        store.save_prediction(&prediction("m1", "Yes", 0.6, 0.6, 0.6)).await.unwrap();
        store.save_prediction(&prediction("m2", "Yes", 0.6, 0.6, 0.6)).await.unwrap();
        let source = Arc::new(StaticMarketSource::new(vec![settled("m1", 1.0, 0.0), settled("m2", 0.0, 1.0)]));
        let scorer = Scorer::new(source, store, ScorerConfig::default());

        let summary = scorer.score_pending(None, None).await.unwrap();
        assert_eq!(summary.scored, 0);
        assert_eq!(summary.total, summary.scored + summary.still_pending + summary.failed);
        assert_eq!(summary.still_pending, 2);
    }

    #[tokio::test]
    async fn test_listing_failure_is_a_batch_error() {
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        store.save_prediction(&prediction("m1", "Yes", 0.6, 0.6, 0.6)).await.unwrap();
        let scorer = Scorer::new(Arc::new(StaticMarketSource::failing()), store.clone(), ScorerConfig::default());

        let err = scorer.score_pending(None, None).await.unwrap_err();
        assert!(matches!(err, ScoreError::MarketData(_)));
        assert_eq!(store.get_predictions(&PredictionFilter::pending(None, 10)).await.unwrap().len(), 1);
    }
}
