use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, info, warn};
use crate::data::types::{MarketCacheEntry, ModelMetrics, ModelStage, Prediction};
use crate::storage::{
    outcomes_match, PredictionFilter, PredictionStore, ResolutionFilter, SqliteStore, StoreError,
};

/// Prefix for ids of records that were written to the local fallback.
const LOCAL_ID_PREFIX: &str = "local_";

/// Prediction store backed by a Supabase (PostgREST) project.
///
/// Writes and reads that fail remotely are served by the local store
/// instead, so a run never loses its predictions to a network error.
pub struct SupabaseStore {
    client: Client,
    rest_url: String,
    key: String,
    local: SqliteStore,
}

#[derive(Debug, Deserialize)]
struct PredictionRow {
    id: Option<Value>,
    market_id: String,
    #[serde(default)]
    sport: String,
    #[serde(default)]
    event_name: String,
    predicted_outcome: String,
    #[serde(default)]
    historical_confidence: f64,
    #[serde(default)]
    sentiment_confidence: f64,
    #[serde(default)]
    hybrid_confidence: f64,
    actual_outcome: Option<String>,
    is_correct: Option<bool>,
    created_at: DateTime<Utc>,
    resolved_at: Option<DateTime<Utc>>,
}

impl From<PredictionRow> for Prediction {
    fn from(row: PredictionRow) -> Self {
        let id = row.id.map(|id| match id {
            Value::String(s) => s,
            other => other.to_string(),
        });
        Prediction {
            id,
            market_id: row.market_id,
            sport: row.sport,
            event_name: row.event_name,
            predicted_outcome: row.predicted_outcome,
            historical_confidence: row.historical_confidence,
            sentiment_confidence: row.sentiment_confidence,
            hybrid_confidence: row.hybrid_confidence,
            actual_outcome: row.actual_outcome,
            is_correct: row.is_correct,
            created_at: row.created_at,
            resolved_at: row.resolved_at,
        }
    }
}

#[derive(Debug, Deserialize)]
struct MetricsRow {
    model_type: ModelStage,
    #[serde(default)]
    total_predictions: u64,
    #[serde(default)]
    correct_predictions: u64,
    #[serde(default)]
    accuracy: Option<f64>,
    #[serde(default)]
    accuracy_7d: f64,
    #[serde(default)]
    accuracy_30d: f64,
}

impl From<MetricsRow> for ModelMetrics {
    fn from(row: MetricsRow) -> Self {
        let accuracy = row.accuracy.unwrap_or_else(|| {
            crate::data::types::accuracy(row.correct_predictions, row.total_predictions)
        });
        ModelMetrics {
            model_type: row.model_type,
            total_predictions: row.total_predictions,
            correct_predictions: row.correct_predictions,
            accuracy,
            accuracy_7d: row.accuracy_7d,
            accuracy_30d: row.accuracy_30d,
        }
    }
}

fn localize(mut prediction: Prediction) -> Prediction {
    prediction.id = prediction.id.map(|id| format!("{}{}", LOCAL_ID_PREFIX, id));
    prediction
}

impl SupabaseStore {
    pub fn new(url: &str, key: &str, timeout: Duration, local: SqliteStore) -> Result<Self, StoreError> {
        let client = Client::builder().timeout(timeout).build()?;
        info!("Using Supabase prediction store at {}", url);

        Ok(Self {
            client,
            rest_url: format!("{}/rest/v1", url.trim_end_matches('/')),
            key: key.to_string(),
            local,
        })
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        request
            .header("apikey", &self.key)
            .header("Authorization", format!("Bearer {}", self.key))
            .header("Accept", "application/json")
    }

    async fn check(response: Response) -> Result<Response, StoreError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(StoreError::Remote { status: status.as_u16(), body })
    }

    async fn rows<T: DeserializeOwned>(response: Response) -> Result<Vec<T>, StoreError> {
        Ok(Self::check(response).await?.json().await?)
    }

    async fn insert_remote(&self, prediction: &Prediction) -> Result<Prediction, StoreError> {
        let body = json!({
            "market_id": prediction.market_id,
            "sport": prediction.sport,
            "event_name": prediction.event_name,
            "predicted_outcome": prediction.predicted_outcome,
            "historical_confidence": prediction.historical_confidence,
            "sentiment_confidence": prediction.sentiment_confidence,
            "hybrid_confidence": prediction.hybrid_confidence,
            "actual_outcome": prediction.actual_outcome,
            "is_correct": prediction.is_correct,
            "created_at": prediction.created_at,
            "resolved_at": prediction.resolved_at,
        });
        let response = self
            .authorized(self.client.post(format!("{}/predictions", self.rest_url)))
            .header("Prefer", "return=representation")
            .json(&body)
            .send()
            .await?;

        let rows: Vec<PredictionRow> = Self::rows(response).await?;
        let mut saved = prediction.clone();
        saved.id = rows.into_iter().next().and_then(|row| Prediction::from(row).id);
        Ok(saved)
    }

    async fn select_remote(&self, filter: &PredictionFilter) -> Result<Vec<Prediction>, StoreError> {
        let mut query = vec![
            ("select", "*".to_string()),
            ("order", "created_at.asc".to_string()),
        ];
        if let Some(sport) = &filter.sport {
            query.push(("sport", format!("eq.{}", sport)));
        }
        match filter.resolution {
            ResolutionFilter::All => {}
            ResolutionFilter::Pending => query.push(("actual_outcome", "is.null".to_string())),
            ResolutionFilter::Resolved => query.push(("actual_outcome", "not.is.null".to_string())),
        }
        if let Some(limit) = filter.limit {
            query.push(("limit", limit.to_string()));
        }

        let response = self
            .authorized(self.client.get(format!("{}/predictions", self.rest_url)))
            .query(&query)
            .send()
            .await?;
        let rows: Vec<PredictionRow> = Self::rows(response).await?;
        Ok(rows.into_iter().map(Prediction::from).collect())
    }

    async fn resolve_remote(
        &self,
        id: &str,
        actual_outcome: &str,
        resolved_at: DateTime<Utc>,
    ) -> Result<Option<Prediction>, StoreError> {
        let guard = [
            ("id", format!("eq.{}", id)),
            ("actual_outcome", "is.null".to_string()),
        ];
        let url = format!("{}/predictions", self.rest_url);

        let response = self
            .authorized(self.client.get(&url))
            .query(&guard)
            .query(&[("select", "*")])
            .send()
            .await?;
        let pending: Vec<PredictionRow> = Self::rows(response).await?;
        let Some(pending) = pending.into_iter().next() else {
            return Ok(None);
        };

        // The PATCH carries the same guard, so a concurrent resolution wins and this one is a no-op
        let body = json!({
            "actual_outcome": actual_outcome,
            "is_correct": outcomes_match(&pending.predicted_outcome, actual_outcome),
            "resolved_at": resolved_at,
        });
        let response = self
            .authorized(self.client.patch(&url))
            .query(&guard)
            .header("Prefer", "return=representation")
            .json(&body)
            .send()
            .await?;
        let updated: Vec<PredictionRow> = Self::rows(response).await?;
        Ok(updated.into_iter().next().map(Prediction::from))
    }

    async fn upsert_remote(&self, table: &str, conflict: &str, body: Value) -> Result<(), StoreError> {
        let response = self
            .authorized(self.client.post(format!("{}/{}", self.rest_url, table)))
            .query(&[("on_conflict", conflict)])
            .header("Prefer", "resolution=merge-duplicates,return=minimal")
            .json(&body)
            .send()
            .await?;
        Self::check(response).await?;
        Ok(())
    }
}

#[async_trait]
impl PredictionStore for SupabaseStore {
    async fn save_prediction(&self, prediction: &Prediction) -> Result<Prediction, StoreError> {
        match self.insert_remote(prediction).await {
            Ok(saved) => {
                debug!("Saved prediction to Supabase: {:?}", saved.id);
                Ok(saved)
            }
            Err(e) => {
                warn!("Failed to save to Supabase, keeping it locally: {}", e);
                Ok(localize(self.local.save_prediction(prediction).await?))
            }
        }
    }

    async fn get_predictions(&self, filter: &PredictionFilter) -> Result<Vec<Prediction>, StoreError> {
        let remote = match self.select_remote(filter).await {
            Ok(predictions) => predictions,
            Err(e) => {
                warn!("Failed to fetch from Supabase, reading local store: {}", e);
                Vec::new()
            }
        };

        // Rows saved locally while Supabase was unreachable stay visible until resolved
        let local = self.local.get_predictions(filter).await?;
        if !local.is_empty() {
            debug!("Merging {} locally stored predictions", local.len());
        }

        let mut merged: Vec<Prediction> = remote.into_iter().chain(local.into_iter().map(localize)).collect();
        merged.sort_by_key(|p| p.created_at);
        if let Some(limit) = filter.limit {
            merged.truncate(limit);
        }
        Ok(merged)
    }

    async fn resolve_prediction(
        &self,
        id: &str,
        actual_outcome: &str,
        resolved_at: DateTime<Utc>,
    ) -> Result<Option<Prediction>, StoreError> {
        if let Some(local_id) = id.strip_prefix(LOCAL_ID_PREFIX) {
            let resolved = self.local.resolve_prediction(local_id, actual_outcome, resolved_at).await?;
            return Ok(resolved.map(localize));
        }
        self.resolve_remote(id, actual_outcome, resolved_at).await
    }

    async fn upsert_metrics(&self, metrics: &ModelMetrics) -> Result<(), StoreError> {
        let body = json!({
            "model_type": metrics.model_type,
            "total_predictions": metrics.total_predictions,
            "correct_predictions": metrics.correct_predictions,
            "accuracy_7d": metrics.accuracy_7d,
            "accuracy_30d": metrics.accuracy_30d,
            "updated_at": Utc::now(),
        });
        if let Err(e) = self.upsert_remote("model_metrics", "model_type", body).await {
            warn!("Failed to update metrics in Supabase, keeping them locally: {}", e);
            self.local.upsert_metrics(metrics).await?;
        }
        Ok(())
    }

    async fn get_model_metrics(&self) -> Result<Vec<ModelMetrics>, StoreError> {
        let response = async {
            let response = self
                .authorized(self.client.get(format!("{}/model_metrics", self.rest_url)))
                .query(&[("select", "*")])
                .send()
                .await?;
            Self::rows::<MetricsRow>(response).await
        }
        .await;

        match response {
            Ok(rows) => Ok(rows.into_iter().map(ModelMetrics::from).collect()),
            Err(e) => {
                warn!("Failed to fetch metrics from Supabase, reading local store: {}", e);
                self.local.get_model_metrics().await
            }
        }
    }

    async fn cache_markets(&self, entries: &[MarketCacheEntry]) -> Result<usize, StoreError> {
        if entries.is_empty() {
            return Ok(0);
        }
        let now = Utc::now();
        let body: Vec<Value> = entries
            .iter()
            .map(|entry| {
                json!({
                    "condition_id": entry.condition_id,
                    "question": entry.question,
                    "sport": entry.sport,
                    "end_date": entry.end_date,
                    "yes_price": entry.yes_price,
                    "no_price": entry.no_price,
                    "is_active": entry.is_active,
                    "last_updated": now,
                })
            })
            .collect();

        if let Err(e) = self.upsert_remote("market_cache", "condition_id", Value::Array(body)).await {
            warn!("Failed to cache markets in Supabase, keeping them locally: {}", e);
            return self.local.cache_markets(entries).await;
        }
        Ok(entries.len())
    }

    fn backend(&self) -> &'static str {
        "supabase"
    }
}
