pub mod sqlite;
pub mod supabase;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use crate::data::types::{MarketCacheEntry, ModelMetrics, Prediction};

pub use sqlite::SqliteStore;
pub use supabase::SupabaseStore;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Remote store request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Remote store returned {status}: {body}")]
    Remote { status: u16, body: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Store connection lock poisoned")]
    LockPoisoned,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResolutionFilter {
    #[default]
    All,
    Pending,
    Resolved,
}

/// Selection over stored predictions, oldest first.
#[derive(Debug, Clone, Default)]
pub struct PredictionFilter {
    pub sport: Option<String>,
    pub resolution: ResolutionFilter,
    pub limit: Option<usize>,
}

impl PredictionFilter {
    pub fn pending(sport: Option<&str>, limit: usize) -> Self {
        Self {
            sport: sport.map(str::to_string),
            resolution: ResolutionFilter::Pending,
            limit: Some(limit),
        }
    }

    pub fn resolved() -> Self {
        Self {
            resolution: ResolutionFilter::Resolved,
            ..Self::default()
        }
    }
}

/// Outcome labels compare case- and whitespace-insensitively.
pub fn outcomes_match(predicted: &str, actual: &str) -> bool {
    predicted.trim().to_lowercase() == actual.trim().to_lowercase()
}

#[async_trait]
pub trait PredictionStore: Send + Sync {
    /// Insert a new prediction and return it with its assigned id.
    async fn save_prediction(&self, prediction: &Prediction) -> Result<Prediction, StoreError>;

    async fn get_predictions(&self, filter: &PredictionFilter) -> Result<Vec<Prediction>, StoreError>;

    /// Record the actual outcome of a still-unresolved prediction.
    ///
    /// Returns `None` when the id is unknown or the prediction was already
    /// resolved; the stored record is left untouched in both cases.
    async fn resolve_prediction(
        &self,
        id: &str,
        actual_outcome: &str,
        resolved_at: DateTime<Utc>,
    ) -> Result<Option<Prediction>, StoreError>;

    async fn upsert_metrics(&self, metrics: &ModelMetrics) -> Result<(), StoreError>;

    async fn get_model_metrics(&self) -> Result<Vec<ModelMetrics>, StoreError>;

    async fn cache_markets(&self, entries: &[MarketCacheEntry]) -> Result<usize, StoreError>;

    fn backend(&self) -> &'static str;
}
