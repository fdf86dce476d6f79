use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::{Type, Value};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tracing::info;
use crate::data::types::{MarketCacheEntry, ModelMetrics, ModelStage, Prediction};
use crate::storage::{outcomes_match, PredictionFilter, PredictionStore, ResolutionFilter, StoreError};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS predictions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    market_id TEXT NOT NULL,
    sport TEXT NOT NULL,
    event_name TEXT NOT NULL,
    predicted_outcome TEXT NOT NULL,
    historical_confidence REAL NOT NULL DEFAULT 0.0,
    sentiment_confidence REAL NOT NULL DEFAULT 0.0,
    hybrid_confidence REAL NOT NULL DEFAULT 0.0,
    actual_outcome TEXT,
    is_correct INTEGER,
    created_at TEXT NOT NULL,
    resolved_at TEXT
);

CREATE TABLE IF NOT EXISTS model_metrics (
    model_type TEXT PRIMARY KEY,
    total_predictions INTEGER NOT NULL DEFAULT 0,
    correct_predictions INTEGER NOT NULL DEFAULT 0,
    accuracy REAL NOT NULL DEFAULT 0.0,
    accuracy_7d REAL NOT NULL DEFAULT 0.0,
    accuracy_30d REAL NOT NULL DEFAULT 0.0,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS market_cache (
    condition_id TEXT PRIMARY KEY,
    question TEXT NOT NULL,
    sport TEXT,
    end_date TEXT,
    yes_price REAL,
    no_price REAL,
    is_active INTEGER NOT NULL DEFAULT 1,
    last_updated TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_predictions_sport ON predictions(sport);
CREATE INDEX IF NOT EXISTS idx_predictions_created_at ON predictions(created_at);
CREATE INDEX IF NOT EXISTS idx_predictions_actual_outcome ON predictions(actual_outcome);
"#;

const PREDICTION_COLUMNS: &str = "id, market_id, sport, event_name, predicted_outcome, \
    historical_confidence, sentiment_confidence, hybrid_confidence, \
    actual_outcome, is_correct, created_at, resolved_at";

/// Local prediction store; the default when no remote store is configured.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open(db_path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(db_path)?;
        info!("Using local prediction store at {}", db_path.display());
        Self::with_connection(conn)
    }

    pub fn in_memory() -> Result<Self, StoreError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::LockPoisoned)
    }

    fn fetch_by_id(conn: &Connection, id: i64) -> Result<Option<Prediction>, StoreError> {
        let sql = format!("SELECT {} FROM predictions WHERE id = ?1", PREDICTION_COLUMNS);
        Ok(conn.query_row(&sql, params![id], prediction_from_row).optional()?)
    }
}

fn timestamp(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(idx: usize, s: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn prediction_from_row(row: &Row<'_>) -> rusqlite::Result<Prediction> {
    let id: i64 = row.get(0)?;
    let created_at: String = row.get(10)?;
    let resolved_at: Option<String> = row.get(11)?;

    Ok(Prediction {
        id: Some(id.to_string()),
        market_id: row.get(1)?,
        sport: row.get(2)?,
        event_name: row.get(3)?,
        predicted_outcome: row.get(4)?,
        historical_confidence: row.get(5)?,
        sentiment_confidence: row.get(6)?,
        hybrid_confidence: row.get(7)?,
        actual_outcome: row.get(8)?,
        is_correct: row.get(9)?,
        created_at: parse_timestamp(10, &created_at)?,
        resolved_at: resolved_at.map(|s| parse_timestamp(11, &s)).transpose()?,
    })
}

fn metrics_from_row(row: &Row<'_>) -> rusqlite::Result<ModelMetrics> {
    let model_type: String = row.get(0)?;
    let stage = ModelStage::parse(&model_type).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            0,
            Type::Text,
            format!("unknown model type {}", model_type).into(),
        )
    })?;
    let total: i64 = row.get(1)?;
    let correct: i64 = row.get(2)?;

    Ok(ModelMetrics {
        model_type: stage,
        total_predictions: total as u64,
        correct_predictions: correct as u64,
        accuracy: row.get(3)?,
        accuracy_7d: row.get(4)?,
        accuracy_30d: row.get(5)?,
    })
}

#[async_trait]
impl PredictionStore for SqliteStore {
    async fn save_prediction(&self, prediction: &Prediction) -> Result<Prediction, StoreError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO predictions (market_id, sport, event_name, predicted_outcome,
                historical_confidence, sentiment_confidence, hybrid_confidence,
                actual_outcome, is_correct, created_at, resolved_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                prediction.market_id,
                prediction.sport,
                prediction.event_name,
                prediction.predicted_outcome,
                prediction.historical_confidence,
                prediction.sentiment_confidence,
                prediction.hybrid_confidence,
                prediction.actual_outcome,
                prediction.is_correct,
                timestamp(&prediction.created_at),
                prediction.resolved_at.as_ref().map(timestamp),
            ],
        )?;

        let mut saved = prediction.clone();
        saved.id = Some(conn.last_insert_rowid().to_string());
        Ok(saved)
    }

    async fn get_predictions(&self, filter: &PredictionFilter) -> Result<Vec<Prediction>, StoreError> {
        let mut sql = format!("SELECT {} FROM predictions WHERE 1 = 1", PREDICTION_COLUMNS);
        let mut values: Vec<Value> = Vec::new();

        if let Some(sport) = &filter.sport {
            values.push(Value::Text(sport.clone()));
            sql.push_str(&format!(" AND sport = ?{}", values.len()));
        }
        match filter.resolution {
            ResolutionFilter::All => {}
            ResolutionFilter::Pending => sql.push_str(" AND actual_outcome IS NULL"),
            ResolutionFilter::Resolved => sql.push_str(" AND actual_outcome IS NOT NULL"),
        }
        sql.push_str(" ORDER BY created_at ASC, id ASC");
        if let Some(limit) = filter.limit {
            values.push(Value::Integer(limit as i64));
            sql.push_str(&format!(" LIMIT ?{}", values.len()));
        }

        let conn = self.conn()?;
        let mut stmt = conn.prepare(&sql)?;
        let predictions = stmt.query_map(params_from_iter(values), prediction_from_row)?;

        predictions.collect::<Result<Vec<_>, _>>().map_err(|e| e.into())
    }

    async fn resolve_prediction(
        &self,
        id: &str,
        actual_outcome: &str,
        resolved_at: DateTime<Utc>,
    ) -> Result<Option<Prediction>, StoreError> {
        let Ok(row_id) = id.parse::<i64>() else {
            return Ok(None);
        };

        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        let predicted: Option<String> = tx
            .query_row(
                "SELECT predicted_outcome FROM predictions WHERE id = ?1 AND actual_outcome IS NULL",
                params![row_id],
                |row| row.get(0),
            )
            .optional()?;
        let Some(predicted) = predicted else {
            return Ok(None);
        };

        let is_correct = outcomes_match(&predicted, actual_outcome);
        tx.execute(
            "UPDATE predictions
             SET actual_outcome = ?1, is_correct = ?2, resolved_at = ?3
             WHERE id = ?4 AND actual_outcome IS NULL",
            params![actual_outcome, is_correct, timestamp(&resolved_at), row_id],
        )?;
        let resolved = Self::fetch_by_id(&tx, row_id)?;
        tx.commit()?;

        Ok(resolved)
    }

    async fn upsert_metrics(&self, metrics: &ModelMetrics) -> Result<(), StoreError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO model_metrics (model_type, total_predictions, correct_predictions,
                accuracy, accuracy_7d, accuracy_30d, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(model_type) DO UPDATE SET
                total_predictions = excluded.total_predictions,
                correct_predictions = excluded.correct_predictions,
                accuracy = excluded.accuracy,
                accuracy_7d = excluded.accuracy_7d,
                accuracy_30d = excluded.accuracy_30d,
                updated_at = excluded.updated_at",
            params![
                metrics.model_type.as_str(),
                metrics.total_predictions as i64,
                metrics.correct_predictions as i64,
                metrics.accuracy,
                metrics.accuracy_7d,
                metrics.accuracy_30d,
                timestamp(&Utc::now()),
            ],
        )?;
        Ok(())
    }

    async fn get_model_metrics(&self) -> Result<Vec<ModelMetrics>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT model_type, total_predictions, correct_predictions, accuracy, accuracy_7d, accuracy_30d
             FROM model_metrics
             ORDER BY model_type",
        )?;
        let metrics = stmt.query_map([], metrics_from_row)?;

        metrics.collect::<Result<Vec<_>, _>>().map_err(|e| e.into())
    }

    async fn cache_markets(&self, entries: &[MarketCacheEntry]) -> Result<usize, StoreError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let now = timestamp(&Utc::now());
        for entry in entries {
            tx.execute(
                "INSERT INTO market_cache (condition_id, question, sport, end_date, yes_price, no_price, is_active, last_updated)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                 ON CONFLICT(condition_id) DO UPDATE SET
                    question = excluded.question,
                    sport = excluded.sport,
                    end_date = excluded.end_date,
                    yes_price = excluded.yes_price,
                    no_price = excluded.no_price,
                    is_active = excluded.is_active,
                    last_updated = excluded.last_updated",
                params![
                    entry.condition_id,
                    entry.question,
                    entry.sport,
                    entry.end_date.as_ref().map(timestamp),
                    entry.yes_price,
                    entry.no_price,
                    entry.is_active,
                    now,
                ],
            )?;
        }
        tx.commit()?;
        Ok(entries.len())
    }

    fn backend(&self) -> &'static str {
        "sqlite"
    }
}
