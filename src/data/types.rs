use serde::{Deserialize, Serialize};
use chrono::{DateTime, Utc};
use std::fmt;

/// Tags (and question substrings) that mark a market as sports-related.
pub const SPORTS_TAGS: &[&str] = &[
    "sports", "nba", "nfl", "mlb", "nhl", "soccer", "football", "basketball",
    "baseball", "hockey", "tennis", "golf", "mma", "ufc", "boxing", "f1",
    "racing", "olympics", "esports",
];

/// Maximum stored length of a prediction's event name.
pub const EVENT_NAME_MAX_CHARS: usize = 200;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Token {
    pub token_id: String,
    pub outcome: String,
    pub price: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Market {
    pub condition_id: String,
    pub question_id: String,
    pub question: String,
    pub description: String,
    pub market_slug: String,
    pub end_date: Option<DateTime<Utc>>,
    pub game_start_time: Option<String>,
    pub tokens: Vec<Token>,
    pub active: bool,
    pub closed: bool,
    pub accepting_orders: bool,
    pub tags: Vec<String>,
}

impl Market {
    /// Price of the token labelled `outcome` (case-insensitive).
    pub fn price_of(&self, outcome: &str) -> Option<f64> {
        self.tokens
            .iter()
            .find(|t| t.outcome.eq_ignore_ascii_case(outcome))
            .and_then(|t| t.price)
    }

    pub fn yes_price(&self) -> Option<f64> {
        self.price_of("yes")
    }

    pub fn no_price(&self) -> Option<f64> {
        self.price_of("no")
    }

    /// Sports markets are recognised by tag or by a sports keyword in the question.
    pub fn is_sports_market(&self) -> bool {
        let tags_lower: Vec<String> = self.tags.iter().map(|t| t.to_lowercase()).collect();
        let question_lower = self.question.to_lowercase();

        SPORTS_TAGS.iter().any(|tag| {
            tags_lower.iter().any(|t| t == tag) || question_lower.contains(tag)
        })
    }
}

/// One of the three inference paths whose accuracy is tracked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelStage {
    Historical,
    Sentiment,
    Hybrid,
}

impl ModelStage {
    pub const ALL: [ModelStage; 3] = [ModelStage::Historical, ModelStage::Sentiment, ModelStage::Hybrid];

    pub fn as_str(&self) -> &'static str {
        match self {
            ModelStage::Historical => "historical",
            ModelStage::Sentiment => "sentiment",
            ModelStage::Hybrid => "hybrid",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "historical" => Some(ModelStage::Historical),
            "sentiment" => Some(ModelStage::Sentiment),
            "hybrid" => Some(ModelStage::Hybrid),
            _ => None,
        }
    }
}

impl fmt::Display for ModelStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    pub id: Option<String>,
    pub market_id: String,
    pub sport: String,
    pub event_name: String,
    pub predicted_outcome: String,
    pub historical_confidence: f64,
    pub sentiment_confidence: f64,
    pub hybrid_confidence: f64,
    pub actual_outcome: Option<String>,
    pub is_correct: Option<bool>,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

impl Prediction {
    /// Stored confidence for a given stage.
    pub fn confidence(&self, stage: ModelStage) -> f64 {
        match stage {
            ModelStage::Historical => self.historical_confidence,
            ModelStage::Sentiment => self.sentiment_confidence,
            ModelStage::Hybrid => self.hybrid_confidence,
        }
    }
}

/// Truncate a market question to the stored event-name length without
/// splitting a multi-byte character.
pub fn truncate_event_name(question: &str) -> String {
    question.chars().take(EVENT_NAME_MAX_CHARS).collect()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelMetrics {
    pub model_type: ModelStage,
    pub total_predictions: u64,
    pub correct_predictions: u64,
    pub accuracy: f64,
    pub accuracy_7d: f64,
    pub accuracy_30d: f64,
}

impl ModelMetrics {
    pub fn empty(model_type: ModelStage) -> Self {
        Self {
            model_type,
            total_predictions: 0,
            correct_predictions: 0,
            accuracy: 0.0,
            accuracy_7d: 0.0,
            accuracy_30d: 0.0,
        }
    }
}

/// `correct / total`, or 0.0 for an empty window.
pub fn accuracy(correct: u64, total: u64) -> f64 {
    if total > 0 {
        correct as f64 / total as f64
    } else {
        0.0
    }
}

/// Snapshot of a scored market kept alongside the predictions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketCacheEntry {
    pub condition_id: String,
    pub question: String,
    pub sport: String,
    pub end_date: Option<DateTime<Utc>>,
    pub yes_price: Option<f64>,
    pub no_price: Option<f64>,
    pub is_active: bool,
}

impl MarketCacheEntry {
    pub fn from_market(market: &Market, sport: &str) -> Self {
        Self {
            condition_id: market.condition_id.clone(),
            question: market.question.clone(),
            sport: sport.to_string(),
            end_date: market.end_date,
            yes_price: market.yes_price(),
            no_price: market.no_price(),
            is_active: market.active && !market.closed,
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use super::fixtures::market;

    #[test]
    fn test_yes_no_prices_case_insensitive() {
        let mut m = market("m1", "Lakers vs Celtics", Some(0.65), Some(0.35));
        m.tokens[0].outcome = "YES".to_string();
        assert_eq!(m.yes_price(), Some(0.65));
        assert_eq!(m.no_price(), Some(0.35));
    }

    #[test]
    fn test_is_sports_market_by_tag_or_question() {
        let mut m = market("m1", "Will it rain in London?", None, None);
        assert!(!m.is_sports_market());

        m.tags = vec!["NBA".to_string()];
        assert!(m.is_sports_market());

        let m = market("m2", "Will the NFL season start on time?", None, None);
        assert!(m.is_sports_market());
    }

    #[test]
    fn test_truncate_event_name_is_char_safe() {
        let long = "é".repeat(250);
        let truncated = truncate_event_name(&long);
        assert_eq!(truncated.chars().count(), EVENT_NAME_MAX_CHARS);

        assert_eq!(truncate_event_name("short"), "short");
    }

    #[test]
    fn test_accuracy_zero_total() {
        assert_eq!(accuracy(0, 0), 0.0);
        assert_eq!(accuracy(3, 4), 0.75);
    }

    #[test]
    fn test_model_stage_round_trip_names() {
        for stage in ModelStage::ALL {
            assert_eq!(ModelStage::parse(stage.as_str()), Some(stage));
        }
        assert_eq!(serde_json::to_string(&ModelStage::Hybrid).unwrap(), "\"hybrid\"");
    }
}
