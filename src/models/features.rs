use std::collections::BTreeMap;
use crate::data::types::Market;

/// Sport label used when no keyword matches.
pub const OTHER_SPORT: &str = "other";

/// Prefix of one-hot sport columns in a feature schema (`sport_nba`, ...).
pub const SPORT_COLUMN_PREFIX: &str = "sport_";

/// Ordered keyword table; the first sport with a matching keyword wins.
pub const SPORT_KEYWORDS: &[(&str, &[&str])] = &[
    ("nba", &["nba", "basketball", "lakers", "celtics", "warriors", "bulls"]),
    ("nfl", &["nfl", "football", "chiefs", "eagles", "cowboys", "patriots"]),
    ("mlb", &["mlb", "baseball", "yankees", "dodgers", "red sox", "cubs"]),
    ("nhl", &["nhl", "hockey", "bruins", "rangers", "penguins", "maple leafs"]),
    ("mma", &["ufc", "mma", "fight", "bellator"]),
    ("soccer", &["soccer", "mls", "premier league", "la liga"]),
];

/// Sports that can be selected as a filter.
pub fn known_sports() -> impl Iterator<Item = &'static str> {
    SPORT_KEYWORDS.iter().map(|(sport, _)| *sport)
}

/// Neutral values used for inputs the live market cannot supply.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureDefaults {
    /// Price assumed for a token without a quote
    pub neutral_price: f64,
    /// Reference point for `market_edge`
    pub fair_odds: f64,
    /// Team win percentage when records are unavailable
    pub neutral_win_pct: f64,
    /// Win/loss counts when records are unavailable
    pub record_count: f64,
}

impl Default for FeatureDefaults {
    fn default() -> Self {
        Self {
            neutral_price: 0.5,
            fair_odds: 0.5,
            neutral_win_pct: 0.5,
            record_count: 0.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FeatureValue {
    Number(f64),
    Flag(bool),
}

impl FeatureValue {
    pub fn as_f64(&self) -> f64 {
        match self {
            FeatureValue::Number(v) => *v,
            FeatureValue::Flag(true) => 1.0,
            FeatureValue::Flag(false) => 0.0,
        }
    }
}

/// Named features for one market.
#[derive(Debug, Clone, PartialEq)]
pub struct MarketFeatures {
    pub market_id: String,
    pub sport: String,
    /// Yes price with the neutral default already applied.
    pub yes_price: f64,
    pub values: BTreeMap<String, FeatureValue>,
}

impl MarketFeatures {
    pub fn get(&self, name: &str) -> Option<FeatureValue> {
        self.values.get(name).copied()
    }

    /// Implied probability of the Yes outcome.
    pub fn yes_price(&self) -> f64 {
        self.yes_price
    }
}

/// Ordered feature names a trained model expects.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FeatureSchema {
    names: Vec<String>,
}

impl FeatureSchema {
    pub fn new(names: Vec<String>) -> Self {
        Self { names }
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Project features onto this schema's column order.
    pub fn to_vector(&self, features: &MarketFeatures) -> Vec<f64> {
        self.names
            .iter()
            .map(|name| match name.strip_prefix(SPORT_COLUMN_PREFIX) {
                Some(sport) => {
                    if sport == features.sport { 1.0 } else { 0.0 }
                }
                None => features.get(name).map(|v| v.as_f64()).unwrap_or(0.0),
            })
            .collect()
    }
}

#[derive(Debug, Clone, Default)]
pub struct FeatureExtractor {
    defaults: FeatureDefaults,
}

impl FeatureExtractor {
    pub fn new(defaults: FeatureDefaults) -> Self {
        Self { defaults }
    }

    pub fn defaults(&self) -> &FeatureDefaults {
        &self.defaults
    }

    /// Detect sport from market question
    pub fn detect_sport(&self, text: &str) -> &'static str {
        let text_lower = text.to_lowercase();

        SPORT_KEYWORDS
            .iter()
            .find(|(_, keywords)| keywords.iter().any(|kw| text_lower.contains(kw)))
            .map(|(sport, _)| *sport)
            .unwrap_or(OTHER_SPORT)
    }

    pub fn extract(&self, market: &Market) -> MarketFeatures {
        let d = &self.defaults;
        let sport = self.detect_sport(&market.question);

        let yes_price = market.yes_price().unwrap_or(d.neutral_price);
        let no_price = market.no_price().unwrap_or(d.neutral_price);

        let mut values = BTreeMap::new();
        let mut put = |name: &str, value: FeatureValue| {
            values.insert(name.to_string(), value);
        };

        put("home_yes_price", FeatureValue::Number(yes_price));
        put("away_yes_price", FeatureValue::Number(no_price));
        put("price_spread", FeatureValue::Number((yes_price - no_price).abs()));
        put("is_home_favorite", FeatureValue::Flag(yes_price > no_price));
        put("market_edge", FeatureValue::Number(yes_price - d.fair_odds));

        // Live team records are not available from market quotes
        put("home_wins", FeatureValue::Number(d.record_count));
        put("home_losses", FeatureValue::Number(d.record_count));
        put("away_wins", FeatureValue::Number(d.record_count));
        put("away_losses", FeatureValue::Number(d.record_count));
        put("home_win_pct", FeatureValue::Number(d.neutral_win_pct));
        put("away_win_pct", FeatureValue::Number(d.neutral_win_pct));
        put("win_pct_diff", FeatureValue::Number(d.neutral_win_pct - d.neutral_win_pct));

        MarketFeatures {
            market_id: market.condition_id.clone(),
            sport: sport.to_string(),
            yes_price,
            values,
        }
    }
}
