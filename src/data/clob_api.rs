use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, info, warn};
use crate::config::MarketDataConfig;
use crate::data::cache::MarketCache;
use crate::data::types::{Market, Token};

/// Cursor the CLOB API returns on the last page.
const END_CURSOR: &str = "LTE=";

pub const DEFAULT_PAGE_SIZE: usize = 100;

#[derive(Debug, thiserror::Error)]
pub enum MarketDataError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Unexpected status {status} from {url}")]
    Status { url: String, status: u16 },

    #[error("Market not found: {0}")]
    NotFound(String),

    #[error("Request to {url} failed after {attempts} attempts: {last_error}")]
    RetriesExhausted {
        url: String,
        attempts: u32,
        last_error: String,
    },
}

/// One page of the market listing.
#[derive(Debug, Clone, Default)]
pub struct MarketsPage {
    pub markets: Vec<Market>,
    pub next_cursor: Option<String>,
}

/// Read side of the market-data provider.
#[async_trait]
pub trait MarketSource: Send + Sync {
    async fn get_markets(
        &self,
        cursor: Option<&str>,
        limit: usize,
    ) -> Result<MarketsPage, MarketDataError>;

    async fn get_market_by_id(&self, condition_id: &str) -> Result<Option<Market>, MarketDataError>;

    fn page_size(&self) -> usize {
        DEFAULT_PAGE_SIZE
    }

    /// Page through the listing, stopping at the last page or after `max_pages`.
    async fn get_all_markets(&self, max_pages: usize) -> Result<Vec<Market>, MarketDataError> {
        let mut all_markets = Vec::new();
        let mut cursor: Option<String> = None;

        for page in 0..max_pages {
            debug!("Fetching markets page {}...", page + 1);
            let response = self.get_markets(cursor.as_deref(), self.page_size()).await?;
            all_markets.extend(response.markets);

            match response.next_cursor {
                Some(next) if !next.is_empty() && next != END_CURSOR => cursor = Some(next),
                _ => break,
            }
        }

        info!("Fetched {} total markets", all_markets.len());
        Ok(all_markets)
    }

    /// Sports markets only, soonest end date first (undated markets last).
    async fn get_sports_markets(&self, max_pages: usize) -> Result<Vec<Market>, MarketDataError> {
        let all_markets = self.get_all_markets(max_pages).await?;

        let mut sports_markets: Vec<Market> = all_markets
            .into_iter()
            .filter(|m| m.is_sports_market())
            .collect();
        sports_markets.sort_by_key(|m| (m.end_date.is_none(), m.end_date));

        info!("Found {} sports markets", sports_markets.len());
        Ok(sports_markets)
    }
}

pub struct ClobApiClient {
    client: Client,
    base_url: String,
    max_retries: u32,
    retry_base_delay: Duration,
    page_size: usize,
    cache: MarketCache,
}

#[derive(Debug, Deserialize)]
struct ClobToken {
    #[serde(default)]
    token_id: String,
    #[serde(default)]
    outcome: String,
    #[serde(default)]
    price: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct ClobMarket {
    #[serde(default)]
    condition_id: String,
    #[serde(default)]
    question_id: String,
    #[serde(default)]
    question: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    market_slug: Option<String>,
    #[serde(default)]
    end_date_iso: Option<String>,
    #[serde(default)]
    game_start_time: Option<String>,
    #[serde(default)]
    tokens: Vec<ClobToken>,
    #[serde(default = "default_true")]
    active: bool,
    #[serde(default)]
    closed: bool,
    #[serde(default = "default_true")]
    accepting_orders: bool,
    #[serde(default)]
    tags: Option<Vec<String>>,
}

fn default_true() -> bool { true }

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ClobMarketsResponse {
    Paged {
        #[serde(default)]
        data: Vec<serde_json::Value>,
        #[serde(default)]
        next_cursor: Option<String>,
    },
    List(Vec<serde_json::Value>),
}

impl ClobApiClient {
    pub fn new(base_url: String, config: &MarketDataConfig) -> Result<Self, MarketDataError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            max_retries: config.max_retries.max(1),
            retry_base_delay: Duration::from_millis(config.retry_base_delay_ms),
            page_size: config.page_size,
            cache: MarketCache::default(),
        })
    }

    /// GET with bounded retries; the delay doubles after each failed attempt.
    async fn get_json<T: DeserializeOwned>(
        &self,
        url: &str,
        query: &[(&str, String)],
    ) -> Result<T, MarketDataError> {
        let mut delay = self.retry_base_delay;
        let mut last_error = String::new();

        for attempt in 1..=self.max_retries {
            match self.get_once(url, query).await {
                Ok(value) => return Ok(value),
                Err(MarketDataError::NotFound(id)) => return Err(MarketDataError::NotFound(id)),
                Err(e) => {
                    warn!(
                        "Request failed (attempt {}/{}): {}",
                        attempt, self.max_retries, e
                    );
                    last_error = e.to_string();
                    if attempt < self.max_retries {
                        tokio::time::sleep(delay).await;
                        delay *= 2;
                    }
                }
            }
        }

        Err(MarketDataError::RetriesExhausted {
            url: url.to_string(),
            attempts: self.max_retries,
            last_error,
        })
    }

    async fn get_once<T: DeserializeOwned>(
        &self,
        url: &str,
        query: &[(&str, String)],
    ) -> Result<T, MarketDataError> {
        let response = self.client
            .get(url)
            .header("Accept", "application/json")
            .query(query)
            .send()
            .await?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(MarketDataError::NotFound(url.to_string()));
        }
        if !status.is_success() {
            return Err(MarketDataError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }

        Ok(response.json().await?)
    }
}

#[async_trait]
impl MarketSource for ClobApiClient {
    async fn get_markets(
        &self,
        cursor: Option<&str>,
        limit: usize,
    ) -> Result<MarketsPage, MarketDataError> {
        let url = format!("{}/markets", self.base_url);
        let mut query = vec![("limit", limit.to_string())];
        if let Some(cursor) = cursor {
            query.push(("next_cursor", cursor.to_string()));
        }

        let response: ClobMarketsResponse = self.get_json(&url, &query).await?;
        let (items, next_cursor) = match response {
            ClobMarketsResponse::Paged { data, next_cursor } => (data, next_cursor),
            ClobMarketsResponse::List(items) => (items, None),
        };

        let markets = items
            .into_iter()
            .filter_map(|item| match serde_json::from_value::<ClobMarket>(item) {
                Ok(raw) => Some(convert_clob_market(raw)),
                Err(e) => {
                    warn!("Failed to parse market: {}", e);
                    None
                }
            })
            .collect();

        Ok(MarketsPage { markets, next_cursor })
    }

    async fn get_market_by_id(&self, condition_id: &str) -> Result<Option<Market>, MarketDataError> {
        if let Some(market) = self.cache.get(condition_id) {
            return Ok(Some(market));
        }

        let url = format!("{}/markets/{}", self.base_url, condition_id);
        match self.get_json::<ClobMarket>(&url, &[]).await {
            Ok(raw) => {
                let market = convert_clob_market(raw);
                self.cache.insert(market.clone());
                Ok(Some(market))
            }
            Err(MarketDataError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn page_size(&self) -> usize {
        self.page_size
    }
}

/// Convert CLOB API market format to our internal Market type
fn convert_clob_market(raw: ClobMarket) -> Market {
    let end_date = raw.end_date_iso
        .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
        .map(|dt| dt.with_timezone(&Utc));

    let tokens = raw.tokens
        .into_iter()
        .map(|t| Token {
            token_id: t.token_id,
            outcome: t.outcome,
            // The CLOB reports a zero price for tokens it has no quote for
            price: t.price.filter(|p| *p != 0.0),
        })
        .collect();

    Market {
        condition_id: raw.condition_id,
        question_id: raw.question_id,
        question: raw.question,
        description: raw.description.unwrap_or_default(),
        market_slug: raw.market_slug.unwrap_or_default(),
        end_date,
        game_start_time: raw.game_start_time,
        tokens,
        active: raw.active,
        closed: raw.closed,
        accepting_orders: raw.accepting_orders,
        tags: raw.tags.unwrap_or_default(),
    }
}
