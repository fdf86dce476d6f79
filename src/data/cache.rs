use dashmap::DashMap;
use std::time::{Duration, Instant};
use crate::data::types::Market;

/// Default lifetime of a cached market snapshot.
pub const DEFAULT_MARKET_TTL: Duration = Duration::from_secs(60);

pub struct MarketCache {
    cache: DashMap<String, CachedMarket>,
    ttl: Duration,
}

struct CachedMarket {
    market: Market,
    timestamp: Instant,
}

impl MarketCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            cache: DashMap::new(),
            ttl,
        }
    }

    pub fn insert(&self, market: Market) {
        self.cache.insert(market.condition_id.clone(), CachedMarket {
            market,
            timestamp: Instant::now(),
        });
    }

    /// Get market if not expired (evict on read)
    pub fn get(&self, condition_id: &str) -> Option<Market> {
        let expired = match self.cache.get(condition_id) {
            Some(entry) if entry.timestamp.elapsed() <= self.ttl => {
                return Some(entry.market.clone());
            }
            Some(_) => true,
            None => false,
        };

        if expired {
            self.cache.remove(condition_id);
        }
        None
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }
}

impl Default for MarketCache {
    fn default() -> Self {
        Self::new(DEFAULT_MARKET_TTL)
    }
}
