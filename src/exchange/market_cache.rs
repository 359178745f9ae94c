// =============================================================================
// Market list TTL cache — stale-serve on refresh failure
// =============================================================================
//
// The market list changes rarely but every scanner needs it on every tick.
// Entries are cached for five minutes; when a refresh fails the previous
// snapshot keeps being served so scanners never stall on an exchange outage.
// =============================================================================

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::exchange::client::ExchangeClient;
use crate::exchange::error::ExchangeError;
use crate::types::Market;

/// How long a fetched market list stays fresh.
pub const MARKET_LIST_TTL: Duration = Duration::from_secs(300);

struct CachedList {
    markets: Vec<Market>,
    fetched_at: Instant,
}

pub struct MarketCache {
    client: Arc<ExchangeClient>,
    cached: RwLock<Option<CachedList>>,
    ttl: Duration,
}

impl MarketCache {
    pub fn new(client: Arc<ExchangeClient>) -> Self {
        Self::with_ttl(client, MARKET_LIST_TTL)
    }

    pub fn with_ttl(client: Arc<ExchangeClient>, ttl: Duration) -> Self {
        Self {
            client,
            cached: RwLock::new(None),
            ttl,
        }
    }

    /// Current market list. Serves the cache while fresh; on expiry tries a
    /// refresh and falls back to the stale snapshot if the exchange is down.
    pub async fn markets(&self) -> Result<Vec<Market>, ExchangeError> {
        if let Some(fresh) = self.fresh_snapshot() {
            return Ok(fresh);
        }

        match self.client.list_markets().await {
            Ok(Some(markets)) => {
                debug!(count = markets.len(), "market list refreshed");
                *self.cached.write() = Some(CachedList {
                    markets: markets.clone(),
                    fetched_at: Instant::now(),
                });
                Ok(markets)
            }
            Ok(None) => self.stale_or(ExchangeError::Decode("empty market list".into())),
            Err(e) => {
                warn!(error = %e, "market list refresh failed — serving stale cache");
                self.stale_or(e)
            }
        }
    }

    /// KRW-quoted markets without an exchange warning flag — the scanners'
    /// default universe.
    pub async fn tradable_krw_markets(&self) -> Result<Vec<Market>, ExchangeError> {
        let markets = self.markets().await?;
        Ok(markets
            .into_iter()
            .filter(|m| m.market.starts_with("KRW-") && !m.warning)
            .collect())
    }

    /// Inject a snapshot directly (tests and warm-start).
    pub fn prime(&self, markets: Vec<Market>) {
        *self.cached.write() = Some(CachedList {
            markets,
            fetched_at: Instant::now(),
        });
    }

    fn fresh_snapshot(&self) -> Option<Vec<Market>> {
        let guard = self.cached.read();
        let entry = guard.as_ref()?;
        (entry.fetched_at.elapsed() <= self.ttl).then(|| entry.markets.clone())
    }

    fn stale_or(&self, err: ExchangeError) -> Result<Vec<Market>, ExchangeError> {
        match self.cached.read().as_ref() {
            Some(entry) => Ok(entry.markets.clone()),
            None => Err(err),
        }
    }
}
