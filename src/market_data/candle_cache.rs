// =============================================================================
// Candle model + freshness-controlled fetch cache
// =============================================================================
//
// Candles arrive by REST poll, not by stream, so the cache's job is freshness
// control: a scan tick that runs twice within the freshness window reuses the
// previous fetch instead of hitting the exchange again. Entries are immutable
// once stored; a newer fetch replaces the whole series.
// =============================================================================

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Data types
// ---------------------------------------------------------------------------

/// A single OHLCV candle (oldest-first ordering in every slice).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Candle {
    /// Candle open time, epoch milliseconds.
    pub timestamp: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl Candle {
    pub fn new(timestamp: i64, open: f64, high: f64, low: f64, close: f64, volume: f64) -> Self {
        Self { timestamp, open, high, low, close, volume }
    }
}

/// Composite key that identifies a unique candle series.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct CandleKey {
    pub market: String,
    /// Interval label, e.g. "1m", "5m", "15m".
    pub interval: String,
}

impl std::fmt::Display for CandleKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.market, self.interval)
    }
}

struct CachedSeries {
    candles: Vec<Candle>,
    fetched_at: Instant,
}

// ---------------------------------------------------------------------------
// CandleCache
// ---------------------------------------------------------------------------

/// Thread-safe per-(market, interval) cache of the latest fetched series.
pub struct CandleCache {
    entries: RwLock<HashMap<CandleKey, CachedSeries>>,
    freshness: Duration,
}

impl CandleCache {
    /// Create a cache whose entries are considered fresh for `freshness`.
    pub fn new(freshness: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            freshness,
        }
    }

    /// Return the cached series if it is still within the freshness window
    /// and holds at least `min_count` candles.
    pub fn get_fresh(&self, key: &CandleKey, min_count: usize) -> Option<Vec<Candle>> {
        let map = self.entries.read();
        let entry = map.get(key)?;
        if entry.fetched_at.elapsed() > self.freshness {
            return None;
        }
        if entry.candles.len() < min_count {
            return None;
        }
        Some(entry.candles.clone())
    }

    /// Store a freshly fetched series, replacing any previous entry.
    pub fn put(&self, key: CandleKey, candles: Vec<Candle>) {
        self.entries.write().insert(
            key,
            CachedSeries {
                candles,
                fetched_at: Instant::now(),
            },
        );
    }

    /// Close price of the most recent cached candle, regardless of freshness.
    pub fn last_close(&self, key: &CandleKey) -> Option<f64> {
        let map = self.entries.read();
        map.get(key).and_then(|e| e.candles.last().map(|c| c.close))
    }

    /// Drop every cached series (used by tests and the sync endpoint).
    pub fn clear(&self) {
        self.entries.write().clear();
    }
}
