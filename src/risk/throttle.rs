// =============================================================================
// Risk Throttle — rolling-window performance gate per (market, strategy)
// =============================================================================
//
// Looks at the last 30 closed trades for a key. Severity tiers:
//
//   CRITICAL  win rate <= 0.35 OR avg pnl% <= -0.8 OR current loss streak >= 4
//             -> multiplier 0.45, new buys blocked
//   WEAK      win rate <= 0.45 OR avg pnl% <= -0.2
//             -> multiplier 0.70
//   NORMAL    otherwise -> multiplier 1.0
//
// Fewer than 8 samples always assess NORMAL. The minimum entry confidence a
// strategy must present rises with severity (55 / 65 / 75). Assessments are
// cached ten minutes per key; `force_refresh` bypasses the cache.
// =============================================================================

use std::collections::HashMap;
use std::time::{Duration, Instant};

use anyhow::Result;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::ThrottleThresholds;
use crate::store::position_store::PositionStore;
use crate::types::StrategyCode;

pub const LOOKBACK_TRADES: u32 = 30;
pub const MIN_SAMPLE: usize = 8;
pub const CACHE_TTL: Duration = Duration::from_secs(600);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ThrottleSeverity {
    Normal,
    Weak,
    Critical,
}

impl ThrottleSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Normal => "NORMAL",
            Self::Weak => "WEAK",
            Self::Critical => "CRITICAL",
        }
    }

    /// Minimum entry confidence a signal must carry under this severity.
    pub fn min_entry_confidence(&self) -> f64 {
        match self {
            Self::Normal => 55.0,
            Self::Weak => 65.0,
            Self::Critical => 75.0,
        }
    }
}

impl std::fmt::Display for ThrottleSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Assessment outcome for one (market, strategy) key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThrottleState {
    pub lookback_trades: usize,
    pub consecutive_losses: u32,
    pub win_rate: f64,
    pub avg_pnl_percent: f64,
    pub multiplier: f64,
    pub severity: ThrottleSeverity,
    pub block_new_buys: bool,
}

impl ThrottleState {
    fn normal(samples: usize) -> Self {
        Self {
            lookback_trades: samples,
            consecutive_losses: 0,
            win_rate: 0.0,
            avg_pnl_percent: 0.0,
            multiplier: 1.0,
            severity: ThrottleSeverity::Normal,
            block_new_buys: false,
        }
    }
}

/// Assess a pnl% series (newest first) with the default thresholds.
pub fn assess(pnl_percents: &[f64]) -> ThrottleState {
    assess_with(pnl_percents, &ThrottleThresholds::default())
}

/// Assess with explicit thresholds. Pure so the tier table is testable
/// without a database.
pub fn assess_with(pnl_percents: &[f64], thresholds: &ThrottleThresholds) -> ThrottleState {
    if pnl_percents.len() < MIN_SAMPLE {
        return ThrottleState::normal(pnl_percents.len());
    }

    let n = pnl_percents.len() as f64;
    let wins = pnl_percents.iter().filter(|&&p| p > 0.0).count() as f64;
    let win_rate = wins / n;
    let avg = pnl_percents.iter().sum::<f64>() / n;

    let mut streak: u32 = 0;
    for &p in pnl_percents {
        if p < 0.0 {
            streak += 1;
        } else {
            break;
        }
    }

    let (severity, multiplier, block) = if win_rate <= thresholds.critical_win_rate
        || avg <= thresholds.critical_avg_pnl
        || streak >= thresholds.critical_loss_streak
    {
        (ThrottleSeverity::Critical, 0.45, true)
    } else if win_rate <= thresholds.weak_win_rate || avg <= thresholds.weak_avg_pnl {
        (ThrottleSeverity::Weak, 0.70, false)
    } else {
        (ThrottleSeverity::Normal, 1.0, false)
    };

    ThrottleState {
        lookback_trades: pnl_percents.len(),
        consecutive_losses: streak,
        win_rate,
        avg_pnl_percent: avg,
        multiplier,
        severity,
        block_new_buys: block,
    }
}

// ---------------------------------------------------------------------------
// Cached throttle over the position store
// ---------------------------------------------------------------------------

struct CachedState {
    state: ThrottleState,
    cached_until: Instant,
}

pub struct RiskThrottle {
    store: PositionStore,
    thresholds: ThrottleThresholds,
    cache: RwLock<HashMap<(String, StrategyCode), CachedState>>,
    ttl: Duration,
}

impl RiskThrottle {
    pub fn new(store: PositionStore) -> Self {
        Self::with_ttl(store, CACHE_TTL)
    }

    pub fn with_ttl(store: PositionStore, ttl: Duration) -> Self {
        Self {
            store,
            thresholds: ThrottleThresholds::default(),
            cache: RwLock::new(HashMap::new()),
            ttl,
        }
    }

    pub fn with_thresholds(store: PositionStore, thresholds: ThrottleThresholds) -> Self {
        Self {
            store,
            thresholds,
            cache: RwLock::new(HashMap::new()),
            ttl: CACHE_TTL,
        }
    }

    /// Evaluate the throttle for one key, serving the cache when fresh.
    pub async fn evaluate(
        &self,
        market: &str,
        code: StrategyCode,
        force_refresh: bool,
    ) -> Result<ThrottleState> {
        let key = (market.to_string(), code);

        if !force_refresh {
            if let Some(cached) = self.cache.read().get(&key) {
                if cached.cached_until > Instant::now() {
                    return Ok(cached.state.clone());
                }
            }
        }

        let trades = self
            .store
            .recent_closed_trades(market, code, LOOKBACK_TRADES)
            .await?;
        let pnls: Vec<f64> = trades.iter().map(|t| t.realized_pnl_percent).collect();
        let state = assess_with(&pnls, &self.thresholds);

        debug!(
            market,
            strategy = %code,
            severity = %state.severity,
            multiplier = state.multiplier,
            win_rate = format!("{:.2}", state.win_rate),
            samples = state.lookback_trades,
            "risk throttle evaluated"
        );

        self.cache.write().insert(
            key,
            CachedState {
                state: state.clone(),
                cached_until: Instant::now() + self.ttl,
            },
        );

        Ok(state)
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_sample_is_normal() {
        let state = assess(&[-5.0; 7]);
        assert_eq!(state.severity, ThrottleSeverity::Normal);
        assert!((state.multiplier - 1.0).abs() < 1e-10);
        assert!(!state.block_new_buys);
    }

    #[test]
    fn healthy_record_is_normal() {
        let pnls = [1.0, 0.8, -0.3, 1.2, 0.5, -0.2, 0.9, 1.1, 0.4, 0.6];
        let state = assess(&pnls);
        assert_eq!(state.severity, ThrottleSeverity::Normal);
        assert!((state.multiplier - 1.0).abs() < 1e-10);
    }

    #[test]
    fn low_win_rate_is_weak() {
        // 4 wins / 10 = 0.40 <= 0.45, but avg stays above the weak line.
        let pnls = [2.0, -0.1, 2.0, -0.1, 2.0, -0.1, 2.0, -0.1, -0.1, -0.1];
        let state = assess(&pnls);
        assert_eq!(state.severity, ThrottleSeverity::Weak);
        assert!((state.multiplier - 0.70).abs() < 1e-10);
        assert!(!state.block_new_buys);
    }

    #[test]
    fn loss_streak_is_critical() {
        // Four leading losses trip the streak rule even with a decent record
        // behind them.
        let pnls = [-0.1, -0.1, -0.1, -0.1, 2.0, 2.0, 2.0, 2.0, 2.0, 2.0];
        let state = assess(&pnls);
        assert_eq!(state.severity, ThrottleSeverity::Critical);
        assert!((state.multiplier - 0.45).abs() < 1e-10);
        assert!(state.block_new_buys);
        assert_eq!(state.consecutive_losses, 4);
    }

    #[test]
    fn deep_average_loss_is_critical() {
        let pnls = [-1.0; 10];
        let state = assess(&pnls);
        assert_eq!(state.severity, ThrottleSeverity::Critical);
    }

    #[test]
    fn multiplier_monotone_in_loss_streak() {
        // Holding the other stats fixed, growing the leading loss streak must
        // never raise the multiplier.
        let mut prev = f64::INFINITY;
        for streak in 0..6 {
            let mut pnls: Vec<f64> = vec![-0.05; streak];
            // Pad with wins so win rate and average stay comfortably healthy.
            while pnls.len() < 16 {
                pnls.push(1.5);
            }
            let state = assess(&pnls);
            assert!(
                state.multiplier <= prev + 1e-12,
                "multiplier rose at streak {streak}"
            );
            prev = state.multiplier;
        }
    }

    #[test]
    fn confidence_floor_rises_with_severity() {
        assert!((ThrottleSeverity::Normal.min_entry_confidence() - 55.0).abs() < 1e-10);
        assert!((ThrottleSeverity::Weak.min_entry_confidence() - 65.0).abs() < 1e-10);
        assert!((ThrottleSeverity::Critical.min_entry_confidence() - 75.0).abs() < 1e-10);
    }

    #[tokio::test]
    async fn cache_serves_and_force_refresh_bypasses() {
        use crate::store::database::Database;
        use crate::store::position_store::{NewPosition, PositionStore};

        let store = PositionStore::new(Database::in_memory().await.unwrap());
        let throttle = RiskThrottle::new(store.clone());

        // First evaluation: no closed trades at all -> NORMAL, cached.
        let s1 = throttle.evaluate("KRW-BTC", StrategyCode::Dca, false).await.unwrap();
        assert_eq!(s1.severity, ThrottleSeverity::Normal);
        assert_eq!(s1.lookback_trades, 0);

        // Close enough losing trades to go CRITICAL.
        for _ in 0..8 {
            let pos = store
                .open_position(NewPosition {
                    market: "KRW-BTC".to_string(),
                    strategy_code: StrategyCode::Dca,
                    entry_price: 100.0,
                    quantity: 1.0,
                    stop_loss: 90.0,
                    take_profit: 120.0,
                    entry_regime: "SIDEWAYS".to_string(),
                    entry_confluence_score: 60.0,
                })
                .await
                .unwrap();
            store.close_position(&pos.id, 98.0, "STOP_LOSS", 0.0).await.unwrap();
        }

        // Cached answer is still the stale NORMAL.
        let cached = throttle.evaluate("KRW-BTC", StrategyCode::Dca, false).await.unwrap();
        assert_eq!(cached.lookback_trades, 0);

        // Forced refresh sees the eight losses.
        let fresh = throttle.evaluate("KRW-BTC", StrategyCode::Dca, true).await.unwrap();
        assert_eq!(fresh.lookback_trades, 8);
        assert_eq!(fresh.severity, ThrottleSeverity::Critical);
        assert!(fresh.block_new_buys);
    }
}
