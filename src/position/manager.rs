// =============================================================================
// Active Position Manager — re-evaluates every open position per tick
// =============================================================================
//
// Decision priority on each tick (first hit wins):
//
//   1. Regime-shift exit (profile-gated): a position entered in a trend exits
//      fully when the regime turns BEAR_TREND, or HIGH_VOLATILITY with
//      adverse momentum.
//   2. Trailing stop: armed once PnL% reaches the trigger; the stop rides
//      peak * (1 - offset%) and a breach closes the position.
//   3. Stop-loss / take-profit breach: immediate full close.
//   4. Timeout: holding time past the strategy maximum closes regardless of
//      PnL, subject to the executor's minimum-holding floor.
//   5. Half take-profit: once per position at half the target, selling
//      `half_take_profit_ratio` of the remaining quantity.
//   6. Break-even move, profit lock, confluence-decay tighten: stop
//      adjustments that never close by themselves.
//
// All adjustments are persisted on the position row; closes flow through the
// executor (lifecycle events) and feed the circuit breaker.
// =============================================================================

use std::sync::Arc;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::coordinator::Coordinator;
use crate::exchange::client::ExchangeClient;
use crate::execution::{timeout_exit_allowed, ExecutionOutcome, OrderExecutor};
use crate::market_data::{CandleCache, CandleKey, TickerFeed};
use crate::position::profile::ExitProfile;
use crate::regime::{Regime, RegimeAnalysis, RegimeDetector};
use crate::risk::breaker::CircuitBreaker;
use crate::store::position_store::{Position, PositionStatus, PositionStore};
use crate::confluence;
use crate::types::StrategyCode;

/// Adverse momentum (%) that makes HIGH_VOLATILITY a regime-shift exit.
const ADVERSE_MOMENTUM_PCT: f64 = -1.2;

/// Break-even stop sits a hair above entry to cover fees.
const BREAK_EVEN_BUFFER: f64 = 1.001;

/// Candle series used for monitor-time confluence/regime reads.
const MONITOR_INTERVAL_LABEL: &str = "5m";
const MONITOR_CANDLE_COUNT: u32 = 100;

// ---------------------------------------------------------------------------
// Decision model
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ExitDecision {
    Hold,
    TightenStop { new_stop: f64 },
    MoveToBreakEven { new_stop: f64 },
    ProfitLock { new_stop: f64 },
    PartialExit { quantity: f64 },
    FullExit { reason: String },
}

/// Trailing-state change to persist alongside the decision.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrailingUpdate {
    pub active: bool,
    pub peak: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Assessment {
    pub decision: ExitDecision,
    pub trailing: Option<TrailingUpdate>,
}

/// Pure per-tick evaluation of one open position.
pub fn evaluate(
    position: &Position,
    profile: &ExitProfile,
    current_price: f64,
    current_regime: Option<&RegimeAnalysis>,
    current_confluence: Option<f64>,
) -> Assessment {
    let pnl_pct = position.unrealized_pnl_pct(current_price);

    // ── Trailing state update (computed first, applied with any decision) ──
    let mut trailing = None;
    let mut trailing_peak = position.trailing_peak.unwrap_or(0.0);
    let mut trailing_active = position.trailing_active;

    if trailing_active {
        if current_price > trailing_peak {
            trailing_peak = current_price;
            trailing = Some(TrailingUpdate { active: true, peak: trailing_peak });
        }
    } else if pnl_pct >= profile.trailing_trigger_pct {
        trailing_active = true;
        trailing_peak = current_price.max(position.entry_price);
        trailing = Some(TrailingUpdate { active: true, peak: trailing_peak });
    }

    // ── 1. Regime shift ────────────────────────────────────────────────
    if profile.regime_shift_exit {
        if let Some(shift_reason) = regime_shift(position, current_regime) {
            return Assessment {
                decision: ExitDecision::FullExit { reason: shift_reason },
                trailing,
            };
        }
    }

    // ── 2. Trailing stop breach ────────────────────────────────────────
    if trailing_active && trailing_peak > 0.0 {
        let trail_stop = trailing_peak * (1.0 - profile.trailing_offset_pct / 100.0);
        if current_price <= trail_stop {
            return Assessment {
                decision: ExitDecision::FullExit { reason: "TRAILING_STOP".to_string() },
                trailing,
            };
        }
    }

    // ── 3. Stop / target breach ────────────────────────────────────────
    if current_price <= position.stop_loss {
        return Assessment {
            decision: ExitDecision::FullExit { reason: "STOP_LOSS".to_string() },
            trailing,
        };
    }
    if current_price >= position.take_profit {
        return Assessment {
            decision: ExitDecision::FullExit { reason: "TAKE_PROFIT".to_string() },
            trailing,
        };
    }

    // ── 4. Timeout (minimum-holding floor applies) ─────────────────────
    let holding_secs = position.holding_secs();
    if holding_secs > (profile.position_timeout_min as i64) * 60 && timeout_exit_allowed(holding_secs) {
        return Assessment {
            decision: ExitDecision::FullExit { reason: "TIMEOUT".to_string() },
            trailing,
        };
    }

    // ── 5. Half take-profit (latched once) ─────────────────────────────
    if !position.half_take_profit_done && pnl_pct >= profile.half_target_pct() {
        let quantity = position.remaining_quantity * profile.half_take_profit_ratio;
        if quantity > 0.0 {
            return Assessment {
                decision: ExitDecision::PartialExit { quantity },
                trailing,
            };
        }
    }

    // ── 6. Stop adjustments ────────────────────────────────────────────
    let profit_lock_stop = position.entry_price * (1.0 + profile.profit_lock_min_pct / 100.0);
    if pnl_pct >= profile.profit_lock_trigger_pct && position.stop_loss < profit_lock_stop {
        return Assessment {
            decision: ExitDecision::ProfitLock { new_stop: profit_lock_stop },
            trailing,
        };
    }

    let break_even_stop = position.entry_price * BREAK_EVEN_BUFFER;
    if pnl_pct >= profile.break_even_trigger_pct && position.stop_loss < break_even_stop {
        return Assessment {
            decision: ExitDecision::MoveToBreakEven { new_stop: break_even_stop },
            trailing,
        };
    }

    if let Some(confluence_now) = current_confluence {
        if position.entry_confluence_score - confluence_now >= profile.confluence_degradation {
            let tightened =
                position.stop_loss + position.entry_price * profile.divergence_stop_tighten_pct / 100.0;
            // Only ever raise the stop, and never past the current price.
            if tightened > position.stop_loss && tightened < current_price {
                return Assessment {
                    decision: ExitDecision::TightenStop { new_stop: tightened },
                    trailing,
                };
            }
        }
    }

    Assessment { decision: ExitDecision::Hold, trailing }
}

/// Regime-shift rule: trend entries exit when the market turns into a bear
/// trend or adversely-directed high volatility.
fn regime_shift(position: &Position, current: Option<&RegimeAnalysis>) -> Option<String> {
    let current = current?;
    let entered_in_trend =
        position.entry_regime == "BULL_TREND" || position.entry_regime == "BEAR_TREND";
    if !entered_in_trend {
        return None;
    }

    match current.regime {
        Regime::BearTrend => Some("REGIME_SHIFT".to_string()),
        Regime::HighVolatility if current.momentum_pct <= ADVERSE_MOMENTUM_PCT => {
            Some("REGIME_SHIFT".to_string())
        }
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Manager service
// ---------------------------------------------------------------------------

pub struct PositionManager {
    client: Arc<ExchangeClient>,
    store: PositionStore,
    executor: Arc<OrderExecutor>,
    breaker: Arc<CircuitBreaker>,
    coordinator: Arc<Coordinator>,
    candles: Arc<CandleCache>,
    tickers: Arc<TickerFeed>,
    detector: Arc<RegimeDetector>,
    fee_rate: f64,
}

impl PositionManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        client: Arc<ExchangeClient>,
        store: PositionStore,
        executor: Arc<OrderExecutor>,
        breaker: Arc<CircuitBreaker>,
        coordinator: Arc<Coordinator>,
        candles: Arc<CandleCache>,
        tickers: Arc<TickerFeed>,
        detector: Arc<RegimeDetector>,
        fee_rate: f64,
    ) -> Self {
        Self {
            client,
            store,
            executor,
            breaker,
            coordinator,
            candles,
            tickers,
            detector,
            fee_rate,
        }
    }

    /// One monitor tick for a strategy: walk its open positions and act on
    /// each decision under the per-key mutex.
    pub async fn monitor_strategy(&self, code: StrategyCode, profile: &ExitProfile) -> Result<()> {
        let positions = self.store.open_positions_for(code).await?;
        if positions.is_empty() {
            return Ok(());
        }

        debug!(strategy = %code, count = positions.len(), "monitor tick");

        for stale in positions {
            let _guard = self.coordinator.lock_key(&stale.market, code).await;

            // Re-read under the lock; another path may have closed it.
            let position = match self.store.get(&stale.id).await? {
                Some(p) if p.status == PositionStatus::Open => p,
                _ => continue,
            };

            let Some(price) = self.current_price(&position.market).await else {
                warn!(market = %position.market, "no price available — skipping monitor evaluation");
                continue;
            };

            let (regime, confluence_now) = self.market_context(&position.market).await;

            let assessment = evaluate(&position, profile, price, regime.as_ref(), confluence_now);

            if let Some(update) = assessment.trailing {
                if let Err(e) = self
                    .store
                    .update_trailing(&position.id, update.active, update.peak)
                    .await
                {
                    warn!(id = %position.id, error = %e, "trailing update failed");
                }
            }

            if let Err(e) = self.apply_decision(&position, price, assessment.decision).await {
                error!(id = %position.id, error = %e, "failed to apply exit decision — tick aborted for key");
            }
        }

        Ok(())
    }

    async fn apply_decision(
        &self,
        position: &Position,
        price: f64,
        decision: ExitDecision,
    ) -> Result<()> {
        match decision {
            ExitDecision::Hold => Ok(()),

            ExitDecision::TightenStop { new_stop } => {
                info!(id = %position.id, new_stop, "confluence decay — stop tightened");
                self.store.update_stops(&position.id, new_stop, None).await
            }

            ExitDecision::MoveToBreakEven { new_stop } => {
                info!(id = %position.id, new_stop, "stop moved to break-even");
                self.store.update_stops(&position.id, new_stop, None).await
            }

            ExitDecision::ProfitLock { new_stop } => {
                info!(id = %position.id, new_stop, "profit lock engaged");
                self.store.update_stops(&position.id, new_stop, None).await
            }

            ExitDecision::PartialExit { quantity } => {
                let outcome = self
                    .executor
                    .execute_sell(&position.market, position.strategy_code, quantity, price, "PARTIAL_TAKE_PROFIT")
                    .await;
                match outcome {
                    ExecutionOutcome::Filled { avg_price, quantity: sold, .. } => {
                        self.store
                            .apply_partial_exit(&position.id, sold, avg_price, self.fee_rate)
                            .await?;
                        self.store.mark_half_take_profit(&position.id).await?;
                        info!(id = %position.id, sold, avg_price, "half take-profit executed");
                        Ok(())
                    }
                    other => {
                        warn!(id = %position.id, outcome = %other, "partial exit sell did not fill");
                        Ok(())
                    }
                }
            }

            ExitDecision::FullExit { reason } => {
                let outcome = self
                    .executor
                    .execute_sell(
                        &position.market,
                        position.strategy_code,
                        position.remaining_quantity,
                        price,
                        &reason,
                    )
                    .await;
                match outcome {
                    ExecutionOutcome::Filled { avg_price, .. } => {
                        let closed = self
                            .store
                            .close_position(&position.id, avg_price, &reason, self.fee_rate)
                            .await?;
                        self.breaker
                            .record_trade_result(position.strategy_code, closed.realized_pnl);
                        info!(
                            id = %position.id,
                            reason,
                            realized_pnl = closed.realized_pnl,
                            "position fully exited"
                        );
                        Ok(())
                    }
                    other => {
                        warn!(id = %position.id, outcome = %other, reason, "full exit sell did not fill");
                        Ok(())
                    }
                }
            }
        }
    }

    /// Operator-initiated close of the open position for a key. Returns the
    /// closed row, or `None` when there is nothing open. Idempotent: calling
    /// it again finds no open position.
    pub async fn close_manual(
        &self,
        market: &str,
        code: StrategyCode,
    ) -> Result<Option<Position>> {
        let _guard = self.coordinator.lock_key(market, code).await;

        let Some(position) = self.store.open_position_for_key(market, code).await? else {
            return Ok(None);
        };

        let price = self.current_price(market).await.unwrap_or(position.entry_price);
        let outcome = self
            .executor
            .execute_sell(market, code, position.remaining_quantity, price, "MANUAL")
            .await;

        match outcome {
            ExecutionOutcome::Filled { avg_price, .. } => {
                let closed = self
                    .store
                    .close_position(&position.id, avg_price, "MANUAL", self.fee_rate)
                    .await?;
                self.breaker.record_trade_result(code, closed.realized_pnl);
                info!(market, strategy = %code, id = %closed.id, "manual close complete");
                Ok(Some(closed))
            }
            other => {
                warn!(market, strategy = %code, outcome = %other, "manual close sell did not fill");
                Ok(None)
            }
        }
    }

    /// Latest price: fresh WebSocket ticker first, REST fallback.
    async fn current_price(&self, market: &str) -> Option<f64> {
        if let Some(ticker) = self.tickers.fresh_ticker(market) {
            return Some(ticker.trade_price);
        }
        match self.client.get_ticker(market).await {
            Ok(Some(t)) => Some(t.trade_price),
            Ok(None) => None,
            Err(e) => {
                warn!(market, error = %e, "ticker fetch failed during monitor");
                None
            }
        }
    }

    /// Regime and confluence context from cached (or freshly fetched) candles.
    async fn market_context(&self, market: &str) -> (Option<RegimeAnalysis>, Option<f64>) {
        let key = CandleKey {
            market: market.to_string(),
            interval: MONITOR_INTERVAL_LABEL.to_string(),
        };

        let candles = match self.candles.get_fresh(&key, confluence::MIN_CANDLES) {
            Some(c) => c,
            None => match self
                .client
                .get_candles(market, MONITOR_INTERVAL_LABEL, MONITOR_CANDLE_COUNT)
                .await
            {
                Ok(Some(c)) => {
                    self.candles.put(key, c.clone());
                    c
                }
                _ => return (None, None),
            },
        };

        let regime = self.detector.analyze(&candles);
        let result = confluence::analyze(&candles);
        let confluence_now = match result.classification {
            crate::confluence::ConfluenceClass::InsufficientData => None,
            _ => Some(result.total),
        };
        (regime, confluence_now)
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration as ChronoDuration, Utc};

    fn profile() -> ExitProfile {
        ExitProfile {
            stop_loss_percent: 3.0,
            take_profit_percent: 6.0,
            trailing_trigger_pct: 2.0,
            trailing_offset_pct: 1.0,
            break_even_trigger_pct: 1.0,
            profit_lock_trigger_pct: 2.5,
            profit_lock_min_pct: 1.0,
            half_take_profit_ratio: 0.5,
            confluence_degradation: 20.0,
            divergence_stop_tighten_pct: 0.5,
            position_timeout_min: 240,
            regime_shift_exit: true,
        }
    }

    fn position(entry: f64, stop: f64, target: f64) -> Position {
        let now = Utc::now();
        Position {
            id: "p1".to_string(),
            market: "KRW-BTC".to_string(),
            strategy_code: StrategyCode::VolumeSurge,
            entry_price: entry,
            entry_quantity: 1.0,
            remaining_quantity: 1.0,
            stop_loss: stop,
            take_profit: target,
            trailing_active: false,
            trailing_peak: None,
            dca_count: 0,
            status: PositionStatus::Open,
            entry_regime: "BULL_TREND".to_string(),
            entry_confluence_score: 80.0,
            half_take_profit_done: false,
            realized_pnl: 0.0,
            realized_pnl_percent: None,
            exit_price: None,
            exit_reason: None,
            created_at: now - ChronoDuration::minutes(30),
            updated_at: now,
            closed_at: None,
        }
    }

    fn regime(r: Regime, momentum: f64) -> RegimeAnalysis {
        RegimeAnalysis {
            regime: r,
            confidence: 60.0,
            adx: 30.0,
            atr: 1.0,
            atr_percent: 1.0,
            momentum_pct: momentum,
            trend_direction: 0,
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn quiet_position_holds() {
        let pos = position(100.0, 95.0, 110.0);
        let a = evaluate(&pos, &profile(), 100.5, None, Some(80.0));
        assert_eq!(a.decision, ExitDecision::Hold);
        assert!(a.trailing.is_none());
    }

    #[test]
    fn stop_breach_exits() {
        let pos = position(100.0, 95.0, 110.0);
        let a = evaluate(&pos, &profile(), 94.9, None, None);
        assert_eq!(a.decision, ExitDecision::FullExit { reason: "STOP_LOSS".to_string() });
    }

    #[test]
    fn target_breach_exits() {
        let pos = position(100.0, 95.0, 110.0);
        let a = evaluate(&pos, &profile(), 110.5, None, None);
        assert_eq!(a.decision, ExitDecision::FullExit { reason: "TAKE_PROFIT".to_string() });
    }

    #[test]
    fn trailing_arms_then_rides_then_exits() {
        // Entry 100, trigger 2%, offset 1%. Prices 100, 101, 103, 101.5.
        let mut pos = position(100.0, 95.0, 110.0);
        let p = profile();

        // 100: nothing.
        let a = evaluate(&pos, &p, 100.0, None, None);
        assert_eq!(a.decision, ExitDecision::Hold);
        assert!(a.trailing.is_none());

        // 101: +1% — below the 2% trigger, break-even move fires instead.
        let a = evaluate(&pos, &p, 101.0, None, None);
        assert!(matches!(a.decision, ExitDecision::MoveToBreakEven { .. }));
        assert!(a.trailing.is_none());
        if let ExitDecision::MoveToBreakEven { new_stop } = a.decision {
            pos.stop_loss = new_stop;
        }

        // 103: +3% — trailing arms at peak 103 (half-TP is latched already
        // in this walk to isolate the trailing path).
        pos.half_take_profit_done = true;
        let a = evaluate(&pos, &p, 103.0, None, None);
        let trailing = a.trailing.expect("trailing must arm");
        assert!(trailing.active);
        assert!((trailing.peak - 103.0).abs() < 1e-10);
        pos.trailing_active = true;
        pos.trailing_peak = Some(trailing.peak);

        // 101.5: below 103 * 0.99 = 101.97 — trailing stop fires.
        let a = evaluate(&pos, &p, 101.5, None, None);
        assert_eq!(a.decision, ExitDecision::FullExit { reason: "TRAILING_STOP".to_string() });
    }

    #[test]
    fn trailing_peak_only_rises() {
        let mut pos = position(100.0, 95.0, 110.0);
        pos.trailing_active = true;
        pos.trailing_peak = Some(105.0);
        pos.half_take_profit_done = true;

        // Price below the peak but above the trail: no peak update.
        let a = evaluate(&pos, &profile(), 104.5, None, None);
        assert!(a.trailing.is_none());

        // New high: peak follows.
        let a = evaluate(&pos, &profile(), 106.0, None, None);
        assert_eq!(a.trailing, Some(TrailingUpdate { active: true, peak: 106.0 }));
    }

    #[test]
    fn regime_shift_exits_trend_entry() {
        // Entered in BULL_TREND; high-volatility with momentum <= -1.2 exits.
        let pos = position(100.0, 95.0, 110.0);
        let shifted = regime(Regime::HighVolatility, -1.5);
        let a = evaluate(&pos, &profile(), 100.5, Some(&shifted), Some(80.0));
        assert_eq!(a.decision, ExitDecision::FullExit { reason: "REGIME_SHIFT".to_string() });

        // Favourable momentum in high-vol does not exit.
        let benign = regime(Regime::HighVolatility, 0.5);
        let a = evaluate(&pos, &profile(), 100.5, Some(&benign), Some(80.0));
        assert_eq!(a.decision, ExitDecision::Hold);

        // Bear trend always exits a trend entry.
        let bear = regime(Regime::BearTrend, 0.0);
        let a = evaluate(&pos, &profile(), 100.5, Some(&bear), Some(80.0));
        assert_eq!(a.decision, ExitDecision::FullExit { reason: "REGIME_SHIFT".to_string() });
    }

    #[test]
    fn regime_shift_ignored_for_sideways_entry() {
        let mut pos = position(100.0, 95.0, 110.0);
        pos.entry_regime = "SIDEWAYS".to_string();
        let bear = regime(Regime::BearTrend, -2.0);
        let a = evaluate(&pos, &profile(), 100.5, Some(&bear), Some(80.0));
        assert_eq!(a.decision, ExitDecision::Hold);
    }

    #[test]
    fn regime_shift_respects_profile_flag() {
        let pos = position(100.0, 95.0, 110.0);
        let mut p = profile();
        p.regime_shift_exit = false;
        let bear = regime(Regime::BearTrend, -2.0);
        let a = evaluate(&pos, &p, 100.5, Some(&bear), Some(80.0));
        assert_eq!(a.decision, ExitDecision::Hold);
    }

    #[test]
    fn half_take_profit_fires_once() {
        // +3% = half of the 6% target.
        let mut pos = position(100.0, 95.0, 110.0);
        let a = evaluate(&pos, &profile(), 103.0, None, None);
        assert_eq!(a.decision, ExitDecision::PartialExit { quantity: 0.5 });

        // Latched: same price later does not fire again. The stop has been
        // locked above the profit-lock level by the earlier management moves.
        pos.half_take_profit_done = true;
        pos.trailing_active = true;
        pos.trailing_peak = Some(103.0);
        pos.stop_loss = 101.5;
        let a = evaluate(&pos, &profile(), 103.0, None, None);
        assert_eq!(a.decision, ExitDecision::Hold);
    }

    #[test]
    fn profit_lock_beats_break_even() {
        // +2.6% clears both triggers; the higher profit-lock stop wins.
        let pos = position(100.0, 95.0, 110.0);
        let mut p = profile();
        p.trailing_trigger_pct = 10.0; // keep trailing out of the way
        p.half_take_profit_ratio = 0.5;
        let mut pos2 = pos.clone();
        pos2.half_take_profit_done = true;
        let a = evaluate(&pos2, &p, 102.6, None, None);
        match a.decision {
            ExitDecision::ProfitLock { new_stop } => {
                assert!((new_stop - 101.0).abs() < 1e-9);
            }
            other => panic!("expected ProfitLock, got {other:?}"),
        }
    }

    #[test]
    fn break_even_move_at_trigger() {
        let pos = position(100.0, 95.0, 110.0);
        let mut p = profile();
        p.trailing_trigger_pct = 10.0;
        p.half_take_profit_ratio = 0.5;
        let mut pos2 = pos;
        pos2.half_take_profit_done = true;
        let a = evaluate(&pos2, &p, 101.2, None, None);
        match a.decision {
            ExitDecision::MoveToBreakEven { new_stop } => {
                assert!((new_stop - 100.1).abs() < 1e-9);
            }
            other => panic!("expected MoveToBreakEven, got {other:?}"),
        }
    }

    #[test]
    fn confluence_decay_tightens_stop() {
        let pos = position(100.0, 95.0, 110.0);
        // Entry confluence 80, now 55 — degradation 25 >= 20.
        let a = evaluate(&pos, &profile(), 100.2, None, Some(55.0));
        match a.decision {
            ExitDecision::TightenStop { new_stop } => {
                // stop 95 + 0.5% of entry = 95.5.
                assert!((new_stop - 95.5).abs() < 1e-9);
            }
            other => panic!("expected TightenStop, got {other:?}"),
        }
    }

    #[test]
    fn timeout_exit_after_max_holding() {
        let mut pos = position(100.0, 95.0, 110.0);
        pos.created_at = Utc::now() - ChronoDuration::minutes(241);
        let a = evaluate(&pos, &profile(), 100.0, None, None);
        assert_eq!(a.decision, ExitDecision::FullExit { reason: "TIMEOUT".to_string() });
    }

    #[test]
    fn timeout_blocked_by_minimum_holding() {
        // A zero-minute timeout with a position a few seconds old: the
        // minimum-holding floor keeps it open.
        let mut pos = position(100.0, 95.0, 110.0);
        pos.created_at = Utc::now() - ChronoDuration::seconds(5);
        let mut p = profile();
        p.position_timeout_min = 0;
        let a = evaluate(&pos, &p, 100.0, None, None);
        assert_eq!(a.decision, ExitDecision::Hold);
    }

    #[test]
    fn stop_breach_is_exempt_from_minimum_holding() {
        let mut pos = position(100.0, 95.0, 110.0);
        pos.created_at = Utc::now() - ChronoDuration::seconds(2);
        let a = evaluate(&pos, &profile(), 94.0, None, None);
        assert_eq!(a.decision, ExitDecision::FullExit { reason: "STOP_LOSS".to_string() });
    }
}
