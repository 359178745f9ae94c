// =============================================================================
// Shared strategy runner — scan and monitor loops around a Strategy impl
// =============================================================================
//
// The runner owns every side effect of a scan tick: universe listing,
// eligibility filters, candle fetches, regime + confluence, the throttle
// gate, sizing, execution, and the position row. The `Strategy` trait is
// consulted exactly once per market, with a fully prepared context.
//
// Candidates surviving the gates are ranked by confidence and the top K are
// kept (bounded candidate queue, deterministic drop). Entries execute only
// while the engine has free position slots.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::{EngineConfig, StrategyConfig};
use crate::confluence::{self, ConfluenceClass};
use crate::coordinator::{Coordinator, MarketExclusion};
use crate::exchange::client::ExchangeClient;
use crate::exchange::market_cache::MarketCache;
use crate::execution::{ExecutionOutcome, OrderExecutor};
use crate::indicators::bollinger::calculate_bollinger;
use crate::indicators::rsi::last_rsi;
use crate::market_data::{Candle, CandleCache, CandleKey, TickerFeed};
use crate::position::manager::PositionManager;
use crate::position::profile::ExitProfile;
use crate::regime::RegimeDetector;
use crate::risk::breaker::CircuitBreaker;
use crate::risk::sizer::position_notional;
use crate::risk::throttle::{RiskThrottle, ThrottleState, MIN_SAMPLE};
use crate::store::position_store::{NewPosition, PositionStore};
use crate::strategy::{EntrySignal, MarketContext, Strategy};
use crate::types::{Signal, SignalAction, StrategyCode};

/// Candle series parameters shared by every scan.
const SCAN_INTERVAL_LABEL: &str = "5m";
const SCAN_CANDLE_COUNT: u32 = 100;

/// Default win rate assumed before the throttle has a real sample.
const DEFAULT_WIN_RATE: f64 = 0.55;

/// Everything the runners share. Built once in main and cloned per engine.
#[derive(Clone)]
pub struct SharedServices {
    pub client: Arc<ExchangeClient>,
    pub markets: Arc<MarketCache>,
    pub candles: Arc<CandleCache>,
    pub tickers: Arc<TickerFeed>,
    pub detector: Arc<RegimeDetector>,
    pub throttle: Arc<RiskThrottle>,
    pub breaker: Arc<CircuitBreaker>,
    pub executor: Arc<OrderExecutor>,
    pub store: PositionStore,
    pub coordinator: Arc<Coordinator>,
    pub manager: Arc<PositionManager>,
    /// Hot-reloadable config: readers clone the inner Arc per tick.
    pub config: Arc<RwLock<Arc<EngineConfig>>>,
}

impl SharedServices {
    pub fn config_snapshot(&self) -> Arc<EngineConfig> {
        self.config.read().clone()
    }
}

/// One market that survived every gate, ready for sizing.
struct Candidate {
    market: String,
    price: f64,
    regime_label: String,
    confluence_total: f64,
    entry: EntrySignal,
    throttle: ThrottleState,
}

/// Engine status for the dashboard.
#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    pub strategy_code: StrategyCode,
    pub state: String,
    pub suspended_reason: Option<String>,
    pub last_scan_secs_ago: Option<u64>,
}

pub struct StrategyEngine {
    strategy: Arc<dyn Strategy>,
    services: SharedServices,
    cooldowns: RwLock<HashMap<String, Instant>>,
    scanning: AtomicBool,
    last_scan: RwLock<Option<Instant>>,
}

impl StrategyEngine {
    pub fn new(strategy: Arc<dyn Strategy>, services: SharedServices) -> Arc<Self> {
        Arc::new(Self {
            strategy,
            services,
            cooldowns: RwLock::new(HashMap::new()),
            scanning: AtomicBool::new(false),
            last_scan: RwLock::new(None),
        })
    }

    pub fn code(&self) -> StrategyCode {
        self.strategy.code()
    }

    pub fn status(&self) -> EngineStatus {
        let code = self.code();
        let suspended = self.services.breaker.tripped_reason(code);
        let state = if suspended.is_some() {
            "SUSPENDED"
        } else if self.scanning.load(Ordering::SeqCst) {
            "SCANNING"
        } else {
            "IDLE"
        };
        EngineStatus {
            strategy_code: code,
            state: state.to_string(),
            suspended_reason: suspended,
            last_scan_secs_ago: self.last_scan.read().map(|t| t.elapsed().as_secs()),
        }
    }

    // -------------------------------------------------------------------------
    // Scan tick
    // -------------------------------------------------------------------------

    /// One scan pass. Errors are absorbed per market; the loop never dies.
    pub async fn scan_tick(&self) {
        let code = self.code();
        let config = self.services.config_snapshot();
        let s_cfg = config.strategy(code).clone();

        if !s_cfg.enabled {
            return;
        }
        if !self.services.coordinator.trading_allowed() {
            debug!(strategy = %code, "scan skipped: trading not allowed");
            return;
        }
        if let Some(reason) = self.services.breaker.tripped_reason(code) {
            debug!(strategy = %code, reason, "scan skipped: SUSPENDED");
            return;
        }

        self.scanning.store(true, Ordering::SeqCst);
        *self.last_scan.write() = Some(Instant::now());

        let open = match self.services.store.open_positions_for(code).await {
            Ok(o) => o,
            Err(e) => {
                warn!(strategy = %code, error = %e, "open-position query failed — scan aborted");
                self.scanning.store(false, Ordering::SeqCst);
                return;
            }
        };

        // Averaging-down pass for engines that allow add-on buys.
        if s_cfg.dca_max_add_ons > 0 {
            self.add_on_pass(&s_cfg, &open).await;
        }

        if (open.len() as u32) < s_cfg.max_positions {
            match self.collect_candidates(&config, &s_cfg, &open).await {
                Ok(candidates) => {
                    let slots = s_cfg.max_positions as usize - open.len();
                    self.enter_candidates(&config, &s_cfg, candidates, slots).await;
                }
                Err(e) => {
                    warn!(strategy = %code, error = %e, "candidate collection failed");
                }
            }
        }

        self.scanning.store(false, Ordering::SeqCst);
    }

    /// Buy more of an existing position once price has dropped the configured
    /// distance below the average entry, up to `dca_max_add_ons` times.
    async fn add_on_pass(&self, s_cfg: &StrategyConfig, open: &[crate::store::position_store::Position]) {
        let code = self.code();

        for position in open {
            if position.dca_count >= s_cfg.dca_max_add_ons {
                continue;
            }

            let price = match self.services.tickers.fresh_ticker(&position.market) {
                Some(t) => t.trade_price,
                None => match self.services.client.get_ticker(&position.market).await {
                    Ok(Some(t)) => t.trade_price,
                    _ => continue,
                },
            };
            let trigger = position.entry_price * (1.0 - s_cfg.dca_add_on_drop_pct / 100.0);
            if price <= 0.0 || price > trigger {
                continue;
            }

            let throttle = match self.services.throttle.evaluate(&position.market, code, false).await {
                Ok(t) => t,
                Err(_) => continue,
            };
            if throttle.block_new_buys {
                continue;
            }

            let signal = Signal {
                market: position.market.clone(),
                action: SignalAction::Buy,
                confidence: 60.0,
                price,
                reason: format!(
                    "dca add-on #{} at {:.1}% below entry",
                    position.dca_count + 1,
                    (position.entry_price - price) / position.entry_price * 100.0
                ),
                strategy_code: code,
                regime: position.entry_regime.clone(),
            };

            let outcome = self
                .services
                .executor
                .execute_buy(&signal, s_cfg.position_size_krw)
                .await;

            if let ExecutionOutcome::Filled { avg_price, quantity, .. } = outcome {
                let _guard = self.services.coordinator.lock_key(&position.market, code).await;

                // Re-anchor the bracket on the new average entry.
                let total = position.remaining_quantity + quantity;
                let avg_entry =
                    (position.entry_price * position.remaining_quantity + avg_price * quantity) / total;
                let new_stop = avg_entry * (1.0 - s_cfg.stop_loss_percent / 100.0);
                let new_target = avg_entry * (1.0 + s_cfg.take_profit_percent / 100.0);

                match self
                    .services
                    .store
                    .apply_dca_fill(&position.id, quantity, avg_price, new_stop, new_target)
                    .await
                {
                    Ok(updated) => info!(
                        strategy = %code,
                        market = %position.market,
                        dca_count = updated.dca_count,
                        avg_entry = updated.entry_price,
                        "add-on buy applied"
                    ),
                    Err(e) => warn!(
                        strategy = %code,
                        market = %position.market,
                        error = %e,
                        "add-on fill could not be applied"
                    ),
                }
            }
        }
    }

    async fn collect_candidates(
        &self,
        config: &EngineConfig,
        s_cfg: &StrategyConfig,
        open: &[crate::store::position_store::Position],
    ) -> anyhow::Result<Vec<Candidate>> {
        let code = self.code();
        let universe = self.services.markets.tradable_krw_markets().await?;
        let mut candidates = Vec::new();

        for market in &universe {
            let symbol = &market.market;

            if s_cfg.exclude_markets.iter().any(|m| m == symbol) {
                continue;
            }
            if self.on_cooldown(symbol) {
                continue;
            }

            // Open-position exclusion per the configured scope.
            let occupied = match config.market_exclusion {
                MarketExclusion::PerStrategy => open.iter().any(|p| &p.market == symbol),
                MarketExclusion::Global => {
                    self.services.store.any_open_for_market(symbol).await.unwrap_or(true)
                }
            };
            if occupied {
                continue;
            }

            // 24h traded-value band (fresh ticker preferred, REST fallback).
            let ticker = match self.services.tickers.fresh_ticker(symbol) {
                Some(t) => Some(t),
                None => self.services.client.get_ticker(symbol).await.ok().flatten(),
            };
            let Some(ticker) = ticker else { continue };
            if ticker.trade_price <= 0.0
                || ticker.acc_trade_value_24h < s_cfg.min_trading_value_krw
                || ticker.acc_trade_value_24h > s_cfg.max_trading_value_krw
            {
                continue;
            }

            let Some(candles) = self.fetch_candles(symbol).await else { continue };

            let Some(regime) = self.services.detector.analyze(&candles) else { continue };
            let confluence_result = confluence::analyze(&candles);
            if confluence_result.classification == ConfluenceClass::InsufficientData {
                continue;
            }
            if confluence_result.total < s_cfg.min_confluence {
                continue;
            }

            let closes: Vec<f64> = candles.iter().map(|c| c.close).collect();
            let rsi = last_rsi(&closes, 14);
            if rsi.map(|r| r > s_cfg.max_rsi).unwrap_or(true) {
                continue;
            }
            let ratio = volume_ratio(&candles);
            if ratio < s_cfg.min_volume_ratio {
                continue;
            }
            if !s_cfg.regime_whitelist.is_empty()
                && !s_cfg.regime_whitelist.iter().any(|r| r == regime.regime.as_str())
            {
                continue;
            }

            // Throttle gate (cached 10 min per key).
            let throttle = match self.services.throttle.evaluate(symbol, code, false).await {
                Ok(t) => t,
                Err(e) => {
                    warn!(market = %symbol, error = %e, "throttle evaluation failed");
                    continue;
                }
            };
            if throttle.block_new_buys {
                debug!(market = %symbol, strategy = %code, "entry blocked by risk throttle");
                continue;
            }

            let percent_b = calculate_bollinger(&closes, 20, 2.0).map(|b| b.percent_b);
            let ctx = MarketContext {
                market: symbol.clone(),
                price: ticker.trade_price,
                rsi,
                percent_b,
                volume_ratio: ratio,
                momentum_pct: regime.momentum_pct,
                value_24h_krw: ticker.acc_trade_value_24h,
                regime: regime.clone(),
                confluence: confluence_result.clone(),
            };

            let Some(entry) = self.strategy.evaluate(&ctx, s_cfg) else { continue };
            if entry.confidence < throttle.severity.min_entry_confidence() {
                debug!(
                    market = %symbol,
                    confidence = entry.confidence,
                    floor = throttle.severity.min_entry_confidence(),
                    "confidence below throttle floor"
                );
                continue;
            }

            candidates.push(Candidate {
                market: symbol.clone(),
                price: ticker.trade_price,
                regime_label: regime.regime.as_str().to_string(),
                confluence_total: confluence_result.total,
                entry,
                throttle,
            });
        }

        Ok(rank_candidates(candidates, config.max_scan_candidates))
    }

    async fn enter_candidates(
        &self,
        config: &EngineConfig,
        s_cfg: &StrategyConfig,
        candidates: Vec<Candidate>,
        mut slots: usize,
    ) {
        let code = self.code();

        for candidate in candidates {
            if slots == 0 {
                break;
            }

            let win_rate = if candidate.throttle.lookback_trades >= MIN_SAMPLE {
                candidate.throttle.win_rate
            } else {
                DEFAULT_WIN_RATE
            };
            let reward_risk = if s_cfg.stop_loss_percent > 0.0 {
                s_cfg.take_profit_percent / s_cfg.stop_loss_percent
            } else {
                1.0
            };

            let Some(notional) = position_notional(
                config.capital_krw,
                win_rate,
                reward_risk,
                candidate.entry.confidence,
                candidate.throttle.multiplier,
                &config.sizer,
            ) else {
                debug!(market = %candidate.market, "sizer produced no notional — skipped");
                continue;
            };
            let notional = notional.min(s_cfg.position_size_krw);

            let signal = Signal {
                market: candidate.market.clone(),
                action: SignalAction::Buy,
                confidence: candidate.entry.confidence,
                price: candidate.price,
                reason: candidate.entry.reason.clone(),
                strategy_code: code,
                regime: candidate.regime_label.clone(),
            };

            // The exchange call runs without the key mutex; only the row
            // insert below holds it.
            let outcome = self.services.executor.execute_buy(&signal, notional).await;
            match outcome {
                ExecutionOutcome::Filled { avg_price, quantity, .. } => {
                    let _guard = self.services.coordinator.lock_key(&candidate.market, code).await;

                    let new_position = NewPosition {
                        market: candidate.market.clone(),
                        strategy_code: code,
                        entry_price: avg_price,
                        quantity,
                        stop_loss: avg_price * (1.0 - s_cfg.stop_loss_percent / 100.0),
                        take_profit: avg_price * (1.0 + s_cfg.take_profit_percent / 100.0),
                        entry_regime: candidate.regime_label.clone(),
                        entry_confluence_score: candidate.confluence_total,
                    };

                    match self.services.store.open_position(new_position).await {
                        Ok(position) => {
                            info!(
                                strategy = %code,
                                market = %candidate.market,
                                id = %position.id,
                                notional,
                                confidence = candidate.entry.confidence,
                                "entry complete"
                            );
                            self.strategy.on_entry(&candidate.market);
                            self.start_cooldown(&candidate.market, s_cfg.cooldown_sec);
                            slots -= 1;
                        }
                        Err(e) => {
                            // The fill is real but the row could not be
                            // created; the sync routine will adopt the
                            // balance.
                            warn!(
                                strategy = %code,
                                market = %candidate.market,
                                error = %e,
                                "position row creation failed after fill"
                            );
                        }
                    }
                }
                other => {
                    debug!(
                        strategy = %code,
                        market = %candidate.market,
                        outcome = %other,
                        "entry did not fill"
                    );
                }
            }
        }
    }

    // -------------------------------------------------------------------------
    // Monitor tick
    // -------------------------------------------------------------------------

    /// One monitor pass: hand open positions to the position manager with
    /// this engine's exit profile.
    pub async fn monitor_tick(&self) {
        let code = self.code();
        let config = self.services.config_snapshot();
        let s_cfg = config.strategy(code);
        if !s_cfg.enabled {
            return;
        }

        let profile = ExitProfile::from_config(s_cfg);
        if let Err(e) = self.services.manager.monitor_strategy(code, &profile).await {
            warn!(strategy = %code, error = %e, "monitor tick failed");
        }
    }

    // -------------------------------------------------------------------------
    // Internal helpers
    // -------------------------------------------------------------------------

    async fn fetch_candles(&self, market: &str) -> Option<Vec<Candle>> {
        let key = CandleKey {
            market: market.to_string(),
            interval: SCAN_INTERVAL_LABEL.to_string(),
        };
        if let Some(cached) = self.services.candles.get_fresh(&key, confluence::MIN_CANDLES) {
            return Some(cached);
        }
        match self
            .services
            .client
            .get_candles(market, SCAN_INTERVAL_LABEL, SCAN_CANDLE_COUNT)
            .await
        {
            Ok(Some(candles)) if candles.len() >= confluence::MIN_CANDLES => {
                self.services.candles.put(key, candles.clone());
                Some(candles)
            }
            Ok(_) => None,
            Err(e) => {
                debug!(market, error = %e, "candle fetch failed");
                None
            }
        }
    }

    fn on_cooldown(&self, market: &str) -> bool {
        self.cooldowns
            .read()
            .get(market)
            .map(|until| *until > Instant::now())
            .unwrap_or(false)
    }

    fn start_cooldown(&self, market: &str, cooldown_sec: u64) {
        self.cooldowns
            .write()
            .insert(market.to_string(), Instant::now() + Duration::from_secs(cooldown_sec));
    }
}

// =============================================================================
// Free helpers (pure)
// =============================================================================

/// Last bar's volume over the mean of the preceding 20 bars.
pub fn volume_ratio(candles: &[Candle]) -> f64 {
    const WINDOW: usize = 20;
    if candles.len() < WINDOW + 1 {
        return 0.0;
    }
    let last = match candles.last() {
        Some(c) => c.volume,
        None => return 0.0,
    };
    let window = &candles[candles.len() - 1 - WINDOW..candles.len() - 1];
    let avg = window.iter().map(|c| c.volume).sum::<f64>() / WINDOW as f64;
    if avg <= 0.0 {
        return 0.0;
    }
    last / avg
}

/// Rank by confidence (strongest first) and keep the top `k` — the bounded
/// candidate queue with deterministic drop.
fn rank_candidates(mut candidates: Vec<Candidate>, k: usize) -> Vec<Candidate> {
    candidates.sort_by(|a, b| {
        b.entry
            .confidence
            .partial_cmp(&a.entry.confidence)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.market.cmp(&b.market))
    });
    candidates.truncate(k);
    candidates
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::risk::throttle::assess;

    fn candle_with_volume(volume: f64) -> Candle {
        Candle::new(0, 100.0, 101.0, 99.0, 100.0, volume)
    }

    #[test]
    fn volume_ratio_basic() {
        let mut candles = vec![candle_with_volume(10.0); 20];
        candles.push(candle_with_volume(25.0));
        assert!((volume_ratio(&candles) - 2.5).abs() < 1e-10);
    }

    #[test]
    fn volume_ratio_short_series_is_zero() {
        let candles = vec![candle_with_volume(10.0); 10];
        assert_eq!(volume_ratio(&candles), 0.0);
    }

    fn candidate(market: &str, confidence: f64) -> Candidate {
        Candidate {
            market: market.to_string(),
            price: 100.0,
            regime_label: "SIDEWAYS".to_string(),
            confluence_total: confidence,
            entry: EntrySignal {
                confidence,
                reason: "t".to_string(),
            },
            throttle: assess(&[]),
        }
    }

    #[test]
    fn ranking_keeps_strongest_k() {
        let ranked = rank_candidates(
            vec![
                candidate("KRW-A", 60.0),
                candidate("KRW-B", 90.0),
                candidate("KRW-C", 75.0),
                candidate("KRW-D", 55.0),
            ],
            2,
        );
        let markets: Vec<&str> = ranked.iter().map(|c| c.market.as_str()).collect();
        assert_eq!(markets, vec!["KRW-B", "KRW-C"]);
    }

    #[test]
    fn ranking_ties_break_by_market_symbol() {
        let ranked = rank_candidates(
            vec![candidate("KRW-Z", 70.0), candidate("KRW-A", 70.0)],
            2,
        );
        let markets: Vec<&str> = ranked.iter().map(|c| c.market.as_str()).collect();
        assert_eq!(markets, vec!["KRW-A", "KRW-Z"]);
    }
}
