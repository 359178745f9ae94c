// =============================================================================
// Per-strategy circuit breaker — consecutive losses + daily drawdown
// =============================================================================
//
// Each strategy engine carries its own breaker. A trip suspends the engine
// (its scans emit nothing) until an operator reset or the UTC day roll.
// =============================================================================

use std::collections::HashMap;

use chrono::Utc;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::types::StrategyCode;

/// Trip thresholds for one strategy.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BreakerConfig {
    /// Consecutive losing trades before the breaker trips.
    pub max_consecutive_losses: u32,
    /// Daily cumulative loss (KRW) before the breaker trips.
    pub daily_max_loss_krw: f64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            max_consecutive_losses: 3,
            daily_max_loss_krw: 50_000.0,
        }
    }
}

/// Serialisable snapshot of one strategy's breaker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerState {
    pub strategy_code: StrategyCode,
    pub consecutive_losses: u32,
    pub daily_pnl: f64,
    pub tripped: bool,
    pub suspended_reason: Option<String>,
    pub reset_at: Option<String>,
    pub current_date: String,
}

struct Inner {
    config: BreakerConfig,
    consecutive_losses: u32,
    daily_pnl: f64,
    tripped: bool,
    suspended_reason: Option<String>,
    reset_at: Option<String>,
    current_date: String,
}

impl Inner {
    fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            consecutive_losses: 0,
            daily_pnl: 0.0,
            tripped: false,
            suspended_reason: None,
            reset_at: None,
            current_date: utc_date(),
        }
    }

    fn reset(&mut self, reason: &str) {
        self.consecutive_losses = 0;
        self.daily_pnl = 0.0;
        self.tripped = false;
        self.suspended_reason = None;
        self.reset_at = Some(Utc::now().to_rfc3339());
        self.current_date = utc_date();
        info!(reason, "circuit breaker reset");
    }

    /// Reset daily counters (and any trip) when the UTC date rolls over.
    fn maybe_roll_day(&mut self) {
        let today = utc_date();
        if self.current_date != today {
            info!(old = %self.current_date, new = %today, "UTC day rolled — breaker counters reset");
            self.reset("utc_day_roll");
        }
    }
}

fn utc_date() -> String {
    Utc::now().format("%Y-%m-%d").to_string()
}

/// Registry of breakers, one per strategy code.
pub struct CircuitBreaker {
    states: RwLock<HashMap<StrategyCode, Inner>>,
}

impl CircuitBreaker {
    pub fn new() -> Self {
        Self {
            states: RwLock::new(HashMap::new()),
        }
    }

    /// Register (or reconfigure) a strategy's thresholds.
    pub fn register(&self, code: StrategyCode, config: BreakerConfig) {
        let mut states = self.states.write();
        match states.get_mut(&code) {
            Some(inner) => inner.config = config,
            None => {
                states.insert(code, Inner::new(config));
            }
        }
    }

    /// Record a closed trade's PnL (KRW) and evaluate the trip conditions.
    pub fn record_trade_result(&self, code: StrategyCode, pnl_krw: f64) {
        let mut states = self.states.write();
        let inner = states.entry(code).or_insert_with(|| Inner::new(BreakerConfig::default()));
        inner.maybe_roll_day();

        inner.daily_pnl += pnl_krw;
        if pnl_krw < 0.0 {
            inner.consecutive_losses += 1;
        } else {
            inner.consecutive_losses = 0;
        }

        if !inner.tripped {
            if inner.consecutive_losses >= inner.config.max_consecutive_losses {
                inner.tripped = true;
                inner.suspended_reason = Some(format!(
                    "{} consecutive losses (limit {})",
                    inner.consecutive_losses, inner.config.max_consecutive_losses
                ));
                warn!(
                    strategy = %code,
                    consecutive_losses = inner.consecutive_losses,
                    "circuit breaker TRIPPED (loss streak)"
                );
            } else if inner.daily_pnl <= -inner.config.daily_max_loss_krw {
                inner.tripped = true;
                inner.suspended_reason = Some(format!(
                    "daily loss {:.0} KRW (limit {:.0})",
                    -inner.daily_pnl, inner.config.daily_max_loss_krw
                ));
                warn!(
                    strategy = %code,
                    daily_pnl = inner.daily_pnl,
                    "circuit breaker TRIPPED (daily drawdown)"
                );
            }
        }
    }

    /// `Some(reason)` when the strategy is suspended.
    pub fn tripped_reason(&self, code: StrategyCode) -> Option<String> {
        let mut states = self.states.write();
        let inner = states.get_mut(&code)?;
        inner.maybe_roll_day();
        if inner.tripped {
            inner.suspended_reason.clone().or_else(|| Some("tripped".to_string()))
        } else {
            None
        }
    }

    /// Operator reset (admin endpoint). Returns `true` when the strategy was
    /// known to the registry.
    pub fn reset(&self, code: StrategyCode) -> bool {
        let mut states = self.states.write();
        match states.get_mut(&code) {
            Some(inner) => {
                inner.reset("manual");
                true
            }
            None => false,
        }
    }

    pub fn snapshot(&self, code: StrategyCode) -> Option<CircuitBreakerState> {
        let mut states = self.states.write();
        let inner = states.get_mut(&code)?;
        inner.maybe_roll_day();
        Some(CircuitBreakerState {
            strategy_code: code,
            consecutive_losses: inner.consecutive_losses,
            daily_pnl: inner.daily_pnl,
            tripped: inner.tripped,
            suspended_reason: inner.suspended_reason.clone(),
            reset_at: inner.reset_at.clone(),
            current_date: inner.current_date.clone(),
        })
    }

    pub fn snapshots(&self) -> Vec<CircuitBreakerState> {
        let codes: Vec<StrategyCode> = self.states.read().keys().copied().collect();
        codes.into_iter().filter_map(|c| self.snapshot(c)).collect()
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new()
    }
}
