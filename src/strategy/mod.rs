// =============================================================================
// Strategy engines — capability interface and shared scan context
// =============================================================================
//
// Each engine implements the `Strategy` trait: a pure per-market evaluation
// over a prepared `MarketContext`. The shared `StrategyEngine` runner (in
// `engine.rs`) owns all IO — market list, candles, regime, confluence,
// throttle, sizing, execution — and calls the trait at the decision point.
// No shared base-class state: engine-specific state lives inside each
// implementation.
// =============================================================================

pub mod dca;
pub mod engine;
pub mod guided;
pub mod mean_reversion;
pub mod meme_scalper;
pub mod volatility_survival;
pub mod volume_surge;

pub use engine::StrategyEngine;
pub use guided::GuidedQueue;

use crate::config::StrategyConfig;
use crate::confluence::ConfluenceResult;
use crate::regime::RegimeAnalysis;
use crate::types::StrategyCode;

/// Everything a strategy needs to judge one market on one scan tick.
#[derive(Debug, Clone)]
pub struct MarketContext {
    pub market: String,
    pub price: f64,
    pub rsi: Option<f64>,
    pub percent_b: Option<f64>,
    /// Last volume over the 20-bar average.
    pub volume_ratio: f64,
    /// 12-bar momentum in percent (from the regime analysis).
    pub momentum_pct: f64,
    /// 24h traded value in KRW.
    pub value_24h_krw: f64,
    pub regime: RegimeAnalysis,
    pub confluence: ConfluenceResult,
}

/// A strategy's verdict on one market.
#[derive(Debug, Clone)]
pub struct EntrySignal {
    /// Signal confidence in [0, 100]; still subject to the throttle floor.
    pub confidence: f64,
    pub reason: String,
}

/// Capability interface every engine provides.
pub trait Strategy: Send + Sync {
    fn code(&self) -> StrategyCode;

    /// Judge one market. `None` means no entry. The shared predicates
    /// (min confluence, max RSI, min volume ratio, regime whitelist) have
    /// already passed when this is called.
    fn evaluate(&self, ctx: &MarketContext, config: &StrategyConfig) -> Option<EntrySignal>;

    /// Called once an entry for `market` has been executed. Engines with
    /// consumable state (e.g. the guided queue) override this.
    fn on_entry(&self, _market: &str) {}
}
