// =============================================================================
// Volatility-survival engine — oversold knives in high-volatility regimes
// =============================================================================
//
// Only trades when the regime whitelist (HIGH_VOLATILITY) lets a market
// through, then demands a genuinely washed-out read: deep RSI or a close
// under the lower band. Sized small by its config, stopped tight.
// =============================================================================

use crate::config::StrategyConfig;
use crate::strategy::{EntrySignal, MarketContext, Strategy};
use crate::types::StrategyCode;

/// RSI at or below this counts as washed out.
const OVERSOLD_RSI: f64 = 30.0;

pub struct VolatilitySurvivalStrategy;

impl Strategy for VolatilitySurvivalStrategy {
    fn code(&self) -> StrategyCode {
        StrategyCode::VolatilitySurvival
    }

    fn evaluate(&self, ctx: &MarketContext, _config: &StrategyConfig) -> Option<EntrySignal> {
        let rsi = ctx.rsi?;
        let deep_rsi = rsi <= OVERSOLD_RSI;
        let under_band = ctx.percent_b.map(|pb| pb <= 0.0).unwrap_or(false);

        if !deep_rsi && !under_band {
            return None;
        }
        // Selling pressure must already be decelerating.
        if ctx.momentum_pct < -3.0 {
            return None;
        }

        let washout_bonus = if deep_rsi && under_band { 10.0 } else { 5.0 };
        Some(EntrySignal {
            confidence: (ctx.confluence.total + washout_bonus).min(100.0),
            reason: format!("high-vol washout: RSI {rsi:.0}, %B {:?}", ctx.percent_b),
        })
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::regime::Regime;
    use crate::strategy::test_support::context;

    fn config() -> StrategyConfig {
        StrategyConfig::defaults_for(StrategyCode::VolatilitySurvival)
    }

    fn high_vol_ctx() -> super::MarketContext {
        let mut ctx = context("KRW-AVAX");
        ctx.regime.regime = Regime::HighVolatility;
        ctx
    }

    #[test]
    fn deep_oversold_enters() {
        let mut ctx = high_vol_ctx();
        ctx.rsi = Some(22.0);
        ctx.percent_b = Some(-0.1);
        let signal = VolatilitySurvivalStrategy.evaluate(&ctx, &config()).unwrap();
        assert!((signal.confidence - 70.0).abs() < 1e-10); // 60 + 10 double washout
    }

    #[test]
    fn single_condition_gets_smaller_bonus() {
        let mut ctx = high_vol_ctx();
        ctx.rsi = Some(28.0);
        ctx.percent_b = Some(0.3);
        let signal = VolatilitySurvivalStrategy.evaluate(&ctx, &config()).unwrap();
        assert!((signal.confidence - 65.0).abs() < 1e-10);
    }

    #[test]
    fn neutral_rsi_is_rejected() {
        let mut ctx = high_vol_ctx();
        ctx.rsi = Some(45.0);
        ctx.percent_b = Some(0.4);
        assert!(VolatilitySurvivalStrategy.evaluate(&ctx, &config()).is_none());
    }

    #[test]
    fn accelerating_crash_is_rejected() {
        let mut ctx = high_vol_ctx();
        ctx.rsi = Some(20.0);
        ctx.momentum_pct = -5.0;
        assert!(VolatilitySurvivalStrategy.evaluate(&ctx, &config()).is_none());
    }
}
