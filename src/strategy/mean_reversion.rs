// =============================================================================
// Mean-reversion / breakout engine — two legs, one book
// =============================================================================
//
// Reversion leg: oversold probes of the lower Bollinger band inside a range.
// Breakout leg: closes above the upper band on expanding volume in a bull
// trend. The legs are mutually exclusive on any given tick.
// =============================================================================

use crate::config::StrategyConfig;
use crate::regime::Regime;
use crate::strategy::{EntrySignal, MarketContext, Strategy};
use crate::types::StrategyCode;

/// Reversion leg: %B at or below this.
const REVERSION_PERCENT_B: f64 = 0.2;
/// Reversion leg: RSI at or below this.
const REVERSION_RSI: f64 = 40.0;
/// Breakout leg: volume expansion floor.
const BREAKOUT_VOLUME_RATIO: f64 = 1.5;

pub struct MeanReversionStrategy;

impl Strategy for MeanReversionStrategy {
    fn code(&self) -> StrategyCode {
        StrategyCode::MeanReversion
    }

    fn evaluate(&self, ctx: &MarketContext, _config: &StrategyConfig) -> Option<EntrySignal> {
        let rsi = ctx.rsi?;
        let percent_b = ctx.percent_b?;

        // ── Reversion leg ──────────────────────────────────────────────
        if ctx.regime.regime == Regime::Sideways
            && percent_b <= REVERSION_PERCENT_B
            && rsi <= REVERSION_RSI
        {
            let depth_bonus = ((REVERSION_PERCENT_B - percent_b) * 25.0).min(10.0);
            return Some(EntrySignal {
                confidence: (ctx.confluence.total + depth_bonus).min(100.0),
                reason: format!("mean reversion: %B {percent_b:.2}, RSI {rsi:.0}"),
            });
        }

        // ── Breakout leg ───────────────────────────────────────────────
        if ctx.regime.regime == Regime::BullTrend
            && percent_b >= 1.0
            && ctx.volume_ratio >= BREAKOUT_VOLUME_RATIO
            && ctx.momentum_pct > 0.0
        {
            // Confluence is built for dip-buying and reads low here; the
            // breakout confidence comes from trend strength and volume.
            let volume_bonus = ((ctx.volume_ratio - BREAKOUT_VOLUME_RATIO) * 10.0).min(15.0);
            let confidence = (55.0 + ctx.regime.confidence * 0.3 + volume_bonus).min(100.0);
            return Some(EntrySignal {
                confidence,
                reason: format!(
                    "breakout above upper band: vol {:.1}x, momentum {:.1}%",
                    ctx.volume_ratio, ctx.momentum_pct
                ),
            });
        }

        None
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategy::test_support::context;

    fn config() -> StrategyConfig {
        StrategyConfig::defaults_for(StrategyCode::MeanReversion)
    }

    #[test]
    fn reversion_leg_fires_at_lower_band() {
        let mut ctx = context("KRW-ETH");
        ctx.percent_b = Some(0.05);
        ctx.rsi = Some(32.0);
        let signal = MeanReversionStrategy.evaluate(&ctx, &config()).unwrap();
        assert!(signal.confidence >= ctx.confluence.total);
        assert!(signal.reason.contains("mean reversion"));
    }

    #[test]
    fn reversion_needs_sideways_regime() {
        let mut ctx = context("KRW-ETH");
        ctx.percent_b = Some(0.05);
        ctx.rsi = Some(32.0);
        ctx.regime.regime = Regime::BullTrend;
        assert!(MeanReversionStrategy.evaluate(&ctx, &config()).is_none());
    }

    #[test]
    fn breakout_leg_fires_on_expansion() {
        let mut ctx = context("KRW-ETH");
        ctx.regime.regime = Regime::BullTrend;
        ctx.percent_b = Some(1.05);
        ctx.rsi = Some(68.0);
        ctx.volume_ratio = 2.2;
        ctx.momentum_pct = 3.0;
        let signal = MeanReversionStrategy.evaluate(&ctx, &config()).unwrap();
        assert!(signal.reason.contains("breakout"));
        assert!(signal.confidence >= 55.0);
    }

    #[test]
    fn breakout_needs_volume() {
        let mut ctx = context("KRW-ETH");
        ctx.regime.regime = Regime::BullTrend;
        ctx.percent_b = Some(1.05);
        ctx.volume_ratio = 1.1;
        ctx.momentum_pct = 3.0;
        assert!(MeanReversionStrategy.evaluate(&ctx, &config()).is_none());
    }

    #[test]
    fn mid_band_does_nothing() {
        let ctx = context("KRW-ETH");
        assert!(MeanReversionStrategy.evaluate(&ctx, &config()).is_none());
    }
}
