// =============================================================================
// Meme-scalper engine — fast entries on small-cap momentum bursts
// =============================================================================
//
// Works the small-cap band only (the 24h-value window in its config), wants
// fresh momentum, and refuses anything already overheated. Exits are handled
// by the tightest profile in the book (30 s monitor, 30 min timeout).
// =============================================================================

use crate::config::StrategyConfig;
use crate::regime::Regime;
use crate::strategy::{EntrySignal, MarketContext, Strategy};
use crate::types::StrategyCode;

/// Momentum floor for a scalp entry (%).
const MIN_MOMENTUM_PCT: f64 = 0.5;

pub struct MemeScalperStrategy;

impl Strategy for MemeScalperStrategy {
    fn code(&self) -> StrategyCode {
        StrategyCode::MemeScalper
    }

    fn evaluate(&self, ctx: &MarketContext, _config: &StrategyConfig) -> Option<EntrySignal> {
        if ctx.momentum_pct < MIN_MOMENTUM_PCT {
            return None;
        }
        // A scalp into a confirmed bear trend is a donation.
        if ctx.regime.regime == Regime::BearTrend {
            return None;
        }

        let momentum_bonus = (ctx.momentum_pct * 2.0).min(20.0);
        Some(EntrySignal {
            confidence: (ctx.confluence.total + momentum_bonus).min(100.0),
            reason: format!(
                "scalp: momentum {:.1}%, vol {:.1}x",
                ctx.momentum_pct, ctx.volume_ratio
            ),
        })
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
        StrategyConfig::defaults_for(StrategyCode::MemeScalper)
    }

    #[test]
    fn momentum_burst_enters() {
        let mut ctx = context("KRW-DOGE");
        ctx.momentum_pct = 2.0;
        ctx.volume_ratio = 2.5;
        let signal = MemeScalperStrategy.evaluate(&ctx, &config()).unwrap();
        assert!((signal.confidence - 64.0).abs() < 1e-10); // 60 + 2*2
    }

    #[test]
    fn flat_momentum_is_rejected() {
        let mut ctx = context("KRW-DOGE");
        ctx.momentum_pct = 0.2;
        assert!(MemeScalperStrategy.evaluate(&ctx, &config()).is_none());
    }

    #[test]
    fn bear_trend_is_rejected() {
        let mut ctx = context("KRW-DOGE");
        ctx.momentum_pct = 2.0;
        ctx.regime.regime = Regime::BearTrend;
        assert!(MemeScalperStrategy.evaluate(&ctx, &config()).is_none());
    }

    #[test]
    fn momentum_bonus_capped_at_twenty() {
        let mut ctx = context("KRW-DOGE");
        ctx.momentum_pct = 50.0;
        let signal = MemeScalperStrategy.evaluate(&ctx, &config()).unwrap();
        assert!((signal.confidence - 80.0).abs() < 1e-10); // 60 + capped 20
    }
}
