// =============================================================================
// Volume-surge engine — rides unusual volume with positive momentum
// =============================================================================

use crate::confluence::ConfluenceClass;
use crate::config::StrategyConfig;
use crate::strategy::{EntrySignal, MarketContext, Strategy};
use crate::types::StrategyCode;

pub struct VolumeSurgeStrategy;

impl Strategy for VolumeSurgeStrategy {
    fn code(&self) -> StrategyCode {
        StrategyCode::VolumeSurge
    }

    fn evaluate(&self, ctx: &MarketContext, config: &StrategyConfig) -> Option<EntrySignal> {
        // The shared gate already checked min_volume_ratio; the surge engine
        // additionally demands momentum in its favour and a live signal.
        if ctx.momentum_pct <= 0.0 {
            return None;
        }
        if ctx.confluence.classification == ConfluenceClass::NoSignal
            || ctx.confluence.classification == ConfluenceClass::InsufficientData
        {
            return None;
        }

        let surge_bonus = ((ctx.volume_ratio - config.min_volume_ratio) * 5.0).clamp(0.0, 15.0);
        Some(EntrySignal {
            confidence: (ctx.confluence.total + surge_bonus).min(100.0),
            reason: format!(
                "volume surge {:.1}x with momentum {:.1}%",
                ctx.volume_ratio, ctx.momentum_pct
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
        StrategyConfig::defaults_for(StrategyCode::VolumeSurge)
    }

    #[test]
    fn surge_with_momentum_enters() {
        let mut ctx = context("KRW-SOL");
        ctx.volume_ratio = 3.0;
        ctx.momentum_pct = 1.5;
        let signal = VolumeSurgeStrategy.evaluate(&ctx, &config()).unwrap();
        // 2x over the 2.0 floor adds a 5-point bonus.
        assert!((signal.confidence - 65.0).abs() < 1e-10);
    }

    #[test]
    fn negative_momentum_is_rejected() {
        let mut ctx = context("KRW-SOL");
        ctx.volume_ratio = 3.0;
        ctx.momentum_pct = -0.5;
        assert!(VolumeSurgeStrategy.evaluate(&ctx, &config()).is_none());
    }

    #[test]
    fn bonus_is_capped() {
        let mut ctx = context("KRW-SOL");
        ctx.volume_ratio = 50.0;
        ctx.momentum_pct = 2.0;
        let signal = VolumeSurgeStrategy.evaluate(&ctx, &config()).unwrap();
        assert!(signal.confidence <= 100.0);
        assert!((signal.confidence - 75.0).abs() < 1e-10); // 60 + capped 15
    }
}
