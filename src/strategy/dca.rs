// =============================================================================
// DCA engine — slow accumulation on confluence dips
// =============================================================================
//
// The patient engine: long scan cadence, long timeout, wide stop. It buys
// whenever the shared gate passes and the market is not in a bear trend,
// letting the position profile (no regime-shift exit, 24 h timeout) carry
// the position.
// =============================================================================

use crate::confluence::ConfluenceClass;
use crate::config::StrategyConfig;
use crate::regime::Regime;
use crate::strategy::{EntrySignal, MarketContext, Strategy};
use crate::types::StrategyCode;

pub struct DcaStrategy;

impl Strategy for DcaStrategy {
    fn code(&self) -> StrategyCode {
        StrategyCode::Dca
    }

    fn evaluate(&self, ctx: &MarketContext, _config: &StrategyConfig) -> Option<EntrySignal> {
        // Accumulation never buys into a falling knife.
        if ctx.regime.regime == Regime::BearTrend {
            return None;
        }
        if ctx.confluence.classification == ConfluenceClass::NoSignal
            || ctx.confluence.classification == ConfluenceClass::InsufficientData
        {
            return None;
        }

        Some(EntrySignal {
            confidence: ctx.confluence.total,
            reason: format!(
                "dca accumulation ({} at {:.0})",
                ctx.confluence.classification, ctx.confluence.total
            ),
        })
    }
}
