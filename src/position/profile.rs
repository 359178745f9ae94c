// =============================================================================
// Exit profile — per-strategy exit management parameters
// =============================================================================

use serde::{Deserialize, Serialize};

use crate::config::StrategyConfig;

/// Immutable snapshot of a strategy's exit rules, taken when a monitor tick
/// starts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExitProfile {
    pub stop_loss_percent: f64,
    pub take_profit_percent: f64,
    /// Unrealized PnL% at which the trailing stop arms.
    pub trailing_trigger_pct: f64,
    /// Trailing distance below the peak, in percent.
    pub trailing_offset_pct: f64,
    pub break_even_trigger_pct: f64,
    pub profit_lock_trigger_pct: f64,
    pub profit_lock_min_pct: f64,
    pub half_take_profit_ratio: f64,
    pub confluence_degradation: f64,
    pub divergence_stop_tighten_pct: f64,
    pub position_timeout_min: u64,
    pub regime_shift_exit: bool,
}

impl ExitProfile {
    pub fn from_config(config: &StrategyConfig) -> Self {
        Self {
            stop_loss_percent: config.stop_loss_percent,
            take_profit_percent: config.take_profit_percent,
            trailing_trigger_pct: config.trailing_stop_trigger,
            trailing_offset_pct: config.trailing_stop_offset,
            break_even_trigger_pct: config.break_even_trigger_pct,
            profit_lock_trigger_pct: config.profit_lock_trigger_pct,
            profit_lock_min_pct: config.profit_lock_min_pct,
            half_take_profit_ratio: config.half_take_profit_ratio,
            confluence_degradation: config.confluence_degradation,
            divergence_stop_tighten_pct: config.divergence_stop_tighten_pct,
            position_timeout_min: config.position_timeout_min,
            regime_shift_exit: config.regime_shift_exit,
        }
    }

    /// PnL% at which the half take-profit fires (half the full target).
    pub fn half_target_pct(&self) -> f64 {
        self.take_profit_percent / 2.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::StrategyCode;

    #[test]
    fn profile_mirrors_strategy_config() {
        let config = StrategyConfig::defaults_for(StrategyCode::MemeScalper);
        let profile = ExitProfile::from_config(&config);
        assert!((profile.stop_loss_percent - config.stop_loss_percent).abs() < 1e-12);
        assert!((profile.trailing_trigger_pct - config.trailing_stop_trigger).abs() < 1e-12);
        assert_eq!(profile.position_timeout_min, config.position_timeout_min);
        assert!((profile.half_target_pct() - config.take_profit_percent / 2.0).abs() < 1e-12);
    }
}
