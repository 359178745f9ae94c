// =============================================================================
// Position Sizer — Half-Kelly notional, gated by throttle and caps
// =============================================================================
//
// Kelly fraction f* = (b*p - q) / b with b = reward:risk, p = win rate,
// q = 1 - p. Half-Kelly is applied for variance reduction, then the fraction
// is scaled by signal confidence and the throttle multiplier, clamped to the
// configured position band, and floored at the exchange minimum notional.
// =============================================================================

use serde::{Deserialize, Serialize};

/// Exchange minimum order notional (KRW).
pub const MIN_NOTIONAL_KRW: f64 = 5_100.0;

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SizerConfig {
    /// Fraction of the raw Kelly to use (0.5 = Half-Kelly).
    pub kelly_multiplier: f64,
    /// Smallest allowed position as a fraction of capital.
    pub min_position_pct: f64,
    /// Largest allowed position as a fraction of capital.
    pub max_position_pct: f64,
    /// Exchange minimum notional in KRW.
    pub min_notional_krw: f64,
}

impl Default for SizerConfig {
    fn default() -> Self {
        Self {
            kelly_multiplier: 0.5,
            min_position_pct: 0.01,
            max_position_pct: 0.10,
            min_notional_krw: MIN_NOTIONAL_KRW,
        }
    }
}

/// Raw Kelly fraction `(b*p - q) / b`. Returns 0 when the edge is negative
/// or the inputs are degenerate.
pub fn kelly_fraction(win_rate: f64, reward_risk: f64) -> f64 {
    if reward_risk <= 0.0 || !(0.0..=1.0).contains(&win_rate) {
        return 0.0;
    }
    let q = 1.0 - win_rate;
    let f = (reward_risk * win_rate - q) / reward_risk;
    f.max(0.0)
}

/// Compute the entry notional in KRW, or `None` when there is no edge or the
/// result cannot clear the exchange minimum.
///
/// `confidence` is the signal confidence in [0, 100]; `throttle_multiplier`
/// comes from the risk throttle in [0, 1].
pub fn position_notional(
    capital_krw: f64,
    win_rate: f64,
    reward_risk: f64,
    confidence: f64,
    throttle_multiplier: f64,
    config: &SizerConfig,
) -> Option<f64> {
    if capital_krw <= 0.0 {
        return None;
    }

    let kelly = kelly_fraction(win_rate, reward_risk);
    if kelly <= 0.0 {
        return None;
    }

    let scaled = kelly
        * config.kelly_multiplier
        * (confidence / 100.0).clamp(0.0, 1.0)
        * throttle_multiplier.clamp(0.0, 1.0);
    if scaled <= 0.0 {
        return None;
    }

    let fraction = scaled.clamp(config.min_position_pct, config.max_position_pct);
    let notional = capital_krw * fraction;

    // The exchange refuses anything below its minimum; bump up when capital
    // allows, otherwise there is no valid order to place.
    if notional >= config.min_notional_krw {
        Some(notional)
    } else if capital_krw >= config.min_notional_krw {
        Some(config.min_notional_krw)
    } else {
        None
    }
}
