// =============================================================================
// Average Directional Index (ADX) with Directional Indicators
// =============================================================================
//
// Pipeline:
//   1. +DM / -DM and True Range per bar.
//   2. Wilder's smoothing of +DM, -DM, TR.
//   3. +DI = smoothed(+DM) / smoothed(TR) * 100 (same for -DI).
//   4. DX = |+DI - -DI| / (+DI + -DI) * 100.
//   5. ADX = Wilder's smoothed average of DX over `period` bars.
//
// The regime detector needs both trend strength (ADX) and direction
// (+DI vs -DI), so the final DI pair is returned alongside the ADX.
// =============================================================================

use crate::market_data::Candle;

/// ADX plus the final directional indicator pair.
#[derive(Debug, Clone, Copy)]
pub struct AdxResult {
    pub adx: f64,
    pub plus_di: f64,
    pub minus_di: f64,
}

impl AdxResult {
    /// +1 when +DI dominates, -1 when -DI dominates, 0 on a dead heat.
    pub fn di_direction(&self) -> i8 {
        if self.plus_di > self.minus_di {
            1
        } else if self.minus_di > self.plus_di {
            -1
        } else {
            0
        }
    }
}

/// Compute the most recent ADX (and DI pair) from OHLCV candles.
///
/// Returns `None` when `period` is zero, fewer than `2 * period + 1` candles
/// are available (initial smoothing plus the DX seed window), or any
/// intermediate value is non-finite.
pub fn calculate_adx(candles: &[Candle], period: usize) -> Option<AdxResult> {
    if period == 0 || candles.len() < 2 * period + 1 {
        return None;
    }

    let period_f = period as f64;
    let n = candles.len();
    let bar_count = n - 1;

    let mut plus_dm = Vec::with_capacity(bar_count);
    let mut minus_dm = Vec::with_capacity(bar_count);
    let mut tr_vals = Vec::with_capacity(bar_count);

    for i in 1..n {
        let high = candles[i].high;
        let low = candles[i].low;
        let prev_high = candles[i - 1].high;
        let prev_low = candles[i - 1].low;
        let prev_close = candles[i - 1].close;

        let tr = (high - low)
            .max((high - prev_close).abs())
            .max((low - prev_close).abs());

        let up_move = high - prev_high;
        let down_move = prev_low - low;

        plus_dm.push(if up_move > down_move && up_move > 0.0 { up_move } else { 0.0 });
        minus_dm.push(if down_move > up_move && down_move > 0.0 { down_move } else { 0.0 });
        tr_vals.push(tr);
    }

    // Initial Wilder sums over the first `period` bars.
    let mut smooth_plus: f64 = plus_dm[..period].iter().sum();
    let mut smooth_minus: f64 = minus_dm[..period].iter().sum();
    let mut smooth_tr: f64 = tr_vals[..period].iter().sum();

    let mut dx_values = Vec::with_capacity(bar_count - period + 1);
    let (mut plus_di, mut minus_di, dx) = directional_values(smooth_plus, smooth_minus, smooth_tr)?;
    dx_values.push(dx);

    for i in period..bar_count {
        smooth_plus = smooth_plus - smooth_plus / period_f + plus_dm[i];
        smooth_minus = smooth_minus - smooth_minus / period_f + minus_dm[i];
        smooth_tr = smooth_tr - smooth_tr / period_f + tr_vals[i];

        let (p, m, dx) = directional_values(smooth_plus, smooth_minus, smooth_tr)?;
        plus_di = p;
        minus_di = m;
        dx_values.push(dx);
    }

    if dx_values.len() < period {
        return None;
    }

    let mut adx: f64 = dx_values[..period].iter().sum::<f64>() / period_f;
    for &dx in &dx_values[period..] {
        adx = (adx * (period_f - 1.0) + dx) / period_f;
    }

    if adx.is_finite() {
        Some(AdxResult { adx, plus_di, minus_di })
    } else {
        None
    }
}

// =============================================================================
// Internal helpers
// =============================================================================

/// Derive (+DI, -DI, DX) from smoothed sums. `None` when TR is zero or the
/// values are non-finite.
fn directional_values(smooth_plus: f64, smooth_minus: f64, smooth_tr: f64) -> Option<(f64, f64, f64)> {
    if smooth_tr == 0.0 || !smooth_tr.is_finite() {
        return None;
    }

    let plus_di = (smooth_plus / smooth_tr) * 100.0;
    let minus_di = (smooth_minus / smooth_tr) * 100.0;

    let di_sum = plus_di + minus_di;
    let dx = if di_sum == 0.0 {
        0.0 // No directional movement at all.
    } else {
        ((plus_di - minus_di).abs() / di_sum) * 100.0
    };

    if plus_di.is_finite() && minus_di.is_finite() && dx.is_finite() {
        Some((plus_di, minus_di, dx))
    } else {
        None
    }
}
