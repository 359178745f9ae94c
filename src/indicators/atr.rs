// =============================================================================
// Average True Range (ATR) — Wilder's Smoothing Method
// =============================================================================
//
// True Range (TR) for each bar:
//   TR = max(H - L, |H - prevClose|, |L - prevClose|)
//
// ATR:
//   ATR_0 = SMA of first `period` TR values
//   ATR_t = (ATR_{t-1} * (period - 1) + TR_t) / period
//
// Default period: 14
// =============================================================================

use crate::market_data::Candle;

/// Compute the most recent ATR value from a slice of OHLCV candles
/// (oldest first).
///
/// Returns `None` when `period` is zero, fewer than `period + 1` candles are
/// available, or any intermediate value is non-finite.
pub fn calculate_atr(candles: &[Candle], period: usize) -> Option<f64> {
    atr_series(candles, period)?.last().copied()
}

/// ATR as a percentage of the most recent close.
pub fn calculate_atr_pct(candles: &[Candle], period: usize) -> Option<f64> {
    let atr = calculate_atr(candles, period)?;
    let last_close = candles.last()?.close;
    if last_close == 0.0 {
        return None;
    }
    Some((atr / last_close) * 100.0)
}

/// Rolling ATR% series — one value per bar starting at index `period`.
///
/// The regime detector feeds the tail of this series into its volatility
/// percentile and z-score checks.
pub fn atr_pct_series(candles: &[Candle], period: usize) -> Option<Vec<f64>> {
    let atrs = atr_series(candles, period)?;
    // atrs[i] corresponds to candles[period + i].
    let mut out = Vec::with_capacity(atrs.len());
    for (i, &atr) in atrs.iter().enumerate() {
        let close = candles[period + i].close;
        if close == 0.0 {
            return None;
        }
        let pct = (atr / close) * 100.0;
        if !pct.is_finite() {
            return None;
        }
        out.push(pct);
    }
    Some(out)
}

// =============================================================================
// Internal helpers
// =============================================================================

/// Full ATR series via Wilder's smoothing. `None` on bad input.
fn atr_series(candles: &[Candle], period: usize) -> Option<Vec<f64>> {
    if period == 0 || candles.len() < period + 1 {
        return None;
    }

    let mut tr_values: Vec<f64> = Vec::with_capacity(candles.len() - 1);
    for i in 1..candles.len() {
        let high = candles[i].high;
        let low = candles[i].low;
        let prev_close = candles[i - 1].close;

        let tr = (high - low)
            .max((high - prev_close).abs())
            .max((low - prev_close).abs());
        tr_values.push(tr);
    }

    let period_f = period as f64;
    let seed: f64 = tr_values[..period].iter().sum::<f64>() / period_f;
    if !seed.is_finite() {
        return None;
    }

    let mut out = Vec::with_capacity(tr_values.len() - period + 1);
    out.push(seed);

    let mut atr = seed;
    for &tr in &tr_values[period..] {
        atr = (atr * (period_f - 1.0) + tr) / period_f;
        if !atr.is_finite() {
            return None;
        }
        out.push(atr);
    }

    Some(out)
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn candle(open: f64, high: f64, low: f64, close: f64) -> Candle {
        Candle::new(0, open, high, low, close, 100.0)
    }

    #[test]
    fn atr_period_zero() {
        let candles = vec![candle(100.0, 105.0, 95.0, 102.0); 20];
        assert!(calculate_atr(&candles, 0).is_none());
    }

    #[test]
    fn atr_insufficient_data() {
        let candles = vec![candle(100.0, 105.0, 95.0, 102.0); 10];
        assert!(calculate_atr(&candles, 14).is_none());
    }

    #[test]
    fn atr_constant_range_converges() {
        // Constant H-L = 10 with close at midpoint: ATR converges to 10.
        let mut candles = Vec::new();
        for i in 0..30 {
            let base = 100.0 + i as f64 * 0.1;
            candles.push(candle(base, base + 5.0, base - 5.0, base));
        }
        let atr = calculate_atr(&candles, 14).unwrap();
        assert!((atr - 10.0).abs() < 1.0, "expected ATR near 10, got {atr}");
    }

    #[test]
    fn atr_constant_price_converges_to_zero() {
        // Zero-range bars: TR = 0 everywhere, ATR = 0 within `period` bars.
        let candles = vec![candle(100.0, 100.0, 100.0, 100.0); 30];
        let atr = calculate_atr(&candles, 14).unwrap();
        assert!(atr.abs() < 1e-10, "expected ATR 0 for flat input, got {atr}");
    }

    #[test]
    fn atr_gap_uses_prev_close() {
        let candles = vec![
            candle(100.0, 105.0, 95.0, 95.0),
            candle(110.0, 115.0, 108.0, 112.0), // gap up: |115-95| = 20 > 7
            candle(112.0, 118.0, 110.0, 115.0),
            candle(115.0, 120.0, 113.0, 118.0),
        ];
        let atr = calculate_atr(&candles, 3).unwrap();
        assert!(atr > 7.0, "ATR should reflect the gap, got {atr}");
    }

    #[test]
    fn atr_pct_scales_with_price() {
        let candles: Vec<Candle> = (0..30)
            .map(|i| {
                let base = 100.0 + i as f64;
                candle(base, base + 3.0, base - 3.0, base + 1.0)
            })
            .collect();
        let pct = calculate_atr_pct(&candles, 14).unwrap();
        assert!(pct > 0.0 && pct.is_finite());
    }

    #[test]
    fn atr_pct_series_length() {
        let candles: Vec<Candle> = (0..50)
            .map(|i| {
                let base = 100.0 + (i as f64 * 0.5).sin() * 10.0;
                candle(base - 0.5, base + 2.0, base - 2.0, base + 0.5)
            })
            .collect();
        let series = atr_pct_series(&candles, 14).unwrap();
        // One value per bar from index `period` on: 50 - 1 - 14 + 1 = 36.
        assert_eq!(series.len(), 36);
        for &v in &series {
            assert!(v >= 0.0 && v.is_finite());
        }
    }

    #[test]
    fn atr_nan_returns_none() {
        let candles = vec![
            candle(100.0, 105.0, 95.0, 100.0),
            candle(100.0, f64::NAN, f64::NAN, 100.0),
            candle(100.0, 105.0, 95.0, 100.0),
            candle(100.0, 105.0, 95.0, 100.0),
        ];
        assert!(calculate_atr(&candles, 3).is_none());
    }
}
