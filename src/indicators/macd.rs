// =============================================================================
// Moving Average Convergence Divergence (MACD)
// =============================================================================
//
// MACD line  = EMA(fast) - EMA(slow), aligned by dropping the fast prefix.
// Signal     = EMA(signal_period) of the MACD line.
// Histogram  = MACD - Signal.
//
// Default parameters: (12, 26, 9). Scalping variant: (5, 13, 6).
// =============================================================================

use crate::indicators::ema::calculate_ema;

/// MACD parameter set `(fast, slow, signal)`.
pub const DEFAULT_PARAMS: (usize, usize, usize) = (12, 26, 9);
pub const SCALPING_PARAMS: (usize, usize, usize) = (5, 13, 6);

/// MACD, signal, and histogram series, all trimmed to the same length and
/// aligned at the most recent bar.
#[derive(Debug, Clone)]
pub struct MacdResult {
    pub macd: Vec<f64>,
    pub signal: Vec<f64>,
    pub histogram: Vec<f64>,
}

impl MacdResult {
    pub fn last_macd(&self) -> Option<f64> {
        self.macd.last().copied()
    }

    pub fn last_histogram(&self) -> Option<f64> {
        self.histogram.last().copied()
    }

    /// True when the MACD line crossed above its signal line on the most
    /// recent bar.
    pub fn bullish_signal_cross(&self) -> bool {
        let n = self.macd.len();
        if n < 2 {
            return false;
        }
        self.macd[n - 2] <= self.signal[n - 2] && self.macd[n - 1] > self.signal[n - 1]
    }

    /// True when the last three histogram bars show a reversal shape
    /// (negative, negative, positive).
    pub fn histogram_reversal(&self) -> bool {
        let n = self.histogram.len();
        if n < 3 {
            return false;
        }
        self.histogram[n - 3] < 0.0
            && self.histogram[n - 2] < 0.0
            && self.histogram[n - 1] > 0.0
    }
}

/// Compute MACD over `closes` with the given `(fast, slow, signal)` periods.
///
/// Returns `None` when parameters are degenerate (`fast >= slow`, any zero)
/// or there is not enough data for at least one signal value
/// (`closes.len() >= slow + signal_period - 1`).
pub fn calculate_macd(
    closes: &[f64],
    fast: usize,
    slow: usize,
    signal_period: usize,
) -> Option<MacdResult> {
    if fast == 0 || signal_period == 0 || fast >= slow {
        return None;
    }
    if closes.len() < slow + signal_period - 1 {
        return None;
    }

    let fast_ema = calculate_ema(closes, fast);
    let slow_ema = calculate_ema(closes, slow);
    if slow_ema.is_empty() || fast_ema.len() < slow_ema.len() {
        return None;
    }

    // Align the faster series to the slower by dropping the prefix.
    let offset = fast_ema.len() - slow_ema.len();
    let macd_line: Vec<f64> = slow_ema
        .iter()
        .enumerate()
        .map(|(i, &s)| fast_ema[offset + i] - s)
        .collect();

    let signal = calculate_ema(&macd_line, signal_period);
    if signal.is_empty() {
        return None;
    }

    // Trim the MACD line to the signal length so all three series align at
    // the most recent bar.
    let trim = macd_line.len() - signal.len();
    let macd: Vec<f64> = macd_line[trim..].to_vec();
    let histogram: Vec<f64> = macd
        .iter()
        .zip(signal.iter())
        .map(|(m, s)| m - s)
        .collect();

    Some(MacdResult {
        macd,
        signal,
        histogram,
    })
}

/// MACD with the default (12, 26, 9) parameters.
pub fn calculate(closes: &[f64]) -> Option<MacdResult> {
    let (f, s, g) = DEFAULT_PARAMS;
    calculate_macd(closes, f, s, g)
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn macd_insufficient_data() {
        let closes: Vec<f64> = (1..=20).map(|x| x as f64).collect();
        assert!(calculate(&closes).is_none());
    }

    #[test]
    fn macd_degenerate_params() {
        let closes: Vec<f64> = (1..=100).map(|x| x as f64).collect();
        assert!(calculate_macd(&closes, 26, 12, 9).is_none()); // fast >= slow
        assert!(calculate_macd(&closes, 0, 26, 9).is_none());
        assert!(calculate_macd(&closes, 12, 26, 0).is_none());
    }

    #[test]
    fn macd_series_are_aligned() {
        let closes: Vec<f64> = (0..120)
            .map(|i| 100.0 + (i as f64 * 0.2).sin() * 5.0)
            .collect();
        let result = calculate(&closes).unwrap();
        assert_eq!(result.macd.len(), result.signal.len());
        assert_eq!(result.macd.len(), result.histogram.len());
        assert!(!result.macd.is_empty());
        for i in 0..result.macd.len() {
            let expected = result.macd[i] - result.signal[i];
            assert!((result.histogram[i] - expected).abs() < 1e-10);
        }
    }

    #[test]
    fn macd_flat_market_is_zero() {
        // Constant-price input: both EMAs equal the price, MACD = 0.
        let closes = vec![100.0; 120];
        let result = calculate(&closes).unwrap();
        for &v in &result.macd {
            assert!(v.abs() < 1e-10, "expected 0 MACD on flat input, got {v}");
        }
        for &v in &result.histogram {
            assert!(v.abs() < 1e-10);
        }
    }

    #[test]
    fn macd_positive_in_uptrend() {
        let closes: Vec<f64> = (1..=120).map(|x| x as f64).collect();
        let result = calculate(&closes).unwrap();
        assert!(result.last_macd().unwrap() > 0.0);
    }

    #[test]
    fn bullish_cross_on_v_shape() {
        // Decline then sharp recovery: MACD crosses up through its signal.
        let mut closes: Vec<f64> = (0..60).map(|i| 200.0 - i as f64).collect();
        for i in 0..25 {
            closes.push(141.0 + i as f64 * 2.0);
        }
        let result = calculate(&closes).unwrap();
        // Somewhere during the recovery the cross must have happened; walk the
        // tail and confirm at least one bar had macd <= signal then macd > signal.
        let mut crossed = false;
        for i in 1..result.macd.len() {
            if result.macd[i - 1] <= result.signal[i - 1] && result.macd[i] > result.signal[i] {
                crossed = true;
            }
        }
        assert!(crossed, "expected a bullish signal cross during recovery");
    }

    #[test]
    fn histogram_reversal_shape() {
        let result = MacdResult {
            macd: vec![0.0; 3],
            signal: vec![0.0; 3],
            histogram: vec![-0.5, -0.2, 0.1],
        };
        assert!(result.histogram_reversal());

        let flat = MacdResult {
            macd: vec![0.0; 3],
            signal: vec![0.0; 3],
            histogram: vec![0.5, -0.2, 0.1],
        };
        assert!(!flat.histogram_reversal());
    }

    #[test]
    fn scalping_params_need_less_data() {
        let closes: Vec<f64> = (1..=20).map(|x| x as f64).collect();
        let (f, s, g) = SCALPING_PARAMS;
        assert!(calculate_macd(&closes, f, s, g).is_some());
    }
}
