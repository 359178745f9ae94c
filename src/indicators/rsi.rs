// =============================================================================
// Relative Strength Index (RSI) — Wilder's Smoothing
// =============================================================================
//
// Step 1 — Compute price deltas from consecutive closes.
// Step 2 — Seed average gain / loss with the SMA of the first `period` deltas.
// Step 3 — Wilder's smoothing:
//            avg_gain = (prev_avg_gain * (period - 1) + gain) / period
// Step 4 — RS = avg_gain / avg_loss, RSI = 100 - 100 / (1 + RS)
// =============================================================================

/// Compute the full RSI series for the given `closes` and `period`.
///
/// The returned vector holds one RSI value per close starting at index
/// `period` (the first `period` closes seed the averages).
///
/// # Edge cases
/// - `period == 0` => empty vec
/// - `closes.len() < period + 1` => empty vec
/// - Zero average loss (no down moves) clamps RSI to 100.0.
/// - A non-finite intermediate truncates the series.
pub fn calculate_rsi(closes: &[f64], period: usize) -> Vec<f64> {
    if period == 0 || closes.len() < period + 1 {
        return Vec::new();
    }

    let deltas: Vec<f64> = closes.windows(2).map(|w| w[1] - w[0]).collect();

    let (sum_gain, sum_loss) = deltas[..period]
        .iter()
        .fold((0.0_f64, 0.0_f64), |(g, l), &d| {
            if d > 0.0 { (g + d, l) } else { (g, l - d) }
        });

    let period_f = period as f64;
    let mut avg_gain = sum_gain / period_f;
    let mut avg_loss = sum_loss / period_f;

    let mut result = Vec::with_capacity(deltas.len() - period + 1);
    match rsi_value(avg_gain, avg_loss) {
        Some(first) => result.push(first),
        None => return Vec::new(),
    }

    for &delta in &deltas[period..] {
        let gain = delta.max(0.0);
        let loss = (-delta).max(0.0);

        avg_gain = (avg_gain * (period_f - 1.0) + gain) / period_f;
        avg_loss = (avg_loss * (period_f - 1.0) + loss) / period_f;

        match rsi_value(avg_gain, avg_loss) {
            Some(rsi) => result.push(rsi),
            None => break,
        }
    }

    result
}

/// Most recent RSI value, or `None` on insufficient data.
pub fn last_rsi(closes: &[f64], period: usize) -> Option<f64> {
    calculate_rsi(closes, period).last().copied()
}

/// Detect a bullish RSI divergence over the last `2 * half_window` bars:
/// the recent half makes a lower price low while RSI makes a higher low.
///
/// The RSI series is tail-aligned with `closes` before comparison. Returns
/// `false` on insufficient data.
pub fn bullish_divergence(closes: &[f64], period: usize, half_window: usize) -> bool {
    if half_window == 0 {
        return false;
    }
    let rsi = calculate_rsi(closes, period);
    let window = half_window * 2;
    if rsi.len() < window || closes.len() < window {
        return false;
    }

    let close_tail = &closes[closes.len() - window..];
    let rsi_tail = &rsi[rsi.len() - window..];

    let (prior_close, recent_close) = close_tail.split_at(half_window);
    let (prior_rsi, recent_rsi) = rsi_tail.split_at(half_window);

    let prior_low_idx = min_index(prior_close);
    let recent_low_idx = min_index(recent_close);

    recent_close[recent_low_idx] < prior_close[prior_low_idx]
        && recent_rsi[recent_low_idx] > prior_rsi[prior_low_idx]
}

// =============================================================================
// Internal helpers
// =============================================================================

/// Convert average gain / loss into an RSI value in [0, 100].
fn rsi_value(avg_gain: f64, avg_loss: f64) -> Option<f64> {
    let rsi = if avg_loss == 0.0 && avg_gain == 0.0 {
        50.0 // No movement at all — neutral.
    } else if avg_loss == 0.0 {
        100.0
    } else {
        let rs = avg_gain / avg_loss;
        100.0 - 100.0 / (1.0 + rs)
    };
    rsi.is_finite().then_some(rsi)
}

fn min_index(values: &[f64]) -> usize {
    let mut idx = 0;
    for (i, &v) in values.iter().enumerate() {
        if v < values[idx] {
            idx = i;
        }
    }
    idx
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rsi_empty_input() {
        assert!(calculate_rsi(&[], 14).is_empty());
    }

    #[test]
    fn rsi_period_zero() {
        assert!(calculate_rsi(&[1.0, 2.0, 3.0], 0).is_empty());
    }

    #[test]
    fn rsi_insufficient_data() {
        // 14 closes => 13 deltas < period 14.
        let closes: Vec<f64> = (1..=14).map(|x| x as f64).collect();
        assert!(calculate_rsi(&closes, 14).is_empty());
    }

    #[test]
    fn rsi_all_gains_is_hundred() {
        let closes: Vec<f64> = (1..=30).map(|x| x as f64).collect();
        for &v in &calculate_rsi(&closes, 14) {
            assert!((v - 100.0).abs() < 1e-10, "expected 100.0, got {v}");
        }
    }

    #[test]
    fn rsi_all_losses_is_zero() {
        let closes: Vec<f64> = (1..=30).rev().map(|x| x as f64).collect();
        for &v in &calculate_rsi(&closes, 14) {
            assert!(v.abs() < 1e-10, "expected 0.0, got {v}");
        }
    }

    #[test]
    fn rsi_flat_market_is_fifty() {
        // Constant-price input converges to RSI 50 within `period` bars.
        let closes = vec![100.0; 30];
        let series = calculate_rsi(&closes, 14);
        assert!(!series.is_empty());
        for &v in &series {
            assert!((v - 50.0).abs() < 1e-10, "expected 50.0, got {v}");
        }
    }

    #[test]
    fn rsi_range_check() {
        let closes = vec![
            44.34, 44.09, 44.15, 43.61, 44.33, 44.83, 45.10, 45.42, 45.84, 46.08,
            45.89, 46.03, 44.18, 44.22, 44.57, 43.42, 42.66, 43.13,
        ];
        for &v in &calculate_rsi(&closes, 14) {
            assert!((0.0..=100.0).contains(&v), "RSI {v} out of range");
        }
    }

    #[test]
    fn divergence_detected_on_lower_low_higher_rsi() {
        // A long decline followed by a shallower decline: the second low is
        // lower in price but the loss momentum has eased, raising RSI.
        let mut closes: Vec<f64> = (0..30).map(|i| 100.0 - i as f64).collect(); // steep fall to 71
        for i in 0..10 {
            closes.push(71.0 - 0.05 * i as f64); // drift to a marginal lower low
        }
        assert!(bullish_divergence(&closes, 14, 5));
    }

    #[test]
    fn divergence_absent_on_rally() {
        let closes: Vec<f64> = (1..=60).map(|x| x as f64).collect();
        assert!(!bullish_divergence(&closes, 14, 5));
    }

    #[test]
    fn divergence_insufficient_data() {
        assert!(!bullish_divergence(&[1.0, 2.0, 3.0], 14, 5));
    }
}
