// =============================================================================
// Bollinger Bands
// =============================================================================
//
// Middle band = 20-period SMA, upper/lower = SMA ± k*σ (k = 2 by default).
// %B locates the last close within the bands: 0 at the lower band, 1 at the
// upper band, < 0 below the lower band.

/// Result of a Bollinger Band calculation over the most recent window.
#[derive(Debug, Clone)]
pub struct BollingerResult {
    pub upper: f64,
    pub middle: f64,
    pub lower: f64,
    /// (upper - lower) / middle * 100 — normalised bandwidth.
    pub width: f64,
    /// (close - lower) / (upper - lower); 0.5 when the bands collapse.
    pub percent_b: f64,
}

/// Calculate Bollinger Bands for the given closing prices.
///
/// Returns `None` when fewer than `period` data points are available or the
/// middle band is degenerate (zero).
pub fn calculate_bollinger(closes: &[f64], period: usize, num_std: f64) -> Option<BollingerResult> {
    if period == 0 || closes.len() < period {
        return None;
    }

    let window = &closes[closes.len() - period..];
    let middle = window.iter().sum::<f64>() / period as f64;
    if middle == 0.0 {
        return None;
    }

    let variance = window.iter().map(|x| (x - middle).powi(2)).sum::<f64>() / period as f64;
    let std_dev = variance.sqrt();

    let upper = middle + num_std * std_dev;
    let lower = middle - num_std * std_dev;
    let width = (upper - lower) / middle * 100.0;

    let last_close = *window.last()?;
    let band_span = upper - lower;
    let percent_b = if band_span == 0.0 {
        0.5
    } else {
        (last_close - lower) / band_span
    };

    if width.is_finite() && percent_b.is_finite() {
        Some(BollingerResult {
            upper,
            middle,
            lower,
            width,
            percent_b,
        })
    } else {
        None
    }
}

/// Detect a W-bottom near the lower band over the last `window` closes:
/// two distinct local lows, the second no deeper than the first by more than
/// `tolerance` (fraction), with a bounce between them, and the latest close
/// recovering above the second low.
pub fn w_bottom_near_lower_band(closes: &[f64], period: usize, window: usize) -> bool {
    if closes.len() < period || window < 5 || closes.len() < window {
        return false;
    }

    let bb = match calculate_bollinger(closes, period, 2.0) {
        Some(b) => b,
        None => return false,
    };

    let tail = &closes[closes.len() - window..];
    let mut lows: Vec<(usize, f64)> = Vec::new();
    for i in 1..tail.len() - 1 {
        if tail[i] < tail[i - 1] && tail[i] < tail[i + 1] {
            lows.push((i, tail[i]));
        }
    }
    if lows.len() < 2 {
        return false;
    }

    let (first_idx, first_low) = lows[lows.len() - 2];
    let (second_idx, second_low) = lows[lows.len() - 1];

    // Both lows must probe the lower-band neighbourhood.
    let near_band = bb.lower * 1.01;
    if first_low > near_band || second_low > near_band {
        return false;
    }

    // The second low holds at or above the first (within 0.5 % tolerance),
    // with a bounce in between and a recovering close.
    let tolerance = first_low * 0.005;
    let holds = second_low >= first_low - tolerance;
    let bounced = tail[first_idx..=second_idx].iter().any(|&c| c > first_low * 1.005);
    let recovering = *tail.last().unwrap_or(&second_low) > second_low;

    holds && bounced && recovering
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bollinger_basic() {
        let closes: Vec<f64> = (1..=20).map(|x| x as f64).collect();
        let bb = calculate_bollinger(&closes, 20, 2.0).unwrap();
        assert!(bb.upper > bb.middle);
        assert!(bb.lower < bb.middle);
        assert!(bb.width > 0.0);
    }

    #[test]
    fn bollinger_insufficient_data() {
        assert!(calculate_bollinger(&[1.0, 2.0, 3.0], 20, 2.0).is_none());
    }

    #[test]
    fn bollinger_flat_has_zero_width() {
        // Constant-price input: σ = 0, bandwidth 0, %B pinned to 0.5.
        let closes = vec![100.0; 20];
        let bb = calculate_bollinger(&closes, 20, 2.0).unwrap();
        assert!(bb.width.abs() < 1e-10);
        assert!((bb.percent_b - 0.5).abs() < 1e-10);
    }

    #[test]
    fn percent_b_below_zero_under_lower_band() {
        // Stable window with a crash on the final close.
        let mut closes = vec![100.0; 19];
        closes.push(80.0);
        let bb = calculate_bollinger(&closes, 20, 2.0).unwrap();
        assert!(bb.percent_b < 0.0, "got %B = {}", bb.percent_b);
    }

    #[test]
    fn percent_b_above_one_over_upper_band() {
        let mut closes = vec![100.0; 19];
        closes.push(120.0);
        let bb = calculate_bollinger(&closes, 20, 2.0).unwrap();
        assert!(bb.percent_b > 1.0, "got %B = {}", bb.percent_b);
    }

    #[test]
    fn w_bottom_requires_two_lows() {
        let closes: Vec<f64> = (1..=40).map(|x| x as f64).collect();
        assert!(!w_bottom_near_lower_band(&closes, 20, 10));
    }
}
