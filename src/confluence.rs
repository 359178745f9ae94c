// =============================================================================
// Confluence Analyzer — four-indicator composite entry score
// =============================================================================
//
// Four sub-scores, each in [0, 25], summed into a 0-100 total:
//
//   RSI        25: RSI <= 25 | 20: <= 30 | 15: bullish divergence
//              10: <= 40 | 0 otherwise
//   MACD       25: bullish signal cross AND RSI in [30, 50]
//              20: bullish signal cross | 15: histogram reversal (-,-,+)
//              10: MACD > 0 | 0 otherwise
//   Bollinger  25: %B <= 0 AND histogram reversal | 20: %B <= 0.1
//              15: %B <= 0.2 | 10: W-bottom near the lower band | 0 otherwise
//   Volume     25: >= 2.0x 20-bar avg | 20: >= 1.5x | 15: >= 1.2x
//              10: >= 1.0x | 0 otherwise
//
// Classification: >= 100 STRONG_BUY, >= 75 BUY, >= 50 WEAK_BUY, else
// NO_SIGNAL. Fewer than 50 candles: INSUFFICIENT_DATA.
// =============================================================================

use serde::{Deserialize, Serialize};

use crate::indicators::bollinger::{calculate_bollinger, w_bottom_near_lower_band};
use crate::indicators::macd;
use crate::indicators::rsi::{bullish_divergence, calculate_rsi};
use crate::market_data::Candle;

/// Candles required before any score is produced.
pub const MIN_CANDLES: usize = 50;

const RSI_PERIOD: usize = 14;
const BOLLINGER_PERIOD: usize = 20;
const VOLUME_WINDOW: usize = 20;
const DIVERGENCE_HALF_WINDOW: usize = 5;

/// Entry-signal strength classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfluenceClass {
    StrongBuy,
    Buy,
    WeakBuy,
    NoSignal,
    InsufficientData,
}

impl ConfluenceClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::StrongBuy => "STRONG_BUY",
            Self::Buy => "BUY",
            Self::WeakBuy => "WEAK_BUY",
            Self::NoSignal => "NO_SIGNAL",
            Self::InsufficientData => "INSUFFICIENT_DATA",
        }
    }
}

impl std::fmt::Display for ConfluenceClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Composite score with the per-signal breakdown.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfluenceResult {
    /// Sum of the four sub-scores, in [0, 100].
    pub total: f64,
    pub rsi_score: f64,
    pub macd_score: f64,
    pub bollinger_score: f64,
    pub volume_score: f64,
    pub classification: ConfluenceClass,
}

impl ConfluenceResult {
    fn insufficient() -> Self {
        Self {
            total: 0.0,
            rsi_score: 0.0,
            macd_score: 0.0,
            bollinger_score: 0.0,
            volume_score: 0.0,
            classification: ConfluenceClass::InsufficientData,
        }
    }
}

/// Score `candles` (oldest first) through the four-signal pipeline.
pub fn analyze(candles: &[Candle]) -> ConfluenceResult {
    if candles.len() < MIN_CANDLES {
        return ConfluenceResult::insufficient();
    }

    let closes: Vec<f64> = candles.iter().map(|c| c.close).collect();

    let rsi_series = calculate_rsi(&closes, RSI_PERIOD);
    let rsi_last = rsi_series.last().copied();
    let macd_result = macd::calculate(&closes);
    let bb = calculate_bollinger(&closes, BOLLINGER_PERIOD, 2.0);

    let histogram_reversal = macd_result
        .as_ref()
        .map(|m| m.histogram_reversal())
        .unwrap_or(false);

    let rsi_score = score_rsi(rsi_last, &closes);
    let macd_score = score_macd(macd_result.as_ref(), rsi_last);
    let bollinger_score = score_bollinger(bb.as_ref().map(|b| b.percent_b), histogram_reversal, &closes);
    let volume_score = score_volume(candles);

    let total = rsi_score + macd_score + bollinger_score + volume_score;

    let classification = if total >= 100.0 {
        ConfluenceClass::StrongBuy
    } else if total >= 75.0 {
        ConfluenceClass::Buy
    } else if total >= 50.0 {
        ConfluenceClass::WeakBuy
    } else {
        ConfluenceClass::NoSignal
    };

    ConfluenceResult {
        total,
        rsi_score,
        macd_score,
        bollinger_score,
        volume_score,
        classification,
    }
}

// =============================================================================
// Sub-scores
// =============================================================================

fn score_rsi(rsi: Option<f64>, closes: &[f64]) -> f64 {
    let rsi = match rsi {
        Some(v) => v,
        None => return 0.0,
    };

    if rsi <= 25.0 {
        25.0
    } else if rsi <= 30.0 {
        20.0
    } else if bullish_divergence(closes, RSI_PERIOD, DIVERGENCE_HALF_WINDOW) {
        15.0
    } else if rsi <= 40.0 {
        10.0
    } else {
        0.0
    }
}

fn score_macd(result: Option<&macd::MacdResult>, rsi: Option<f64>) -> f64 {
    let m = match result {
        Some(m) => m,
        None => return 0.0,
    };

    let cross = m.bullish_signal_cross();
    let rsi_in_band = rsi.map(|r| (30.0..=50.0).contains(&r)).unwrap_or(false);

    if cross && rsi_in_band {
        25.0
    } else if cross {
        20.0
    } else if m.histogram_reversal() {
        15.0
    } else if m.last_macd().map(|v| v > 0.0).unwrap_or(false) {
        10.0
    } else {
        0.0
    }
}

fn score_bollinger(percent_b: Option<f64>, histogram_reversal: bool, closes: &[f64]) -> f64 {
    let pb = match percent_b {
        Some(v) => v,
        None => return 0.0,
    };

    if pb <= 0.0 && histogram_reversal {
        25.0
    } else if pb <= 0.1 {
        20.0
    } else if pb <= 0.2 {
        15.0
    } else if w_bottom_near_lower_band(closes, BOLLINGER_PERIOD, 10) {
        10.0
    } else {
        0.0
    }
}

fn score_volume(candles: &[Candle]) -> f64 {
    if candles.len() < VOLUME_WINDOW + 1 {
        return 0.0;
    }

    let last = match candles.last() {
        Some(c) => c.volume,
        None => return 0.0,
    };
    let window = &candles[candles.len() - 1 - VOLUME_WINDOW..candles.len() - 1];
    let avg = window.iter().map(|c| c.volume).sum::<f64>() / VOLUME_WINDOW as f64;
    if avg <= 0.0 {
        return 0.0;
    }

    let ratio = last / avg;
    if ratio >= 2.0 {
        25.0
    } else if ratio >= 1.5 {
        20.0
    } else if ratio >= 1.2 {
        15.0
    } else if ratio >= 1.0 {
        10.0
    } else {
        0.0
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn candle(close: f64, volume: f64) -> Candle {
        Candle::new(0, close, close + 0.5, close - 0.5, close, volume)
    }

    #[test]
    fn under_fifty_candles_is_insufficient() {
        let candles: Vec<Candle> = (0..49).map(|_| candle(100.0, 10.0)).collect();
        let result = analyze(&candles);
        assert_eq!(result.classification, ConfluenceClass::InsufficientData);
        assert!(result.total.abs() < 1e-10);
    }

    #[test]
    fn sub_scores_stay_in_range_and_sum() {
        // A mix of shapes — every outcome must respect the [0,25] sub-score
        // band and the total must equal the sum.
        let shapes: Vec<Vec<Candle>> = vec![
            (0..80).map(|i| candle(100.0 + i as f64, 10.0)).collect(),
            (0..80).map(|i| candle(180.0 - i as f64, 10.0)).collect(),
            (0..80).map(|_| candle(100.0, 10.0)).collect(),
            (0..80)
                .map(|i| candle(100.0 + (i as f64 * 0.7).sin() * 5.0, 10.0 + (i % 7) as f64))
                .collect(),
        ];
        for candles in shapes {
            let r = analyze(&candles);
            for score in [r.rsi_score, r.macd_score, r.bollinger_score, r.volume_score] {
                assert!((0.0..=25.0).contains(&score), "sub-score {score} out of range");
            }
            let sum = r.rsi_score + r.macd_score + r.bollinger_score + r.volume_score;
            assert!((r.total - sum).abs() < 1e-10);
            assert!((0.0..=100.0).contains(&r.total));
        }
    }

    #[test]
    fn oversold_crash_scores_rsi_and_bollinger() {
        // A grind sideways then a hard sell-off: RSI deeply oversold, close
        // pinned under the lower band, volume surging.
        let mut candles: Vec<Candle> = (0..60).map(|_| candle(100.0, 10.0)).collect();
        let mut price = 100.0;
        for _ in 0..5 {
            price *= 0.97;
            candles.push(candle(price, 40.0));
        }
        let result = analyze(&candles);
        assert_eq!(result.rsi_score, 25.0, "deep sell-off must max the RSI tier");
        assert!(result.bollinger_score >= 15.0, "close should be under the band");
        assert_eq!(result.volume_score, 25.0, "volume surge hits the top tier");
        assert!(result.total >= 50.0);
    }

    #[test]
    fn quiet_uptrend_scores_macd_only() {
        // Steady climb: RSI overbought (0), %B high (0), flat volume (10),
        // MACD positive (10).
        let candles: Vec<Candle> = (0..80).map(|i| candle(100.0 + i as f64 * 0.5, 10.0)).collect();
        let result = analyze(&candles);
        assert_eq!(result.rsi_score, 0.0);
        assert_eq!(result.macd_score, 10.0);
        assert_eq!(result.bollinger_score, 0.0);
        assert_eq!(result.classification, ConfluenceClass::NoSignal);
    }

    #[test]
    fn flat_market_is_no_signal() {
        let candles: Vec<Candle> = (0..80).map(|_| candle(100.0, 10.0)).collect();
        let result = analyze(&candles);
        // RSI 50 => 0; MACD 0 => 0; %B 0.5 => 0; volume ratio 1.0 => 10.
        assert_eq!(result.classification, ConfluenceClass::NoSignal);
        assert_eq!(result.volume_score, 10.0);
        assert!((result.total - 10.0).abs() < 1e-10);
    }

    #[test]
    fn classification_thresholds() {
        let classify = |total: f64| {
            if total >= 100.0 {
                ConfluenceClass::StrongBuy
            } else if total >= 75.0 {
                ConfluenceClass::Buy
            } else if total >= 50.0 {
                ConfluenceClass::WeakBuy
            } else {
                ConfluenceClass::NoSignal
            }
        };
        assert_eq!(classify(100.0), ConfluenceClass::StrongBuy);
        assert_eq!(classify(80.0), ConfluenceClass::Buy);
        assert_eq!(classify(55.0), ConfluenceClass::WeakBuy);
        assert_eq!(classify(49.9), ConfluenceClass::NoSignal);
    }
}
