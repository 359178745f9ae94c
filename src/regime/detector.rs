// =============================================================================
// Market Regime Detector
// =============================================================================
//
// Classifies each market into one of four regimes from ADX/ATR features, with
// an optional HMM overlay that re-labels from decoded hidden states.
//
// Classification rules (trend dominates high-vol on a tie):
//
//   TREND      — ADX >= 25 AND the EMA(12)/EMA(26) gap sign agrees with the
//                DI direction AND the 12-bar momentum sign agrees.
//   HIGH_VOL   — ATR% >= 2.5 absolute, or its percentile within the last 30
//                ATR% readings >= 0.8, or its z-score >= 1.0.
//   SIDEWAYS   — ADX < 20, or no other rule fires.
// =============================================================================

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::indicators::adx::calculate_adx;
use crate::indicators::atr::{atr_pct_series, calculate_atr};
use crate::indicators::ema::ema_gap;
use crate::market_data::Candle;
use crate::regime::hmm::HmmModel;

// =============================================================================
// Types
// =============================================================================

/// High-level market regime classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Regime {
    BullTrend,
    BearTrend,
    Sideways,
    HighVolatility,
}

impl Regime {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BullTrend => "BULL_TREND",
            Self::BearTrend => "BEAR_TREND",
            Self::Sideways => "SIDEWAYS",
            Self::HighVolatility => "HIGH_VOLATILITY",
        }
    }

    /// Whether this regime is a directional trend.
    pub fn is_trend(&self) -> bool {
        matches!(self, Self::BullTrend | Self::BearTrend)
    }
}

impl std::fmt::Display for Regime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Regime {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "BULL_TREND" => Ok(Self::BullTrend),
            "BEAR_TREND" => Ok(Self::BearTrend),
            "SIDEWAYS" => Ok(Self::Sideways),
            "HIGH_VOLATILITY" => Ok(Self::HighVolatility),
            other => Err(format!("unknown regime: {other}")),
        }
    }
}

/// Complete regime snapshot with the contributing metrics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegimeAnalysis {
    pub regime: Regime,
    /// Confidence in [30, 95].
    pub confidence: f64,
    pub adx: f64,
    pub atr: f64,
    pub atr_percent: f64,
    /// 12-bar momentum as a percentage of price.
    pub momentum_pct: f64,
    /// -1 (down), 0 (none), +1 (up).
    pub trend_direction: i8,
    pub timestamp: DateTime<Utc>,
}

// =============================================================================
// Thresholds
// =============================================================================

const ADX_SIDEWAYS_MAX: f64 = 20.0;
const ADX_TREND_MIN: f64 = 25.0;
const ATR_PCT_HIGH_VOL: f64 = 2.5;
const ATR_PCT_PERCENTILE: f64 = 0.8;
const ATR_PCT_PERCENTILE_FLOOR: f64 = 1.0;
const ATR_PCT_ZSCORE: f64 = 1.0;
const ATR_PCT_LOOKBACK: usize = 30;
const MOMENTUM_BARS: usize = 12;

const CONFIDENCE_MIN: f64 = 30.0;
const CONFIDENCE_MAX: f64 = 95.0;

// =============================================================================
// RegimeDetector
// =============================================================================

/// Stateless rule-based detector with an optional trained HMM overlay.
pub struct RegimeDetector {
    hmm: RwLock<Option<HmmModel>>,
}

impl RegimeDetector {
    pub fn new() -> Self {
        Self { hmm: RwLock::new(None) }
    }

    /// Install (or replace) the HMM overlay. Subsequent calls to [`analyze`]
    /// re-label the regime from the decoded hidden-state path.
    pub fn set_hmm(&self, model: HmmModel) {
        *self.hmm.write() = Some(model);
    }

    /// Whether an HMM overlay is installed.
    pub fn has_hmm(&self) -> bool {
        self.hmm.read().is_some()
    }

    /// Run regime detection on `candles` (oldest-first).
    ///
    /// Returns `None` when the series is too short for the underlying
    /// indicators (roughly 2×ADX period + 1 bars).
    pub fn analyze(&self, candles: &[Candle]) -> Option<RegimeAnalysis> {
        let closes: Vec<f64> = candles.iter().map(|c| c.close).collect();

        let adx_result = calculate_adx(candles, 14)?;
        let atr = calculate_atr(candles, 14)?;
        let atr_pcts = atr_pct_series(candles, 14)?;
        let atr_percent = *atr_pcts.last()?;

        let gap = ema_gap(&closes, 12, 26)?;
        let momentum_pct = momentum(&closes, MOMENTUM_BARS)?;

        let (rule_regime, confidence, trend_direction) = classify(
            adx_result.adx,
            adx_result.di_direction(),
            gap,
            momentum_pct,
            atr_percent,
            &atr_pcts,
        );

        // HMM overlay: decoded state wins when a trained model is installed.
        let (regime, confidence) = match self.hmm.read().as_ref() {
            Some(model) => match model.decode_regime(candles) {
                Some((hmm_regime, hmm_conf)) => (hmm_regime, hmm_conf),
                None => (rule_regime, confidence),
            },
            None => (rule_regime, confidence),
        };

        let analysis = RegimeAnalysis {
            regime,
            confidence: confidence.clamp(CONFIDENCE_MIN, CONFIDENCE_MAX),
            adx: adx_result.adx,
            atr,
            atr_percent,
            momentum_pct,
            trend_direction,
            timestamp: Utc::now(),
        };

        debug!(
            regime = %analysis.regime,
            adx = format!("{:.2}", analysis.adx),
            atr_pct = format!("{:.3}", analysis.atr_percent),
            momentum = format!("{:.3}", analysis.momentum_pct),
            confidence = format!("{:.1}", analysis.confidence),
            "regime detected"
        );

        Some(analysis)
    }
}

impl Default for RegimeDetector {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Classification logic
// =============================================================================

/// 12-bar momentum as a percentage: (last - close[n-1-bars]) / close[n-1-bars].
fn momentum(closes: &[f64], bars: usize) -> Option<f64> {
    if closes.len() < bars + 1 {
        return None;
    }
    let last = *closes.last()?;
    let base = closes[closes.len() - 1 - bars];
    if base == 0.0 {
        return None;
    }
    let m = (last - base) / base * 100.0;
    m.is_finite().then_some(m)
}

/// Apply the rule hierarchy. Returns (regime, confidence, trend_direction).
fn classify(
    adx: f64,
    di_direction: i8,
    ema_gap: f64,
    momentum_pct: f64,
    atr_percent: f64,
    atr_pcts: &[f64],
) -> (Regime, f64, i8) {
    let gap_sign = sign(ema_gap);
    let momentum_sign = sign(momentum_pct);

    // A trend requires ADX strength and triple agreement: EMA gap, DI
    // direction, and momentum all pointing the same way.
    let aligned = gap_sign != 0 && gap_sign == di_direction && gap_sign == momentum_sign;
    let trending = adx >= ADX_TREND_MIN && aligned;

    // The percentile path needs an absolute floor: a flat ATR% window puts
    // every reading at the 100th percentile.
    let high_vol = atr_percent >= ATR_PCT_HIGH_VOL
        || (atr_percent >= ATR_PCT_PERCENTILE_FLOOR
            && volatility_percentile(atr_percent, atr_pcts) >= ATR_PCT_PERCENTILE)
        || volatility_zscore(atr_percent, atr_pcts) >= ATR_PCT_ZSCORE;

    if trending {
        // Trend dominates high-vol when aligned.
        let regime = if gap_sign > 0 { Regime::BullTrend } else { Regime::BearTrend };
        let confidence = remap(adx, ADX_TREND_MIN, 50.0, 55.0, CONFIDENCE_MAX);
        return (regime, confidence, gap_sign);
    }

    if high_vol {
        let confidence = remap(atr_percent, ATR_PCT_HIGH_VOL, 6.0, 55.0, CONFIDENCE_MAX);
        return (Regime::HighVolatility, confidence, momentum_sign);
    }

    if adx < ADX_SIDEWAYS_MAX {
        let confidence = remap(adx, ADX_SIDEWAYS_MAX, 5.0, 50.0, 85.0);
        return (Regime::Sideways, confidence, 0);
    }

    // Ambiguous band (ADX in [20, 25) or unaligned trend) — sideways with
    // floor confidence.
    (Regime::Sideways, CONFIDENCE_MIN, 0)
}

fn sign(v: f64) -> i8 {
    if v > 0.0 {
        1
    } else if v < 0.0 {
        -1
    } else {
        0
    }
}

/// Fraction of lookback readings at or below the current value.
fn volatility_percentile(current: f64, series: &[f64]) -> f64 {
    let tail_start = series.len().saturating_sub(ATR_PCT_LOOKBACK);
    let tail = &series[tail_start..];
    if tail.is_empty() {
        return 0.0;
    }
    let below = tail.iter().filter(|&&v| v <= current).count();
    below as f64 / tail.len() as f64
}

/// Z-score of the current value against the lookback window.
fn volatility_zscore(current: f64, series: &[f64]) -> f64 {
    let tail_start = series.len().saturating_sub(ATR_PCT_LOOKBACK);
    let tail = &series[tail_start..];
    if tail.len() < 2 {
        return 0.0;
    }
    let mean = tail.iter().sum::<f64>() / tail.len() as f64;
    let var = tail.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / tail.len() as f64;
    let std = var.sqrt();
    if std == 0.0 {
        return 0.0;
    }
    (current - mean) / std
}

/// Linearly remap `value` from `[in_lo, in_hi]` to `[out_lo, out_hi]`,
/// clamped to the output range.
fn remap(value: f64, in_lo: f64, in_hi: f64, out_lo: f64, out_hi: f64) -> f64 {
    let t = if (in_hi - in_lo).abs() < f64::EPSILON {
        0.5
    } else {
        (value - in_lo) / (in_hi - in_lo)
    };
    out_lo + t.clamp(0.0, 1.0) * (out_hi - out_lo)
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn candle(base: f64, spread: f64, close: f64) -> Candle {
        Candle::new(0, base, base + spread, base - spread, close, 100.0)
    }

    /// A steady climb: high ADX, positive gap/DI/momentum.
    fn uptrend(n: usize) -> Vec<Candle> {
        (0..n)
            .map(|i| {
                let base = 100.0 + i as f64 * 2.0;
                candle(base, 0.8, base + 1.0)
            })
            .collect()
    }

    fn downtrend(n: usize) -> Vec<Candle> {
        (0..n)
            .map(|i| {
                let base = 500.0 - i as f64 * 2.0;
                candle(base, 0.8, base - 1.0)
            })
            .collect()
    }

    /// Narrow chop around a flat level: low ADX, low ATR%.
    fn chop(n: usize) -> Vec<Candle> {
        (0..n)
            .map(|i| {
                let wiggle = if i % 2 == 0 { 0.1 } else { -0.1 };
                candle(100.0 + wiggle, 0.15, 100.0 - wiggle)
            })
            .collect()
    }

    #[test]
    fn detects_bull_trend() {
        let detector = RegimeDetector::new();
        let analysis = detector.analyze(&uptrend(80)).unwrap();
        assert_eq!(analysis.regime, Regime::BullTrend);
        assert_eq!(analysis.trend_direction, 1);
        assert!(analysis.confidence >= 30.0 && analysis.confidence <= 95.0);
    }

    #[test]
    fn detects_bear_trend() {
        let detector = RegimeDetector::new();
        let analysis = detector.analyze(&downtrend(80)).unwrap();
        assert_eq!(analysis.regime, Regime::BearTrend);
        assert_eq!(analysis.trend_direction, -1);
    }

    #[test]
    fn detects_sideways_in_chop() {
        let detector = RegimeDetector::new();
        let analysis = detector.analyze(&chop(80)).unwrap();
        assert_eq!(analysis.regime, Regime::Sideways);
    }

    #[test]
    fn detects_high_volatility_on_expansion() {
        // Calm series then wild swings without directional agreement.
        let mut candles = chop(60);
        for i in 0..15 {
            let up = i % 2 == 0;
            let base = 100.0;
            let spread = 4.0;
            let close = if up { base + 3.5 } else { base - 3.5 };
            candles.push(candle(base, spread, close));
        }
        let detector = RegimeDetector::new();
        let analysis = detector.analyze(&candles).unwrap();
        assert_eq!(analysis.regime, Regime::HighVolatility);
        assert!(analysis.atr_percent > 1.0);
    }

    #[test]
    fn trend_dominates_high_vol_tie() {
        // A violent but perfectly aligned climb: ATR% stays above the 2.5
        // absolute threshold, yet ADX and all three direction signals agree —
        // trend must win the tie.
        let candles: Vec<Candle> = (0..80)
            .map(|i| {
                let base = 100.0 * 1.04_f64.powi(i);
                candle(base, base * 0.03, base + base * 0.02)
            })
            .collect();
        let detector = RegimeDetector::new();
        let analysis = detector.analyze(&candles).unwrap();
        assert_eq!(analysis.regime, Regime::BullTrend);
    }

    #[test]
    fn insufficient_data_returns_none() {
        let detector = RegimeDetector::new();
        assert!(detector.analyze(&uptrend(10)).is_none());
    }

    #[test]
    fn confidence_stays_in_band() {
        let detector = RegimeDetector::new();
        for candles in [uptrend(80), downtrend(80), chop(80)] {
            let a = detector.analyze(&candles).unwrap();
            assert!((30.0..=95.0).contains(&a.confidence), "confidence {}", a.confidence);
        }
    }

    #[test]
    fn regime_string_roundtrip() {
        use std::str::FromStr;
        for r in [Regime::BullTrend, Regime::BearTrend, Regime::Sideways, Regime::HighVolatility] {
            assert_eq!(Regime::from_str(r.as_str()).unwrap(), r);
        }
    }

    #[test]
    fn percentile_and_zscore_basics() {
        let series: Vec<f64> = (1..=30).map(|i| i as f64 / 10.0).collect();
        assert!((volatility_percentile(3.0, &series) - 1.0).abs() < 1e-10);
        assert!(volatility_percentile(0.05, &series) < 0.05);
        assert!(volatility_zscore(3.0, &series) > 1.0);
        assert!(volatility_zscore(1.55, &series).abs() < 0.1);
    }
}
