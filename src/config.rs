// =============================================================================
// Engine Configuration — hot-reloadable settings with atomic save
// =============================================================================
//
// Every tunable lives here. All fields carry serde defaults so older config
// files keep loading as fields are added. Persistence uses the tmp + rename
// pattern to prevent corruption on crash.
//
// Hot reload never mutates in place: callers hold `Arc<EngineConfig>`
// snapshots taken at scan start, and a reload swaps the shared pointer.
// =============================================================================

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::coordinator::MarketExclusion;
use crate::risk::sizer::SizerConfig;
use crate::types::StrategyCode;

// =============================================================================
// Default-value helpers (required by serde `default = "..."`)
// =============================================================================

fn default_true() -> bool {
    true
}

fn default_db_url() -> String {
    "sqlite://data/namsan.db".to_string()
}

fn default_base_url() -> String {
    "https://api.upbit.com".to_string()
}

fn default_ws_url() -> String {
    "wss://api.upbit.com/websocket/v1".to_string()
}

fn default_fee_rate() -> f64 {
    0.0004 // 0.04% one-way
}

fn default_capital_krw() -> f64 {
    1_000_000.0
}

fn default_max_scan_candidates() -> usize {
    5
}

fn default_sizer() -> SizerConfig {
    SizerConfig::default()
}

fn default_dca_add_on_drop_pct() -> f64 {
    3.0
}

// =============================================================================
// Gateway
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_ws_url")]
    pub ws_url: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            ws_url: default_ws_url(),
        }
    }
}

// =============================================================================
// Risk throttle thresholds
// =============================================================================

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ThrottleThresholds {
    pub critical_win_rate: f64,
    pub critical_avg_pnl: f64,
    pub critical_loss_streak: u32,
    pub weak_win_rate: f64,
    pub weak_avg_pnl: f64,
}

impl Default for ThrottleThresholds {
    fn default() -> Self {
        Self {
            critical_win_rate: 0.35,
            critical_avg_pnl: -0.8,
            critical_loss_streak: 4,
            weak_win_rate: 0.45,
            weak_avg_pnl: -0.2,
        }
    }
}

// =============================================================================
// Per-strategy configuration
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Cadence of the scan loop.
    pub scan_interval_ms: u64,
    /// Cadence of the open-position monitor loop.
    pub monitor_interval_ms: u64,

    /// Hard cap on a single entry's notional.
    pub position_size_krw: f64,
    /// Maximum simultaneous open positions for this strategy.
    pub max_positions: u32,

    // --- Stops & targets -----------------------------------------------------
    pub stop_loss_percent: f64,
    pub take_profit_percent: f64,
    /// Unrealized PnL% at which the trailing stop arms.
    pub trailing_stop_trigger: f64,
    /// Trailing distance below the peak, in percent.
    pub trailing_stop_offset: f64,
    /// Holding time after which the position is force-closed.
    pub position_timeout_min: u64,

    // --- Entry predicates ----------------------------------------------------
    pub min_confluence: f64,
    pub max_rsi: f64,
    pub min_volume_ratio: f64,
    /// Allowed regimes at entry (labels like "BULL_TREND"). Empty = any.
    #[serde(default)]
    pub regime_whitelist: Vec<String>,

    // --- Eligibility filters -------------------------------------------------
    #[serde(default)]
    pub exclude_markets: Vec<String>,
    pub min_trading_value_krw: f64,
    pub max_trading_value_krw: f64,
    /// Seconds a market stays on cooldown after a close.
    pub cooldown_sec: u64,

    // --- Circuit breaker -----------------------------------------------------
    pub max_consecutive_losses: u32,
    pub daily_max_loss_krw: f64,

    // --- DCA add-ons ---------------------------------------------------------
    /// Maximum add-on buys per position (0 disables averaging down).
    #[serde(default)]
    pub dca_max_add_ons: u32,
    /// Price drop below the average entry (%) that triggers an add-on.
    #[serde(default = "default_dca_add_on_drop_pct")]
    pub dca_add_on_drop_pct: f64,

    // --- Exit profile --------------------------------------------------------
    /// PnL% at which the stop moves to break-even.
    pub break_even_trigger_pct: f64,
    /// PnL% at which the profit lock engages.
    pub profit_lock_trigger_pct: f64,
    /// Minimum locked profit in percent once the lock engages.
    pub profit_lock_min_pct: f64,
    /// Fraction of remaining quantity sold at the half take-profit.
    pub half_take_profit_ratio: f64,
    /// Confluence drop from entry that tightens the stop.
    pub confluence_degradation: f64,
    /// How much the stop tightens on confluence decay, in percent.
    pub divergence_stop_tighten_pct: f64,
    /// Exit fully when the entry-time trend regime turns adverse.
    pub regime_shift_exit: bool,
}

impl StrategyConfig {
    /// Baseline defaults, tuned per strategy by [`defaults_for`].
    fn baseline() -> Self {
        Self {
            enabled: true,
            scan_interval_ms: 120_000,
            monitor_interval_ms: 120_000,
            position_size_krw: 100_000.0,
            max_positions: 3,
            stop_loss_percent: 3.0,
            take_profit_percent: 6.0,
            trailing_stop_trigger: 2.0,
            trailing_stop_offset: 1.0,
            position_timeout_min: 240,
            min_confluence: 55.0,
            max_rsi: 70.0,
            min_volume_ratio: 1.0,
            regime_whitelist: Vec::new(),
            exclude_markets: Vec::new(),
            min_trading_value_krw: 1_000_000_000.0,
            max_trading_value_krw: f64::MAX,
            cooldown_sec: 600,
            max_consecutive_losses: 3,
            daily_max_loss_krw: 50_000.0,
            dca_max_add_ons: 0,
            dca_add_on_drop_pct: default_dca_add_on_drop_pct(),
            break_even_trigger_pct: 1.0,
            profit_lock_trigger_pct: 2.5,
            profit_lock_min_pct: 1.0,
            half_take_profit_ratio: 0.5,
            confluence_degradation: 20.0,
            divergence_stop_tighten_pct: 0.5,
            regime_shift_exit: true,
        }
    }

    /// Strategy-specific cadence and parameter defaults.
    pub fn defaults_for(code: StrategyCode) -> Self {
        let mut config = Self::baseline();
        match code {
            StrategyCode::Dca => {
                config.scan_interval_ms = 300_000;
                config.monitor_interval_ms = 300_000;
                config.position_timeout_min = 24 * 60;
                config.stop_loss_percent = 5.0;
                config.regime_shift_exit = false;
                config.dca_max_add_ons = 3;
            }
            StrategyCode::MeanReversion | StrategyCode::Breakout => {
                config.scan_interval_ms = 120_000;
                config.monitor_interval_ms = 120_000;
                // The breakout leg trades on volume/momentum, not oversold
                // confluence, so the shared floor sits lower here.
                config.min_confluence = 30.0;
            }
            StrategyCode::VolumeSurge => {
                config.scan_interval_ms = 60_000;
                config.monitor_interval_ms = 60_000;
                config.min_volume_ratio = 2.0;
                config.position_timeout_min = 120;
            }
            StrategyCode::MemeScalper => {
                config.scan_interval_ms = 30_000;
                config.monitor_interval_ms = 30_000;
                config.stop_loss_percent = 1.5;
                config.take_profit_percent = 3.0;
                config.trailing_stop_trigger = 1.0;
                config.trailing_stop_offset = 0.5;
                config.position_timeout_min = 30;
                config.cooldown_sec = 300;
                config.max_rsi = 65.0;
                config.min_volume_ratio = 1.5;
                // Small-cap band: big enough to exit, small enough to move.
                config.min_trading_value_krw = 500_000_000.0;
                config.max_trading_value_krw = 20_000_000_000.0;
            }
            StrategyCode::VolatilitySurvival => {
                config.scan_interval_ms = 180_000;
                config.monitor_interval_ms = 120_000;
                config.regime_whitelist = vec!["HIGH_VOLATILITY".to_string()];
                config.stop_loss_percent = 2.0;
            }
            StrategyCode::Guided => {
                config.scan_interval_ms = 300_000;
                config.monitor_interval_ms = 60_000;
                config.min_confluence = 65.0;
            }
            _ => {}
        }
        config
    }
}

fn default_strategy(code: StrategyCode) -> StrategyConfig {
    StrategyConfig::defaults_for(code)
}

fn default_dca() -> StrategyConfig {
    default_strategy(StrategyCode::Dca)
}
fn default_mean_reversion() -> StrategyConfig {
    default_strategy(StrategyCode::MeanReversion)
}
fn default_volume_surge() -> StrategyConfig {
    default_strategy(StrategyCode::VolumeSurge)
}
// =============================================================================
// Top-level configuration
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default = "default_db_url")]
    pub db_url: String,

    #[serde(default)]
    pub gateway: GatewayConfig,

    /// Exchange fee rate (one-way fraction).
    #[serde(default = "default_fee_rate")]
    pub fee_rate: f64,

    /// Working capital assumed for position sizing.
    #[serde(default = "default_capital_krw")]
    pub capital_krw: f64,

    /// Scope of the one-open-position constraint.
    #[serde(default)]
    pub market_exclusion: MarketExclusion,

    /// Per-scan candidate cap (strongest signals kept).
    #[serde(default = "default_max_scan_candidates")]
    pub max_scan_candidates: usize,

    #[serde(default = "default_sizer")]
    pub sizer: SizerConfig,

    #[serde(default)]
    pub throttle: ThrottleThresholds,

    #[serde(default = "default_dca")]
    pub dca: StrategyConfig,
    #[serde(default = "default_mean_reversion")]
    pub mean_reversion: StrategyConfig,
    #[serde(default = "default_volume_surge")]
    pub volume_surge: StrategyConfig,
    #[serde(default = "default_meme_scalper_plain")]
    pub meme_scalper: StrategyConfig,
    #[serde(default = "default_volatility_survival")]
    pub volatility_survival: StrategyConfig,
    #[serde(default = "default_guided")]
    pub guided: StrategyConfig,
}

fn default_meme_scalper_plain() -> StrategyConfig {
    default_strategy(StrategyCode::MemeScalper)
}
fn default_volatility_survival() -> StrategyConfig {
    default_strategy(StrategyCode::VolatilitySurvival)
}
fn default_guided() -> StrategyConfig {
    default_strategy(StrategyCode::Guided)
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            db_url: default_db_url(),
            gateway: GatewayConfig::default(),
            fee_rate: default_fee_rate(),
            capital_krw: default_capital_krw(),
            market_exclusion: MarketExclusion::default(),
            max_scan_candidates: default_max_scan_candidates(),
            sizer: SizerConfig::default(),
            throttle: ThrottleThresholds::default(),
            dca: default_dca(),
            mean_reversion: default_mean_reversion(),
            volume_surge: default_volume_surge(),
            meme_scalper: default_meme_scalper_plain(),
            volatility_survival: default_volatility_survival(),
            guided: default_guided(),
        }
    }
}

impl EngineConfig {
    /// Config for a specific strategy code.
    pub fn strategy(&self, code: StrategyCode) -> &StrategyConfig {
        match code {
            StrategyCode::Dca => &self.dca,
            StrategyCode::MeanReversion | StrategyCode::Breakout => &self.mean_reversion,
            StrategyCode::VolumeSurge => &self.volume_surge,
            StrategyCode::MemeScalper => &self.meme_scalper,
            StrategyCode::VolatilitySurvival => &self.volatility_survival,
            _ => &self.guided,
        }
    }

    /// Load configuration from a JSON file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config from {}", path.display()))?;
        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse config from {}", path.display()))?;

        info!(path = %path.display(), "engine config loaded");
        Ok(config)
    }

    /// Persist to `path` atomically (tmp + rename).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let content = serde_json::to_string_pretty(self).context("failed to serialize config")?;

        let tmp_path = path.with_extension("json.tmp");
        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;
        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "engine config saved (atomic)");
        Ok(())
    }
}
