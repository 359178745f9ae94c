// =============================================================================
// Shared types used across the Namsan trading engine
// =============================================================================

use serde::{Deserialize, Serialize};

/// A tradable market in canonical `QUOTE-BASE` form (e.g. `KRW-BTC`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Market {
    /// Canonical symbol, e.g. "KRW-BTC".
    pub market: String,
    #[serde(default)]
    pub korean_name: String,
    #[serde(default)]
    pub english_name: String,
    /// Exchange-issued caution flag (e.g. volatility warning).
    #[serde(default)]
    pub warning: bool,
}

/// Latest trade snapshot for a market.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ticker {
    pub market: String,
    pub trade_price: f64,
    #[serde(default)]
    pub acc_trade_value_24h: f64,
    #[serde(default)]
    pub signed_change_rate: f64,
    #[serde(default)]
    pub timestamp: i64,
}

/// One price level of an order book.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct OrderbookLevel {
    pub price: f64,
    pub quantity: f64,
}

/// Order book snapshot (best levels first).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Orderbook {
    pub market: String,
    pub bids: Vec<OrderbookLevel>,
    pub asks: Vec<OrderbookLevel>,
    #[serde(default)]
    pub timestamp: i64,
}

impl Orderbook {
    /// Best bid price, if the book has any bids.
    pub fn best_bid(&self) -> Option<f64> {
        self.bids.first().map(|l| l.price)
    }

    /// Best ask price, if the book has any asks.
    pub fn best_ask(&self) -> Option<f64> {
        self.asks.first().map(|l| l.price)
    }

    /// Total quoted value (price * qty) on both sides of the visible book.
    /// Used by the executor to judge liquidity depth.
    pub fn visible_value(&self) -> f64 {
        self.bids
            .iter()
            .chain(self.asks.iter())
            .map(|l| l.price * l.quantity)
            .sum()
    }
}

/// Balance snapshot for a single asset from the exchange.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Balance {
    pub currency: String,
    #[serde(default)]
    pub available: f64,
    #[serde(default)]
    pub locked: f64,
}

/// Side of an order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Buy => "BUY",
            Self::Sell => "SELL",
        }
    }
}

impl std::fmt::Display for OrderSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for OrderSide {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "BUY" => Ok(Self::Buy),
            "SELL" => Ok(Self::Sell),
            other => Err(format!("unknown order side: {other}")),
        }
    }
}

/// Order type submitted to the exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderType {
    Limit,
    Market,
    /// Market buy expressed in quote currency (KRW amount, not quantity).
    MarketBuyByPrice,
}

impl OrderType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Limit => "LIMIT",
            Self::Market => "MARKET",
            Self::MarketBuyByPrice => "MARKET_BUY_BY_PRICE",
        }
    }
}

impl std::fmt::Display for OrderType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for OrderType {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "LIMIT" => Ok(Self::Limit),
            "MARKET" => Ok(Self::Market),
            "MARKET_BUY_BY_PRICE" => Ok(Self::MarketBuyByPrice),
            other => Err(format!("unknown order type: {other}")),
        }
    }
}

/// Identifies which engine (or manual path) originated an order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StrategyCode {
    Dca,
    MeanReversion,
    Breakout,
    VolumeSurge,
    MemeScalper,
    VolatilitySurvival,
    Guided,
    OrderBookImbalance,
    Momentum,
    Manual,
}

impl StrategyCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Dca => "DCA",
            Self::MeanReversion => "MEAN_REVERSION",
            Self::Breakout => "BREAKOUT",
            Self::VolumeSurge => "VOLUME_SURGE",
            Self::MemeScalper => "MEME_SCALPER",
            Self::VolatilitySurvival => "VOLATILITY_SURVIVAL",
            Self::Guided => "GUIDED",
            Self::OrderBookImbalance => "ORDER_BOOK_IMBALANCE",
            Self::Momentum => "MOMENTUM",
            Self::Manual => "MANUAL",
        }
    }

    /// Which telemetry group this code reports under.
    pub fn group(&self) -> StrategyGroup {
        match self {
            Self::Manual => StrategyGroup::Manual,
            Self::Guided => StrategyGroup::Guided,
            _ => StrategyGroup::CoreEngine,
        }
    }
}

impl std::fmt::Display for StrategyCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for StrategyCode {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "DCA" => Ok(Self::Dca),
            "MEAN_REVERSION" => Ok(Self::MeanReversion),
            "BREAKOUT" => Ok(Self::Breakout),
            "VOLUME_SURGE" => Ok(Self::VolumeSurge),
            "MEME_SCALPER" => Ok(Self::MemeScalper),
            "VOLATILITY_SURVIVAL" => Ok(Self::VolatilitySurvival),
            "GUIDED" => Ok(Self::Guided),
            "ORDER_BOOK_IMBALANCE" => Ok(Self::OrderBookImbalance),
            "MOMENTUM" => Ok(Self::Momentum),
            "MANUAL" => Ok(Self::Manual),
            other => Err(format!("unknown strategy code: {other}")),
        }
    }
}

/// Telemetry grouping for lifecycle events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StrategyGroup {
    Manual,
    Guided,
    AutopilotMcp,
    CoreEngine,
}

impl StrategyGroup {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Manual => "MANUAL",
            Self::Guided => "GUIDED",
            Self::AutopilotMcp => "AUTOPILOT_MCP",
            Self::CoreEngine => "CORE_ENGINE",
        }
    }
}

impl std::fmt::Display for StrategyGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for StrategyGroup {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "MANUAL" => Ok(Self::Manual),
            "GUIDED" => Ok(Self::Guided),
            "AUTOPILOT_MCP" => Ok(Self::AutopilotMcp),
            "CORE_ENGINE" => Ok(Self::CoreEngine),
            other => Err(format!("unknown strategy group: {other}")),
        }
    }
}

/// Action recommended by a strategy scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SignalAction {
    Buy,
    Sell,
    Hold,
}

impl std::fmt::Display for SignalAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Buy => f.write_str("BUY"),
            Self::Sell => f.write_str("SELL"),
            Self::Hold => f.write_str("HOLD"),
        }
    }
}

/// Entry/exit signal produced by a strategy engine and consumed by the
/// order executor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signal {
    pub market: String,
    pub action: SignalAction,
    /// Confidence in [0, 100].
    pub confidence: f64,
    pub price: f64,
    pub reason: String,
    pub strategy_code: StrategyCode,
    /// Regime label at signal time (e.g. "BULL_TREND").
    pub regime: String,
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn strategy_code_roundtrip() {
        for code in [
            StrategyCode::Dca,
            StrategyCode::MeanReversion,
            StrategyCode::Breakout,
            StrategyCode::VolumeSurge,
            StrategyCode::MemeScalper,
            StrategyCode::VolatilitySurvival,
            StrategyCode::Guided,
            StrategyCode::OrderBookImbalance,
            StrategyCode::Momentum,
            StrategyCode::Manual,
        ] {
            assert_eq!(StrategyCode::from_str(code.as_str()).unwrap(), code);
        }
    }

    #[test]
    fn strategy_code_groups() {
        assert_eq!(StrategyCode::Manual.group(), StrategyGroup::Manual);
        assert_eq!(StrategyCode::Guided.group(), StrategyGroup::Guided);
        assert_eq!(StrategyCode::Dca.group(), StrategyGroup::CoreEngine);
        assert_eq!(StrategyCode::MemeScalper.group(), StrategyGroup::CoreEngine);
    }

    #[test]
    fn orderbook_best_levels() {
        let book = Orderbook {
            market: "KRW-BTC".into(),
            bids: vec![OrderbookLevel { price: 100.0, quantity: 1.0 }],
            asks: vec![OrderbookLevel { price: 101.0, quantity: 2.0 }],
            timestamp: 0,
        };
        assert_eq!(book.best_bid(), Some(100.0));
        assert_eq!(book.best_ask(), Some(101.0));
        assert!((book.visible_value() - 302.0).abs() < 1e-10);
    }

    #[test]
    fn orderbook_empty_sides() {
        let book = Orderbook {
            market: "KRW-XRP".into(),
            bids: vec![],
            asks: vec![],
            timestamp: 0,
        };
        assert!(book.best_bid().is_none());
        assert!(book.best_ask().is_none());
    }

    #[test]
    fn side_parse_rejects_unknown() {
        assert!(OrderSide::from_str("HOLD").is_err());
    }
}
