// =============================================================================
// WebSocket ticker feed with REST-fallback staleness tracking
// =============================================================================
//
// The feed keeps the most recent ticker per subscribed market. Consumers ask
// for a *fresh* ticker; if the last WebSocket update for that market is older
// than the staleness threshold (15 s) the call returns `None` and the caller
// falls back to a REST fetch through the gateway.
//
// Subscription frames carry at most 70 codes; larger universes are split
// across multiple frames on the same connection.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use parking_lot::RwLock;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::types::Ticker;

/// Reconnect delay after a dropped connection.
pub const RECONNECT_DELAY_SECS: u64 = 5;

/// A ticker older than this is considered stale and callers must fall back
/// to REST.
const STALENESS_THRESHOLD: Duration = Duration::from_secs(15);

/// Maximum market codes per subscription frame.
const MAX_CODES_PER_FRAME: usize = 70;

/// Shared store of the latest ticker per market, stamped with arrival time.
pub struct TickerFeed {
    latest: RwLock<HashMap<String, (Ticker, Instant)>>,
}

impl TickerFeed {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            latest: RwLock::new(HashMap::new()),
        })
    }

    /// Record a ticker received from the stream.
    pub fn update(&self, ticker: Ticker) {
        self.latest
            .write()
            .insert(ticker.market.clone(), (ticker, Instant::now()));
    }

    /// Return the latest ticker for `market` if it is within the staleness
    /// threshold. `None` means the caller should fetch over REST.
    pub fn fresh_ticker(&self, market: &str) -> Option<Ticker> {
        let map = self.latest.read();
        let (ticker, at) = map.get(market)?;
        if at.elapsed() > STALENESS_THRESHOLD {
            return None;
        }
        Some(ticker.clone())
    }

    /// Number of markets with any ticker recorded (stale or not).
    pub fn tracked_count(&self) -> usize {
        self.latest.read().len()
    }
}

/// Build the subscription frames for `codes`, batching at 70 codes each.
pub fn subscription_frames(codes: &[String]) -> Vec<String> {
    codes
        .chunks(MAX_CODES_PER_FRAME)
        .map(|chunk| {
            serde_json::json!([
                { "ticket": Uuid::new_v4().to_string() },
                { "type": "ticker", "codes": chunk },
            ])
            .to_string()
        })
        .collect()
}

/// Run one WebSocket session: connect, subscribe, and pump tickers into the
/// feed until the connection drops. The caller wraps this in a reconnect loop
/// sleeping [`RECONNECT_DELAY_SECS`] between attempts.
pub async fn run_ticker_stream(ws_url: &str, codes: &[String], feed: &TickerFeed) -> Result<()> {
    let (ws, _) = connect_async(ws_url)
        .await
        .context("ticker stream: websocket connect failed")?;
    let (mut write, mut read) = ws.split();

    for frame in subscription_frames(codes) {
        write
            .send(Message::Text(frame))
            .await
            .context("ticker stream: subscribe frame send failed")?;
    }

    info!(url = ws_url, codes = codes.len(), "ticker stream subscribed");

    while let Some(msg) = read.next().await {
        let msg = msg.context("ticker stream: read error")?;
        match msg {
            Message::Text(text) => handle_payload(text.as_bytes(), feed),
            Message::Binary(bytes) => handle_payload(&bytes, feed),
            Message::Ping(p) => {
                let _ = write.send(Message::Pong(p)).await;
            }
            Message::Close(_) => {
                warn!("ticker stream closed by server");
                break;
            }
            _ => {}
        }
    }

    Ok(())
}

fn handle_payload(bytes: &[u8], feed: &TickerFeed) {
    let value: serde_json::Value = match serde_json::from_slice(bytes) {
        Ok(v) => v,
        Err(e) => {
            debug!(error = %e, "ticker stream: unparseable payload skipped");
            return;
        }
    };

    let market = value
        .get("code")
        .or_else(|| value.get("market"))
        .and_then(|v| v.as_str());
    let price = value.get("trade_price").and_then(|v| v.as_f64());

    if let (Some(market), Some(trade_price)) = (market, price) {
        feed.update(Ticker {
            market: market.to_string(),
            trade_price,
            acc_trade_value_24h: value
                .get("acc_trade_price_24h")
                .and_then(|v| v.as_f64())
                .unwrap_or(0.0),
            signed_change_rate: value
                .get("signed_change_rate")
                .and_then(|v| v.as_f64())
                .unwrap_or(0.0),
            timestamp: value.get("timestamp").and_then(|v| v.as_i64()).unwrap_or(0),
        });
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_are_batched_at_seventy() {
        let codes: Vec<String> = (0..150).map(|i| format!("KRW-C{i}")).collect();
        let frames = subscription_frames(&codes);
        assert_eq!(frames.len(), 3); // 70 + 70 + 10

        let parsed: serde_json::Value = serde_json::from_str(&frames[0]).unwrap();
        let chunk = parsed[1]["codes"].as_array().unwrap();
        assert_eq!(chunk.len(), 70);

        let parsed_last: serde_json::Value = serde_json::from_str(&frames[2]).unwrap();
        assert_eq!(parsed_last[1]["codes"].as_array().unwrap().len(), 10);
    }

    #[test]
    fn fresh_ticker_within_threshold() {
        let feed = TickerFeed::new();
        feed.update(Ticker {
            market: "KRW-BTC".into(),
            trade_price: 50_000_000.0,
            acc_trade_value_24h: 0.0,
            signed_change_rate: 0.0,
            timestamp: 0,
        });
        let t = feed.fresh_ticker("KRW-BTC").unwrap();
        assert!((t.trade_price - 50_000_000.0).abs() < 1e-10);
        assert!(feed.fresh_ticker("KRW-ETH").is_none());
    }

    #[test]
    fn payload_parses_ticker_fields() {
        let feed = TickerFeed::new();
        let payload = serde_json::json!({
            "code": "KRW-XRP",
            "trade_price": 700.5,
            "acc_trade_price_24h": 1_000_000.0,
            "signed_change_rate": 0.012,
            "timestamp": 1700000000000_i64,
        })
        .to_string();
        handle_payload(payload.as_bytes(), &feed);
        let t = feed.fresh_ticker("KRW-XRP").unwrap();
        assert!((t.trade_price - 700.5).abs() < 1e-10);
        assert_eq!(t.timestamp, 1700000000000);
    }

    #[test]
    fn garbage_payload_is_ignored() {
        let feed = TickerFeed::new();
        handle_payload(b"not json at all", &feed);
        assert_eq!(feed.tracked_count(), 0);
    }
}
