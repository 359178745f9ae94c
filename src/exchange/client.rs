// =============================================================================
// Exchange REST client — JWT-authenticated spot trading gateway
// =============================================================================
//
// SECURITY: the secret key is used exclusively to sign per-request JWTs and
// is never logged or serialized.
//
// Request signing: each authenticated call carries a fresh HS256 JWT with
// claims {access_key, nonce, query_hash, query_hash_alg: "SHA512"} where
// query_hash is the SHA-512 hex digest of the exact query string sent.
//
// Failure semantics:
//   - network errors / 5xx / 429  -> retried with exponential backoff
//     (1 s initial, 10 s cap, three attempts), then surfaced as Transport.
//   - envelope status "5500"      -> unlisted coin, reads return Ok(None).
//   - {error: {name, message}}    -> mapped to the typed ExchangeError.
//   - auth failures               -> surfaced once, then the process-wide
//     degraded flag is flipped for the Coordinator to read.
// =============================================================================

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use jsonwebtoken::{encode, EncodingKey, Header};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha512};
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::exchange::error::ExchangeError;
use crate::exchange::rate_limit::TokenBucket;
use crate::market_data::Candle;
use crate::types::{Balance, Market, Orderbook, OrderbookLevel, OrderSide, OrderType, Ticker};

/// Retry policy: initial delay, cap, attempts.
const RETRY_INITIAL: Duration = Duration::from_secs(1);
const RETRY_MAX: Duration = Duration::from_secs(10);
const RETRY_ATTEMPTS: u32 = 3;

/// HTTP timeout per request.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

type ExchangeResult<T> = Result<T, ExchangeError>;

// ---------------------------------------------------------------------------
// Request / response types
// ---------------------------------------------------------------------------

/// Order submission parameters.
#[derive(Debug, Clone)]
pub struct OrderRequest {
    pub market: String,
    pub side: OrderSide,
    pub order_type: OrderType,
    /// Limit price, or the KRW notional for MARKET_BUY_BY_PRICE.
    pub price: Option<f64>,
    /// Base-asset quantity; unused for MARKET_BUY_BY_PRICE.
    pub volume: Option<f64>,
}

/// Normalized view of the exchange's order object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderResponse {
    pub order_id: String,
    /// "wait", "done", or "cancel".
    pub state: String,
    pub side: String,
    pub executed_volume: f64,
    pub remaining_volume: f64,
    pub price: Option<f64>,
    pub avg_price: Option<f64>,
}

impl OrderResponse {
    pub fn from_json(value: &serde_json::Value) -> Option<Self> {
        let order_id = value
            .get("uuid")
            .or_else(|| value.get("order_id"))
            .and_then(|v| v.as_str())?
            .to_string();

        Some(Self {
            order_id,
            state: value
                .get("state")
                .and_then(|v| v.as_str())
                .unwrap_or("wait")
                .to_string(),
            side: value
                .get("side")
                .and_then(|v| v.as_str())
                .unwrap_or("")
                .to_string(),
            executed_volume: str_or_num(value.get("executed_volume")).unwrap_or(0.0),
            remaining_volume: str_or_num(value.get("remaining_volume")).unwrap_or(0.0),
            price: str_or_num(value.get("price")),
            avg_price: str_or_num(value.get("avg_price")),
        })
    }

    pub fn is_filled(&self) -> bool {
        self.state == "done"
    }

    pub fn is_cancelled(&self) -> bool {
        self.state == "cancel"
    }

    /// Fraction of the order filled, in [0, 1].
    pub fn fill_ratio(&self) -> f64 {
        let total = self.executed_volume + self.remaining_volume;
        if total <= 0.0 {
            if self.is_filled() { 1.0 } else { 0.0 }
        } else {
            self.executed_volume / total
        }
    }
}

/// Per-request JWT claims.
#[derive(Debug, Serialize, Deserialize)]
struct ApiClaims {
    access_key: String,
    nonce: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    query_hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    query_hash_alg: Option<String>,
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

pub struct ExchangeClient {
    access_key: String,
    secret_key: String,
    base_url: String,
    http: reqwest::Client,
    bucket: TokenBucket,
    degraded: Arc<AtomicBool>,
    auth_alerted: AtomicBool,
}

impl ExchangeClient {
    pub fn new(base_url: impl Into<String>, access_key: impl Into<String>, secret_key: impl Into<String>) -> Self {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .expect("failed to build reqwest client");

        Self {
            access_key: access_key.into(),
            secret_key: secret_key.into(),
            base_url: base_url.into(),
            http,
            bucket: TokenBucket::default(),
            degraded: Arc::new(AtomicBool::new(false)),
            auth_alerted: AtomicBool::new(false),
        }
    }

    /// Shared degraded flag — the Coordinator holds a clone and refuses new
    /// entries while it is set.
    pub fn degraded_flag(&self) -> Arc<AtomicBool> {
        self.degraded.clone()
    }

    // -------------------------------------------------------------------------
    // Signing
    // -------------------------------------------------------------------------

    /// Build the Authorization header value for `query` (may be empty).
    fn authorization(&self, query: &str) -> ExchangeResult<String> {
        let claims = if query.is_empty() {
            ApiClaims {
                access_key: self.access_key.clone(),
                nonce: Uuid::new_v4().to_string(),
                query_hash: None,
                query_hash_alg: None,
            }
        } else {
            let mut hasher = Sha512::new();
            hasher.update(query.as_bytes());
            ApiClaims {
                access_key: self.access_key.clone(),
                nonce: Uuid::new_v4().to_string(),
                query_hash: Some(hex::encode(hasher.finalize())),
                query_hash_alg: Some("SHA512".to_string()),
            }
        };

        let token = encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(self.secret_key.as_bytes()),
        )
        .map_err(|e| ExchangeError::Auth(format!("jwt encode failed: {e}")))?;

        Ok(format!("Bearer {token}"))
    }

    // -------------------------------------------------------------------------
    // Transport with retry
    // -------------------------------------------------------------------------

    /// Send a request with retry on network errors, 5xx, and 429. Returns the
    /// final status and parsed JSON body.
    async fn send(
        &self,
        method: reqwest::Method,
        path: &str,
        query: &str,
        signed: bool,
    ) -> ExchangeResult<(reqwest::StatusCode, serde_json::Value)> {
        let url = if query.is_empty() {
            format!("{}{}", self.base_url, path)
        } else {
            format!("{}{}?{}", self.base_url, path, query)
        };

        let mut last_err: Option<ExchangeError> = None;

        for attempt in 0..RETRY_ATTEMPTS {
            if attempt > 0 {
                let delay = backoff_delay(attempt - 1);
                debug!(attempt, delay_ms = delay.as_millis() as u64, path, "retrying request");
                tokio::time::sleep(delay).await;
            }

            self.bucket.acquire().await;

            let mut req = self.http.request(method.clone(), &url);
            if signed {
                req = req.header(reqwest::header::AUTHORIZATION, self.authorization(query)?);
            }

            let resp = match req.send().await {
                Ok(r) => r,
                Err(e) => {
                    last_err = Some(ExchangeError::Transport(format!("{e}")));
                    continue;
                }
            };

            let status = resp.status();
            if status.is_server_error() || status.as_u16() == 429 {
                last_err = Some(ExchangeError::Transport(format!("HTTP {status} from {path}")));
                continue;
            }

            let body: serde_json::Value = match resp.json().await {
                Ok(v) => v,
                Err(e) => {
                    last_err = Some(ExchangeError::Decode(format!("{e}")));
                    continue;
                }
            };

            return Ok((status, body));
        }

        Err(last_err.unwrap_or_else(|| ExchangeError::Transport("request failed".to_string())))
    }

    /// Decode one of the three response shapes into an optional payload, then
    /// note auth failures on the degraded flag.
    fn unwrap_body(
        &self,
        status: reqwest::StatusCode,
        body: serde_json::Value,
    ) -> ExchangeResult<Option<serde_json::Value>> {
        let result = decode_envelope(status, body);
        if let Err(ref e) = result {
            self.note_error(e);
        }
        result
    }

    /// Surface a fatal auth error once, then flip the degraded flag.
    fn note_error(&self, e: &ExchangeError) {
        if e.is_auth() {
            if !self.auth_alerted.swap(true, Ordering::SeqCst) {
                error!(error = %e, "fatal exchange auth error — entering degraded mode");
            }
            self.degraded.store(true, Ordering::SeqCst);
        }
    }

    // -------------------------------------------------------------------------
    // Public market data
    // -------------------------------------------------------------------------

    /// Full market list with warning flags.
    pub async fn list_markets(&self) -> ExchangeResult<Option<Vec<Market>>> {
        let (status, body) = self.send(reqwest::Method::GET, "/v1/market/all", "isDetails=true", false).await?;
        let payload = match self.unwrap_body(status, body)? {
            Some(p) => p,
            None => return Ok(None),
        };

        let raw = payload
            .as_array()
            .ok_or_else(|| ExchangeError::Decode("market list is not an array".into()))?;

        let markets = raw
            .iter()
            .filter_map(|m| {
                let symbol = m.get("market")?.as_str()?;
                Some(Market {
                    market: symbol.to_string(),
                    korean_name: m.get("korean_name").and_then(|v| v.as_str()).unwrap_or("").to_string(),
                    english_name: m.get("english_name").and_then(|v| v.as_str()).unwrap_or("").to_string(),
                    warning: m
                        .get("market_warning")
                        .and_then(|v| v.as_str())
                        .map(|w| w != "NONE")
                        .unwrap_or(false),
                })
            })
            .collect();

        Ok(Some(markets))
    }

    /// Minute candles, oldest first. `interval` is a label like "1m" / "5m".
    pub async fn get_candles(&self, market: &str, interval: &str, count: u32) -> ExchangeResult<Option<Vec<Candle>>> {
        let unit = match interval_to_unit(interval) {
            Some(u) => u,
            None => return Err(ExchangeError::InvalidOrder(format!("unsupported interval {interval}"))),
        };
        let path = format!("/v1/candles/minutes/{unit}");
        let query = format!("market={market}&count={count}");

        let (status, body) = self.send(reqwest::Method::GET, &path, &query, false).await?;
        let payload = match self.read_payload(status, body)? {
            Some(p) => p,
            None => return Ok(None),
        };

        let raw = payload
            .as_array()
            .ok_or_else(|| ExchangeError::Decode("candle response is not an array".into()))?;

        // The exchange returns newest-first; indicators expect oldest-first.
        let mut candles: Vec<Candle> = raw
            .iter()
            .filter_map(|c| {
                Some(Candle::new(
                    c.get("timestamp").and_then(|v| v.as_i64()).unwrap_or(0),
                    str_or_num(c.get("opening_price"))?,
                    str_or_num(c.get("high_price"))?,
                    str_or_num(c.get("low_price"))?,
                    str_or_num(c.get("trade_price"))?,
                    str_or_num(c.get("candle_acc_trade_volume")).unwrap_or(0.0),
                ))
            })
            .collect();
        candles.reverse();

        debug!(market, interval, count = candles.len(), "candles fetched");
        Ok(Some(candles))
    }

    /// Latest ticker for one market.
    pub async fn get_ticker(&self, market: &str) -> ExchangeResult<Option<Ticker>> {
        let query = format!("markets={market}");
        let (status, body) = self.send(reqwest::Method::GET, "/v1/ticker", &query, false).await?;
        let payload = match self.read_payload(status, body)? {
            Some(p) => p,
            None => return Ok(None),
        };

        let first = match payload.as_array().and_then(|a| a.first()) {
            Some(f) => f.clone(),
            None => return Ok(None),
        };

        Ok(Some(Ticker {
            market: market.to_string(),
            trade_price: str_or_num(first.get("trade_price")).unwrap_or(0.0),
            acc_trade_value_24h: str_or_num(first.get("acc_trade_price_24h")).unwrap_or(0.0),
            signed_change_rate: str_or_num(first.get("signed_change_rate")).unwrap_or(0.0),
            timestamp: first.get("timestamp").and_then(|v| v.as_i64()).unwrap_or(0),
        }))
    }

    /// Order book snapshot (best levels first).
    pub async fn get_orderbook(&self, market: &str) -> ExchangeResult<Option<Orderbook>> {
        let query = format!("markets={market}");
        let (status, body) = self.send(reqwest::Method::GET, "/v1/orderbook", &query, false).await?;
        let payload = match self.read_payload(status, body)? {
            Some(p) => p,
            None => return Ok(None),
        };

        let first = match payload.as_array().and_then(|a| a.first()) {
            Some(f) => f.clone(),
            None => return Ok(None),
        };

        let units = first
            .get("orderbook_units")
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default();

        let mut bids = Vec::with_capacity(units.len());
        let mut asks = Vec::with_capacity(units.len());
        for u in &units {
            if let (Some(bp), Some(bq)) = (str_or_num(u.get("bid_price")), str_or_num(u.get("bid_size"))) {
                bids.push(OrderbookLevel { price: bp, quantity: bq });
            }
            if let (Some(ap), Some(aq)) = (str_or_num(u.get("ask_price")), str_or_num(u.get("ask_size"))) {
                asks.push(OrderbookLevel { price: ap, quantity: aq });
            }
        }

        Ok(Some(Orderbook {
            market: market.to_string(),
            bids,
            asks,
            timestamp: first.get("timestamp").and_then(|v| v.as_i64()).unwrap_or(0),
        }))
    }

    // -------------------------------------------------------------------------
    // Authenticated endpoints
    // -------------------------------------------------------------------------

    /// Account balances (signed).
    pub async fn get_balances(&self) -> ExchangeResult<Option<Vec<Balance>>> {
        let (status, body) = self.send(reqwest::Method::GET, "/v1/accounts", "", true).await?;
        let payload = match self.read_payload(status, body)? {
            Some(p) => p,
            None => return Ok(None),
        };

        let raw = payload
            .as_array()
            .ok_or_else(|| ExchangeError::Decode("accounts response is not an array".into()))?;

        let balances = raw
            .iter()
            .filter_map(|b| {
                Some(Balance {
                    currency: b.get("currency")?.as_str()?.to_string(),
                    available: str_or_num(b.get("balance")).unwrap_or(0.0),
                    locked: str_or_num(b.get("locked")).unwrap_or(0.0),
                })
            })
            .collect();

        Ok(Some(balances))
    }

    /// Submit an order (signed). Domain errors surface typed; the caller is
    /// responsible for lifecycle events.
    pub async fn place_order(&self, req: &OrderRequest) -> ExchangeResult<OrderResponse> {
        let query = build_order_query(req)?;
        let (status, body) = self.send(reqwest::Method::POST, "/v1/orders", &query, true).await?;
        let payload = self
            .unwrap_body(status, body)?
            .ok_or_else(|| ExchangeError::MarketUnavailable(req.market.clone()))?;

        OrderResponse::from_json(&payload)
            .ok_or_else(|| ExchangeError::Decode("order response missing uuid".into()))
    }

    /// Cancel an order by id (signed).
    pub async fn cancel_order(&self, order_id: &str) -> ExchangeResult<OrderResponse> {
        let query = format!("uuid={order_id}");
        let (status, body) = self.send(reqwest::Method::DELETE, "/v1/order", &query, true).await?;
        let payload = self
            .unwrap_body(status, body)?
            .ok_or_else(|| ExchangeError::OrderNotFound(order_id.to_string()))?;

        OrderResponse::from_json(&payload)
            .ok_or_else(|| ExchangeError::Decode("cancel response missing uuid".into()))
    }

    /// Fetch a single order's current state (signed).
    pub async fn get_order(&self, order_id: &str) -> ExchangeResult<Option<OrderResponse>> {
        let query = format!("uuid={order_id}");
        let (status, body) = self.send(reqwest::Method::GET, "/v1/order", &query, true).await?;
        match self.unwrap_body(status, body) {
            Ok(Some(payload)) => Ok(OrderResponse::from_json(&payload)),
            Ok(None) => Ok(None),
            Err(ExchangeError::OrderNotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    // -------------------------------------------------------------------------
    // Internal helpers
    // -------------------------------------------------------------------------

    /// Read-path decoding: unlisted coins and unavailable markets become
    /// `Ok(None)` instead of errors.
    fn read_payload(
        &self,
        status: reqwest::StatusCode,
        body: serde_json::Value,
    ) -> ExchangeResult<Option<serde_json::Value>> {
        match self.unwrap_body(status, body) {
            Ok(v) => Ok(v),
            Err(ExchangeError::MarketUnavailable(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

impl std::fmt::Debug for ExchangeClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExchangeClient")
            .field("access_key", &"<redacted>")
            .field("secret_key", &"<redacted>")
            .field("base_url", &self.base_url)
            .finish()
    }
}

// =============================================================================
// Free helpers
// =============================================================================

/// Exponential backoff: 1 s doubling, capped at 10 s.
pub fn backoff_delay(retry_index: u32) -> Duration {
    let delay = RETRY_INITIAL * 2u32.saturating_pow(retry_index);
    delay.min(RETRY_MAX)
}

/// Decode one of the three documented response shapes:
///   1. bare JSON array (v1)                 -> payload as-is
///   2. {status, data, message} envelope     -> unwrap on "0000",
///      None on "5500" (unlisted coin), warn otherwise
///   3. {error: {name, message}}             -> typed error
fn decode_envelope(
    status: reqwest::StatusCode,
    body: serde_json::Value,
) -> Result<Option<serde_json::Value>, ExchangeError> {
    if let Some(err) = body.get("error") {
        let name = err.get("name").and_then(|v| v.as_str()).unwrap_or("unknown");
        let message = err.get("message").and_then(|v| v.as_str()).unwrap_or("");
        return Err(ExchangeError::from_error_name(name, message));
    }

    if let Some(code) = body.get("status").and_then(|v| v.as_str()) {
        return match code {
            "0000" => Ok(Some(body.get("data").cloned().unwrap_or(serde_json::Value::Null))),
            "5500" => Ok(None), // unlisted coin — silent null
            other => {
                warn!(
                    status = other,
                    message = body.get("message").and_then(|v| v.as_str()).unwrap_or(""),
                    "unexpected envelope status"
                );
                Ok(None)
            }
        };
    }

    if !status.is_success() {
        return Err(ExchangeError::Transport(format!("HTTP {status} with unrecognized body")));
    }

    Ok(Some(body))
}

/// Map an interval label to the exchange's minute unit.
fn interval_to_unit(interval: &str) -> Option<u32> {
    match interval {
        "1m" => Some(1),
        "3m" => Some(3),
        "5m" => Some(5),
        "10m" => Some(10),
        "15m" => Some(15),
        "30m" => Some(30),
        "60m" | "1h" => Some(60),
        "240m" | "4h" => Some(240),
        _ => None,
    }
}

/// Build the signed order query string for a request.
fn build_order_query(req: &OrderRequest) -> Result<String, ExchangeError> {
    let side = match req.side {
        OrderSide::Buy => "bid",
        OrderSide::Sell => "ask",
    };

    match req.order_type {
        OrderType::Limit => {
            let price = req
                .price
                .ok_or_else(|| ExchangeError::InvalidOrder("limit order requires price".into()))?;
            let volume = req
                .volume
                .ok_or_else(|| ExchangeError::InvalidOrder("limit order requires volume".into()))?;
            Ok(format!(
                "market={}&side={side}&ord_type=limit&price={price}&volume={volume}",
                req.market
            ))
        }
        OrderType::MarketBuyByPrice => {
            if req.side != OrderSide::Buy {
                return Err(ExchangeError::InvalidOrder("MARKET_BUY_BY_PRICE must be a buy".into()));
            }
            let notional = req
                .price
                .ok_or_else(|| ExchangeError::InvalidOrder("market buy requires KRW notional".into()))?;
            Ok(format!(
                "market={}&side=bid&ord_type=price&price={notional}",
                req.market
            ))
        }
        OrderType::Market => {
            if req.side != OrderSide::Sell {
                return Err(ExchangeError::InvalidOrder("MARKET order type is sell-only".into()));
            }
            let volume = req
                .volume
                .ok_or_else(|| ExchangeError::InvalidOrder("market sell requires volume".into()))?;
            Ok(format!(
                "market={}&side=ask&ord_type=market&volume={volume}",
                req.market
            ))
        }
    }
}

/// Parse a JSON value that may be either a string or a number into `f64`.
fn str_or_num(val: Option<&serde_json::Value>) -> Option<f64> {
    let val = val?;
    if let Some(n) = val.as_f64() {
        return Some(n);
    }
    val.as_str().and_then(|s| s.parse::<f64>().ok())
}
