// =============================================================================
// Order Executor — turns signals into exchange orders with full lifecycle
// =============================================================================
//
// Submission protocol (buys):
//   1. Reject anything under the exchange minimum notional before touching
//      the store — no PendingOrder row, no lifecycle event.
//   2. Pre-trade slippage estimate from the order book: warn above 0.5%,
//      block above 2%.
//   3. Emit BUY_REQUESTED and insert PendingOrder(PENDING), keyed by a
//      client-generated intent id. The exchange uuid is recorded once known.
//   4. Place the order (gateway handles retry). Final failure marks the
//      PendingOrder FAILED and emits FAILED.
//   5. LIMIT orders poll until FILLED, >= 90% PARTIAL (success), or the 5 s
//      timeout; on timeout a cancel is issued (CANCEL_REQUESTED, CANCELLED).
//   6. On success BUY_FILLED is emitted exactly once — the telemetry log's
//      (order_id, event_type) key dedupes replays.
//
// Order-type policy: MARKET when the regime is HIGH_VOLATILITY, confidence
// >= 85, liquidity is thin, or the strategy is in the prefer-market
// allowlist; LIMIT pegged just inside the best quote otherwise.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::exchange::client::{ExchangeClient, OrderRequest, OrderResponse};
use crate::exchange::error::ExchangeError;
use crate::store::position_store::{PendingOrder, PendingStatus, PositionStore};
use crate::store::telemetry::{EventType, LifecycleEvent, TelemetryLog};
use crate::types::{Orderbook, OrderSide, OrderType, Signal, StrategyCode};

/// Exchange minimum order notional in KRW.
pub const MIN_NOTIONAL_KRW: f64 = 5_100.0;

/// Confidence at or above which buys go straight to market.
const MARKET_CONFIDENCE: f64 = 85.0;

/// Book depth below this multiple of the notional counts as thin.
const THIN_BOOK_MULTIPLE: f64 = 5.0;

/// Estimated-slippage thresholds (fractions).
const SLIPPAGE_WARN: f64 = 0.005;
const SLIPPAGE_BLOCK: f64 = 0.02;

/// LIMIT fill polling: 10 polls x 500 ms = 5 s timeout.
const LIMIT_POLL_INTERVAL: Duration = Duration::from_millis(500);
const LIMIT_POLL_ATTEMPTS: u32 = 10;

/// A PARTIAL fill at or above this ratio is treated as success.
const PARTIAL_SUCCESS_RATIO: f64 = 0.9;

/// Positions younger than this cannot be force-closed by timeout exits.
pub const MIN_HOLDING_SECS: i64 = 10;

/// Strategies that always prefer market orders on entry.
const PREFER_MARKET: [StrategyCode; 5] = [
    StrategyCode::Dca,
    StrategyCode::OrderBookImbalance,
    StrategyCode::Momentum,
    StrategyCode::Breakout,
    StrategyCode::MemeScalper,
];

// ---------------------------------------------------------------------------
// Outcome
// ---------------------------------------------------------------------------

/// Result of one execution attempt.
#[derive(Debug, Clone)]
pub enum ExecutionOutcome {
    /// Order filled (fully, or >= 90% partial treated as success).
    Filled {
        order_id: String,
        avg_price: f64,
        quantity: f64,
    },
    /// Limit order timed out and was cancelled; any partial fill is noted
    /// and left for the sync routine to adopt.
    Cancelled {
        order_id: String,
        filled_quantity: f64,
    },
    /// Rejected before anything reached the store or the exchange.
    Rejected(String),
    /// The exchange refused or the transport gave up after retries.
    Failed(String),
}

impl std::fmt::Display for ExecutionOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Filled { order_id, avg_price, quantity } => {
                write!(f, "Filled(id={order_id} price={avg_price} qty={quantity})")
            }
            Self::Cancelled { order_id, filled_quantity } => {
                write!(f, "Cancelled(id={order_id} filled={filled_quantity})")
            }
            Self::Rejected(reason) => write!(f, "Rejected({reason})"),
            Self::Failed(reason) => write!(f, "Failed({reason})"),
        }
    }
}

// ---------------------------------------------------------------------------
// Executor
// ---------------------------------------------------------------------------

pub struct OrderExecutor {
    client: Arc<ExchangeClient>,
    store: PositionStore,
    telemetry: TelemetryLog,
}

impl OrderExecutor {
    pub fn new(client: Arc<ExchangeClient>, store: PositionStore, telemetry: TelemetryLog) -> Self {
        Self { client, store, telemetry }
    }

    // -------------------------------------------------------------------------
    // Buy entry
    // -------------------------------------------------------------------------

    /// Execute a BUY signal with the given notional (KRW).
    pub async fn execute_buy(&self, signal: &Signal, notional_krw: f64) -> ExecutionOutcome {
        // 1. Minimum-notional guard: reject before any row or event exists.
        if notional_krw < MIN_NOTIONAL_KRW {
            debug!(
                market = %signal.market,
                notional = notional_krw,
                "buy rejected below exchange minimum"
            );
            return ExecutionOutcome::Rejected(format!(
                "notional {notional_krw:.0} below exchange minimum {MIN_NOTIONAL_KRW:.0}"
            ));
        }

        // 2. Order book for policy and slippage estimation.
        let book = match self.client.get_orderbook(&signal.market).await {
            Ok(b) => b,
            Err(e) => {
                warn!(market = %signal.market, error = %e, "orderbook fetch failed before entry");
                None
            }
        };

        if let Some(ref book) = book {
            if let Some(slip) = estimated_buy_slippage(book, notional_krw) {
                if slip > SLIPPAGE_BLOCK {
                    warn!(
                        market = %signal.market,
                        slippage = format!("{:.3}%", slip * 100.0),
                        "buy blocked: estimated slippage above hard limit"
                    );
                    return ExecutionOutcome::Rejected(format!(
                        "estimated slippage {:.2}% exceeds {:.1}%",
                        slip * 100.0,
                        SLIPPAGE_BLOCK * 100.0
                    ));
                }
                if slip > SLIPPAGE_WARN {
                    warn!(
                        market = %signal.market,
                        slippage = format!("{:.3}%", slip * 100.0),
                        "elevated estimated slippage on entry"
                    );
                }
            }
        }

        let order_type = choose_order_type(signal, book.as_ref(), notional_krw);
        let intent_id = Uuid::new_v4().to_string();

        // 3. Lifecycle first: BUY_REQUESTED + PendingOrder(PENDING).
        let (request, order_price, order_quantity, order_amount) = match order_type {
            OrderType::MarketBuyByPrice => (
                OrderRequest {
                    market: signal.market.clone(),
                    side: OrderSide::Buy,
                    order_type: OrderType::MarketBuyByPrice,
                    price: Some(notional_krw),
                    volume: None,
                },
                None,
                None,
                Some(notional_krw),
            ),
            _ => {
                let limit_price = peg_buy_price(book.as_ref(), signal.price);
                let volume = notional_krw / limit_price;
                (
                    OrderRequest {
                        market: signal.market.clone(),
                        side: OrderSide::Buy,
                        order_type: OrderType::Limit,
                        price: Some(limit_price),
                        volume: Some(volume),
                    },
                    Some(limit_price),
                    Some(volume),
                    None,
                )
            }
        };

        self.telemetry
            .record(
                &LifecycleEvent::new(
                    &intent_id,
                    &signal.market,
                    OrderSide::Buy,
                    EventType::BuyRequested,
                    signal.strategy_code,
                )
                .with_message(signal.reason.clone()),
            )
            .await;

        let now = Utc::now();
        let pending = PendingOrder {
            order_id: intent_id.clone(),
            exchange_order_id: None,
            market: signal.market.clone(),
            side: OrderSide::Buy,
            order_type: request.order_type,
            order_price,
            order_quantity,
            order_amount_krw: order_amount,
            filled_quantity: 0.0,
            status: PendingStatus::Pending,
            strategy_code: signal.strategy_code,
            created_at: now,
            updated_at: now,
        };
        if let Err(e) = self.store.insert_pending(&pending).await {
            error!(order_id = %intent_id, error = %e, "pending order insert failed — aborting entry");
            return ExecutionOutcome::Failed(format!("pending insert failed: {e}"));
        }

        // 4. Submit (gateway retries transient failures internally).
        let response = match self.client.place_order(&request).await {
            Ok(r) => r,
            Err(e) => {
                return self
                    .fail_order(&intent_id, signal, OrderSide::Buy, &format!("place failed: {e}"))
                    .await;
            }
        };

        if let Err(e) = self
            .store
            .set_exchange_order_id(&intent_id, &response.order_id)
            .await
        {
            warn!(order_id = %intent_id, error = %e, "could not record exchange order id");
        }

        // 5. Type-specific confirmation.
        match request.order_type {
            OrderType::MarketBuyByPrice => {
                self.confirm_market_buy(&intent_id, signal, &response, notional_krw)
                    .await
            }
            _ => self.confirm_limit(&intent_id, signal, &response).await,
        }
    }

    /// Verify a market buy via a follow-up order query, check realized
    /// slippage against the signal price, and emit the fill.
    async fn confirm_market_buy(
        &self,
        intent_id: &str,
        signal: &Signal,
        response: &OrderResponse,
        notional_krw: f64,
    ) -> ExecutionOutcome {
        // Market orders settle near-instantly; one short poll round covers
        // exchange-side bookkeeping lag.
        let mut latest = response.clone();
        for _ in 0..3 {
            if latest.is_filled() && latest.executed_volume > 0.0 {
                break;
            }
            tokio::time::sleep(LIMIT_POLL_INTERVAL).await;
            match self.client.get_order(&response.order_id).await {
                Ok(Some(o)) => latest = o,
                Ok(None) => break,
                Err(e) => {
                    warn!(order_id = %response.order_id, error = %e, "market buy verification query failed");
                    break;
                }
            }
        }

        let quantity = latest.executed_volume;
        if quantity <= 0.0 {
            return self
                .fail_order(intent_id, signal, OrderSide::Buy, "market buy reported zero fill")
                .await;
        }

        let avg_price = latest.avg_price.unwrap_or_else(|| notional_krw / quantity);

        if signal.price > 0.0 {
            let slip = (avg_price - signal.price) / signal.price;
            if slip > SLIPPAGE_BLOCK {
                error!(
                    market = %signal.market,
                    expected = signal.price,
                    executed = avg_price,
                    slippage = format!("{:.3}%", slip * 100.0),
                    "market buy slippage above hard limit — operator attention required"
                );
            } else if slip > SLIPPAGE_WARN {
                warn!(
                    market = %signal.market,
                    slippage = format!("{:.3}%", slip * 100.0),
                    "market buy slippage above warning threshold"
                );
            }
        }

        self.finish_fill(intent_id, signal, OrderSide::Buy, avg_price, quantity)
            .await
    }

    /// Poll a limit order to resolution within the 5 s window.
    async fn confirm_limit(
        &self,
        intent_id: &str,
        signal: &Signal,
        response: &OrderResponse,
    ) -> ExecutionOutcome {
        let mut latest = response.clone();

        for _ in 0..LIMIT_POLL_ATTEMPTS {
            if latest.is_filled() {
                let price = latest.avg_price.or(latest.price).unwrap_or(signal.price);
                return self
                    .finish_fill(intent_id, signal, OrderSide::Buy, price, latest.executed_volume)
                    .await;
            }
            if latest.fill_ratio() >= PARTIAL_SUCCESS_RATIO && latest.executed_volume > 0.0 {
                // Near-complete fill counts as success.
                let price = latest.avg_price.or(latest.price).unwrap_or(signal.price);
                return self
                    .finish_fill(intent_id, signal, OrderSide::Buy, price, latest.executed_volume)
                    .await;
            }

            if latest.executed_volume > 0.0 {
                let _ = self
                    .store
                    .transition_pending(intent_id, PendingStatus::Partial, Some(latest.executed_volume))
                    .await;
            }

            tokio::time::sleep(LIMIT_POLL_INTERVAL).await;
            match self.client.get_order(&response.order_id).await {
                Ok(Some(o)) => latest = o,
                Ok(None) => break,
                Err(e) => {
                    warn!(order_id = %response.order_id, error = %e, "limit fill poll failed");
                }
            }
        }

        // Timeout: cancel what remains.
        self.telemetry
            .record(&LifecycleEvent::new(
                intent_id,
                &signal.market,
                OrderSide::Buy,
                EventType::CancelRequested,
                signal.strategy_code,
            ))
            .await;

        if let Err(e) = self.client.cancel_order(&response.order_id).await {
            match e {
                ExchangeError::OrderNotFound(_) => {
                    // Raced a final fill — re-query once and accept it.
                    if let Ok(Some(o)) = self.client.get_order(&response.order_id).await {
                        if o.is_filled() {
                            let price = o.avg_price.or(o.price).unwrap_or(signal.price);
                            return self
                                .finish_fill(intent_id, signal, OrderSide::Buy, price, o.executed_volume)
                                .await;
                        }
                    }
                }
                other => {
                    warn!(order_id = %response.order_id, error = %other, "limit cancel failed");
                }
            }
        }

        let filled = latest.executed_volume;
        if let Err(e) = self
            .store
            .transition_pending(intent_id, PendingStatus::Cancelled, Some(filled))
            .await
        {
            warn!(order_id = %intent_id, error = %e, "pending cancel transition failed");
        }
        self.telemetry
            .record(
                &LifecycleEvent::new(
                    intent_id,
                    &signal.market,
                    OrderSide::Buy,
                    EventType::Cancelled,
                    signal.strategy_code,
                )
                .with_message(format!("limit timeout, filled {filled}")),
            )
            .await;

        info!(
            order_id = %intent_id,
            market = %signal.market,
            filled,
            "limit order timed out and was cancelled"
        );
        ExecutionOutcome::Cancelled {
            order_id: intent_id.to_string(),
            filled_quantity: filled,
        }
    }

    // -------------------------------------------------------------------------
    // Sell exit
    // -------------------------------------------------------------------------

    /// Market-sell `quantity` for an exit. `price_hint` is the monitor's
    /// last observed price, used when the exchange omits an average.
    pub async fn execute_sell(
        &self,
        market: &str,
        strategy_code: StrategyCode,
        quantity: f64,
        price_hint: f64,
        reason: &str,
    ) -> ExecutionOutcome {
        if quantity <= 0.0 {
            return ExecutionOutcome::Rejected("sell quantity must be positive".to_string());
        }

        let intent_id = Uuid::new_v4().to_string();

        self.telemetry
            .record(
                &LifecycleEvent::new(&intent_id, market, OrderSide::Sell, EventType::SellRequested, strategy_code)
                    .with_message(reason.to_string()),
            )
            .await;

        let now = Utc::now();
        let pending = PendingOrder {
            order_id: intent_id.clone(),
            exchange_order_id: None,
            market: market.to_string(),
            side: OrderSide::Sell,
            order_type: OrderType::Market,
            order_price: None,
            order_quantity: Some(quantity),
            order_amount_krw: None,
            filled_quantity: 0.0,
            status: PendingStatus::Pending,
            strategy_code,
            created_at: now,
            updated_at: now,
        };
        if let Err(e) = self.store.insert_pending(&pending).await {
            error!(order_id = %intent_id, error = %e, "pending sell insert failed");
            return ExecutionOutcome::Failed(format!("pending insert failed: {e}"));
        }

        let request = OrderRequest {
            market: market.to_string(),
            side: OrderSide::Sell,
            order_type: OrderType::Market,
            price: None,
            volume: Some(quantity),
        };

        let response = match self.client.place_order(&request).await {
            Ok(r) => r,
            Err(e) => {
                let signal_like = Signal {
                    market: market.to_string(),
                    action: crate::types::SignalAction::Sell,
                    confidence: 0.0,
                    price: price_hint,
                    reason: reason.to_string(),
                    strategy_code,
                    regime: String::new(),
                };
                return self
                    .fail_order(&intent_id, &signal_like, OrderSide::Sell, &format!("sell failed: {e}"))
                    .await;
            }
        };

        if let Err(e) = self
            .store
            .set_exchange_order_id(&intent_id, &response.order_id)
            .await
        {
            warn!(order_id = %intent_id, error = %e, "could not record exchange order id");
        }

        // Verify the executed quantity.
        let mut latest = response.clone();
        for _ in 0..3 {
            if latest.is_filled() && latest.executed_volume > 0.0 {
                break;
            }
            tokio::time::sleep(LIMIT_POLL_INTERVAL).await;
            match self.client.get_order(&response.order_id).await {
                Ok(Some(o)) => latest = o,
                Ok(None) => break,
                Err(e) => {
                    warn!(order_id = %response.order_id, error = %e, "sell verification query failed");
                    break;
                }
            }
        }

        let executed = if latest.executed_volume > 0.0 { latest.executed_volume } else { quantity };
        let avg_price = latest.avg_price.unwrap_or(price_hint);

        if let Err(e) = self
            .store
            .transition_pending(&intent_id, PendingStatus::Filled, Some(executed))
            .await
        {
            warn!(order_id = %intent_id, error = %e, "pending sell fill transition failed");
        }
        self.telemetry
            .record(
                &LifecycleEvent::new(&intent_id, market, OrderSide::Sell, EventType::SellFilled, strategy_code)
                    .with_fill(avg_price, executed)
                    .with_message(reason.to_string()),
            )
            .await;

        info!(
            order_id = %intent_id,
            market,
            quantity = executed,
            avg_price,
            reason,
            "sell filled"
        );
        ExecutionOutcome::Filled {
            order_id: intent_id,
            avg_price,
            quantity: executed,
        }
    }

    // -------------------------------------------------------------------------
    // Shared terminal paths
    // -------------------------------------------------------------------------

    async fn finish_fill(
        &self,
        intent_id: &str,
        signal: &Signal,
        side: OrderSide,
        avg_price: f64,
        quantity: f64,
    ) -> ExecutionOutcome {
        if let Err(e) = self
            .store
            .transition_pending(intent_id, PendingStatus::Filled, Some(quantity))
            .await
        {
            warn!(order_id = %intent_id, error = %e, "pending fill transition failed");
        }

        let event_type = match side {
            OrderSide::Buy => EventType::BuyFilled,
            OrderSide::Sell => EventType::SellFilled,
        };
        self.telemetry
            .record(
                &LifecycleEvent::new(intent_id, &signal.market, side, event_type, signal.strategy_code)
                    .with_fill(avg_price, quantity),
            )
            .await;

        info!(
            order_id = %intent_id,
            market = %signal.market,
            side = %side,
            avg_price,
            quantity,
            "order filled"
        );
        ExecutionOutcome::Filled {
            order_id: intent_id.to_string(),
            avg_price,
            quantity,
        }
    }

    async fn fail_order(
        &self,
        intent_id: &str,
        signal: &Signal,
        side: OrderSide,
        reason: &str,
    ) -> ExecutionOutcome {
        if let Err(e) = self
            .store
            .transition_pending(intent_id, PendingStatus::Failed, None)
            .await
        {
            warn!(order_id = %intent_id, error = %e, "pending fail transition failed");
        }
        self.telemetry
            .record(
                &LifecycleEvent::new(intent_id, &signal.market, side, EventType::Failed, signal.strategy_code)
                    .with_message(reason.to_string()),
            )
            .await;

        warn!(order_id = %intent_id, market = %signal.market, reason, "order failed");
        ExecutionOutcome::Failed(reason.to_string())
    }
}

impl std::fmt::Debug for OrderExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrderExecutor").finish()
    }
}

// =============================================================================
// Policy helpers (pure)
// =============================================================================

/// Pick the order type for a BUY signal.
pub fn choose_order_type(signal: &Signal, book: Option<&Orderbook>, notional_krw: f64) -> OrderType {
    if signal.regime == "HIGH_VOLATILITY" {
        return OrderType::MarketBuyByPrice;
    }
    if signal.confidence >= MARKET_CONFIDENCE {
        return OrderType::MarketBuyByPrice;
    }
    if PREFER_MARKET.contains(&signal.strategy_code) {
        return OrderType::MarketBuyByPrice;
    }
    match book {
        Some(b) if b.visible_value() < notional_krw * THIN_BOOK_MULTIPLE => OrderType::MarketBuyByPrice,
        Some(_) => OrderType::Limit,
        // No book data: market order rather than a blind limit peg.
        None => OrderType::MarketBuyByPrice,
    }
}

/// Peg a buy limit just inside the best quote: a hair above the best bid,
/// never at or above the best ask.
pub fn peg_buy_price(book: Option<&Orderbook>, fallback: f64) -> f64 {
    let Some(book) = book else { return fallback };
    match (book.best_bid(), book.best_ask()) {
        (Some(bid), Some(ask)) if bid > 0.0 && ask > bid => {
            let pegged = bid * 1.0001;
            if pegged >= ask { bid } else { pegged }
        }
        (Some(bid), None) if bid > 0.0 => bid,
        _ => fallback,
    }
}

/// Estimated average slippage (fraction above the best ask) for a market buy
/// of `notional_krw`, walking the visible ask ladder. `None` when the book
/// cannot absorb the order.
pub fn estimated_buy_slippage(book: &Orderbook, notional_krw: f64) -> Option<f64> {
    let best_ask = book.best_ask()?;
    if best_ask <= 0.0 || notional_krw <= 0.0 {
        return None;
    }

    let mut remaining = notional_krw;
    let mut quantity_total = 0.0;
    for level in &book.asks {
        let level_value = level.price * level.quantity;
        if level_value >= remaining {
            quantity_total += remaining / level.price;
            remaining = 0.0;
            break;
        }
        quantity_total += level.quantity;
        remaining -= level_value;
    }

    if remaining > 0.0 || quantity_total <= 0.0 {
        return None; // book too thin to absorb the order
    }

    let avg_price = notional_krw / quantity_total;
    Some((avg_price - best_ask) / best_ask)
}

/// Whether a timeout-based exit may fire. Stop/target breaches are exempt
/// from the minimum-holding floor.
pub fn timeout_exit_allowed(holding_secs: i64) -> bool {
    holding_secs >= MIN_HOLDING_SECS
}
