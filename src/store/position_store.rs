// =============================================================================
// Position Store — persistent positions and pending orders
// =============================================================================
//
// Uniquely owns the `positions` and `pending_orders` tables. The
// one-open-position-per-(market, strategy_code) invariant is enforced twice:
// an application-level check-then-insert (run under the coordinator's per-key
// mutex) and the partial unique index as the hard backstop.
//
// P&L convention: fees are deducted from the executed notional on both legs.
//   chunk_pnl           = (exit - entry) * qty - fee * (exit + entry) * qty
//   realized_pnl_percent = ((exit - entry) / entry - 2 * fee) * 100
// =============================================================================

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::Row;
use tracing::{info, warn};
use uuid::Uuid;

use crate::store::database::Database;
use crate::types::{OrderSide, OrderType, StrategyCode};

/// Quantities below this are treated as dust (fully consumed).
pub const QUANTITY_EPSILON: f64 = 1e-12;

// ---------------------------------------------------------------------------
// Status enums
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PositionStatus {
    PendingEntry,
    Open,
    Closing,
    Closed,
    Abandoned,
}

impl PositionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PendingEntry => "PENDING_ENTRY",
            Self::Open => "OPEN",
            Self::Closing => "CLOSING",
            Self::Closed => "CLOSED",
            Self::Abandoned => "ABANDONED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Closed | Self::Abandoned)
    }
}

impl std::str::FromStr for PositionStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING_ENTRY" => Ok(Self::PendingEntry),
            "OPEN" => Ok(Self::Open),
            "CLOSING" => Ok(Self::Closing),
            "CLOSED" => Ok(Self::Closed),
            "ABANDONED" => Ok(Self::Abandoned),
            other => Err(format!("unknown position status: {other}")),
        }
    }
}

impl std::fmt::Display for PositionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PendingStatus {
    Pending,
    Partial,
    Filled,
    Cancelled,
    Failed,
}

impl PendingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Partial => "PARTIAL",
            Self::Filled => "FILLED",
            Self::Cancelled => "CANCELLED",
            Self::Failed => "FAILED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Filled | Self::Cancelled | Self::Failed)
    }

    /// Transitions move monotonically toward a terminal status.
    pub fn can_transition_to(&self, next: PendingStatus) -> bool {
        match self {
            Self::Pending => next != Self::Pending,
            Self::Partial => matches!(next, Self::Partial | Self::Filled | Self::Cancelled | Self::Failed),
            _ => false, // resurrection after a terminal status is forbidden
        }
    }
}

impl std::str::FromStr for PendingStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(Self::Pending),
            "PARTIAL" => Ok(Self::Partial),
            "FILLED" => Ok(Self::Filled),
            "CANCELLED" => Ok(Self::Cancelled),
            "FAILED" => Ok(Self::Failed),
            other => Err(format!("unknown pending status: {other}")),
        }
    }
}

impl std::fmt::Display for PendingStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Domain rows
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub id: String,
    pub market: String,
    pub strategy_code: StrategyCode,
    pub entry_price: f64,
    pub entry_quantity: f64,
    pub remaining_quantity: f64,
    pub stop_loss: f64,
    pub take_profit: f64,
    pub trailing_active: bool,
    pub trailing_peak: Option<f64>,
    pub dca_count: u32,
    pub status: PositionStatus,
    pub entry_regime: String,
    pub entry_confluence_score: f64,
    pub half_take_profit_done: bool,
    pub realized_pnl: f64,
    pub realized_pnl_percent: Option<f64>,
    pub exit_price: Option<f64>,
    pub exit_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
}

impl Position {
    /// Seconds since the position row was created.
    pub fn holding_secs(&self) -> i64 {
        (Utc::now() - self.created_at).num_seconds()
    }

    /// Unrealized PnL percentage at `price`, before fees.
    pub fn unrealized_pnl_pct(&self, price: f64) -> f64 {
        if self.entry_price <= 0.0 {
            return 0.0;
        }
        (price - self.entry_price) / self.entry_price * 100.0
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingOrder {
    /// Client-generated intent id (primary key, lifecycle idempotence key).
    pub order_id: String,
    /// The exchange's uuid, known once the order is accepted.
    pub exchange_order_id: Option<String>,
    pub market: String,
    pub side: OrderSide,
    pub order_type: OrderType,
    pub order_price: Option<f64>,
    pub order_quantity: Option<f64>,
    pub order_amount_krw: Option<f64>,
    pub filled_quantity: f64,
    pub status: PendingStatus,
    pub strategy_code: StrategyCode,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Minimal view of a closed trade for the risk throttle.
#[derive(Debug, Clone)]
pub struct ClosedTrade {
    pub realized_pnl_percent: f64,
    pub closed_at: DateTime<Utc>,
}

/// Parameters for opening a new position.
#[derive(Debug, Clone)]
pub struct NewPosition {
    pub market: String,
    pub strategy_code: StrategyCode,
    pub entry_price: f64,
    pub quantity: f64,
    pub stop_loss: f64,
    pub take_profit: f64,
    pub entry_regime: String,
    pub entry_confluence_score: f64,
}

// ---------------------------------------------------------------------------
// P&L formulas (single source of truth)
// ---------------------------------------------------------------------------

/// PnL of selling `qty` at `exit` that was bought at `entry`, fees taken from
/// the executed notional on both legs.
pub fn chunk_pnl(entry: f64, exit: f64, qty: f64, fee_rate: f64) -> f64 {
    (exit - entry) * qty - fee_rate * (exit + entry) * qty
}

/// Round-trip percentage for a fully closed long.
pub fn round_trip_pnl_percent(entry: f64, exit: f64, fee_rate: f64) -> f64 {
    ((exit - entry) / entry - 2.0 * fee_rate) * 100.0
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct PositionStore {
    db: Database,
}

impl PositionStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    // -------------------------------------------------------------------------
    // Open
    // -------------------------------------------------------------------------

    /// Open a new position. The caller must hold the per-(market, strategy)
    /// mutex; the unique index is the backstop if it does not.
    pub async fn open_position(&self, new: NewPosition) -> Result<Position> {
        if new.quantity <= 0.0 || !new.quantity.is_finite() {
            bail!("position quantity must be positive, got {}", new.quantity);
        }
        if new.entry_price <= 0.0 {
            bail!("entry price must be positive, got {}", new.entry_price);
        }
        if !(new.stop_loss <= new.entry_price && new.entry_price <= new.take_profit) {
            bail!(
                "stop/target bracket violated: sl={} entry={} tp={}",
                new.stop_loss,
                new.entry_price,
                new.take_profit
            );
        }

        // Check-then-insert (the unique index catches races).
        if self
            .open_position_for_key(&new.market, new.strategy_code)
            .await?
            .is_some()
        {
            bail!(
                "open position already exists for ({}, {})",
                new.market,
                new.strategy_code
            );
        }

        let now = Utc::now();
        let position = Position {
            id: Uuid::new_v4().to_string(),
            market: new.market,
            strategy_code: new.strategy_code,
            entry_price: new.entry_price,
            entry_quantity: new.quantity,
            remaining_quantity: new.quantity,
            stop_loss: new.stop_loss,
            take_profit: new.take_profit,
            trailing_active: false,
            trailing_peak: None,
            dca_count: 0,
            status: PositionStatus::Open,
            entry_regime: new.entry_regime,
            entry_confluence_score: new.entry_confluence_score,
            half_take_profit_done: false,
            realized_pnl: 0.0,
            realized_pnl_percent: None,
            exit_price: None,
            exit_reason: None,
            created_at: now,
            updated_at: now,
            closed_at: None,
        };

        sqlx::query(
            r#"
            INSERT INTO positions (
                id, market, strategy_code, entry_price, entry_quantity,
                remaining_quantity, stop_loss, take_profit, trailing_active,
                trailing_peak, dca_count, status, entry_regime,
                entry_confluence_score, half_take_profit_done, realized_pnl,
                created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&position.id)
        .bind(&position.market)
        .bind(position.strategy_code.as_str())
        .bind(position.entry_price)
        .bind(position.entry_quantity)
        .bind(position.remaining_quantity)
        .bind(position.stop_loss)
        .bind(position.take_profit)
        .bind(position.trailing_active)
        .bind(position.trailing_peak)
        .bind(position.dca_count as i64)
        .bind(position.status.as_str())
        .bind(&position.entry_regime)
        .bind(position.entry_confluence_score)
        .bind(position.half_take_profit_done)
        .bind(position.realized_pnl)
        .bind(position.created_at.to_rfc3339())
        .bind(position.updated_at.to_rfc3339())
        .execute(&self.db.pool)
        .await
        .context("failed to insert position")?;

        info!(
            id = %position.id,
            market = %position.market,
            strategy = %position.strategy_code,
            entry_price = position.entry_price,
            quantity = position.entry_quantity,
            stop_loss = position.stop_loss,
            take_profit = position.take_profit,
            "position opened"
        );

        Ok(position)
    }

    // -------------------------------------------------------------------------
    // Queries
    // -------------------------------------------------------------------------

    pub async fn get(&self, id: &str) -> Result<Option<Position>> {
        let row = sqlx::query("SELECT * FROM positions WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.db.pool)
            .await?;
        row.map(|r| row_to_position(&r)).transpose()
    }

    pub async fn open_positions(&self) -> Result<Vec<Position>> {
        let rows = sqlx::query("SELECT * FROM positions WHERE status = 'OPEN' ORDER BY created_at")
            .fetch_all(&self.db.pool)
            .await?;
        rows.iter().map(row_to_position).collect()
    }

    pub async fn open_positions_for(&self, code: StrategyCode) -> Result<Vec<Position>> {
        let rows = sqlx::query(
            "SELECT * FROM positions WHERE status = 'OPEN' AND strategy_code = ? ORDER BY created_at",
        )
        .bind(code.as_str())
        .fetch_all(&self.db.pool)
        .await?;
        rows.iter().map(row_to_position).collect()
    }

    pub async fn open_position_for_key(
        &self,
        market: &str,
        code: StrategyCode,
    ) -> Result<Option<Position>> {
        let row = sqlx::query(
            "SELECT * FROM positions WHERE status = 'OPEN' AND market = ? AND strategy_code = ?",
        )
        .bind(market)
        .bind(code.as_str())
        .fetch_optional(&self.db.pool)
        .await?;
        row.map(|r| row_to_position(&r)).transpose()
    }

    /// Whether any strategy holds an open position on `market` (global
    /// exclusion mode).
    pub async fn any_open_for_market(&self, market: &str) -> Result<bool> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM positions WHERE status = 'OPEN' AND market = ?")
            .bind(market)
            .fetch_one(&self.db.pool)
            .await?;
        let n: i64 = row.try_get("n")?;
        Ok(n > 0)
    }

    /// The most recent `limit` closed trades for a key, newest first.
    pub async fn recent_closed_trades(
        &self,
        market: &str,
        code: StrategyCode,
        limit: u32,
    ) -> Result<Vec<ClosedTrade>> {
        let rows = sqlx::query(
            r#"
            SELECT realized_pnl_percent, closed_at FROM positions
            WHERE market = ? AND strategy_code = ? AND status = 'CLOSED'
              AND closed_at IS NOT NULL
            ORDER BY closed_at DESC LIMIT ?
            "#,
        )
        .bind(market)
        .bind(code.as_str())
        .bind(limit as i64)
        .fetch_all(&self.db.pool)
        .await?;

        rows.iter()
            .map(|r| {
                Ok(ClosedTrade {
                    realized_pnl_percent: r.try_get::<Option<f64>, _>("realized_pnl_percent")?.unwrap_or(0.0),
                    closed_at: parse_ts(r.try_get::<String, _>("closed_at")?)?,
                })
            })
            .collect()
    }

    /// All positions closed (or abandoned) at or after `cutoff`.
    pub async fn closed_since(&self, cutoff: DateTime<Utc>) -> Result<Vec<Position>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM positions
            WHERE status IN ('CLOSED', 'ABANDONED') AND closed_at >= ?
            ORDER BY closed_at
            "#,
        )
        .bind(cutoff.to_rfc3339())
        .fetch_all(&self.db.pool)
        .await?;
        rows.iter().map(row_to_position).collect()
    }

    // -------------------------------------------------------------------------
    // Mutations (caller holds the per-key mutex)
    // -------------------------------------------------------------------------

    /// Raise/lower the stop (and optionally the target) on an open position.
    pub async fn update_stops(&self, id: &str, stop_loss: f64, take_profit: Option<f64>) -> Result<()> {
        match take_profit {
            Some(tp) => {
                sqlx::query(
                    "UPDATE positions SET stop_loss = ?, take_profit = ?, updated_at = ? WHERE id = ?",
                )
                .bind(stop_loss)
                .bind(tp)
                .bind(Utc::now().to_rfc3339())
                .bind(id)
                .execute(&self.db.pool)
                .await?;
            }
            None => {
                sqlx::query("UPDATE positions SET stop_loss = ?, updated_at = ? WHERE id = ?")
                    .bind(stop_loss)
                    .bind(Utc::now().to_rfc3339())
                    .bind(id)
                    .execute(&self.db.pool)
                    .await?;
            }
        }
        Ok(())
    }

    /// Record trailing-stop activation and peak updates.
    pub async fn update_trailing(&self, id: &str, active: bool, peak: f64) -> Result<()> {
        sqlx::query(
            "UPDATE positions SET trailing_active = ?, trailing_peak = ?, updated_at = ? WHERE id = ?",
        )
        .bind(active)
        .bind(peak)
        .bind(Utc::now().to_rfc3339())
        .bind(id)
        .execute(&self.db.pool)
        .await?;
        Ok(())
    }

    /// Latch the once-per-position half take-profit flag.
    pub async fn mark_half_take_profit(&self, id: &str) -> Result<()> {
        sqlx::query("UPDATE positions SET half_take_profit_done = 1, updated_at = ? WHERE id = ?")
            .bind(Utc::now().to_rfc3339())
            .bind(id)
            .execute(&self.db.pool)
            .await?;
        Ok(())
    }

    /// Average an add-on buy into an open position: entry price becomes the
    /// volume-weighted average, quantities grow, `dca_count` increments, and
    /// the bracket is re-anchored by the caller-supplied stops.
    pub async fn apply_dca_fill(
        &self,
        id: &str,
        qty: f64,
        price: f64,
        new_stop_loss: f64,
        new_take_profit: f64,
    ) -> Result<Position> {
        let pos = self
            .get(id)
            .await?
            .with_context(|| format!("position {id} not found"))?;

        if pos.status != PositionStatus::Open {
            bail!("dca fill on non-open position {id} ({})", pos.status);
        }
        if qty <= 0.0 || price <= 0.0 {
            bail!("dca fill requires positive qty and price");
        }

        let total = pos.remaining_quantity + qty;
        let avg_entry = (pos.entry_price * pos.remaining_quantity + price * qty) / total;

        sqlx::query(
            r#"
            UPDATE positions
            SET entry_price = ?, entry_quantity = entry_quantity + ?,
                remaining_quantity = ?, stop_loss = ?, take_profit = ?,
                dca_count = dca_count + 1, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(avg_entry)
        .bind(qty)
        .bind(total)
        .bind(new_stop_loss)
        .bind(new_take_profit)
        .bind(Utc::now().to_rfc3339())
        .bind(id)
        .execute(&self.db.pool)
        .await?;

        info!(id, qty, price, avg_entry, "dca add-on applied");
        self.get(id).await?.context("position vanished after dca fill")
    }

    /// Sell `qty` of an open position at `price`. Accumulates realized PnL
    /// and reduces the remaining quantity; the position stays OPEN.
    pub async fn apply_partial_exit(
        &self,
        id: &str,
        qty: f64,
        price: f64,
        fee_rate: f64,
    ) -> Result<Position> {
        let pos = self
            .get(id)
            .await?
            .with_context(|| format!("position {id} not found"))?;

        if pos.status != PositionStatus::Open {
            bail!("partial exit on non-open position {id} ({})", pos.status);
        }
        if qty <= 0.0 || qty > pos.remaining_quantity + QUANTITY_EPSILON {
            bail!(
                "partial exit quantity {qty} invalid for remaining {}",
                pos.remaining_quantity
            );
        }

        let pnl = chunk_pnl(pos.entry_price, price, qty, fee_rate);
        let remaining = (pos.remaining_quantity - qty).max(0.0);

        sqlx::query(
            r#"
            UPDATE positions
            SET remaining_quantity = ?, realized_pnl = realized_pnl + ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(remaining)
        .bind(pnl)
        .bind(Utc::now().to_rfc3339())
        .bind(id)
        .execute(&self.db.pool)
        .await?;

        info!(
            id,
            sold_qty = qty,
            price,
            partial_pnl = pnl,
            remaining,
            "partial exit applied"
        );

        self.get(id).await?.context("position vanished after partial exit")
    }

    /// Fully close a position at `exit_price` with the given reason.
    pub async fn close_position(
        &self,
        id: &str,
        exit_price: f64,
        exit_reason: &str,
        fee_rate: f64,
    ) -> Result<Position> {
        let pos = self
            .get(id)
            .await?
            .with_context(|| format!("position {id} not found"))?;

        if pos.status.is_terminal() {
            bail!("position {id} already terminal ({})", pos.status);
        }

        let final_pnl = chunk_pnl(pos.entry_price, exit_price, pos.remaining_quantity, fee_rate);
        let pnl_percent = round_trip_pnl_percent(pos.entry_price, exit_price, fee_rate);
        let now = Utc::now().to_rfc3339();

        sqlx::query(
            r#"
            UPDATE positions
            SET remaining_quantity = 0, status = 'CLOSED',
                realized_pnl = realized_pnl + ?, realized_pnl_percent = ?,
                exit_price = ?, exit_reason = ?, updated_at = ?, closed_at = ?
            WHERE id = ?
            "#,
        )
        .bind(final_pnl)
        .bind(pnl_percent)
        .bind(exit_price)
        .bind(exit_reason)
        .bind(&now)
        .bind(&now)
        .bind(id)
        .execute(&self.db.pool)
        .await?;

        let closed = self.get(id).await?.context("position vanished after close")?;
        info!(
            id,
            market = %closed.market,
            strategy = %closed.strategy_code,
            exit_price,
            exit_reason,
            realized_pnl = closed.realized_pnl,
            realized_pnl_percent = pnl_percent,
            "position closed"
        );
        Ok(closed)
    }

    /// Terminal state for positions whose exchange balance is gone. PnL is
    /// recorded as zero; the sync routine owns this path.
    pub async fn mark_abandoned(&self, id: &str, reason: &str) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        sqlx::query(
            r#"
            UPDATE positions
            SET remaining_quantity = 0, status = 'ABANDONED', realized_pnl = 0,
                realized_pnl_percent = 0, exit_reason = ?, updated_at = ?, closed_at = ?
            WHERE id = ?
            "#,
        )
        .bind(reason)
        .bind(&now)
        .bind(&now)
        .bind(id)
        .execute(&self.db.pool)
        .await?;

        warn!(id, reason, "position abandoned");
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Pending orders
    // -------------------------------------------------------------------------

    pub async fn insert_pending(&self, order: &PendingOrder) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO pending_orders (
                order_id, exchange_order_id, market, side, order_type,
                order_price, order_quantity, order_amount_krw, filled_quantity,
                status, strategy_code, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&order.order_id)
        .bind(&order.exchange_order_id)
        .bind(&order.market)
        .bind(order.side.as_str())
        .bind(order.order_type.as_str())
        .bind(order.order_price)
        .bind(order.order_quantity)
        .bind(order.order_amount_krw)
        .bind(order.filled_quantity)
        .bind(order.status.as_str())
        .bind(order.strategy_code.as_str())
        .bind(order.created_at.to_rfc3339())
        .bind(order.updated_at.to_rfc3339())
        .execute(&self.db.pool)
        .await
        .context("failed to insert pending order")?;
        Ok(())
    }

    pub async fn get_pending(&self, order_id: &str) -> Result<Option<PendingOrder>> {
        let row = sqlx::query("SELECT * FROM pending_orders WHERE order_id = ?")
            .bind(order_id)
            .fetch_optional(&self.db.pool)
            .await?;
        row.map(|r| row_to_pending(&r)).transpose()
    }

    /// Record the exchange-assigned uuid once the order is accepted.
    pub async fn set_exchange_order_id(&self, order_id: &str, exchange_id: &str) -> Result<()> {
        sqlx::query(
            "UPDATE pending_orders SET exchange_order_id = ?, updated_at = ? WHERE order_id = ?",
        )
        .bind(exchange_id)
        .bind(Utc::now().to_rfc3339())
        .bind(order_id)
        .execute(&self.db.pool)
        .await?;
        Ok(())
    }

    /// Move a pending order toward a terminal status. Rejects transitions
    /// that would resurrect a FILLED/CANCELLED/FAILED order.
    pub async fn transition_pending(
        &self,
        order_id: &str,
        next: PendingStatus,
        filled_quantity: Option<f64>,
    ) -> Result<()> {
        let current = self
            .get_pending(order_id)
            .await?
            .with_context(|| format!("pending order {order_id} not found"))?;

        if !current.status.can_transition_to(next) {
            bail!(
                "illegal pending transition {} -> {} for {order_id}",
                current.status,
                next
            );
        }

        sqlx::query(
            "UPDATE pending_orders SET status = ?, filled_quantity = ?, updated_at = ? WHERE order_id = ?",
        )
        .bind(next.as_str())
        .bind(filled_quantity.unwrap_or(current.filled_quantity))
        .bind(Utc::now().to_rfc3339())
        .bind(order_id)
        .execute(&self.db.pool)
        .await?;
        Ok(())
    }

    /// Orders still awaiting resolution (PENDING or PARTIAL).
    pub async fn unresolved_pending(&self) -> Result<Vec<PendingOrder>> {
        let rows = sqlx::query(
            "SELECT * FROM pending_orders WHERE status IN ('PENDING', 'PARTIAL') ORDER BY created_at",
        )
        .fetch_all(&self.db.pool)
        .await?;
        rows.iter().map(row_to_pending).collect()
    }
}

// ---------------------------------------------------------------------------
// Row mapping
// ---------------------------------------------------------------------------

fn parse_ts(s: String) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&s)
        .map(|dt| dt.with_timezone(&Utc))
        .with_context(|| format!("bad timestamp in row: {s}"))
}

fn row_to_position(row: &sqlx::sqlite::SqliteRow) -> Result<Position> {
    let status: String = row.try_get("status")?;
    let code: String = row.try_get("strategy_code")?;
    let closed_at: Option<String> = row.try_get("closed_at")?;

    Ok(Position {
        id: row.try_get("id")?,
        market: row.try_get("market")?,
        strategy_code: code.parse().map_err(anyhow::Error::msg)?,
        entry_price: row.try_get("entry_price")?,
        entry_quantity: row.try_get("entry_quantity")?,
        remaining_quantity: row.try_get("remaining_quantity")?,
        stop_loss: row.try_get("stop_loss")?,
        take_profit: row.try_get("take_profit")?,
        trailing_active: row.try_get("trailing_active")?,
        trailing_peak: row.try_get("trailing_peak")?,
        dca_count: row.try_get::<i64, _>("dca_count")? as u32,
        status: status.parse().map_err(anyhow::Error::msg)?,
        entry_regime: row.try_get("entry_regime")?,
        entry_confluence_score: row.try_get("entry_confluence_score")?,
        half_take_profit_done: row.try_get("half_take_profit_done")?,
        realized_pnl: row.try_get("realized_pnl")?,
        realized_pnl_percent: row.try_get("realized_pnl_percent")?,
        exit_price: row.try_get("exit_price")?,
        exit_reason: row.try_get("exit_reason")?,
        created_at: parse_ts(row.try_get("created_at")?)?,
        updated_at: parse_ts(row.try_get("updated_at")?)?,
        closed_at: closed_at.map(parse_ts).transpose()?,
    })
}

fn row_to_pending(row: &sqlx::sqlite::SqliteRow) -> Result<PendingOrder> {
    let side: String = row.try_get("side")?;
    let order_type: String = row.try_get("order_type")?;
    let status: String = row.try_get("status")?;
    let code: String = row.try_get("strategy_code")?;

    Ok(PendingOrder {
        order_id: row.try_get("order_id")?,
        exchange_order_id: row.try_get("exchange_order_id")?,
        market: row.try_get("market")?,
        side: side.parse().map_err(anyhow::Error::msg)?,
        order_type: order_type.parse().map_err(anyhow::Error::msg)?,
        order_price: row.try_get("order_price")?,
        order_quantity: row.try_get("order_quantity")?,
        order_amount_krw: row.try_get("order_amount_krw")?,
        filled_quantity: row.try_get("filled_quantity")?,
        status: status.parse().map_err(anyhow::Error::msg)?,
        strategy_code: code.parse().map_err(anyhow::Error::msg)?,
        created_at: parse_ts(row.try_get("created_at")?)?,
        updated_at: parse_ts(row.try_get("updated_at")?)?,
    })
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    async fn store() -> PositionStore {
        PositionStore::new(Database::in_memory().await.unwrap())
    }

    fn new_position(market: &str, code: StrategyCode) -> NewPosition {
        NewPosition {
            market: market.to_string(),
            strategy_code: code,
            entry_price: 100.0,
            quantity: 1.0,
            stop_loss: 95.0,
            take_profit: 110.0,
            entry_regime: "BULL_TREND".to_string(),
            entry_confluence_score: 80.0,
        }
    }

    #[tokio::test]
    async fn open_and_fetch_roundtrip() {
        let store = store().await;
        let pos = store.open_position(new_position("KRW-BTC", StrategyCode::Dca)).await.unwrap();

        let fetched = store.get(&pos.id).await.unwrap().unwrap();
        assert_eq!(fetched.market, "KRW-BTC");
        assert_eq!(fetched.strategy_code, StrategyCode::Dca);
        assert_eq!(fetched.status, PositionStatus::Open);
        assert!((fetched.remaining_quantity - 1.0).abs() < 1e-12);
        assert!(!fetched.half_take_profit_done);
    }

    #[tokio::test]
    async fn one_open_per_key_enforced() {
        let store = store().await;
        store.open_position(new_position("KRW-BTC", StrategyCode::Dca)).await.unwrap();

        // Same key: rejected.
        assert!(store.open_position(new_position("KRW-BTC", StrategyCode::Dca)).await.is_err());
        // Same market, different strategy: allowed (per-key exclusion).
        store.open_position(new_position("KRW-BTC", StrategyCode::VolumeSurge)).await.unwrap();
        // Global check sees both.
        assert!(store.any_open_for_market("KRW-BTC").await.unwrap());
    }

    #[tokio::test]
    async fn bracket_invariant_checked_at_creation() {
        let store = store().await;
        let mut bad = new_position("KRW-ETH", StrategyCode::Breakout);
        bad.stop_loss = 105.0; // above entry
        assert!(store.open_position(bad).await.is_err());

        let mut bad_tp = new_position("KRW-ETH", StrategyCode::Breakout);
        bad_tp.take_profit = 99.0; // below entry
        assert!(store.open_position(bad_tp).await.is_err());

        let mut bad_qty = new_position("KRW-ETH", StrategyCode::Breakout);
        bad_qty.quantity = 0.0;
        assert!(store.open_position(bad_qty).await.is_err());
    }

    #[tokio::test]
    async fn close_computes_round_trip_pnl() {
        let store = store().await;
        let pos = store.open_position(new_position("KRW-BTC", StrategyCode::MemeScalper)).await.unwrap();

        let fee = 0.0004;
        let closed = store.close_position(&pos.id, 101.97, "TRAILING_STOP", fee).await.unwrap();

        assert_eq!(closed.status, PositionStatus::Closed);
        assert!(closed.remaining_quantity.abs() < 1e-12);
        assert_eq!(closed.exit_reason.as_deref(), Some("TRAILING_STOP"));

        // ((101.97 - 100)/100 - 2*0.0004) * 100 = 1.89
        let pct = closed.realized_pnl_percent.unwrap();
        assert!((pct - 1.89).abs() < 1e-6, "got {pct}");

        // Closing again must fail (terminal).
        assert!(store.close_position(&pos.id, 102.0, "MANUAL", fee).await.is_err());
    }

    #[tokio::test]
    async fn partial_exit_accumulates_pnl_and_keeps_open() {
        let store = store().await;
        let pos = store.open_position(new_position("KRW-BTC", StrategyCode::VolumeSurge)).await.unwrap();

        let fee = 0.0004;
        let after = store.apply_partial_exit(&pos.id, 0.5, 106.0, fee).await.unwrap();
        assert_eq!(after.status, PositionStatus::Open);
        assert!((after.remaining_quantity - 0.5).abs() < 1e-12);

        let expected = chunk_pnl(100.0, 106.0, 0.5, fee);
        assert!((after.realized_pnl - expected).abs() < 1e-9);

        // Selling more than remaining is an invariant violation.
        assert!(store.apply_partial_exit(&pos.id, 0.6, 106.0, fee).await.is_err());

        // Full close adds the remaining chunk on top.
        let closed = store.close_position(&pos.id, 106.0, "TAKE_PROFIT", fee).await.unwrap();
        let total = expected + chunk_pnl(100.0, 106.0, 0.5, fee);
        assert!((closed.realized_pnl - total).abs() < 1e-9);
    }

    #[tokio::test]
    async fn dca_fill_averages_entry_and_counts() {
        let store = store().await;
        let pos = store.open_position(new_position("KRW-BTC", StrategyCode::Dca)).await.unwrap();

        // Add 1.0 more at 90: average entry becomes 95.
        let after = store
            .apply_dca_fill(&pos.id, 1.0, 90.0, 90.25, 104.5)
            .await
            .unwrap();
        assert!((after.entry_price - 95.0).abs() < 1e-9);
        assert!((after.entry_quantity - 2.0).abs() < 1e-12);
        assert!((after.remaining_quantity - 2.0).abs() < 1e-12);
        assert_eq!(after.dca_count, 1);
        assert!((after.stop_loss - 90.25).abs() < 1e-12);
        assert!((after.take_profit - 104.5).abs() < 1e-12);

        // A closed position cannot receive add-ons.
        store.close_position(&pos.id, 96.0, "MANUAL", 0.0).await.unwrap();
        assert!(store.apply_dca_fill(&pos.id, 1.0, 90.0, 85.0, 110.0).await.is_err());
    }

    #[tokio::test]
    async fn abandoned_records_zero_pnl() {
        let store = store().await;
        let pos = store.open_position(new_position("KRW-XRP", StrategyCode::Dca)).await.unwrap();

        store.mark_abandoned(&pos.id, "ABANDONED_NO_BALANCE").await.unwrap();
        let after = store.get(&pos.id).await.unwrap().unwrap();
        assert_eq!(after.status, PositionStatus::Abandoned);
        assert!(after.remaining_quantity.abs() < 1e-12);
        assert!(after.realized_pnl.abs() < 1e-12);
        assert_eq!(after.exit_reason.as_deref(), Some("ABANDONED_NO_BALANCE"));

        // After abandonment the key is free again.
        store.open_position(new_position("KRW-XRP", StrategyCode::Dca)).await.unwrap();
    }

    #[tokio::test]
    async fn recent_closed_trades_ordering_and_limit() {
        let store = store().await;
        for i in 0..5 {
            let pos = store.open_position(new_position("KRW-BTC", StrategyCode::Dca)).await.unwrap();
            let exit = 100.0 + i as f64;
            store.close_position(&pos.id, exit, "TAKE_PROFIT", 0.0).await.unwrap();
        }

        let trades = store.recent_closed_trades("KRW-BTC", StrategyCode::Dca, 3).await.unwrap();
        assert_eq!(trades.len(), 3);
        // Newest first: last close had exit 104 => +4%.
        assert!((trades[0].realized_pnl_percent - 4.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn pending_transitions_are_monotone() {
        let store = store().await;
        let now = Utc::now();
        let order = PendingOrder {
            order_id: "ord-1".to_string(),
            exchange_order_id: None,
            market: "KRW-BTC".to_string(),
            side: OrderSide::Buy,
            order_type: OrderType::Limit,
            order_price: Some(100.0),
            order_quantity: Some(1.0),
            order_amount_krw: None,
            filled_quantity: 0.0,
            status: PendingStatus::Pending,
            strategy_code: StrategyCode::Dca,
            created_at: now,
            updated_at: now,
        };
        store.insert_pending(&order).await.unwrap();

        store.transition_pending("ord-1", PendingStatus::Partial, Some(0.4)).await.unwrap();
        store.transition_pending("ord-1", PendingStatus::Filled, Some(1.0)).await.unwrap();

        // Resurrection after a terminal status is forbidden.
        assert!(store.transition_pending("ord-1", PendingStatus::Pending, None).await.is_err());
        assert!(store.transition_pending("ord-1", PendingStatus::Partial, None).await.is_err());

        let final_state = store.get_pending("ord-1").await.unwrap().unwrap();
        assert_eq!(final_state.status, PendingStatus::Filled);
        assert!((final_state.filled_quantity - 1.0).abs() < 1e-12);
    }

    #[tokio::test]
    async fn unresolved_pending_lists_only_live_orders() {
        let store = store().await;
        let now = Utc::now();
        for (id, status) in [
            ("a", PendingStatus::Pending),
            ("b", PendingStatus::Partial),
            ("c", PendingStatus::Filled),
            ("d", PendingStatus::Cancelled),
        ] {
            let order = PendingOrder {
                order_id: id.to_string(),
                exchange_order_id: None,
                market: "KRW-BTC".to_string(),
                side: OrderSide::Buy,
                order_type: OrderType::Limit,
                order_price: Some(100.0),
                order_quantity: Some(1.0),
                order_amount_krw: None,
                filled_quantity: 0.0,
                status,
                strategy_code: StrategyCode::Dca,
                created_at: now,
                updated_at: now,
            };
            store.insert_pending(&order).await.unwrap();
        }

        let unresolved = store.unresolved_pending().await.unwrap();
        let ids: Vec<&str> = unresolved.iter().map(|o| o.order_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
    }
}
