// =============================================================================
// Order Lifecycle Telemetry — append-only event log
// =============================================================================
//
// Every order transition is recorded exactly once, keyed by
// (order_id, event_type). Writes are best-effort: a telemetry failure is
// logged and swallowed so it can never break an execution path. Summaries
// are computed over the KST day window [today 00:00 Asia/Seoul, now).
// =============================================================================

use anyhow::Result;
use chrono::{DateTime, FixedOffset, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use sqlx::Row;
use tracing::{debug, warn};

use crate::store::database::Database;
use crate::types::{OrderSide, StrategyCode, StrategyGroup};

/// Seoul is UTC+9 with no DST.
const KST_OFFSET_SECS: i32 = 9 * 3600;

// ---------------------------------------------------------------------------
// Event model
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventType {
    BuyRequested,
    BuyFilled,
    SellRequested,
    SellFilled,
    CancelRequested,
    Cancelled,
    Failed,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BuyRequested => "BUY_REQUESTED",
            Self::BuyFilled => "BUY_FILLED",
            Self::SellRequested => "SELL_REQUESTED",
            Self::SellFilled => "SELL_FILLED",
            Self::CancelRequested => "CANCEL_REQUESTED",
            Self::Cancelled => "CANCELLED",
            Self::Failed => "FAILED",
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for EventType {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "BUY_REQUESTED" => Ok(Self::BuyRequested),
            "BUY_FILLED" => Ok(Self::BuyFilled),
            "SELL_REQUESTED" => Ok(Self::SellRequested),
            "SELL_FILLED" => Ok(Self::SellFilled),
            "CANCEL_REQUESTED" => Ok(Self::CancelRequested),
            "CANCELLED" => Ok(Self::Cancelled),
            "FAILED" => Ok(Self::Failed),
            other => Err(format!("unknown event type: {other}")),
        }
    }
}

/// One immutable lifecycle record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LifecycleEvent {
    pub order_id: String,
    pub market: String,
    pub side: OrderSide,
    pub event_type: EventType,
    pub strategy_group: StrategyGroup,
    pub strategy_code: StrategyCode,
    pub price: Option<f64>,
    pub quantity: Option<f64>,
    pub message: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl LifecycleEvent {
    pub fn new(
        order_id: impl Into<String>,
        market: impl Into<String>,
        side: OrderSide,
        event_type: EventType,
        strategy_code: StrategyCode,
    ) -> Self {
        Self {
            order_id: order_id.into(),
            market: market.into(),
            side,
            event_type,
            strategy_group: strategy_code.group(),
            strategy_code,
            price: None,
            quantity: None,
            message: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_fill(mut self, price: f64, quantity: f64) -> Self {
        self.price = Some(price);
        self.quantity = Some(quantity);
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

/// Per-group daily counters.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DailySummary {
    pub requested: u32,
    pub filled: u32,
    pub cancelled: u32,
    pub failed: u32,
    pub pending: u32,
}

// ---------------------------------------------------------------------------
// Log
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct TelemetryLog {
    db: Database,
}

impl TelemetryLog {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Record an event idempotently. Returns `true` when a new row was
    /// written, `false` when the (order_id, event_type) pair already existed.
    /// Failures never propagate.
    pub async fn record(&self, event: &LifecycleEvent) -> bool {
        match self.try_record(event).await {
            Ok(inserted) => inserted,
            Err(e) => {
                warn!(
                    order_id = %event.order_id,
                    event_type = %event.event_type,
                    error = %e,
                    "telemetry write failed (ignored)"
                );
                false
            }
        }
    }

    async fn try_record(&self, event: &LifecycleEvent) -> Result<bool> {
        // EXISTS guard first; the unique index is the concurrent backstop and
        // INSERT OR IGNORE keeps the race silent.
        let row = sqlx::query(
            "SELECT EXISTS(SELECT 1 FROM order_lifecycle_events WHERE order_id = ? AND event_type = ?) AS present",
        )
        .bind(&event.order_id)
        .bind(event.event_type.as_str())
        .fetch_one(&self.db.pool)
        .await?;
        let present: i64 = row.try_get("present")?;
        if present != 0 {
            debug!(
                order_id = %event.order_id,
                event_type = %event.event_type,
                "duplicate lifecycle event suppressed"
            );
            return Ok(false);
        }

        let result = sqlx::query(
            r#"
            INSERT OR IGNORE INTO order_lifecycle_events
                (order_id, market, side, event_type, strategy_group,
                 strategy_code, price, quantity, message, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&event.order_id)
        .bind(&event.market)
        .bind(event.side.as_str())
        .bind(event.event_type.as_str())
        .bind(event.strategy_group.as_str())
        .bind(event.strategy_code.as_str())
        .bind(event.price)
        .bind(event.quantity)
        .bind(&event.message)
        .bind(event.created_at.to_rfc3339())
        .execute(&self.db.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Events for one order, sorted by write time.
    pub async fn events_for_order(&self, order_id: &str) -> Result<Vec<LifecycleEvent>> {
        let rows = sqlx::query(
            "SELECT * FROM order_lifecycle_events WHERE order_id = ? ORDER BY created_at, id",
        )
        .bind(order_id)
        .fetch_all(&self.db.pool)
        .await?;
        rows.iter().map(row_to_event).collect()
    }

    /// Daily counters for one strategy group over [today 00:00 KST, now).
    pub async fn daily_summary(&self, group: StrategyGroup) -> Result<DailySummary> {
        self.summary_since(group, kst_day_start(Utc::now())).await
    }

    /// Counters for a group since an explicit cutoff (test seam).
    pub async fn summary_since(
        &self,
        group: StrategyGroup,
        cutoff: DateTime<Utc>,
    ) -> Result<DailySummary> {
        let rows = sqlx::query(
            r#"
            SELECT event_type, COUNT(*) AS n FROM order_lifecycle_events
            WHERE strategy_group = ? AND created_at >= ?
            GROUP BY event_type
            "#,
        )
        .bind(group.as_str())
        .bind(cutoff.to_rfc3339())
        .fetch_all(&self.db.pool)
        .await?;

        let mut summary = DailySummary::default();
        for row in rows {
            let event_type: String = row.try_get("event_type")?;
            let n: i64 = row.try_get("n")?;
            let n = n as u32;
            match event_type.as_str() {
                "BUY_REQUESTED" | "SELL_REQUESTED" => summary.requested += n,
                "BUY_FILLED" | "SELL_FILLED" => summary.filled += n,
                "CANCELLED" => summary.cancelled += n,
                "FAILED" => summary.failed += n,
                _ => {}
            }
        }
        summary.pending = summary
            .requested
            .saturating_sub(summary.filled + summary.cancelled + summary.failed);
        Ok(summary)
    }
}

/// 00:00 KST of the calendar day containing `now`, expressed in UTC.
pub fn kst_day_start(now: DateTime<Utc>) -> DateTime<Utc> {
    let kst = FixedOffset::east_opt(KST_OFFSET_SECS).expect("static offset");
    let local = now.with_timezone(&kst);
    let midnight = local
        .date_naive()
        .and_hms_opt(0, 0, 0)
        .expect("midnight exists");
    kst.from_local_datetime(&midnight)
        .single()
        .expect("unambiguous in fixed offset")
        .with_timezone(&Utc)
}

fn row_to_event(row: &sqlx::sqlite::SqliteRow) -> Result<LifecycleEvent> {
    let side: String = row.try_get("side")?;
    let event_type: String = row.try_get("event_type")?;
    let group: String = row.try_get("strategy_group")?;
    let code: String = row.try_get("strategy_code")?;
    let created_at: String = row.try_get("created_at")?;

    Ok(LifecycleEvent {
        order_id: row.try_get("order_id")?,
        market: row.try_get("market")?,
        side: side.parse().map_err(anyhow::Error::msg)?,
        event_type: event_type.parse().map_err(anyhow::Error::msg)?,
        strategy_group: group.parse().map_err(anyhow::Error::msg)?,
        strategy_code: code.parse().map_err(anyhow::Error::msg)?,
        price: row.try_get("price")?,
        quantity: row.try_get("quantity")?,
        message: row.try_get("message")?,
        created_at: DateTime::parse_from_rfc3339(&created_at)
            .map_err(anyhow::Error::msg)?
            .with_timezone(&Utc),
    })
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    async fn log() -> TelemetryLog {
        TelemetryLog::new(Database::in_memory().await.unwrap())
    }

    #[tokio::test]
    async fn replayed_fill_is_recorded_once() {
        let log = log().await;
        let event = LifecycleEvent::new("X", "KRW-BTC", OrderSide::Buy, EventType::BuyFilled, StrategyCode::Dca)
            .with_fill(100.0, 1.0);

        assert!(log.record(&event).await);
        assert!(!log.record(&event).await); // replay suppressed

        let events = log.events_for_order("X").await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, EventType::BuyFilled);
    }

    #[tokio::test]
    async fn requested_and_filled_pair_for_an_order() {
        let log = log().await;
        let requested =
            LifecycleEvent::new("ord", "KRW-BTC", OrderSide::Buy, EventType::BuyRequested, StrategyCode::VolumeSurge);
        let filled =
            LifecycleEvent::new("ord", "KRW-BTC", OrderSide::Buy, EventType::BuyFilled, StrategyCode::VolumeSurge)
                .with_fill(101.0, 0.5);

        assert!(log.record(&requested).await);
        assert!(log.record(&filled).await);

        let events = log.events_for_order("ord").await.unwrap();
        let requested_count = events.iter().filter(|e| e.event_type == EventType::BuyRequested).count();
        let filled_count = events.iter().filter(|e| e.event_type == EventType::BuyFilled).count();
        assert_eq!(requested_count, 1);
        assert_eq!(filled_count, 1);
    }

    #[tokio::test]
    async fn summary_counts_by_group() {
        let log = log().await;
        for (id, et) in [
            ("a", EventType::BuyRequested),
            ("a", EventType::BuyFilled),
            ("b", EventType::BuyRequested),
            ("b", EventType::Cancelled),
            ("c", EventType::SellRequested),
        ] {
            let e = LifecycleEvent::new(id, "KRW-BTC", OrderSide::Buy, et, StrategyCode::Dca);
            log.record(&e).await;
        }
        // A manual event must not leak into the CORE_ENGINE summary.
        let manual = LifecycleEvent::new("m", "KRW-BTC", OrderSide::Buy, EventType::BuyRequested, StrategyCode::Manual);
        log.record(&manual).await;

        let cutoff = Utc.with_ymd_and_hms(2000, 1, 1, 0, 0, 0).unwrap();
        let summary = log.summary_since(StrategyGroup::CoreEngine, cutoff).await.unwrap();
        assert_eq!(summary.requested, 3);
        assert_eq!(summary.filled, 1);
        assert_eq!(summary.cancelled, 1);
        assert_eq!(summary.failed, 0);
        assert_eq!(summary.pending, 1);

        let manual_summary = log.summary_since(StrategyGroup::Manual, cutoff).await.unwrap();
        assert_eq!(manual_summary.requested, 1);
    }

    #[test]
    fn kst_day_start_is_utc_minus_nine_hours() {
        // 2025-06-15 10:00 UTC is 19:00 KST; the KST day began at
        // 2025-06-15 00:00 KST = 2025-06-14 15:00 UTC.
        let now = Utc.with_ymd_and_hms(2025, 6, 15, 10, 0, 0).unwrap();
        let start = kst_day_start(now);
        assert_eq!(start, Utc.with_ymd_and_hms(2025, 6, 14, 15, 0, 0).unwrap());

        // 2025-06-15 20:00 UTC is already 05:00 KST on the 16th.
        let late = Utc.with_ymd_and_hms(2025, 6, 15, 20, 0, 0).unwrap();
        let start = kst_day_start(late);
        assert_eq!(start, Utc.with_ymd_and_hms(2025, 6, 15, 15, 0, 0).unwrap());
    }
}
