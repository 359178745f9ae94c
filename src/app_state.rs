// =============================================================================
// Central application state — ties every subsystem together
// =============================================================================
//
// The single hub handed to the API layer. Subsystems manage their own
// interior mutability; AppState only aggregates them and builds the
// dashboard snapshot.
// =============================================================================

use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use chrono::Utc;
use serde::Serialize;

use crate::risk::breaker::CircuitBreakerState;
use crate::store::kv::KvStore;
use crate::store::position_store::{PendingOrder, Position};
use crate::store::telemetry::{kst_day_start, DailySummary, TelemetryLog};
use crate::strategy::engine::{EngineStatus, SharedServices, StrategyEngine};
use crate::strategy::guided::GuidedQueue;
use crate::types::StrategyGroup;

pub struct AppState {
    pub services: SharedServices,
    pub engines: Vec<Arc<StrategyEngine>>,
    pub guided: Arc<GuidedQueue>,
    pub telemetry: TelemetryLog,
    pub kv: KvStore,
    pub start_time: Instant,
}

/// Aggregate statistics over the KST trading day.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TodayStats {
    pub closed_trades: usize,
    pub wins: usize,
    pub win_rate: f64,
    pub realized_pnl: f64,
}

/// Payload for the dashboard read endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct DashboardSnapshot {
    pub server_time: i64,
    pub uptime_secs: u64,
    pub trading_enabled: bool,
    pub degraded: bool,
    pub positions: Vec<Position>,
    pub today: TodayStats,
    pub open_orders: Vec<PendingOrder>,
    pub engines: Vec<EngineStatus>,
    pub circuit_breakers: Vec<CircuitBreakerState>,
    pub telemetry: Vec<(StrategyGroup, DailySummary)>,
    pub guided_pending: Vec<String>,
}

impl AppState {
    /// Build the full dashboard payload.
    pub async fn dashboard_snapshot(&self) -> Result<DashboardSnapshot> {
        let positions = self.services.store.open_positions().await?;
        let open_orders = self.services.store.unresolved_pending().await?;

        // Today's stats over [00:00 KST, now).
        let closed = self
            .services
            .store
            .closed_since(kst_day_start(Utc::now()))
            .await?;
        let wins = closed.iter().filter(|p| p.realized_pnl > 0.0).count();
        let today = TodayStats {
            closed_trades: closed.len(),
            wins,
            win_rate: if closed.is_empty() {
                0.0
            } else {
                wins as f64 / closed.len() as f64
            },
            realized_pnl: closed.iter().map(|p| p.realized_pnl).sum(),
        };

        let mut telemetry = Vec::new();
        for group in [
            StrategyGroup::Manual,
            StrategyGroup::Guided,
            StrategyGroup::AutopilotMcp,
            StrategyGroup::CoreEngine,
        ] {
            telemetry.push((group, self.telemetry.daily_summary(group).await?));
        }

        Ok(DashboardSnapshot {
            server_time: Utc::now().timestamp_millis(),
            uptime_secs: self.start_time.elapsed().as_secs(),
            trading_enabled: self.services.coordinator.is_enabled(),
            degraded: self.services.coordinator.is_degraded(),
            positions,
            today,
            open_orders,
            engines: self.engines.iter().map(|e| e.status()).collect(),
            circuit_breakers: self.services.breaker.snapshots(),
            telemetry,
            guided_pending: self.guided.pending(),
        })
    }
}
