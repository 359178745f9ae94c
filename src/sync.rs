// =============================================================================
// Sync — reconcile database state against exchange balances
// =============================================================================
//
// Runs at startup (after a forced shutdown positions may still be OPEN) and
// on demand from the admin API. Three jobs:
//
//   (a) OPEN positions whose base-asset balance is gone are marked ABANDONED
//       (exit reason ABANDONED_NO_BALANCE, realized PnL zero).
//   (b) Balances with no matching position are adopted as MANUAL positions
//       at the current market price.
//   (c) Pending orders left unresolved are cancelled on the exchange and
//       their rows moved to a terminal status.
// =============================================================================

use anyhow::{Context, Result};
use chrono::Utc;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use tracing::{info, warn};

use crate::exchange::client::ExchangeClient;
use crate::exchange::error::ExchangeError;
use crate::execution::MIN_NOTIONAL_KRW;
use crate::store::position_store::{PendingStatus, Position, PositionStore};
use crate::types::StrategyCode;

/// Balances at or below this fraction of the recorded quantity count as gone.
const DUST_FRACTION: f64 = 0.0001;

/// What one reconciliation pass did.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SyncReport {
    pub positions_checked: u32,
    pub abandoned_no_balance: u32,
    pub abandoned_min_amount: u32,
    pub adopted: u32,
    pub orphan_orders_cancelled: u32,
    pub timestamp: String,
}

/// Verdict for one open position against its exchange balance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PositionVerdict {
    Keep,
    AbandonNoBalance,
    AbandonMinAmount,
}

/// Compare an open position with the on-exchange base balance.
pub fn classify_position(position: &Position, balance: f64) -> PositionVerdict {
    if balance <= position.remaining_quantity * DUST_FRACTION {
        return PositionVerdict::AbandonNoBalance;
    }
    if balance * position.entry_price < MIN_NOTIONAL_KRW {
        return PositionVerdict::AbandonMinAmount;
    }
    PositionVerdict::Keep
}

/// Base currency of a canonical `QUOTE-BASE` symbol.
pub fn base_currency(market: &str) -> Option<&str> {
    market.split('-').nth(1)
}

/// Run one full reconciliation pass.
pub async fn reconcile_once(
    client: &ExchangeClient,
    store: &PositionStore,
) -> Result<SyncReport> {
    let mut report = SyncReport {
        timestamp: Utc::now().to_rfc3339(),
        ..Default::default()
    };

    // -----------------------------------------------------------------
    // 1. Balances snapshot
    // -----------------------------------------------------------------
    let balances = client
        .get_balances()
        .await
        .map_err(|e| anyhow::anyhow!("sync: balance fetch failed: {e}"))?
        .context("sync: balance endpoint returned nothing")?;

    let balance_map: HashMap<String, f64> = balances
        .iter()
        .map(|b| (b.currency.clone(), b.available + b.locked))
        .collect();

    // -----------------------------------------------------------------
    // 2. Open positions vs balances
    // -----------------------------------------------------------------
    let open = store.open_positions().await?;
    let mut held_markets: HashSet<String> = HashSet::new();

    for position in &open {
        report.positions_checked += 1;
        held_markets.insert(position.market.clone());

        let balance = base_currency(&position.market)
            .and_then(|c| balance_map.get(c))
            .copied()
            .unwrap_or(0.0);

        match classify_position(position, balance) {
            PositionVerdict::Keep => {}
            PositionVerdict::AbandonNoBalance => {
                store.mark_abandoned(&position.id, "ABANDONED_NO_BALANCE").await?;
                report.abandoned_no_balance += 1;
            }
            PositionVerdict::AbandonMinAmount => {
                store.mark_abandoned(&position.id, "ABANDONED_MIN_AMOUNT").await?;
                report.abandoned_min_amount += 1;
            }
        }
    }

    // -----------------------------------------------------------------
    // 3. Adoption: unexpected balances become MANUAL positions
    // -----------------------------------------------------------------
    for balance in &balances {
        if balance.currency == "KRW" {
            continue;
        }
        let quantity = balance.available + balance.locked;
        if quantity <= 0.0 {
            continue;
        }

        let market = format!("KRW-{}", balance.currency);
        if held_markets.contains(&market) {
            continue;
        }
        if store
            .open_position_for_key(&market, StrategyCode::Manual)
            .await?
            .is_some()
        {
            continue;
        }

        let Ok(Some(ticker)) = client.get_ticker(&market).await else {
            // Unlisted or unreachable — nothing to adopt against.
            continue;
        };
        let price = ticker.trade_price;
        if price <= 0.0 || price * quantity < MIN_NOTIONAL_KRW {
            continue;
        }

        // Wide brackets: an adopted position is managed manually, never by
        // the automatic stop machinery.
        let adopted = store
            .open_position(crate::store::position_store::NewPosition {
                market: market.clone(),
                strategy_code: StrategyCode::Manual,
                entry_price: price,
                quantity,
                stop_loss: price * 0.5,
                take_profit: price * 10.0,
                entry_regime: "SIDEWAYS".to_string(),
                entry_confluence_score: 0.0,
            })
            .await;

        match adopted {
            Ok(position) => {
                info!(market = %market, quantity, price, id = %position.id, "balance adopted as MANUAL position");
                report.adopted += 1;
            }
            Err(e) => warn!(market = %market, error = %e, "adoption failed"),
        }
    }

    // -----------------------------------------------------------------
    // 4. Orphaned pending orders
    // -----------------------------------------------------------------
    for pending in store.unresolved_pending().await? {
        match &pending.exchange_order_id {
            Some(exchange_id) => {
                match client.cancel_order(exchange_id).await {
                    Ok(_) | Err(ExchangeError::OrderNotFound(_)) => {
                        store
                            .transition_pending(&pending.order_id, PendingStatus::Cancelled, None)
                            .await?;
                        report.orphan_orders_cancelled += 1;
                    }
                    Err(e) => {
                        warn!(order_id = %pending.order_id, error = %e, "orphan cancel failed");
                    }
                }
            }
            None => {
                // Never confirmed by the exchange — terminal locally.
                store
                    .transition_pending(&pending.order_id, PendingStatus::Failed, None)
                    .await?;
                report.orphan_orders_cancelled += 1;
            }
        }
    }

    info!(
        checked = report.positions_checked,
        abandoned_no_balance = report.abandoned_no_balance,
        abandoned_min_amount = report.abandoned_min_amount,
        adopted = report.adopted,
        orphans_cancelled = report.orphan_orders_cancelled,
        "reconciliation complete"
    );

    Ok(report)
}
