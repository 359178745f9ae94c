// =============================================================================
// Coordinator — process-wide trading switches and per-key serialization
// =============================================================================
//
// Owns the "enabled" flag (operator-controlled), reads the gateway's
// degraded flag (set on fatal auth errors), hands out the per-
// (market, strategy) async mutexes that serialize entry/monitor/exit, and
// broadcasts the graceful-shutdown signal.
//
// Exclusion scope: `PerStrategy` allows different strategies to hold the same
// market simultaneously (the store's unique index still guards each key);
// `Global` blocks a market for everyone once any strategy is in.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{info, warn};

use crate::types::StrategyCode;

/// Scope of the one-open-position constraint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MarketExclusion {
    /// One open position per (market, strategy) — the default.
    PerStrategy,
    /// One open position per market across all strategies.
    Global,
}

impl Default for MarketExclusion {
    fn default() -> Self {
        Self::PerStrategy
    }
}

pub struct Coordinator {
    enabled: AtomicBool,
    degraded: Arc<AtomicBool>,
    exclusion: MarketExclusion,
    locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
    shutdown_tx: watch::Sender<bool>,
}

impl Coordinator {
    /// `degraded` is the flag owned by the exchange gateway.
    pub fn new(degraded: Arc<AtomicBool>, exclusion: MarketExclusion) -> Arc<Self> {
        let (shutdown_tx, _) = watch::channel(false);
        Arc::new(Self {
            enabled: AtomicBool::new(false),
            degraded,
            exclusion,
            locks: Mutex::new(HashMap::new()),
            shutdown_tx,
        })
    }

    // -------------------------------------------------------------------------
    // Switches
    // -------------------------------------------------------------------------

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
        info!(enabled, "trading enabled flag changed");
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::SeqCst)
    }

    /// Entries require the enabled flag on, a healthy gateway, and no
    /// shutdown in progress.
    pub fn trading_allowed(&self) -> bool {
        self.is_enabled() && !self.is_degraded() && !self.is_shutting_down()
    }

    pub fn exclusion(&self) -> MarketExclusion {
        self.exclusion
    }

    // -------------------------------------------------------------------------
    // Per-key serialization
    // -------------------------------------------------------------------------

    /// Acquire the mutex serializing all mutations for one
    /// (market, strategy) key. Guards must not be held across exchange calls
    /// that mutate exchange state during scans.
    pub async fn lock_key(&self, market: &str, code: StrategyCode) -> OwnedMutexGuard<()> {
        let mutex = {
            let mut locks = self.locks.lock();
            locks
                .entry(format!("{market}|{code}"))
                .or_insert_with(|| Arc::new(AsyncMutex::new(())))
                .clone()
        };
        mutex.lock_owned().await
    }

    // -------------------------------------------------------------------------
    // Shutdown
    // -------------------------------------------------------------------------

    /// Flip the shutdown signal. Idempotent.
    pub fn begin_shutdown(&self) {
        if !*self.shutdown_tx.borrow() {
            warn!("graceful shutdown initiated");
        }
        let _ = self.shutdown_tx.send(true);
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown_tx.borrow()
    }

    /// Subscribe to the shutdown signal (for scheduler loops).
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn coordinator() -> Arc<Coordinator> {
        Coordinator::new(Arc::new(AtomicBool::new(false)), MarketExclusion::PerStrategy)
    }

    #[test]
    fn starts_disabled() {
        let c = coordinator();
        assert!(!c.is_enabled());
        assert!(!c.trading_allowed());
        c.set_enabled(true);
        assert!(c.trading_allowed());
    }

    #[test]
    fn degraded_blocks_trading() {
        let degraded = Arc::new(AtomicBool::new(false));
        let c = Coordinator::new(degraded.clone(), MarketExclusion::PerStrategy);
        c.set_enabled(true);
        assert!(c.trading_allowed());

        degraded.store(true, Ordering::SeqCst);
        assert!(c.is_degraded());
        assert!(!c.trading_allowed());
    }

    #[test]
    fn shutdown_blocks_trading_and_signals() {
        let c = coordinator();
        c.set_enabled(true);
        let rx = c.shutdown_signal();
        assert!(!*rx.borrow());

        c.begin_shutdown();
        assert!(c.is_shutting_down());
        assert!(!c.trading_allowed());
        assert!(*rx.borrow());

        // Idempotent.
        c.begin_shutdown();
        assert!(c.is_shutting_down());
    }

    #[tokio::test]
    async fn key_mutex_serializes_same_key_only() {
        let c = coordinator();

        let guard = c.lock_key("KRW-BTC", StrategyCode::Dca).await;

        // The same key is blocked while the guard is held.
        let c2 = c.clone();
        let blocked = tokio::time::timeout(
            std::time::Duration::from_millis(50),
            c2.lock_key("KRW-BTC", StrategyCode::Dca),
        )
        .await;
        assert!(blocked.is_err(), "same key must be serialized");

        // A different strategy on the same market is independent.
        let _other = c.lock_key("KRW-BTC", StrategyCode::VolumeSurge).await;

        drop(guard);
        let _reacquired = c.lock_key("KRW-BTC", StrategyCode::Dca).await;
    }

    #[test]
    fn exclusion_mode_parses_from_config_labels() {
        let per: MarketExclusion = serde_json::from_str("\"per_strategy\"").unwrap();
        assert_eq!(per, MarketExclusion::PerStrategy);
        let global: MarketExclusion = serde_json::from_str("\"global\"").unwrap();
        assert_eq!(global, MarketExclusion::Global);
    }
}
