// =============================================================================
// Namsan Spot Engine — Main Entry Point
// =============================================================================
//
// The engine starts with trading DISABLED for safety. Operators enable it via
// the dashboard API (`POST /api/v1/control/enable`) or the NAMSAN_AUTOSTART
// environment variable.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod api;
mod app_state;
mod config;
mod confluence;
mod coordinator;
mod exchange;
mod execution;
mod indicators;
mod market_data;
mod position;
mod regime;
mod risk;
mod scheduler;
mod store;
mod strategy;
mod sync;
mod types;

use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::app_state::AppState;
use crate::config::EngineConfig;
use crate::coordinator::Coordinator;
use crate::exchange::client::ExchangeClient;
use crate::exchange::market_cache::MarketCache;
use crate::execution::OrderExecutor;
use crate::market_data::{ticker_feed, CandleCache, TickerFeed};
use crate::position::manager::PositionManager;
use crate::regime::hmm::HmmModel;
use crate::regime::RegimeDetector;
use crate::risk::breaker::{BreakerConfig, CircuitBreaker};
use crate::risk::throttle::RiskThrottle;
use crate::scheduler::Scheduler;
use crate::store::database::Database;
use crate::store::kv::KvStore;
use crate::store::position_store::PositionStore;
use crate::store::telemetry::TelemetryLog;
use crate::strategy::engine::{SharedServices, StrategyEngine};
use crate::strategy::{
    dca::DcaStrategy, guided::GuidedStrategy, mean_reversion::MeanReversionStrategy,
    meme_scalper::MemeScalperStrategy, volatility_survival::VolatilitySurvivalStrategy,
    volume_surge::VolumeSurgeStrategy, GuidedQueue, Strategy,
};
use crate::types::StrategyCode;

const CONFIG_PATH: &str = "engine_config.json";

/// Candle cache freshness: scan ticks within this window reuse the fetch.
const CANDLE_FRESHNESS: Duration = Duration::from_secs(30);

/// Grace period for in-flight tasks during shutdown.
const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("╔══════════════════════════════════════════════════════════╗");
    info!("║          Namsan Spot Engine — Starting Up               ║");
    info!("╚══════════════════════════════════════════════════════════╝");

    let engine_config = EngineConfig::load(CONFIG_PATH).unwrap_or_else(|e| {
        warn!(error = %e, "failed to load config, using defaults");
        EngineConfig::default()
    });
    let db_url = std::env::var("NAMSAN_DB_URL").unwrap_or_else(|_| engine_config.db_url.clone());

    // ── 2. Persistence ───────────────────────────────────────────────────
    let database = Database::new(&db_url).await?;
    let position_store = PositionStore::new(database.clone());
    let telemetry = TelemetryLog::new(database.clone());
    let kv = KvStore::new(database);

    let deploy_count = kv.increment("deploy_count").await.unwrap_or(0);
    info!(deploy_count, "persistence ready");

    // ── 3. Exchange gateway ──────────────────────────────────────────────
    let access_key = std::env::var("NAMSAN_ACCESS_KEY").unwrap_or_default();
    let secret_key = std::env::var("NAMSAN_SECRET_KEY").unwrap_or_default();
    if access_key.is_empty() || secret_key.is_empty() {
        warn!("exchange API keys not set — authenticated calls will fail");
    }
    let client = Arc::new(ExchangeClient::new(
        engine_config.gateway.base_url.clone(),
        access_key,
        secret_key,
    ));
    let market_cache = Arc::new(MarketCache::new(client.clone()));
    let candle_cache = Arc::new(CandleCache::new(CANDLE_FRESHNESS));
    let tickers = TickerFeed::new();

    // ── 4. Coordinator & risk ────────────────────────────────────────────
    let coordinator = Coordinator::new(client.degraded_flag(), engine_config.market_exclusion);
    if std::env::var("NAMSAN_AUTOSTART").map(|v| v == "1").unwrap_or(false) {
        warn!("NAMSAN_AUTOSTART set — trading enabled from boot");
        coordinator.set_enabled(true);
    }

    let throttle = Arc::new(RiskThrottle::with_thresholds(
        position_store.clone(),
        engine_config.throttle,
    ));
    let breaker = Arc::new(CircuitBreaker::new());
    for code in [
        StrategyCode::Dca,
        StrategyCode::MeanReversion,
        StrategyCode::VolumeSurge,
        StrategyCode::MemeScalper,
        StrategyCode::VolatilitySurvival,
        StrategyCode::Guided,
    ] {
        let s_cfg = engine_config.strategy(code);
        breaker.register(
            code,
            BreakerConfig {
                max_consecutive_losses: s_cfg.max_consecutive_losses,
                daily_max_loss_krw: s_cfg.daily_max_loss_krw,
            },
        );
    }

    // ── 5. Execution & position management ───────────────────────────────
    let executor = Arc::new(OrderExecutor::new(
        client.clone(),
        position_store.clone(),
        telemetry.clone(),
    ));
    let detector = Arc::new(RegimeDetector::new());
    let manager = Arc::new(PositionManager::new(
        client.clone(),
        position_store.clone(),
        executor.clone(),
        breaker.clone(),
        coordinator.clone(),
        candle_cache.clone(),
        tickers.clone(),
        detector.clone(),
        engine_config.fee_rate,
    ));

    // ── 6. Startup reconciliation ────────────────────────────────────────
    match sync::reconcile_once(&client, &position_store).await {
        Ok(report) => info!(
            abandoned = report.abandoned_no_balance + report.abandoned_min_amount,
            adopted = report.adopted,
            orphans = report.orphan_orders_cancelled,
            "startup reconciliation complete"
        ),
        Err(e) => warn!(error = %e, "startup reconciliation failed — continuing"),
    }

    // ── 7. Optional HMM overlay ──────────────────────────────────────────
    if std::env::var("NAMSAN_USE_HMM").map(|v| v == "1").unwrap_or(false) {
        let hmm_client = client.clone();
        let hmm_detector = detector.clone();
        tokio::spawn(async move {
            match hmm_client.get_candles("KRW-BTC", "5m", 200).await {
                Ok(Some(candles)) if candles.len() >= regime::hmm::MIN_TRAIN_CANDLES => {
                    let mut model = HmmModel::seeded();
                    match model.train(&candles, 10) {
                        Some(ll) => {
                            info!(log_likelihood = format!("{ll:.2}"), "HMM trained and installed");
                            hmm_detector.set_hmm(model);
                        }
                        None => warn!("HMM training skipped (insufficient observations)"),
                    }
                }
                _ => {
                    info!("HMM training data unavailable — installing seeded model");
                    hmm_detector.set_hmm(HmmModel::seeded());
                }
            }
        });
    }

    // ── 8. WebSocket ticker feed ─────────────────────────────────────────
    {
        let feed = tickers.clone();
        let markets = market_cache.clone();
        let ws_url = engine_config.gateway.ws_url.clone();
        let mut shutdown = coordinator.shutdown_signal();
        tokio::spawn(async move {
            loop {
                if *shutdown.borrow() {
                    break;
                }
                let codes: Vec<String> = match markets.tradable_krw_markets().await {
                    Ok(list) => list.into_iter().map(|m| m.market).collect(),
                    Err(e) => {
                        warn!(error = %e, "market list unavailable for ticker feed");
                        Vec::new()
                    }
                };
                if !codes.is_empty() {
                    if let Err(e) = ticker_feed::run_ticker_stream(&ws_url, &codes, &feed).await {
                        warn!(error = %e, "ticker stream error — reconnecting");
                    }
                }
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_secs(ticker_feed::RECONNECT_DELAY_SECS)) => {}
                    _ = shutdown.changed() => {}
                }
            }
        });
    }

    // ── 9. Strategy engines ──────────────────────────────────────────────
    let config_handle = Arc::new(RwLock::new(Arc::new(engine_config)));
    let guided_queue = GuidedQueue::new();

    let services = SharedServices {
        client: client.clone(),
        markets: market_cache,
        candles: candle_cache,
        tickers,
        detector,
        throttle: throttle.clone(),
        breaker: breaker.clone(),
        executor,
        store: position_store.clone(),
        coordinator: coordinator.clone(),
        manager: manager.clone(),
        config: config_handle.clone(),
    };

    let strategies: Vec<Arc<dyn Strategy>> = vec![
        Arc::new(DcaStrategy),
        Arc::new(MeanReversionStrategy),
        Arc::new(VolumeSurgeStrategy),
        Arc::new(MemeScalperStrategy),
        Arc::new(VolatilitySurvivalStrategy),
        Arc::new(GuidedStrategy::new(guided_queue.clone())),
    ];

    let engines: Vec<Arc<StrategyEngine>> = strategies
        .into_iter()
        .map(|s| StrategyEngine::new(s, services.clone()))
        .collect();

    // ── 10. Scheduler ────────────────────────────────────────────────────
    let scheduler = Arc::new(Scheduler::new(coordinator.shutdown_signal()));
    {
        let config = config_handle.read().clone();
        for engine in &engines {
            let s_cfg = config.strategy(engine.code());

            let scan_engine = engine.clone();
            scheduler.register(
                format!("{}-scan", engine.code()),
                Duration::from_millis(s_cfg.scan_interval_ms),
                move || {
                    let engine = scan_engine.clone();
                    async move { engine.scan_tick().await }
                },
            );

            let monitor_engine = engine.clone();
            scheduler.register(
                format!("{}-monitor", engine.code()),
                Duration::from_millis(s_cfg.monitor_interval_ms),
                move || {
                    let engine = monitor_engine.clone();
                    async move { engine.monitor_tick().await }
                },
            );
        }
    }
    info!(tasks = scheduler.task_count(), "scheduler loops registered");

    // ── 11. API server ───────────────────────────────────────────────────
    let app_state = Arc::new(AppState {
        services,
        engines,
        guided: guided_queue,
        telemetry,
        kv,
        start_time: std::time::Instant::now(),
    });

    let bind_addr = std::env::var("NAMSAN_BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:3100".into());
    {
        let api_state = app_state.clone();
        let addr = bind_addr.clone();
        tokio::spawn(async move {
            let app = api::rest::router(api_state);
            let listener = tokio::net::TcpListener::bind(&addr)
                .await
                .expect("failed to bind API server");
            info!(addr = %addr, "API server listening");
            axum::serve(listener, app).await.expect("API server failed");
        });
    }

    info!("all subsystems running — press Ctrl+C to stop");

    // ── 12. Graceful shutdown ────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("shutdown signal received — stopping gracefully");

    coordinator.begin_shutdown();
    scheduler.join_all(SHUTDOWN_DEADLINE).await;

    // Cancel any limit orders still resting on the exchange.
    match position_store.unresolved_pending().await {
        Ok(pending) => {
            for order in pending {
                if let Some(exchange_id) = &order.exchange_order_id {
                    match client.cancel_order(exchange_id).await {
                        Ok(_) => info!(order_id = %order.order_id, "pending order cancelled on shutdown"),
                        Err(e) => {
                            warn!(order_id = %order.order_id, error = %e, "shutdown cancel failed")
                        }
                    }
                }
                if let Err(e) = position_store
                    .transition_pending(&order.order_id, store::position_store::PendingStatus::Cancelled, None)
                    .await
                {
                    warn!(order_id = %order.order_id, error = %e, "pending shutdown transition failed");
                }
            }
        }
        Err(e) => error!(error = %e, "could not list pending orders on shutdown"),
    }

    // Persist a final config snapshot.
    let final_config = config_handle.read().clone();
    if let Err(e) = final_config.save(CONFIG_PATH) {
        error!(error = %e, "failed to save config on shutdown");
    }

    info!("Namsan Spot Engine shut down complete.");
    Ok(())
}
