// =============================================================================
// SQLite database wrapper — pool construction and schema init
// =============================================================================
//
// WAL journal mode for concurrent readers. Every table is created
// idempotently at startup; the partial unique index on open positions is the
// hard backstop for the one-open-position-per-key invariant, and the unique
// (order_id, event_type) index makes lifecycle writes idempotent.
// =============================================================================

use std::path::Path;
use std::str::FromStr;

use anyhow::{Context, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use tracing::info;

#[derive(Clone)]
pub struct Database {
    pub pool: SqlitePool,
}

impl Database {
    /// Open (or create) the database at `db_url` (e.g. `sqlite://data/bot.db`).
    pub async fn new(db_url: &str) -> Result<Self> {
        if let Some(path_part) = db_url.strip_prefix("sqlite://") {
            if let Some(parent) = Path::new(path_part).parent() {
                if !parent.as_os_str().is_empty() && !parent.exists() {
                    tokio::fs::create_dir_all(parent)
                        .await
                        .context("failed to create database directory")?;
                }
            }
        }

        let options = SqliteConnectOptions::from_str(db_url)?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .context("failed to connect to SQLite database")?;

        info!(url = db_url, "database connected");

        let db = Self { pool };
        db.init().await?;
        Ok(db)
    }

    /// Private in-memory database for tests (single connection so all
    /// queries see the same memory store).
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .context("failed to open in-memory database")?;

        let db = Self { pool };
        db.init().await?;
        Ok(db)
    }

    /// Create the schema if it does not exist yet.
    async fn init(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS positions (
                id TEXT PRIMARY KEY,
                market TEXT NOT NULL,
                strategy_code TEXT NOT NULL,
                entry_price REAL NOT NULL,
                entry_quantity REAL NOT NULL,
                remaining_quantity REAL NOT NULL,
                stop_loss REAL NOT NULL,
                take_profit REAL NOT NULL,
                trailing_active INTEGER NOT NULL DEFAULT 0,
                trailing_peak REAL,
                dca_count INTEGER NOT NULL DEFAULT 0,
                status TEXT NOT NULL,
                entry_regime TEXT NOT NULL,
                entry_confluence_score REAL NOT NULL,
                half_take_profit_done INTEGER NOT NULL DEFAULT 0,
                realized_pnl REAL NOT NULL DEFAULT 0,
                realized_pnl_percent REAL,
                exit_price REAL,
                exit_reason TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                closed_at TEXT
            );
            "#,
        )
        .execute(&self.pool)
        .await
        .context("failed to create positions table")?;

        sqlx::query(
            r#"
            CREATE UNIQUE INDEX IF NOT EXISTS idx_positions_open_key
            ON positions (market, strategy_code) WHERE status = 'OPEN';
            "#,
        )
        .execute(&self.pool)
        .await
        .context("failed to create open-position index")?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_positions_closed
            ON positions (market, strategy_code, closed_at);
            "#,
        )
        .execute(&self.pool)
        .await
        .context("failed to create closed-position index")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS pending_orders (
                order_id TEXT PRIMARY KEY,
                exchange_order_id TEXT,
                market TEXT NOT NULL,
                side TEXT NOT NULL,
                order_type TEXT NOT NULL,
                order_price REAL,
                order_quantity REAL,
                order_amount_krw REAL,
                filled_quantity REAL NOT NULL DEFAULT 0,
                status TEXT NOT NULL,
                strategy_code TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            "#,
        )
        .execute(&self.pool)
        .await
        .context("failed to create pending_orders table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS order_lifecycle_events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                order_id TEXT NOT NULL,
                market TEXT NOT NULL,
                side TEXT NOT NULL,
                event_type TEXT NOT NULL,
                strategy_group TEXT NOT NULL,
                strategy_code TEXT NOT NULL,
                price REAL,
                quantity REAL,
                message TEXT,
                created_at TEXT NOT NULL
            );
            "#,
        )
        .execute(&self.pool)
        .await
        .context("failed to create order_lifecycle_events table")?;

        sqlx::query(
            r#"
            CREATE UNIQUE INDEX IF NOT EXISTS idx_lifecycle_idempotent
            ON order_lifecycle_events (order_id, event_type);
            "#,
        )
        .execute(&self.pool)
        .await
        .context("failed to create lifecycle idempotence index")?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_lifecycle_created_at
            ON order_lifecycle_events (created_at);
            "#,
        )
        .execute(&self.pool)
        .await
        .context("failed to create lifecycle created_at index")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS key_value (
                k TEXT PRIMARY KEY,
                v TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            "#,
        )
        .execute(&self.pool)
        .await
        .context("failed to create key_value table")?;

        info!("database schema initialized");
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn schema_init_is_idempotent() {
        let db = Database::in_memory().await.unwrap();
        // Running init twice must not error.
        db.init().await.unwrap();
    }

    #[tokio::test]
    async fn open_position_index_rejects_duplicates() {
        let db = Database::in_memory().await.unwrap();

        let insert = |id: &str, status: &str| {
            let id = id.to_string();
            let status = status.to_string();
            let pool = db.pool.clone();
            async move {
                sqlx::query(
                    r#"
                    INSERT INTO positions (
                        id, market, strategy_code, entry_price, entry_quantity,
                        remaining_quantity, stop_loss, take_profit, status,
                        entry_regime, entry_confluence_score, created_at, updated_at
                    ) VALUES (?, 'KRW-BTC', 'DCA', 100.0, 1.0, 1.0, 95.0, 110.0, ?,
                              'SIDEWAYS', 60.0, '2025-01-01T00:00:00Z', '2025-01-01T00:00:00Z')
                    "#,
                )
                .bind(id)
                .bind(status)
                .execute(&pool)
                .await
            }
        };

        insert("a", "OPEN").await.unwrap();
        // Second OPEN for the same (market, strategy_code) violates the index.
        assert!(insert("b", "OPEN").await.is_err());
        // A CLOSED row for the same key is fine.
        insert("c", "CLOSED").await.unwrap();
    }

    #[tokio::test]
    async fn lifecycle_index_rejects_duplicate_events() {
        let db = Database::in_memory().await.unwrap();

        let insert = || {
            let pool = db.pool.clone();
            async move {
                sqlx::query(
                    r#"
                    INSERT INTO order_lifecycle_events
                        (order_id, market, side, event_type, strategy_group,
                         strategy_code, created_at)
                    VALUES ('ord-1', 'KRW-BTC', 'BUY', 'BUY_FILLED', 'CORE_ENGINE',
                            'DCA', '2025-01-01T00:00:00Z')
                    "#,
                )
                .execute(&pool)
                .await
            }
        };

        insert().await.unwrap();
        assert!(insert().await.is_err());
    }
}
