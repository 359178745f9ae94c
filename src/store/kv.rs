// =============================================================================
// KeyValue store — counters and cached flags
// =============================================================================

use anyhow::Result;
use chrono::Utc;
use sqlx::Row;

use crate::store::database::Database;

#[derive(Clone)]
pub struct KvStore {
    db: Database,
}

impl KvStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub async fn set(&self, key: &str, value: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO key_value (k, v, updated_at) VALUES (?, ?, ?)
            ON CONFLICT(k) DO UPDATE SET v = excluded.v, updated_at = excluded.updated_at
            "#,
        )
        .bind(key)
        .bind(value)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.db.pool)
        .await?;
        Ok(())
    }

    pub async fn get(&self, key: &str) -> Result<Option<String>> {
        let row = sqlx::query("SELECT v FROM key_value WHERE k = ?")
            .bind(key)
            .fetch_optional(&self.db.pool)
            .await?;
        Ok(match row {
            Some(r) => Some(r.try_get("v")?),
            None => None,
        })
    }

    pub async fn get_i64(&self, key: &str) -> Result<Option<i64>> {
        Ok(self.get(key).await?.and_then(|v| v.parse().ok()))
    }

    pub async fn get_bool(&self, key: &str) -> Result<Option<bool>> {
        Ok(self.get(key).await?.and_then(|v| v.parse().ok()))
    }

    pub async fn set_bool(&self, key: &str, value: bool) -> Result<()> {
        self.set(key, if value { "true" } else { "false" }).await
    }

    /// Atomically increment a counter, returning the new value. Missing keys
    /// start at zero.
    pub async fn increment(&self, key: &str) -> Result<i64> {
        let next = self.get_i64(key).await?.unwrap_or(0) + 1;
        self.set(key, &next.to_string()).await?;
        Ok(next)
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_get_roundtrip() {
        let kv = KvStore::new(Database::in_memory().await.unwrap());
        assert!(kv.get("missing").await.unwrap().is_none());

        kv.set("name", "namsan").await.unwrap();
        assert_eq!(kv.get("name").await.unwrap().as_deref(), Some("namsan"));

        kv.set("name", "updated").await.unwrap();
        assert_eq!(kv.get("name").await.unwrap().as_deref(), Some("updated"));
    }

    #[tokio::test]
    async fn counters_increment_from_zero() {
        let kv = KvStore::new(Database::in_memory().await.unwrap());
        assert_eq!(kv.increment("deploy_count").await.unwrap(), 1);
        assert_eq!(kv.increment("deploy_count").await.unwrap(), 2);
        assert_eq!(kv.get_i64("deploy_count").await.unwrap(), Some(2));
    }

    #[tokio::test]
    async fn bool_flags() {
        let kv = KvStore::new(Database::in_memory().await.unwrap());
        kv.set_bool("reconciled", true).await.unwrap();
        assert_eq!(kv.get_bool("reconciled").await.unwrap(), Some(true));
    }
}
