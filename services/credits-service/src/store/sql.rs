//! SQL credit store over the sqlx `Any` driver (SQLite or Postgres).

use super::{CreditRecord, CreditStore};
use crate::error::{StoreError, StoreResult};
use crate::identity::Identity;
use async_trait::async_trait;
use sqlx::any::AnyRow;
use sqlx::{AnyPool, Row};
use tracing::{debug, error, info};

const CREATE_TABLE: &str = "CREATE TABLE IF NOT EXISTS user_credits (
    user_id TEXT NULL,
    ip_address TEXT NULL,
    credits_remaining BIGINT NOT NULL
)";
const CREATE_USER_INDEX: &str =
    "CREATE UNIQUE INDEX IF NOT EXISTS user_credits_user_id_idx ON user_credits (user_id)";
const CREATE_IP_INDEX: &str =
    "CREATE INDEX IF NOT EXISTS user_credits_ip_address_idx ON user_credits (ip_address)";

const SELECT_BY_USER: &str =
    "SELECT user_id, ip_address, credits_remaining FROM user_credits WHERE user_id = $1";
const SELECT_BY_IP: &str = "SELECT user_id, ip_address, credits_remaining FROM user_credits \
     WHERE ip_address = $1 AND user_id IS NULL";

const UPDATE_BY_USER: &str = "UPDATE user_credits SET credits_remaining = $1 WHERE user_id = $2";
const UPDATE_BY_IP: &str = "UPDATE user_credits SET credits_remaining = $1 \
     WHERE ip_address = $2 AND user_id IS NULL";

const INSERT_USER: &str =
    "INSERT INTO user_credits (user_id, ip_address, credits_remaining) VALUES ($1, NULL, $2)";
const INSERT_IP: &str =
    "INSERT INTO user_credits (user_id, ip_address, credits_remaining) VALUES (NULL, $1, $2)";

/// Credit store backed by a `user_credits` table.
#[derive(Debug, Clone)]
pub struct SqlCreditStore {
    pool: AnyPool,
}

impl SqlCreditStore {
    /// Create a store over an existing connection pool.
    #[must_use]
    pub const fn new(pool: AnyPool) -> Self {
        Self { pool }
    }

    /// Create the `user_credits` table and its indexes if they are missing.
    ///
    /// # Errors
    ///
    /// Returns error if any DDL statement fails.
    pub async fn migrate(&self) -> StoreResult<()> {
        for statement in [CREATE_TABLE, CREATE_USER_INDEX, CREATE_IP_INDEX] {
            sqlx::query(statement).execute(&self.pool).await.map_err(|e| {
                error!(error = %e, "Credit table migration failed");
                StoreError::from(e)
            })?;
        }
        info!("user_credits table ready");
        Ok(())
    }

    /// Key column value and the statements that address it.
    fn key_of(identity: &Identity) -> (String, &'static str, &'static str, &'static str) {
        match identity {
            Identity::Anonymous { ip } => (ip.to_string(), SELECT_BY_IP, UPDATE_BY_IP, INSERT_IP),
            Identity::Authenticated { user_id } => (
                user_id.as_str().to_string(),
                SELECT_BY_USER,
                UPDATE_BY_USER,
                INSERT_USER,
            ),
        }
    }

    fn row_to_record(row: &AnyRow) -> StoreResult<CreditRecord> {
        let user_id: Option<String> = row.try_get("user_id")?;
        let ip_address: Option<String> = row.try_get("ip_address")?;
        let raw: i64 = row.try_get("credits_remaining")?;
        let credits_remaining = u32::try_from(raw)
            .map_err(|_| StoreError::InvalidRecord(format!("credits_remaining = {raw}")))?;

        Ok(CreditRecord {
            user_id,
            ip_address,
            credits_remaining,
        })
    }
}

#[async_trait]
impl CreditStore for SqlCreditStore {
    async fn fetch(&self, identity: &Identity) -> StoreResult<Option<CreditRecord>> {
        let (key, select, _, _) = Self::key_of(identity);
        debug!(%identity, "Fetching credit record");

        let row = sqlx::query(select)
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| {
                error!(error = %e, %identity, "Credit record query failed");
                StoreError::from(e)
            })?;

        row.as_ref().map(Self::row_to_record).transpose()
    }

    async fn upsert(&self, record: &CreditRecord) -> StoreResult<()> {
        let identity = record.identity()?;
        let (key, _, update, insert) = Self::key_of(&identity);
        let remaining = i64::from(record.credits_remaining);
        debug!(%identity, remaining, "Writing credit record");

        let updated = sqlx::query(update)
            .bind(remaining)
            .bind(key.clone())
            .execute(&self.pool)
            .await
            .map_err(|e| {
                error!(error = %e, %identity, "Credit record update failed");
                StoreError::from(e)
            })?;

        if updated.rows_affected() == 0 {
            sqlx::query(insert)
                .bind(key)
                .bind(remaining)
                .execute(&self.pool)
                .await
                .map_err(|e| {
                    error!(error = %e, %identity, "Credit record insert failed");
                    StoreError::from(e)
                })?;
        }

        Ok(())
    }

    fn name(&self) -> &'static str {
        "sql"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::UserId;
    use sqlx::any::AnyPoolOptions;
    use std::net::{IpAddr, Ipv4Addr};

    async fn memory_store() -> SqlCreditStore {
        sqlx::any::install_default_drivers();
        let pool = AnyPoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .expect("sqlite pool");
        let store = SqlCreditStore::new(pool);
        store.migrate().await.expect("migrate");
        store
    }

    #[tokio::test]
    async fn test_migrate_is_idempotent() {
        let store = memory_store().await;
        store.migrate().await.unwrap();
    }

    #[tokio::test]
    async fn test_fetch_missing_record() {
        let store = memory_store().await;
        let identity = Identity::anonymous(IpAddr::V4(Ipv4Addr::LOCALHOST));
        assert!(store.fetch(&identity).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_upsert_inserts_then_updates() {
        let store = memory_store().await;
        let identity = Identity::authenticated(UserId::new("user-1").unwrap());

        store.upsert(&CreditRecord::new(&identity, 10)).await.unwrap();
        store.upsert(&CreditRecord::new(&identity, 9)).await.unwrap();

        let record = store.fetch(&identity).await.unwrap().unwrap();
        assert_eq!(record.credits_remaining, 9);
        assert_eq!(record.user_id.as_deref(), Some("user-1"));
        assert_eq!(record.ip_address, None);

        let count: i64 = sqlx::query("SELECT COUNT(*) AS n FROM user_credits")
            .fetch_one(&store.pool)
            .await
            .unwrap()
            .try_get("n")
            .unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn test_anonymous_and_user_rows_are_separate() {
        let store = memory_store().await;
        let anon = Identity::anonymous(IpAddr::V4(Ipv4Addr::new(198, 51, 100, 4)));
        let user = Identity::authenticated(UserId::new("user-1").unwrap());

        store.upsert(&CreditRecord::new(&anon, 2)).await.unwrap();
        store.upsert(&CreditRecord::new(&user, 10)).await.unwrap();
        store.upsert(&CreditRecord::new(&anon, 1)).await.unwrap();

        assert_eq!(store.fetch(&anon).await.unwrap().unwrap().credits_remaining, 1);
        assert_eq!(store.fetch(&user).await.unwrap().unwrap().credits_remaining, 10);
    }
}
