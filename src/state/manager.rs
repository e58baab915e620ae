//! PostgreSQL swap store

use super::store::SwapStore;
use crate::config::DatabaseConfig;
use crate::coordination::{SwapId, SwapRecord};
use crate::error::SwapResult;

use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::Row;
use tracing::{debug, info};

/// Swap store backed by PostgreSQL
pub struct PgSwapStore {
    pool: PgPool,
}

impl PgSwapStore {
    /// Connect to the database
    pub async fn new(config: &DatabaseConfig) -> SwapResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .connect(&config.url)
            .await?;

        Ok(Self { pool })
    }

    /// Run database migrations
    pub async fn run_migrations(&self) -> SwapResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS swaps (
                id VARCHAR(66) PRIMARY KEY,
                role VARCHAR(20) NOT NULL,
                state VARCHAR(20) NOT NULL,
                active BOOLEAN NOT NULL,
                source_chain BIGINT NOT NULL,
                dest_chain BIGINT NOT NULL,
                hashlock VARCHAR(66) NOT NULL,
                record JSONB NOT NULL,
                created_at TIMESTAMPTZ NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_swaps_active
            ON swaps (active, created_at)
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS swap_transitions (
                swap_id VARCHAR(66) NOT NULL REFERENCES swaps (id),
                seq INTEGER NOT NULL,
                from_state VARCHAR(20) NOT NULL,
                to_state VARCHAR(20) NOT NULL,
                reason TEXT,
                at TIMESTAMPTZ NOT NULL,
                PRIMARY KEY (swap_id, seq)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        info!("Database migrations complete");
        Ok(())
    }

    /// Number of stored swaps per state
    pub async fn count_by_state(&self) -> SwapResult<Vec<(String, u64)>> {
        let rows = sqlx::query("SELECT state, COUNT(*) AS total FROM swaps GROUP BY state")
            .fetch_all(&self.pool)
            .await?;

        Ok(rows
            .into_iter()
            .map(|row| {
                (
                    row.get::<String, _>("state"),
                    row.get::<i64, _>("total") as u64,
                )
            })
            .collect())
    }
}

#[async_trait]
impl SwapStore for PgSwapStore {
    async fn save(&self, record: &SwapRecord) -> SwapResult<()> {
        let id = record.id.to_string();
        let body = serde_json::to_value(record)?;

        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO swaps
                (id, role, state, active, source_chain, dest_chain, hashlock, record,
                 created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (id)
            DO UPDATE SET state = $3, active = $4, record = $8, updated_at = $10
            "#,
        )
        .bind(&id)
        .bind(record.role.as_str())
        .bind(record.state.as_str())
        .bind(!record.is_terminal())
        .bind(record.source.chain_id as i64)
        .bind(record.dest.chain_id as i64)
        .bind(record.hashlock.to_string())
        .bind(&body)
        .bind(record.created_at)
        .bind(record.updated_at)
        .execute(&mut *tx)
        .await?;

        if let Some(last) = record.history.last() {
            sqlx::query(
                r#"
                INSERT INTO swap_transitions (swap_id, seq, from_state, to_state, reason, at)
                VALUES ($1, $2, $3, $4, $5, $6)
                ON CONFLICT (swap_id, seq) DO NOTHING
                "#,
            )
            .bind(&id)
            .bind((record.history.len() - 1) as i32)
            .bind(last.from.as_str())
            .bind(last.to.as_str())
            .bind(last.reason.as_deref())
            .bind(last.at)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;

        debug!("Saved swap {} in state {}", id, record.state);
        Ok(())
    }

    async fn load(&self, id: &SwapId) -> SwapResult<Option<SwapRecord>> {
        let row = sqlx::query("SELECT record FROM swaps WHERE id = $1")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => {
                let body: serde_json::Value = row.get("record");
                Ok(Some(serde_json::from_value(body)?))
            }
            None => Ok(None),
        }
    }

    async fn list_active(&self) -> SwapResult<Vec<SwapRecord>> {
        let rows = sqlx::query("SELECT record FROM swaps WHERE active ORDER BY created_at")
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter()
            .map(|row| -> SwapResult<SwapRecord> {
                let body: serde_json::Value = row.get("record");
                Ok(serde_json::from_value(body)?)
            })
            .collect()
    }

    async fn health_check(&self) -> SwapResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}
