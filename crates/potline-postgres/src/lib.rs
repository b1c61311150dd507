//! PostgreSQL implementation of the potline [`Store`].
//!
//! # Database Schema
//!
//! ```sql
//! CREATE TABLE potline_batches (
//!     id UUID PRIMARY KEY,
//!     title TEXT NOT NULL,
//!     seed_type BIGINT NOT NULL,
//!     output_count BIGINT NOT NULL CHECK (output_count > 0),
//!     pots_done_count BIGINT NOT NULL DEFAULT 0
//!         CHECK (pots_done_count >= 0 AND pots_done_count <= output_count),
//!     status TEXT NOT NULL
//!         CHECK (status IN ('Ongoing', 'Paused', 'Finished', 'Cancelled')),
//!     created_at TIMESTAMPTZ NOT NULL,
//!     updated_at TIMESTAMPTZ NOT NULL
//! );
//!
//! CREATE INDEX idx_potline_batches_created ON potline_batches (created_at DESC);
//!
//! CREATE TABLE potline_machine_state (
//!     singleton_key TEXT PRIMARY KEY,
//!     soil_level SMALLINT NOT NULL CHECK (soil_level IN (0, 1)),
//!     cup_level SMALLINT NOT NULL CHECK (cup_level IN (0, 1)),
//!     active_batch_id UUID,
//!     created_at TIMESTAMPTZ NOT NULL,
//!     updated_at TIMESTAMPTZ NOT NULL
//! );
//! ```
//!
//! `active_batch_id` deliberately has no foreign key: it is a lookup key and
//! deleting a batch never cascades into the machine state.
//!
//! # Usage
//!
//! ```rust,ignore
//! use potline_postgres::PgStore;
//!
//! let store = PgStore::connect("postgres://localhost/potline", 5).await?;
//! store.migrate().await?;
//! let coordinator = Coordinator::new(Arc::new(store), notifier);
//! ```

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use potline::{Batch, BatchId, BatchStatus, MachineState, Store, SupplyLevel, MACHINE_STATE_KEY};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS potline_batches (
    id UUID PRIMARY KEY,
    title TEXT NOT NULL,
    seed_type BIGINT NOT NULL,
    output_count BIGINT NOT NULL CHECK (output_count > 0),
    pots_done_count BIGINT NOT NULL DEFAULT 0
        CHECK (pots_done_count >= 0 AND pots_done_count <= output_count),
    status TEXT NOT NULL
        CHECK (status IN ('Ongoing', 'Paused', 'Finished', 'Cancelled')),
    created_at TIMESTAMPTZ NOT NULL,
    updated_at TIMESTAMPTZ NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_potline_batches_created
    ON potline_batches (created_at DESC);

CREATE TABLE IF NOT EXISTS potline_machine_state (
    singleton_key TEXT PRIMARY KEY,
    soil_level SMALLINT NOT NULL CHECK (soil_level IN (0, 1)),
    cup_level SMALLINT NOT NULL CHECK (cup_level IN (0, 1)),
    active_batch_id UUID,
    created_at TIMESTAMPTZ NOT NULL,
    updated_at TIMESTAMPTZ NOT NULL
);
"#;

/// PostgreSQL store.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect a new pool.
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await
            .context("connecting to postgres")?;
        Ok(Self::new(pool))
    }

    /// Get the underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create the tables if they do not exist.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::raw_sql(SCHEMA)
            .execute(&self.pool)
            .await
            .context("creating potline tables")?;
        tracing::info!("Potline schema ready");
        Ok(())
    }
}

#[async_trait]
impl Store for PgStore {
    async fn load_machine_state(&self) -> Result<Option<MachineState>> {
        let row = sqlx::query(
            r#"
            SELECT singleton_key, soil_level, cup_level, active_batch_id, created_at, updated_at
            FROM potline_machine_state
            WHERE singleton_key = $1
            "#,
        )
        .bind(MACHINE_STATE_KEY)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(machine_state_from_row).transpose()
    }

    async fn save_machine_state(&self, state: &MachineState) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO potline_machine_state
                (singleton_key, soil_level, cup_level, active_batch_id, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (singleton_key) DO UPDATE
            SET soil_level = EXCLUDED.soil_level,
                cup_level = EXCLUDED.cup_level,
                active_batch_id = EXCLUDED.active_batch_id,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(MACHINE_STATE_KEY)
        .bind(level_to_db(state.soil_level))
        .bind(level_to_db(state.cup_level))
        .bind(state.active_batch_id)
        .bind(state.created_at)
        .bind(state.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn load_batch(&self, id: BatchId) -> Result<Option<Batch>> {
        let row = sqlx::query(
            r#"
            SELECT id, title, seed_type, output_count, pots_done_count, status,
                   created_at, updated_at
            FROM potline_batches
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(batch_from_row).transpose()
    }

    async fn save_batch(&self, batch: &Batch) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO potline_batches
                (id, title, seed_type, output_count, pots_done_count, status,
                 created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (id) DO UPDATE
            SET pots_done_count = EXCLUDED.pots_done_count,
                status = EXCLUDED.status,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(batch.id)
        .bind(&batch.title)
        .bind(i64::from(batch.seed_type))
        .bind(i64::from(batch.output_count))
        .bind(i64::from(batch.pots_done_count))
        .bind(batch.status.as_str())
        .bind(batch.created_at)
        .bind(batch.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn delete_batch(&self, id: BatchId) -> Result<bool> {
        let result = sqlx::query("DELETE FROM potline_batches WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn list_batches(&self) -> Result<Vec<Batch>> {
        let rows = sqlx::query(
            r#"
            SELECT id, title, seed_type, output_count, pots_done_count, status,
                   created_at, updated_at
            FROM potline_batches
            ORDER BY created_at DESC, id DESC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(batch_from_row).collect()
    }
}

fn batch_from_row(row: &PgRow) -> Result<Batch> {
    let status: String = row.try_get("status")?;
    Ok(Batch {
        id: row.try_get("id")?,
        title: row.try_get("title")?,
        seed_type: count_from_db(row.try_get("seed_type")?, "seed_type")?,
        output_count: count_from_db(row.try_get("output_count")?, "output_count")?,
        pots_done_count: count_from_db(row.try_get("pots_done_count")?, "pots_done_count")?,
        status: status.parse::<BatchStatus>().map_err(|e| anyhow!(e))?,
        created_at: row.try_get::<DateTime<Utc>, _>("created_at")?,
        updated_at: row.try_get::<DateTime<Utc>, _>("updated_at")?,
    })
}

fn machine_state_from_row(row: &PgRow) -> Result<MachineState> {
    Ok(MachineState {
        singleton_key: row.try_get("singleton_key")?,
        soil_level: level_from_db(row.try_get("soil_level")?)?,
        cup_level: level_from_db(row.try_get("cup_level")?)?,
        active_batch_id: row.try_get("active_batch_id")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn level_to_db(level: SupplyLevel) -> i16 {
    i16::from(u8::from(level))
}

fn level_from_db(value: i16) -> Result<SupplyLevel> {
    let byte = u8::try_from(value).map_err(|_| anyhow!("supply level out of range: {value}"))?;
    SupplyLevel::try_from(byte).map_err(|e| anyhow!(e))
}

fn count_from_db(value: i64, column: &str) -> Result<u32> {
    u32::try_from(value).map_err(|_| anyhow!("{column} out of range: {value}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use potline::NewBatch;

    #[test]
    fn levels_map_to_smallint() {
        assert_eq!(level_to_db(SupplyLevel::Low), 0);
        assert_eq!(level_to_db(SupplyLevel::Sufficient), 1);
        assert_eq!(level_from_db(1).unwrap(), SupplyLevel::Sufficient);
        assert!(level_from_db(2).is_err());
        assert!(level_from_db(-1).is_err());
    }

    #[test]
    fn counts_reject_out_of_range() {
        assert_eq!(count_from_db(7, "x").unwrap(), 7);
        assert!(count_from_db(-1, "x").is_err());
        assert!(count_from_db(i64::from(u32::MAX) + 1, "x").is_err());
    }

    /// Runs only when `POTLINE_TEST_DATABASE_URL` points at a scratch database.
    #[tokio::test]
    async fn round_trips_against_live_database() {
        let Ok(url) = std::env::var("POTLINE_TEST_DATABASE_URL") else {
            return;
        };
        let store = PgStore::connect(&url, 2).await.unwrap();
        store.migrate().await.unwrap();

        let batch = Batch::start(NewBatch::new("pg", 4, 3));
        store.save_batch(&batch).await.unwrap();
        let loaded = store.load_batch(batch.id).await.unwrap().unwrap();
        assert_eq!(loaded.id, batch.id);
        assert_eq!(loaded.status, BatchStatus::Ongoing);

        let mut state = MachineState::default();
        state.active_batch_id = Some(batch.id);
        store.save_machine_state(&state).await.unwrap();
        let loaded = store.load_machine_state().await.unwrap().unwrap();
        assert_eq!(loaded.active_batch_id, Some(batch.id));

        state.active_batch_id = None;
        store.save_machine_state(&state).await.unwrap();
        assert!(store.delete_batch(batch.id).await.unwrap());
        assert!(!store.delete_batch(batch.id).await.unwrap());
    }
}
