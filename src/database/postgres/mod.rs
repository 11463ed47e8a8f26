//! Postgres repositories
//!
//! Queries are built at runtime with `sqlx::query_as` so the crate builds
//! without a live database. Id arrays are bound as `bigint[]`.

use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::time::Duration;
use tracing::info;

use crate::config::MailroomConfig;
use crate::error::{MailroomError, MailroomResult};

mod assets;
mod batches;
mod contacts;
mod fires;
mod groups;
mod incidents;
mod msgs;
mod sessions;

/// Repositories backed by the primary pool, with an optional read replica
#[derive(Debug, Clone)]
pub struct PgRepositories {
    pool: PgPool,
    readonly: Option<PgPool>,
}

impl PgRepositories {
    pub fn new(pool: PgPool, readonly: Option<PgPool>) -> Self {
        Self { pool, readonly }
    }

    /// Connect the primary pool and, when configured, the read replica
    pub async fn connect(config: &MailroomConfig) -> MailroomResult<Self> {
        let pool = connect_pool(&config.db, config.db_pool_size).await?;

        let readonly = match config.readonly_db.as_deref() {
            Some(url) => Some(connect_pool(url, config.db_pool_size).await?),
            None => None,
        };

        info!(
            pool_size = config.db_pool_size,
            readonly = readonly.is_some(),
            "Connected to Postgres"
        );
        Ok(Self::new(pool, readonly))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Pool for reads that tolerate replication lag
    pub(crate) fn reader(&self, read_only: bool) -> &PgPool {
        match (&self.readonly, read_only) {
            (Some(readonly), true) => readonly,
            _ => &self.pool,
        }
    }

    pub async fn health_check(&self) -> MailroomResult<()> {
        let one: i32 = sqlx::query_scalar("SELECT 1")
            .fetch_one(&self.pool)
            .await?;
        if one != 1 {
            return Err(MailroomError::DatabaseError("unexpected health check result".into()));
        }
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
        if let Some(readonly) = &self.readonly {
            readonly.close().await;
        }
    }
}

async fn connect_pool(url: &str, size: u32) -> MailroomResult<PgPool> {
    PgPoolOptions::new()
        .max_connections(size)
        .acquire_timeout(Duration::from_secs(10))
        .idle_timeout(Duration::from_secs(5 * 60))
        .connect(url)
        .await
        .map_err(|e| MailroomError::DatabaseError(format!("unable to connect: {e}")))
}

/// Raw ids for binding as `bigint[]`
pub(crate) fn raw_ids<T: Copy>(ids: &[T], id: impl Fn(T) -> i64) -> Vec<i64> {
    ids.iter().copied().map(id).collect()
}
