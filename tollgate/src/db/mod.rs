//! The persistence layer.
//!
//! [`Store`] wraps the Postgres pool and owns connection/transaction
//! lifecycle; the entity submodules expose typed accessors as free
//! functions taking an explicit executor, so the same accessor can run
//! against the pool or inside a caller-owned transaction.
//!
//! The database is the source of truth. Writers take row-level locks
//! (`FOR UPDATE`) on the record being mutated, and entitlement
//! recomputation serializes per (tenant, user) via a transaction-scoped
//! advisory lock.

use std::str::FromStr;

use anyhow::Context;
use sqlx::{
    postgres::{PgConnectOptions, PgPoolOptions},
    PgPool, Postgres, Transaction,
};

use crate::config::{Config, DB_ACQUIRE_TIMEOUT, DB_STATEMENT_TIMEOUT};

pub mod entitlements;
pub mod events;
pub mod grants;
pub mod lease;
pub mod models;
pub mod purchases;
pub mod subscriptions;
pub mod tenants;

#[derive(Clone)]
pub struct Store {
    pool: PgPool,
}

impl Store {
    /// Connects the pool and verifies connectivity with a ping.
    pub async fn connect(config: &Config) -> anyhow::Result<Self> {
        let statement_timeout_ms = DB_STATEMENT_TIMEOUT.as_millis().to_string();
        let connect_options = PgConnectOptions::from_str(&config.database_url)
            .context("Invalid DATABASE_URL")?
            .options([("statement_timeout", statement_timeout_ms.as_str())]);

        let pool = PgPoolOptions::new()
            .max_connections(config.db_max_connections)
            .acquire_timeout(DB_ACQUIRE_TIMEOUT)
            .connect_with(connect_options)
            .await
            .context("Could not connect to Postgres")?;

        let store = Self { pool };
        store.ping().await.context("Initial database ping failed")?;
        Ok(store)
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    #[inline]
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn begin(&self) -> anyhow::Result<Transaction<'static, Postgres>> {
        self.pool
            .begin()
            .await
            .context("Could not begin transaction")
    }

    /// Used by the `/ready` probe.
    pub async fn ping(&self) -> anyhow::Result<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .context("Database ping failed")?;
        Ok(())
    }
}
