//! Best-effort leader lease for the reconciler.
//!
//! Multiple stateless replicas may have the reconciler enabled; only the
//! one that wins the lease row at a given tick actually runs. The lease is
//! a single upsert guarded by expiry, so a crashed leader is replaced once
//! its lease lapses.

use std::time::Duration;

use anyhow::Context;
use sqlx::PgExecutor;
use tollgate_common::time::TimestampMs;

const LEASE_ID: &str = "reconciler";

/// Attempts to acquire (or steal an expired) lease. Returns whether this
/// holder is the leader for the next `ttl`.
pub async fn try_acquire(
    db: impl PgExecutor<'_>,
    holder: &str,
    now: TimestampMs,
    ttl: Duration,
) -> anyhow::Result<bool> {
    let expires_at = now.saturating_add(ttl);
    let result = sqlx::query(
        "INSERT INTO reconciler_lease (id, holder, expires_at) \
         VALUES ($1, $2, $3) \
         ON CONFLICT (id) DO UPDATE SET \
           holder = EXCLUDED.holder, \
           expires_at = EXCLUDED.expires_at \
         WHERE reconciler_lease.expires_at < $4",
    )
    .bind(LEASE_ID)
    .bind(holder)
    .bind(expires_at.as_i64())
    .bind(now.as_i64())
    .execute(db)
    .await
    .context("Could not acquire reconciler lease")?;

    Ok(result.rows_affected() == 1)
}
