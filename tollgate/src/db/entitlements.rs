//! Accessors for materialized entitlement rows.
//!
//! Entitlements are created, replaced, and deleted only by the
//! recomputation path: inside one transaction, the existing rows for
//! (tenant, user) are deleted and the new set is inserted. A
//! transaction-scoped advisory lock on the pair guarantees that two
//! concurrent recomputations cannot interleave their deletes and inserts.

use anyhow::Context;
use sqlx::PgExecutor;
use tollgate_common::{
    ids::{TenantId, UserId},
    time::TimestampMs,
};

use super::{models::Entitlement, models::EntitlementRow, Store};

/// Derives the advisory lock key for a (tenant, user) pair: the first 8
/// bytes of SHA-256 over `"{tenant}\0{user}"`. The NUL separator keeps
/// distinct pairs from colliding by concatenation.
pub(crate) fn pair_lock_key(tenant_id: &TenantId, user_id: &UserId) -> i64 {
    let digest = ring::digest::digest(
        &ring::digest::SHA256,
        format!("{tenant_id}\0{user_id}").as_bytes(),
    );
    let bytes = <[u8; 8]>::try_from(&digest.as_ref()[..8])
        .expect("SHA-256 digests are 32 bytes");
    i64::from_be_bytes(bytes)
}

/// Replaces the materialized entitlements for (tenant, user) with `rows`
/// in one transaction. The replace-in-place strategy guarantees that
/// deletions (refund, cancellation, revocation) are reflected without any
/// separate "clear" events.
pub async fn replace_for_user(
    store: &Store,
    tenant_id: &TenantId,
    user_id: &UserId,
    rows: &[Entitlement],
    computed_at: TimestampMs,
) -> anyhow::Result<()> {
    let mut tx = store.begin().await?;

    sqlx::query("SELECT pg_advisory_xact_lock($1)")
        .bind(pair_lock_key(tenant_id, user_id))
        .execute(&mut *tx)
        .await
        .context("Could not take pair advisory lock")?;

    sqlx::query("DELETE FROM entitlements WHERE tenant_id = $1 AND user_id = $2")
        .bind(tenant_id.as_str())
        .bind(user_id.as_str())
        .execute(&mut *tx)
        .await
        .context("Could not delete stale entitlements")?;

    for row in rows {
        sqlx::query(
            "INSERT INTO entitlements \
               (tenant_id, user_id, feature_code, source, source_ref, \
                valid_from, valid_to, computed_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
        )
        .bind(row.tenant_id.as_str())
        .bind(row.user_id.as_str())
        .bind(row.feature_code.as_str())
        .bind(row.source.as_str())
        .bind(&row.source_ref)
        .bind(row.valid_from.as_i64())
        .bind(row.valid_to.map(|ts| ts.as_i64()))
        .bind(computed_at.as_i64())
        .execute(&mut *tx)
        .await
        .context("Could not insert entitlement")?;
    }

    tx.commit()
        .await
        .context("Could not commit entitlement replacement")?;
    Ok(())
}

/// Loads the materialized entitlement rows for (tenant, user).
pub async fn for_user(
    db: impl PgExecutor<'_>,
    tenant_id: &TenantId,
    user_id: &UserId,
) -> anyhow::Result<Vec<Entitlement>> {
    let rows = sqlx::query_as::<_, EntitlementRow>(
        "SELECT tenant_id, user_id, feature_code, source, source_ref, \
                valid_from, valid_to, computed_at \
         FROM entitlements \
         WHERE tenant_id = $1 AND user_id = $2 \
         ORDER BY feature_code, source, source_ref",
    )
    .bind(tenant_id.as_str())
    .bind(user_id.as_str())
    .fetch_all(db)
    .await
    .context("Could not query entitlements")?;

    rows.into_iter().map(Entitlement::try_from).collect()
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn pair_lock_key_is_stable_and_collision_aware() {
        let tenant_a: TenantId = "acme".parse().unwrap();
        let tenant_ab: TenantId = "acme-x".parse().unwrap();
        let user_1: UserId = "u1".parse().unwrap();
        let user_x1: UserId = "x-u1".parse().unwrap();

        // Deterministic.
        assert_eq!(
            pair_lock_key(&tenant_a, &user_1),
            pair_lock_key(&tenant_a, &user_1),
        );
        // Different pairs produce different keys, including pairs whose
        // naive concatenation would collide.
        assert_ne!(
            pair_lock_key(&tenant_a, &user_1),
            pair_lock_key(&tenant_ab, &user_1),
        );
        assert_ne!(
            pair_lock_key(&tenant_ab, &user_1),
            pair_lock_key(&tenant_a, &user_x1),
        );
    }
}
