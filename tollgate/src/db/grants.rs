//! Accessors for manual grants and the admin audit log.
//!
//! Grants are append-only: revocation sets the `revoked_*` fields and is
//! permanent. Re-granting after a revocation inserts a new row.

use anyhow::Context;
use sqlx::{PgConnection, PgExecutor};
use tollgate_common::{
    ids::{FeatureCode, TenantId, UserId},
    time::TimestampMs,
};

use super::models::{AuditLine, ManualGrant, ManualGrantRow};

const GRANT_COLUMNS: &str = "id, tenant_id, user_id, feature_code, \
    valid_from, valid_to, reason, granted_by, granted_at, revoked_at, \
    revoked_by, revoke_reason";

/// Inserts a new grant, returning its id.
#[allow(clippy::too_many_arguments)]
pub async fn insert(
    db: impl PgExecutor<'_>,
    tenant_id: &TenantId,
    user_id: &UserId,
    feature_code: &FeatureCode,
    valid_from: TimestampMs,
    valid_to: Option<TimestampMs>,
    reason: &str,
    granted_by: &str,
    granted_at: TimestampMs,
) -> anyhow::Result<i64> {
    let id = sqlx::query_scalar::<_, i64>(
        "INSERT INTO manual_grants \
           (tenant_id, user_id, feature_code, valid_from, valid_to, reason, \
            granted_by, granted_at) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8) \
         RETURNING id",
    )
    .bind(tenant_id.as_str())
    .bind(user_id.as_str())
    .bind(feature_code.as_str())
    .bind(valid_from.as_i64())
    .bind(valid_to.map(|ts| ts.as_i64()))
    .bind(reason)
    .bind(granted_by)
    .bind(granted_at.as_i64())
    .fetch_one(db)
    .await
    .context("Could not insert manual grant")?;
    Ok(id)
}

/// Loads the latest non-revoked grant for (tenant, user, feature_code)
/// and takes a row-level lock on it. Must run inside a transaction.
pub async fn latest_unrevoked_for_update(
    conn: &mut PgConnection,
    tenant_id: &TenantId,
    user_id: &UserId,
    feature_code: &FeatureCode,
) -> anyhow::Result<Option<ManualGrant>> {
    let query = format!(
        "SELECT {GRANT_COLUMNS} FROM manual_grants \
         WHERE tenant_id = $1 AND user_id = $2 AND feature_code = $3 \
           AND revoked_at IS NULL \
         ORDER BY granted_at DESC, id DESC \
         LIMIT 1 \
         FOR UPDATE",
    );
    let row = sqlx::query_as::<_, ManualGrantRow>(&query)
        .bind(tenant_id.as_str())
        .bind(user_id.as_str())
        .bind(feature_code.as_str())
        .fetch_optional(&mut *conn)
        .await
        .context("Could not lock manual grant")?;

    row.map(ManualGrant::try_from).transpose()
}

/// Marks a grant revoked. Permanent.
pub async fn revoke(
    db: impl PgExecutor<'_>,
    grant_id: i64,
    revoked_at: TimestampMs,
    revoked_by: &str,
    revoke_reason: Option<&str>,
) -> anyhow::Result<()> {
    sqlx::query(
        "UPDATE manual_grants \
         SET revoked_at = $2, revoked_by = $3, revoke_reason = $4 \
         WHERE id = $1 AND revoked_at IS NULL",
    )
    .bind(grant_id)
    .bind(revoked_at.as_i64())
    .bind(revoked_by)
    .bind(revoke_reason)
    .execute(db)
    .await
    .context("Could not revoke manual grant")?;
    Ok(())
}

/// All non-revoked grants for (tenant, user). The entitlement engine
/// applies the validity-window filtering.
pub async fn unrevoked_for_user(
    db: impl PgExecutor<'_>,
    tenant_id: &TenantId,
    user_id: &UserId,
) -> anyhow::Result<Vec<ManualGrant>> {
    let query = format!(
        "SELECT {GRANT_COLUMNS} FROM manual_grants \
         WHERE tenant_id = $1 AND user_id = $2 AND revoked_at IS NULL \
         ORDER BY id",
    );
    let rows = sqlx::query_as::<_, ManualGrantRow>(&query)
        .bind(tenant_id.as_str())
        .bind(user_id.as_str())
        .fetch_all(db)
        .await
        .context("Could not query manual grants")?;

    rows.into_iter().map(ManualGrant::try_from).collect()
}

/// Appends an immutable audit line. Written in the same transaction as
/// the grant mutation, but to an independent table.
pub async fn insert_audit(
    db: impl PgExecutor<'_>,
    line: &AuditLine,
) -> anyhow::Result<()> {
    sqlx::query(
        "INSERT INTO audit_log \
           (at, actor, action, tenant_id, user_id, feature_code, detail) \
         VALUES ($1, $2, $3, $4, $5, $6, $7)",
    )
    .bind(line.at.as_i64())
    .bind(&line.actor)
    .bind(line.action)
    .bind(line.tenant_id.as_str())
    .bind(line.user_id.as_str())
    .bind(line.feature_code.as_str())
    .bind(&line.detail)
    .execute(db)
    .await
    .context("Could not insert audit line")?;
    Ok(())
}
