//! Accessors for subscription records.

use anyhow::Context;
use sqlx::{PgConnection, PgExecutor};
use tollgate_common::ids::{ProviderSubscriptionId, TenantId, UserId};

use super::models::{Subscription, SubscriptionGrant, SubscriptionRow};

/// Loads a subscription and takes a row-level lock on it, serializing
/// concurrent processors mutating the same record. Must run inside a
/// transaction.
pub async fn lock_for_update(
    conn: &mut PgConnection,
    id: &ProviderSubscriptionId,
) -> anyhow::Result<Option<Subscription>> {
    let row = sqlx::query_as::<_, SubscriptionRow>(
        "SELECT provider_subscription_id, tenant_id, user_id, price_id, \
                status, current_period_start, current_period_end, \
                cancel_at_period_end, canceled_at \
         FROM subscriptions WHERE provider_subscription_id = $1 \
         FOR UPDATE",
    )
    .bind(id.as_str())
    .fetch_optional(&mut *conn)
    .await
    .context("Could not lock subscription")?;

    row.map(Subscription::try_from).transpose()
}

pub async fn by_provider_id(
    db: impl PgExecutor<'_>,
    id: &ProviderSubscriptionId,
) -> anyhow::Result<Option<Subscription>> {
    let row = sqlx::query_as::<_, SubscriptionRow>(
        "SELECT provider_subscription_id, tenant_id, user_id, price_id, \
                status, current_period_start, current_period_end, \
                cancel_at_period_end, canceled_at \
         FROM subscriptions WHERE provider_subscription_id = $1",
    )
    .bind(id.as_str())
    .fetch_optional(db)
    .await
    .context("Could not query subscription")?;

    row.map(Subscription::try_from).transpose()
}

/// Inserts or fully overwrites the subscription keyed by
/// `provider_subscription_id`. Processors and the reconciler both write
/// through this single path, which is what makes replays idempotent: the
/// same event payload maps to the same row values.
pub async fn upsert(
    db: impl PgExecutor<'_>,
    sub: &Subscription,
) -> anyhow::Result<()> {
    sub.validate()?;
    sqlx::query(
        "INSERT INTO subscriptions \
           (provider_subscription_id, tenant_id, user_id, price_id, status, \
            current_period_start, current_period_end, cancel_at_period_end, \
            canceled_at) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9) \
         ON CONFLICT (provider_subscription_id) DO UPDATE SET \
           price_id = EXCLUDED.price_id, \
           status = EXCLUDED.status, \
           current_period_start = EXCLUDED.current_period_start, \
           current_period_end = EXCLUDED.current_period_end, \
           cancel_at_period_end = EXCLUDED.cancel_at_period_end, \
           canceled_at = EXCLUDED.canceled_at",
    )
    .bind(sub.provider_subscription_id.as_str())
    .bind(sub.tenant_id.as_str())
    .bind(sub.user_id.as_str())
    .bind(sub.price_id.as_str())
    .bind(sub.status.as_str())
    .bind(sub.current_period_start.as_i64())
    .bind(sub.current_period_end.as_i64())
    .bind(sub.cancel_at_period_end)
    .bind(sub.canceled_at.map(|ts| ts.as_i64()))
    .execute(db)
    .await
    .context("Could not upsert subscription")?;
    Ok(())
}

#[derive(sqlx::FromRow)]
struct SubscriptionGrantRow {
    provider_subscription_id: String,
    tenant_id: String,
    user_id: String,
    price_id: String,
    status: String,
    current_period_start: i64,
    current_period_end: i64,
    cancel_at_period_end: bool,
    canceled_at: Option<i64>,
    feature_codes: Vec<String>,
}

/// Loads all subscriptions for (tenant, user) joined with the feature
/// codes their price's product unlocks. Input to the entitlement engine.
pub async fn grants_for_user(
    db: impl PgExecutor<'_>,
    tenant_id: &TenantId,
    user_id: &UserId,
) -> anyhow::Result<Vec<SubscriptionGrant>> {
    let rows = sqlx::query_as::<_, SubscriptionGrantRow>(
        "SELECT s.provider_subscription_id, s.tenant_id, s.user_id, \
                s.price_id, s.status, s.current_period_start, \
                s.current_period_end, s.cancel_at_period_end, s.canceled_at, \
                p.feature_codes \
         FROM subscriptions s \
         JOIN prices pr \
           ON pr.tenant_id = s.tenant_id AND pr.price_id = s.price_id \
         JOIN products p \
           ON p.tenant_id = pr.tenant_id AND p.product_id = pr.product_id \
         WHERE s.tenant_id = $1 AND s.user_id = $2 \
         ORDER BY s.provider_subscription_id",
    )
    .bind(tenant_id.as_str())
    .bind(user_id.as_str())
    .fetch_all(db)
    .await
    .context("Could not query subscription grants")?;

    rows.into_iter()
        .map(|row| {
            let feature_codes = row
                .feature_codes
                .iter()
                .map(|code| code.parse())
                .collect::<Result<Vec<_>, _>>()
                .context("Bad feature_code")?;
            let subscription = Subscription::try_from(SubscriptionRow {
                provider_subscription_id: row.provider_subscription_id,
                tenant_id: row.tenant_id,
                user_id: row.user_id,
                price_id: row.price_id,
                status: row.status,
                current_period_start: row.current_period_start,
                current_period_end: row.current_period_end,
                cancel_at_period_end: row.cancel_at_period_end,
                canceled_at: row.canceled_at,
            })?;
            Ok(SubscriptionGrant {
                subscription,
                feature_codes,
            })
        })
        .collect()
}
