//! Accessors for one-time purchase records.

use anyhow::Context;
use sqlx::{PgConnection, PgExecutor};
use tollgate_common::ids::{ProviderChargeId, TenantId, UserId};

use super::models::{Purchase, PurchaseGrant, PurchaseRow};

/// Loads a purchase and takes a row-level lock on it. Must run inside a
/// transaction.
pub async fn lock_for_update(
    conn: &mut PgConnection,
    id: &ProviderChargeId,
) -> anyhow::Result<Option<Purchase>> {
    let row = sqlx::query_as::<_, PurchaseRow>(
        "SELECT provider_charge_id, tenant_id, user_id, price_id, \
                amount_minor, currency, status, refunded_at, valid_from, \
                valid_to \
         FROM purchases WHERE provider_charge_id = $1 \
         FOR UPDATE",
    )
    .bind(id.as_str())
    .fetch_optional(&mut *conn)
    .await
    .context("Could not lock purchase")?;

    row.map(Purchase::try_from).transpose()
}

pub async fn by_provider_id(
    db: impl PgExecutor<'_>,
    id: &ProviderChargeId,
) -> anyhow::Result<Option<Purchase>> {
    let row = sqlx::query_as::<_, PurchaseRow>(
        "SELECT provider_charge_id, tenant_id, user_id, price_id, \
                amount_minor, currency, status, refunded_at, valid_from, \
                valid_to \
         FROM purchases WHERE provider_charge_id = $1",
    )
    .bind(id.as_str())
    .fetch_optional(db)
    .await
    .context("Could not query purchase")?;

    row.map(Purchase::try_from).transpose()
}

/// Inserts or fully overwrites the purchase keyed by
/// `provider_charge_id`. The single write path shared by processors and
/// the reconciler.
pub async fn upsert(
    db: impl PgExecutor<'_>,
    purchase: &Purchase,
) -> anyhow::Result<()> {
    sqlx::query(
        "INSERT INTO purchases \
           (provider_charge_id, tenant_id, user_id, price_id, amount_minor, \
            currency, status, refunded_at, valid_from, valid_to) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10) \
         ON CONFLICT (provider_charge_id) DO UPDATE SET \
           status = EXCLUDED.status, \
           refunded_at = EXCLUDED.refunded_at, \
           valid_from = EXCLUDED.valid_from, \
           valid_to = EXCLUDED.valid_to",
    )
    .bind(purchase.provider_charge_id.as_str())
    .bind(purchase.tenant_id.as_str())
    .bind(purchase.user_id.as_str())
    .bind(purchase.price_id.as_str())
    .bind(purchase.amount_minor)
    .bind(&purchase.currency)
    .bind(purchase.status.as_str())
    .bind(purchase.refunded_at.map(|ts| ts.as_i64()))
    .bind(purchase.valid_from.as_i64())
    .bind(purchase.valid_to.map(|ts| ts.as_i64()))
    .execute(db)
    .await
    .context("Could not upsert purchase")?;
    Ok(())
}

#[derive(sqlx::FromRow)]
struct PurchaseGrantRow {
    provider_charge_id: String,
    tenant_id: String,
    user_id: String,
    price_id: String,
    amount_minor: i64,
    currency: String,
    status: String,
    refunded_at: Option<i64>,
    valid_from: i64,
    valid_to: Option<i64>,
    feature_codes: Vec<String>,
}

/// Loads all purchases for (tenant, user) joined with the feature codes
/// their price's product unlocks.
pub async fn grants_for_user(
    db: impl PgExecutor<'_>,
    tenant_id: &TenantId,
    user_id: &UserId,
) -> anyhow::Result<Vec<PurchaseGrant>> {
    let rows = sqlx::query_as::<_, PurchaseGrantRow>(
        "SELECT c.provider_charge_id, c.tenant_id, c.user_id, c.price_id, \
                c.amount_minor, c.currency, c.status, c.refunded_at, \
                c.valid_from, c.valid_to, p.feature_codes \
         FROM purchases c \
         JOIN prices pr \
           ON pr.tenant_id = c.tenant_id AND pr.price_id = c.price_id \
         JOIN products p \
           ON p.tenant_id = pr.tenant_id AND p.product_id = pr.product_id \
         WHERE c.tenant_id = $1 AND c.user_id = $2 \
         ORDER BY c.provider_charge_id",
    )
    .bind(tenant_id.as_str())
    .bind(user_id.as_str())
    .fetch_all(db)
    .await
    .context("Could not query purchase grants")?;

    rows.into_iter()
        .map(|row| {
            let feature_codes = row
                .feature_codes
                .iter()
                .map(|code| code.parse())
                .collect::<Result<Vec<_>, _>>()
                .context("Bad feature_code")?;
            let purchase = Purchase::try_from(PurchaseRow {
                provider_charge_id: row.provider_charge_id,
                tenant_id: row.tenant_id,
                user_id: row.user_id,
                price_id: row.price_id,
                amount_minor: row.amount_minor,
                currency: row.currency,
                status: row.status,
                refunded_at: row.refunded_at,
                valid_from: row.valid_from,
                valid_to: row.valid_to,
            })?;
            Ok(PurchaseGrant {
                purchase,
                feature_codes,
            })
        })
        .collect()
}
