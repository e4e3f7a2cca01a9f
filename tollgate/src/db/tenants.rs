//! Accessors for tenants, credentials, and the product/price catalog.

use anyhow::Context;
use sqlx::PgExecutor;
use tollgate_common::ids::{ProviderPriceId, TenantId};

use super::models::{Price, PriceRow, Tenant, TenantRow};

/// Resolves the tenant owning a credential, by the credential's SHA-256
/// hash (credentials themselves are never stored).
pub async fn tenant_by_credential_hash(
    db: impl PgExecutor<'_>,
    credential_hash_hex: &str,
) -> anyhow::Result<Option<Tenant>> {
    let row = sqlx::query_as::<_, TenantRow>(
        "SELECT t.tenant_id, t.display_name, t.active \
         FROM tenants t \
         JOIN tenant_credentials c ON c.tenant_id = t.tenant_id \
         WHERE c.credential_hash = $1",
    )
    .bind(credential_hash_hex)
    .fetch_optional(db)
    .await
    .context("Could not query tenant by credential")?;

    row.map(Tenant::try_from).transpose()
}

pub async fn tenant_by_id(
    db: impl PgExecutor<'_>,
    tenant_id: &TenantId,
) -> anyhow::Result<Option<Tenant>> {
    let row = sqlx::query_as::<_, TenantRow>(
        "SELECT tenant_id, display_name, active \
         FROM tenants WHERE tenant_id = $1",
    )
    .bind(tenant_id.as_str())
    .fetch_optional(db)
    .await
    .context("Could not query tenant by id")?;

    row.map(Tenant::try_from).transpose()
}

/// All active tenants, in stable order. Used by the reconciler sweep.
pub async fn active_tenants(
    db: impl PgExecutor<'_>,
) -> anyhow::Result<Vec<Tenant>> {
    let rows = sqlx::query_as::<_, TenantRow>(
        "SELECT tenant_id, display_name, active \
         FROM tenants WHERE active ORDER BY tenant_id",
    )
    .fetch_all(db)
    .await
    .context("Could not list active tenants")?;

    rows.into_iter().map(Tenant::try_from).collect()
}

/// Looks up a price by the provider's (globally unique) price id. This is
/// how processors bind provider checkout payloads to the local catalog.
pub async fn price_by_provider_id(
    db: impl PgExecutor<'_>,
    provider_price_id: &ProviderPriceId,
) -> anyhow::Result<Option<Price>> {
    let row = sqlx::query_as::<_, PriceRow>(
        "SELECT tenant_id, price_id, product_id, provider_price_id, \
                amount_minor, currency, cadence, access_duration_days \
         FROM prices WHERE provider_price_id = $1",
    )
    .bind(provider_price_id.as_str())
    .fetch_optional(db)
    .await
    .context("Could not query price by provider id")?;

    row.map(Price::try_from).transpose()
}
