//! The HTTP surface.
//!
//! One router serves three audiences: the payment provider (webhook
//! ingest), tenants (entitlement reads), and operators (admin overrides +
//! probes). Handlers stay thin: extract, authenticate, delegate, map
//! errors at the boundary.

use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};
use tollgate_api::error::BillingApiError;

use crate::{
    admin::AdminOps, auth::Authenticator, db::Store,
    entitlements::EntitlementEngine, ingest::Ingestor,
};

/// Handlers for admin overrides.
mod admin;
/// Handler for the provider webhook endpoint.
mod provider;
/// Handlers for tenant entitlement reads.
mod tenant;

pub struct RouterState {
    pub store: Store,
    pub auth: Authenticator,
    pub engine: Arc<EntitlementEngine>,
    pub ingest: Ingestor,
    pub admin: AdminOps,
}

pub fn router(state: Arc<RouterState>) -> Router<()> {
    Router::new()
        .route("/v1/webhooks/provider", post(provider::webhook))
        .route("/v1/entitlements", get(tenant::get_entitlements))
        .route("/v1/admin/grant", post(admin::grant))
        .route("/v1/admin/revoke", post(admin::revoke))
        .route("/healthz", get(healthz))
        .route("/live", get(live))
        .route("/ready", get(ready))
        .with_state(state)
}

async fn healthz() -> &'static str {
    "ok"
}

async fn live() -> &'static str {
    "ok"
}

/// Readiness verifies database connectivity; a replica that cannot reach
/// the database must not receive traffic.
async fn ready(
    axum::extract::State(state): axum::extract::State<Arc<RouterState>>,
) -> Result<&'static str, BillingApiError> {
    state
        .store
        .ping()
        .await
        .map_err(BillingApiError::database)?;
    Ok("ok")
}
