use std::sync::Arc;

use axum::extract::State;
use http::HeaderMap;
use tollgate_api::{
    auth::BearerToken,
    error::BillingApiError,
    models::{EntitlementsResponse, GrantRequest, RevokeRequest},
    server::ApiJson,
};
use tollgate_common::time::TimestampMs;

use super::RouterState;

fn require_admin(
    state: &RouterState,
    headers: &HeaderMap,
) -> Result<(), BillingApiError> {
    let token = BearerToken::from_headers(headers)
        .map_err(|err| BillingApiError::unauthenticated(err.to_string()))?;
    state.auth.verify_admin(&token)
}

/// `POST /v1/admin/grant`
pub(super) async fn grant(
    State(state): State<Arc<RouterState>>,
    headers: HeaderMap,
    ApiJson(req): ApiJson<GrantRequest>,
) -> Result<ApiJson<EntitlementsResponse>, BillingApiError> {
    require_admin(&state, &headers)?;
    state
        .admin
        .grant(&req, TimestampMs::now())
        .await
        .map(ApiJson)
}

/// `POST /v1/admin/revoke`
pub(super) async fn revoke(
    State(state): State<Arc<RouterState>>,
    headers: HeaderMap,
    ApiJson(req): ApiJson<RevokeRequest>,
) -> Result<ApiJson<EntitlementsResponse>, BillingApiError> {
    require_admin(&state, &headers)?;
    state
        .admin
        .revoke(&req, TimestampMs::now())
        .await
        .map(ApiJson)
}
