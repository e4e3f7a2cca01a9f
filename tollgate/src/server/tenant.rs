use std::sync::Arc;

use axum::extract::State;
use http::HeaderMap;
use tollgate_api::{
    auth::BearerToken,
    error::BillingApiError,
    models::{EntitlementsResponse, GetEntitlements},
    server::{ApiJson, ApiQuery},
};
use tollgate_common::time::TimestampMs;

use super::RouterState;
use crate::auth;

/// `GET /v1/entitlements?user_id=<id>[&tenant_id=<id>]`
///
/// The tenant is resolved from the bearer credential; a `tenant_id`
/// query parameter, if present, must match it (403 otherwise). All reads
/// are scoped to the resolved tenant, so one tenant can never observe
/// another's rows.
pub(super) async fn get_entitlements(
    State(state): State<Arc<RouterState>>,
    headers: HeaderMap,
    ApiQuery(query): ApiQuery<GetEntitlements>,
) -> Result<ApiJson<EntitlementsResponse>, BillingApiError> {
    let token = BearerToken::from_headers(&headers)
        .map_err(|err| BillingApiError::unauthenticated(err.to_string()))?;
    let tenant = state.auth.authenticate_tenant(&token).await?;
    auth::check_tenant_scope(&tenant, query.tenant_id.as_ref())?;

    let response = state
        .engine
        .read(&tenant.tenant_id, &query.user_id, TimestampMs::now())
        .await
        .map_err(BillingApiError::database)?;
    Ok(ApiJson(response))
}
