use std::sync::Arc;

use axum::extract::State;
use bytes::Bytes;
use http::HeaderMap;
use tollgate_api::{
    error::BillingApiError, models::WebhookAck, server::ApiJson,
};
use tollgate_common::time::TimestampMs;

use super::RouterState;
use crate::webhook::SIGNATURE_HEADER;

/// `POST /v1/webhooks/provider`
pub(super) async fn webhook(
    State(state): State<Arc<RouterState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<ApiJson<WebhookAck>, BillingApiError> {
    let signature_header = headers
        .get(SIGNATURE_HEADER)
        .and_then(|value| value.to_str().ok());
    state
        .ingest
        .handle(&body, signature_header, TimestampMs::now())
        .await
        .map(ApiJson)
}
