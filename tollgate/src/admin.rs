//! Admin overrides: manual grant and revoke.
//!
//! Both operations require the elevated admin credential (enforced by the
//! handler), write an immutable audit line in the same transaction as the
//! grant mutation, and then run the shared recomputation + eviction path.
//! Both return the resulting aggregated entitlement view.

use std::sync::Arc;

use tollgate_api::{
    error::BillingApiError,
    models::{EntitlementsResponse, GrantRequest, RevokeRequest},
};
use tollgate_common::time::TimestampMs;
use tracing::{info, instrument};

use crate::{
    db::{self, models::AuditLine, Store},
    entitlements::{self, EntitlementEngine},
};

pub struct AdminOps {
    store: Store,
    engine: Arc<EntitlementEngine>,
}

impl AdminOps {
    pub fn new(store: Store, engine: Arc<EntitlementEngine>) -> Self {
        Self { store, engine }
    }

    /// Inserts a manual grant and returns the resulting aggregated view.
    ///
    /// Granting a feature that already has an identical active grant is a
    /// no-op success (the operation is idempotent under admin retries).
    #[instrument(skip_all, name = "(admin-grant)")]
    pub async fn grant(
        &self,
        req: &GrantRequest,
        now: TimestampMs,
    ) -> Result<EntitlementsResponse, BillingApiError> {
        if req.reason.trim().is_empty() {
            return Err(BillingApiError::invalid_request(
                "A non-empty reason is required",
            ));
        }
        if req.granted_by.trim().is_empty() {
            return Err(BillingApiError::invalid_request(
                "granted_by is required",
            ));
        }

        let tenant = db::tenants::tenant_by_id(self.store.pool(), &req.tenant_id)
            .await
            .map_err(BillingApiError::database)?;
        if tenant.is_none() {
            return Err(BillingApiError::invalid_request("Unknown tenant"));
        }

        let valid_from = req.valid_from.unwrap_or(now);
        if let Some(valid_to) = req.valid_to {
            if valid_to <= valid_from {
                return Err(BillingApiError::invalid_request(
                    "valid_to must be after valid_from",
                ));
            }
        }

        let mut tx = self
            .store
            .begin()
            .await
            .map_err(BillingApiError::database)?;

        // Serialize against concurrent grant/revoke for the same triple.
        let existing = db::grants::latest_unrevoked_for_update(
            &mut tx,
            &req.tenant_id,
            &req.user_id,
            &req.feature_code,
        )
        .await
        .map_err(BillingApiError::database)?;

        // Idempotent no-op: an identical active grant already exists.
        let duplicate = existing.as_ref().is_some_and(|grant| {
            grant.valid_from == valid_from
                && grant.valid_to == req.valid_to
                && grant.is_active(now)
        });

        if duplicate {
            info!(
                "Grant for ({}, {}, {}) already active; no-op",
                req.tenant_id, req.user_id, req.feature_code,
            );
        } else {
            let grant_id = db::grants::insert(
                &mut *tx,
                &req.tenant_id,
                &req.user_id,
                &req.feature_code,
                valid_from,
                req.valid_to,
                &req.reason,
                &req.granted_by,
                now,
            )
            .await
            .map_err(BillingApiError::database)?;
            info!(
                "Granted {} to ({}, {}) as grant_{grant_id}",
                req.feature_code, req.tenant_id, req.user_id,
            );
        }

        db::grants::insert_audit(
            &mut *tx,
            &AuditLine {
                at: now,
                actor: req.granted_by.clone(),
                action: "grant",
                tenant_id: req.tenant_id.clone(),
                user_id: req.user_id.clone(),
                feature_code: req.feature_code.clone(),
                detail: req.reason.clone(),
            },
        )
        .await
        .map_err(BillingApiError::database)?;

        tx.commit().await.map_err(BillingApiError::database)?;

        self.recompute_view(&req.tenant_id, &req.user_id, now).await
    }

    /// Revokes the latest non-revoked grant for the triple. Permanent.
    #[instrument(skip_all, name = "(admin-revoke)")]
    pub async fn revoke(
        &self,
        req: &RevokeRequest,
        now: TimestampMs,
    ) -> Result<EntitlementsResponse, BillingApiError> {
        if req.revoked_by.trim().is_empty() {
            return Err(BillingApiError::invalid_request(
                "revoked_by is required",
            ));
        }

        let mut tx = self
            .store
            .begin()
            .await
            .map_err(BillingApiError::database)?;

        let grant = db::grants::latest_unrevoked_for_update(
            &mut tx,
            &req.tenant_id,
            &req.user_id,
            &req.feature_code,
        )
        .await
        .map_err(BillingApiError::database)?
        .ok_or_else(|| {
            BillingApiError::not_found("No active grant to revoke")
        })?;

        db::grants::revoke(
            &mut *tx,
            grant.id,
            now,
            &req.revoked_by,
            req.reason.as_deref(),
        )
        .await
        .map_err(BillingApiError::database)?;

        db::grants::insert_audit(
            &mut *tx,
            &AuditLine {
                at: now,
                actor: req.revoked_by.clone(),
                action: "revoke",
                tenant_id: req.tenant_id.clone(),
                user_id: req.user_id.clone(),
                feature_code: req.feature_code.clone(),
                detail: req.reason.clone().unwrap_or_default(),
            },
        )
        .await
        .map_err(BillingApiError::database)?;

        tx.commit().await.map_err(BillingApiError::database)?;
        info!(
            "Revoked grant_{} for ({}, {})",
            grant.id, req.tenant_id, req.user_id,
        );

        self.recompute_view(&req.tenant_id, &req.user_id, now).await
    }

    /// Shared tail: recompute + evict, then build the aggregated view
    /// from the fresh rows.
    async fn recompute_view(
        &self,
        tenant_id: &tollgate_common::ids::TenantId,
        user_id: &tollgate_common::ids::UserId,
        now: TimestampMs,
    ) -> Result<EntitlementsResponse, BillingApiError> {
        let rows = self
            .engine
            .recompute_and_evict(tenant_id, user_id, now)
            .await
            .map_err(BillingApiError::database)?;
        Ok(entitlements::aggregate_response(
            tenant_id.clone(),
            user_id.clone(),
            &rows,
            now,
        ))
    }
}
