//! Request / response models for the tollgate HTTP API.

#[cfg(any(test, feature = "test-utils"))]
use proptest_derive::Arbitrary;
use serde::{Deserialize, Serialize};
#[cfg(any(test, feature = "test-utils"))]
use tollgate_common::test_utils::arbitrary;
use tollgate_common::{
    enums::EntitlementSource,
    ids::{FeatureCode, TenantId, UserId},
    time::TimestampMs,
};

/// One feature in the aggregated entitlement view returned to tenants.
/// When multiple sources contribute the same feature code, the row with the
/// latest `valid_to` wins (`None` = lifetime beats any finite expiry), with
/// ties broken by source precedence manual > purchase > subscription.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[cfg_attr(any(test, feature = "test-utils"), derive(Arbitrary))]
pub struct EntitlementView {
    pub feature_code: FeatureCode,
    pub is_active: bool,
    pub valid_from: TimestampMs,
    pub valid_to: Option<TimestampMs>,
    pub source: EntitlementSource,
}

/// The aggregated entitlement view for one (tenant, user) pair. This is
/// both the `GET /v1/entitlements` response body and the value serialized
/// into the entitlement cache.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[cfg_attr(any(test, feature = "test-utils"), derive(Arbitrary))]
pub struct EntitlementsResponse {
    pub tenant_id: TenantId,
    pub user_id: UserId,
    pub entitlements: Vec<EntitlementView>,
    pub checked_at: TimestampMs,
}

/// Query string for `GET /v1/entitlements`.
///
/// `tenant_id` is optional; when present it must match the tenant resolved
/// from the caller's credential, otherwise the request is forbidden.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[cfg_attr(any(test, feature = "test-utils"), derive(Arbitrary))]
pub struct GetEntitlements {
    pub user_id: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<TenantId>,
}

/// Body of `POST /v1/admin/grant`.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[cfg_attr(any(test, feature = "test-utils"), derive(Arbitrary))]
pub struct GrantRequest {
    pub tenant_id: TenantId,
    pub user_id: UserId,
    pub feature_code: FeatureCode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub valid_from: Option<TimestampMs>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub valid_to: Option<TimestampMs>,
    /// Required, non-empty. Operator overrides always carry a why.
    #[cfg_attr(
        any(test, feature = "test-utils"),
        proptest(strategy = "arbitrary::any_nonempty_string()")
    )]
    pub reason: String,
    /// Operator identity for the audit trail.
    #[cfg_attr(
        any(test, feature = "test-utils"),
        proptest(strategy = "arbitrary::any_nonempty_string()")
    )]
    pub granted_by: String,
}

/// Body of `POST /v1/admin/revoke`.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[cfg_attr(any(test, feature = "test-utils"), derive(Arbitrary))]
pub struct RevokeRequest {
    pub tenant_id: TenantId,
    pub user_id: UserId,
    pub feature_code: FeatureCode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[cfg_attr(
        any(test, feature = "test-utils"),
        proptest(
            strategy = "proptest::option::of(arbitrary::any_nonempty_string())"
        )
    )]
    pub reason: Option<String>,
    /// Operator identity for the audit trail.
    #[cfg_attr(
        any(test, feature = "test-utils"),
        proptest(strategy = "arbitrary::any_nonempty_string()")
    )]
    pub revoked_by: String,
}

/// Acknowledgement body for `POST /v1/webhooks/provider`.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[cfg_attr(any(test, feature = "test-utils"), derive(Arbitrary))]
pub struct WebhookAck {
    pub received: bool,
}

impl WebhookAck {
    pub const RECEIVED: Self = Self { received: true };
}

#[cfg(test)]
mod test {
    use tollgate_common::test_utils::roundtrip;

    use super::*;

    #[test]
    fn model_serde_roundtrips() {
        roundtrip::json_string_roundtrip_proptest::<EntitlementView>();
        roundtrip::json_string_roundtrip_proptest::<EntitlementsResponse>();
        roundtrip::json_string_roundtrip_proptest::<GetEntitlements>();
        roundtrip::json_string_roundtrip_proptest::<GrantRequest>();
        roundtrip::json_string_roundtrip_proptest::<RevokeRequest>();
        roundtrip::json_string_roundtrip_proptest::<WebhookAck>();
    }

    // The serialized field layout is a public, documented contract.
    #[test]
    fn entitlements_response_shape() {
        let response = EntitlementsResponse {
            tenant_id: "acme".parse().unwrap(),
            user_id: "user_1".parse().unwrap(),
            entitlements: vec![EntitlementView {
                feature_code: "pro".parse().unwrap(),
                is_active: true,
                valid_from: TimestampMs::try_from_ms(1000).unwrap(),
                valid_to: None,
                source: EntitlementSource::Manual,
            }],
            checked_at: TimestampMs::try_from_ms(2000).unwrap(),
        };
        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "tenant_id": "acme",
                "user_id": "user_1",
                "entitlements": [{
                    "feature_code": "pro",
                    "is_active": true,
                    "valid_from": 1000,
                    "valid_to": null,
                    "source": "manual",
                }],
                "checked_at": 2000,
            })
        );
    }

    #[test]
    fn query_tenant_id_is_optional() {
        let query: GetEntitlements =
            serde_json::from_str(r#"{"user_id":"u1"}"#).unwrap();
        assert_eq!(query.user_id.as_str(), "u1");
        assert_eq!(query.tenant_id, None);
    }
}
