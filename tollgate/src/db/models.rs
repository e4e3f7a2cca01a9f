//! Domain entities and their database row representations.
//!
//! Row structs mirror the relational layout exactly (plain SQL types,
//! timestamps as `BIGINT` millis) and convert into domain structs via
//! `TryFrom`, which is where status strings and id invariants are
//! enforced. Domain structs are what the rest of the service works with.

use anyhow::Context;
use tollgate_common::{
    enums::{
        EntitlementSource, PriceCadence, PurchaseStatus, SubscriptionStatus,
    },
    ids::{
        FeatureCode, PriceId, ProductId, ProviderChargeId, ProviderPriceId,
        ProviderSubscriptionId, TenantId, UserId,
    },
    time::TimestampMs,
};

// --- Tenant / Product / Price --- //

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Tenant {
    pub tenant_id: TenantId,
    pub display_name: String,
    pub active: bool,
}

#[derive(sqlx::FromRow)]
pub(crate) struct TenantRow {
    pub tenant_id: String,
    pub display_name: String,
    pub active: bool,
}

impl TryFrom<TenantRow> for Tenant {
    type Error = anyhow::Error;
    fn try_from(row: TenantRow) -> anyhow::Result<Self> {
        Ok(Self {
            tenant_id: row.tenant_id.parse().context("Bad tenant_id")?,
            display_name: row.display_name,
            active: row.active,
        })
    }
}

/// A commercial term referencing a product (a sellable bundle of feature
/// codes; see `schema.sql`). Immutable once referenced by a subscription
/// or purchase; new commercial terms yield new prices.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Price {
    pub tenant_id: TenantId,
    pub price_id: PriceId,
    pub product_id: ProductId,
    pub provider_price_id: ProviderPriceId,
    pub amount_minor: i64,
    pub currency: String,
    pub cadence: PriceCadence,
    /// For one-time prices: how long purchased access lasts, in days.
    /// `None` means lifetime access.
    pub access_duration_days: Option<i32>,
}

#[derive(sqlx::FromRow)]
pub(crate) struct PriceRow {
    pub tenant_id: String,
    pub price_id: String,
    pub product_id: String,
    pub provider_price_id: String,
    pub amount_minor: i64,
    pub currency: String,
    pub cadence: String,
    pub access_duration_days: Option<i32>,
}

impl TryFrom<PriceRow> for Price {
    type Error = anyhow::Error;
    fn try_from(row: PriceRow) -> anyhow::Result<Self> {
        Ok(Self {
            tenant_id: row.tenant_id.parse().context("Bad tenant_id")?,
            price_id: row.price_id.parse().context("Bad price_id")?,
            product_id: row.product_id.parse().context("Bad product_id")?,
            provider_price_id: row
                .provider_price_id
                .parse()
                .context("Bad provider_price_id")?,
            amount_minor: row.amount_minor,
            currency: row.currency,
            cadence: row.cadence.parse().context("Bad cadence")?,
            access_duration_days: row.access_duration_days,
        })
    }
}

// --- Subscription --- //

/// A recurring obligation, mirrored from the provider.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Subscription {
    pub provider_subscription_id: ProviderSubscriptionId,
    pub tenant_id: TenantId,
    pub user_id: UserId,
    pub price_id: PriceId,
    pub status: SubscriptionStatus,
    pub current_period_start: TimestampMs,
    pub current_period_end: TimestampMs,
    pub cancel_at_period_end: bool,
    pub canceled_at: Option<TimestampMs>,
}

impl Subscription {
    /// `current_period_start <= current_period_end` is a data invariant;
    /// writers must validate before persisting.
    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(
            self.current_period_start <= self.current_period_end,
            "Subscription period start {} is after period end {}",
            self.current_period_start,
            self.current_period_end,
        );
        Ok(())
    }
}

#[derive(sqlx::FromRow)]
pub(crate) struct SubscriptionRow {
    pub provider_subscription_id: String,
    pub tenant_id: String,
    pub user_id: String,
    pub price_id: String,
    pub status: String,
    pub current_period_start: i64,
    pub current_period_end: i64,
    pub cancel_at_period_end: bool,
    pub canceled_at: Option<i64>,
}

impl TryFrom<SubscriptionRow> for Subscription {
    type Error = anyhow::Error;
    fn try_from(row: SubscriptionRow) -> anyhow::Result<Self> {
        Ok(Self {
            provider_subscription_id: row
                .provider_subscription_id
                .parse()
                .context("Bad provider_subscription_id")?,
            tenant_id: row.tenant_id.parse().context("Bad tenant_id")?,
            user_id: row.user_id.parse().context("Bad user_id")?,
            price_id: row.price_id.parse().context("Bad price_id")?,
            status: row.status.parse().context("Bad subscription status")?,
            current_period_start: TimestampMs::try_from_ms(
                row.current_period_start,
            )?,
            current_period_end: TimestampMs::try_from_ms(
                row.current_period_end,
            )?,
            cancel_at_period_end: row.cancel_at_period_end,
            canceled_at: row
                .canceled_at
                .map(TimestampMs::try_from_ms)
                .transpose()?,
        })
    }
}

/// A subscription joined with the feature codes its price's product
/// unlocks. Input to the entitlement engine.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SubscriptionGrant {
    pub subscription: Subscription,
    pub feature_codes: Vec<FeatureCode>,
}

// --- Purchase --- //

/// A one-time obligation, mirrored from the provider.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Purchase {
    pub provider_charge_id: ProviderChargeId,
    pub tenant_id: TenantId,
    pub user_id: UserId,
    pub price_id: PriceId,
    pub amount_minor: i64,
    pub currency: String,
    pub status: PurchaseStatus,
    pub refunded_at: Option<TimestampMs>,
    pub valid_from: TimestampMs,
    /// `None` means lifetime access.
    pub valid_to: Option<TimestampMs>,
}

#[derive(sqlx::FromRow)]
pub(crate) struct PurchaseRow {
    pub provider_charge_id: String,
    pub tenant_id: String,
    pub user_id: String,
    pub price_id: String,
    pub amount_minor: i64,
    pub currency: String,
    pub status: String,
    pub refunded_at: Option<i64>,
    pub valid_from: i64,
    pub valid_to: Option<i64>,
}

impl TryFrom<PurchaseRow> for Purchase {
    type Error = anyhow::Error;
    fn try_from(row: PurchaseRow) -> anyhow::Result<Self> {
        Ok(Self {
            provider_charge_id: row
                .provider_charge_id
                .parse()
                .context("Bad provider_charge_id")?,
            tenant_id: row.tenant_id.parse().context("Bad tenant_id")?,
            user_id: row.user_id.parse().context("Bad user_id")?,
            price_id: row.price_id.parse().context("Bad price_id")?,
            amount_minor: row.amount_minor,
            currency: row.currency,
            status: row.status.parse().context("Bad purchase status")?,
            refunded_at: row
                .refunded_at
                .map(TimestampMs::try_from_ms)
                .transpose()?,
            valid_from: TimestampMs::try_from_ms(row.valid_from)?,
            valid_to: row.valid_to.map(TimestampMs::try_from_ms).transpose()?,
        })
    }
}

/// A purchase joined with the feature codes its price's product unlocks.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PurchaseGrant {
    pub purchase: Purchase,
    pub feature_codes: Vec<FeatureCode>,
}

// --- ManualGrant --- //

/// An operator override. Append-only; revocation is permanent.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ManualGrant {
    pub id: i64,
    pub tenant_id: TenantId,
    pub user_id: UserId,
    pub feature_code: FeatureCode,
    pub valid_from: TimestampMs,
    pub valid_to: Option<TimestampMs>,
    pub reason: String,
    pub granted_by: String,
    pub granted_at: TimestampMs,
    pub revoked_at: Option<TimestampMs>,
    pub revoked_by: Option<String>,
    pub revoke_reason: Option<String>,
}

impl ManualGrant {
    /// Whether this grant contributes entitlements at `now`.
    pub fn is_active(&self, now: TimestampMs) -> bool {
        self.revoked_at.is_none()
            && self.valid_from <= now
            && self.valid_to.map_or(true, |valid_to| now < valid_to)
    }
}

#[derive(sqlx::FromRow)]
pub(crate) struct ManualGrantRow {
    pub id: i64,
    pub tenant_id: String,
    pub user_id: String,
    pub feature_code: String,
    pub valid_from: i64,
    pub valid_to: Option<i64>,
    pub reason: String,
    pub granted_by: String,
    pub granted_at: i64,
    pub revoked_at: Option<i64>,
    pub revoked_by: Option<String>,
    pub revoke_reason: Option<String>,
}

impl TryFrom<ManualGrantRow> for ManualGrant {
    type Error = anyhow::Error;
    fn try_from(row: ManualGrantRow) -> anyhow::Result<Self> {
        Ok(Self {
            id: row.id,
            tenant_id: row.tenant_id.parse().context("Bad tenant_id")?,
            user_id: row.user_id.parse().context("Bad user_id")?,
            feature_code: row
                .feature_code
                .parse()
                .context("Bad feature_code")?,
            valid_from: TimestampMs::try_from_ms(row.valid_from)?,
            valid_to: row.valid_to.map(TimestampMs::try_from_ms).transpose()?,
            reason: row.reason,
            granted_by: row.granted_by,
            granted_at: TimestampMs::try_from_ms(row.granted_at)?,
            revoked_at: row
                .revoked_at
                .map(TimestampMs::try_from_ms)
                .transpose()?,
            revoked_by: row.revoked_by,
            revoke_reason: row.revoke_reason,
        })
    }
}

// --- Entitlement --- //

/// One materialized entitlement row: the claim that (tenant, user) has
/// access to `feature_code` via `source` during the validity window.
/// At most one row exists per (tenant, user, feature_code, source,
/// source_ref).
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Entitlement {
    pub tenant_id: TenantId,
    pub user_id: UserId,
    pub feature_code: FeatureCode,
    pub source: EntitlementSource,
    /// The id of the contributing record: a provider subscription id, a
    /// provider charge id, or a manual grant id.
    pub source_ref: String,
    pub valid_from: TimestampMs,
    pub valid_to: Option<TimestampMs>,
    pub computed_at: TimestampMs,
}

impl Entitlement {
    /// Whether this row qualifies at `now`.
    pub fn is_active(&self, now: TimestampMs) -> bool {
        self.valid_from <= now
            && self.valid_to.map_or(true, |valid_to| now < valid_to)
    }
}

#[derive(sqlx::FromRow)]
pub(crate) struct EntitlementRow {
    pub tenant_id: String,
    pub user_id: String,
    pub feature_code: String,
    pub source: String,
    pub source_ref: String,
    pub valid_from: i64,
    pub valid_to: Option<i64>,
    pub computed_at: i64,
}

impl TryFrom<EntitlementRow> for Entitlement {
    type Error = anyhow::Error;
    fn try_from(row: EntitlementRow) -> anyhow::Result<Self> {
        Ok(Self {
            tenant_id: row.tenant_id.parse().context("Bad tenant_id")?,
            user_id: row.user_id.parse().context("Bad user_id")?,
            feature_code: row
                .feature_code
                .parse()
                .context("Bad feature_code")?,
            source: row.source.parse().context("Bad entitlement source")?,
            source_ref: row.source_ref,
            valid_from: TimestampMs::try_from_ms(row.valid_from)?,
            valid_to: row.valid_to.map(TimestampMs::try_from_ms).transpose()?,
            computed_at: TimestampMs::try_from_ms(row.computed_at)?,
        })
    }
}

/// An immutable audit line for admin operations, written independently of
/// the grant rows themselves.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct AuditLine {
    pub at: TimestampMs,
    pub actor: String,
    pub action: &'static str,
    pub tenant_id: TenantId,
    pub user_id: UserId,
    pub feature_code: FeatureCode,
    pub detail: String,
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn subscription_period_invariant() {
        let mut sub = Subscription {
            provider_subscription_id: "sub_1".parse().unwrap(),
            tenant_id: "acme".parse().unwrap(),
            user_id: "u1".parse().unwrap(),
            price_id: "price_m".parse().unwrap(),
            status: SubscriptionStatus::Active,
            current_period_start: TimestampMs::try_from_ms(1000).unwrap(),
            current_period_end: TimestampMs::try_from_ms(2000).unwrap(),
            cancel_at_period_end: false,
            canceled_at: None,
        };
        assert!(sub.validate().is_ok());

        sub.current_period_end = TimestampMs::try_from_ms(999).unwrap();
        assert!(sub.validate().is_err());

        // Degenerate zero-length period is allowed.
        sub.current_period_end = sub.current_period_start;
        assert!(sub.validate().is_ok());
    }

    #[test]
    fn manual_grant_active_window() {
        let grant = ManualGrant {
            id: 1,
            tenant_id: "acme".parse().unwrap(),
            user_id: "u1".parse().unwrap(),
            feature_code: "pro".parse().unwrap(),
            valid_from: TimestampMs::try_from_ms(1000).unwrap(),
            valid_to: Some(TimestampMs::try_from_ms(2000).unwrap()),
            reason: "trial".to_owned(),
            granted_by: "ops".to_owned(),
            granted_at: TimestampMs::try_from_ms(1000).unwrap(),
            revoked_at: None,
            revoked_by: None,
            revoke_reason: None,
        };

        let at = |ms| TimestampMs::try_from_ms(ms).unwrap();
        assert!(!grant.is_active(at(999)));
        assert!(grant.is_active(at(1000)));
        assert!(grant.is_active(at(1999)));
        // Inactive exactly at valid_to and after.
        assert!(!grant.is_active(at(2000)));
        assert!(!grant.is_active(at(3000)));

        // A revoked grant is inactive regardless of window.
        let revoked = ManualGrant {
            revoked_at: Some(at(1500)),
            ..grant.clone()
        };
        assert!(!revoked.is_active(at(1200)));

        // A lifetime grant is active indefinitely.
        let lifetime = ManualGrant {
            valid_to: None,
            ..grant
        };
        assert!(lifetime.is_active(at(i64::MAX - 1)));
    }

    #[test]
    fn row_conversion_rejects_bad_data() {
        let row = SubscriptionRow {
            provider_subscription_id: "sub_1".to_owned(),
            tenant_id: "acme".to_owned(),
            user_id: "u1".to_owned(),
            price_id: "price_m".to_owned(),
            status: "not_a_status".to_owned(),
            current_period_start: 0,
            current_period_end: 100,
            cancel_at_period_end: false,
            canceled_at: None,
        };
        assert!(Subscription::try_from(row).is_err());

        let row = PurchaseRow {
            provider_charge_id: "ch_1".to_owned(),
            tenant_id: "acme".to_owned(),
            user_id: "u1".to_owned(),
            price_id: "price_l".to_owned(),
            amount_minor: 999,
            currency: "usd".to_owned(),
            status: "succeeded".to_owned(),
            refunded_at: None,
            valid_from: -5,
            valid_to: None,
        };
        assert!(Purchase::try_from(row).is_err());
    }
}
