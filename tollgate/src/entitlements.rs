//! Entitlement computation.
//!
//! [`compute_rows`] is a pure function of the three sources and `now`: it
//! emits one entitlement row per (feature, source, source record) that
//! qualifies at `now`. [`aggregate`] collapses stored rows into the
//! per-feature view served to tenants. Keeping both pure makes the
//! determinism and boundary properties directly testable.
//!
//! [`EntitlementEngine`] wires the pure functions to storage and cache:
//! `recompute` replaces the materialized rows for one (tenant, user) pair
//! in a single transaction, and every writer (webhook processor, admin
//! override, reconciler) converges through this one path.

use std::{cmp::Ordering, collections::BTreeSet, sync::Arc, time::Duration};

use tollgate_api::models::{EntitlementView, EntitlementsResponse};
use tollgate_common::{
    enums::{EntitlementSource, PurchaseStatus, SubscriptionStatus},
    ids::{TenantId, UserId},
    time::TimestampMs,
};
use tracing::instrument;

use crate::{
    cache::EntitlementCache,
    db::{
        self,
        models::{Entitlement, ManualGrant, PurchaseGrant, SubscriptionGrant},
        Store,
    },
};

/// Computes the entitlement rows for one (tenant, user) pair from the
/// three sources. Pure and deterministic: for fixed inputs and `now`, the
/// output is identical on repeated invocations (rows are emitted in a
/// canonical sort order, duplicates collapsed).
pub fn compute_rows(
    subscriptions: &[SubscriptionGrant],
    purchases: &[PurchaseGrant],
    grants: &[ManualGrant],
    now: TimestampMs,
    past_due_grace: Duration,
) -> Vec<Entitlement> {
    // BTreeSet keys on the full row identity, giving dedup + canonical
    // order in one shot.
    let mut rows = BTreeSet::new();

    for sub_grant in subscriptions {
        let sub = &sub_grant.subscription;
        // `active`/`trialing` grant through the current period;
        // `past_due` grants only within the configured grace window.
        let valid_to = if sub.status.grants_access() {
            sub.current_period_end
        } else if sub.status == SubscriptionStatus::PastDue {
            sub.current_period_end.saturating_add(past_due_grace)
        } else {
            continue;
        };
        // Strict inequality: a subscription whose period ends exactly now
        // is no longer active.
        if now >= valid_to {
            continue;
        }
        for feature_code in &sub_grant.feature_codes {
            rows.insert(RowKey {
                feature_code: feature_code.clone(),
                source: EntitlementSource::Subscription,
                source_ref: sub.provider_subscription_id.to_string(),
                valid_from: sub.current_period_start,
                valid_to: Some(valid_to),
            });
        }
    }

    for purchase_grant in purchases {
        let purchase = &purchase_grant.purchase;
        if purchase.status != PurchaseStatus::Succeeded {
            continue;
        }
        if !window_contains(now, purchase.valid_from, purchase.valid_to) {
            continue;
        }
        for feature_code in &purchase_grant.feature_codes {
            rows.insert(RowKey {
                feature_code: feature_code.clone(),
                source: EntitlementSource::Purchase,
                source_ref: purchase.provider_charge_id.to_string(),
                valid_from: purchase.valid_from,
                valid_to: purchase.valid_to,
            });
        }
    }

    for grant in grants {
        if !grant.is_active(now) {
            continue;
        }
        rows.insert(RowKey {
            feature_code: grant.feature_code.clone(),
            source: EntitlementSource::Manual,
            source_ref: format!("grant_{}", grant.id),
            valid_from: grant.valid_from,
            valid_to: grant.valid_to,
        });
    }

    // The (tenant, user) pair is uniform across the inputs; take it from
    // whichever source record is present.
    let pair = subscriptions
        .first()
        .map(|s| (&s.subscription.tenant_id, &s.subscription.user_id))
        .or_else(|| {
            purchases
                .first()
                .map(|p| (&p.purchase.tenant_id, &p.purchase.user_id))
        })
        .or_else(|| grants.first().map(|g| (&g.tenant_id, &g.user_id)));
    let Some((tenant_id, user_id)) = pair else {
        return Vec::new();
    };

    rows.into_iter()
        .map(|key| Entitlement {
            tenant_id: tenant_id.clone(),
            user_id: user_id.clone(),
            feature_code: key.feature_code,
            source: key.source,
            source_ref: key.source_ref,
            valid_from: key.valid_from,
            valid_to: key.valid_to,
            computed_at: now,
        })
        .collect()
}

/// The identity + window of one row. `Ord` gives the canonical emit order
/// (feature, source precedence, source_ref, window).
#[derive(Clone, Eq, PartialEq)]
struct RowKey {
    feature_code: tollgate_common::ids::FeatureCode,
    source: EntitlementSource,
    source_ref: String,
    valid_from: TimestampMs,
    valid_to: Option<TimestampMs>,
}

impl Ord for RowKey {
    fn cmp(&self, other: &Self) -> Ordering {
        (
            &self.feature_code,
            self.source.precedence(),
            &self.source_ref,
            self.valid_from,
            self.valid_to,
        )
            .cmp(&(
                &other.feature_code,
                other.source.precedence(),
                &other.source_ref,
                other.valid_from,
                other.valid_to,
            ))
    }
}

impl PartialOrd for RowKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Collapses stored entitlement rows into the aggregated per-feature view.
///
/// All contributing rows stay in storage (audits see every source); the
/// view keeps, per feature code, the row with the latest `valid_to`
/// (`None` = +∞ beats any finite value), breaking ties by source
/// precedence manual > purchase > subscription. `is_active` is true iff
/// at least one contributing row for the feature qualifies at `now`.
pub fn aggregate(rows: &[Entitlement], now: TimestampMs) -> Vec<EntitlementView> {
    // (winning row, any contributing row currently qualifies)
    let mut best: Vec<(&Entitlement, bool)> = Vec::new();

    for row in rows {
        let row_active = row.is_active(now);
        match best
            .iter_mut()
            .find(|(chosen, _)| chosen.feature_code == row.feature_code)
        {
            None => best.push((row, row_active)),
            Some(entry) => {
                if rank(row) > rank(entry.0) {
                    entry.0 = row;
                }
                entry.1 |= row_active;
            }
        }
    }

    best.sort_by(|(a, _), (b, _)| a.feature_code.cmp(&b.feature_code));
    best.into_iter()
        .map(|(row, any_active)| EntitlementView {
            feature_code: row.feature_code.clone(),
            is_active: any_active,
            valid_from: row.valid_from,
            valid_to: row.valid_to,
            source: row.source,
        })
        .collect()
}

/// Comparison rank for choosing the winning row of a feature: latest
/// `valid_to` (`None` = +∞ ranks above any finite value), then source
/// precedence.
fn rank(row: &Entitlement) -> (i64, u8) {
    let valid_to_rank =
        row.valid_to.map_or(i64::MAX, |valid_to| valid_to.as_i64());
    (valid_to_rank, row.source.precedence())
}

#[inline]
fn window_contains(
    now: TimestampMs,
    valid_from: TimestampMs,
    valid_to: Option<TimestampMs>,
) -> bool {
    valid_from <= now && valid_to.map_or(true, |valid_to| now < valid_to)
}

/// Builds the wire response for a (tenant, user) pair from its rows.
pub fn aggregate_response(
    tenant_id: TenantId,
    user_id: UserId,
    rows: &[Entitlement],
    now: TimestampMs,
) -> EntitlementsResponse {
    EntitlementsResponse {
        tenant_id,
        user_id,
        entitlements: aggregate(rows, now),
        checked_at: now,
    }
}

// --- EntitlementEngine --- //

/// Wires the pure computation to storage and cache. Shared by the webhook
/// processor, the admin override operations, and the reconciler, so every
/// writer converges through the same code path.
pub struct EntitlementEngine {
    store: Store,
    cache: EntitlementCache,
    past_due_grace: Duration,
}

impl EntitlementEngine {
    pub fn new(
        store: Store,
        cache: EntitlementCache,
        past_due_grace: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            cache,
            past_due_grace,
        })
    }

    /// Recomputes and replaces the stored entitlements for (tenant, user).
    /// Returns the new rows.
    #[instrument(skip(self), name = "(recompute)")]
    pub async fn recompute(
        &self,
        tenant_id: &TenantId,
        user_id: &UserId,
        now: TimestampMs,
    ) -> anyhow::Result<Vec<Entitlement>> {
        let pool = self.store.pool();
        let subscriptions =
            db::subscriptions::grants_for_user(pool, tenant_id, user_id)
                .await?;
        let purchases =
            db::purchases::grants_for_user(pool, tenant_id, user_id).await?;
        let grants =
            db::grants::unrevoked_for_user(pool, tenant_id, user_id).await?;

        let rows = compute_rows(
            &subscriptions,
            &purchases,
            &grants,
            now,
            self.past_due_grace,
        );

        db::entitlements::replace_for_user(
            &self.store,
            tenant_id,
            user_id,
            &rows,
            now,
        )
        .await?;

        Ok(rows)
    }

    /// Recompute, then evict the cache entry for the pair. Eviction runs
    /// strictly after the replacement transaction commits; its failure is
    /// absorbed (readers self-correct at TTL).
    pub async fn recompute_and_evict(
        &self,
        tenant_id: &TenantId,
        user_id: &UserId,
        now: TimestampMs,
    ) -> anyhow::Result<Vec<Entitlement>> {
        let rows = self.recompute(tenant_id, user_id, now).await?;
        self.cache.evict(tenant_id, user_id).await;
        Ok(rows)
    }

    /// The tenant read path: cache, then database. Cache errors are
    /// treated as misses; a database failure is a real error (callers map
    /// it to 503 — access is never granted by default).
    pub async fn read(
        &self,
        tenant_id: &TenantId,
        user_id: &UserId,
        now: TimestampMs,
    ) -> anyhow::Result<EntitlementsResponse> {
        if let Some(cached) = self.cache.get(tenant_id, user_id).await {
            return Ok(cached);
        }

        let rows =
            db::entitlements::for_user(self.store.pool(), tenant_id, user_id)
                .await?;
        let response = aggregate_response(
            tenant_id.clone(),
            user_id.clone(),
            &rows,
            now,
        );
        self.cache.put(&response).await;
        Ok(response)
    }
}

#[cfg(test)]
mod test {
    use tollgate_common::ids::FeatureCode;

    use super::*;
    use crate::db::models::{Purchase, Subscription};

    fn ts(ms: i64) -> TimestampMs {
        TimestampMs::try_from_ms(ms).unwrap()
    }

    fn feature(code: &str) -> FeatureCode {
        code.parse().unwrap()
    }

    fn sub_grant(
        id: &str,
        status: SubscriptionStatus,
        period_start: i64,
        period_end: i64,
        features: &[&str],
    ) -> SubscriptionGrant {
        SubscriptionGrant {
            subscription: Subscription {
                provider_subscription_id: id.parse().unwrap(),
                tenant_id: "acme".parse().unwrap(),
                user_id: "u1".parse().unwrap(),
                price_id: "price_m".parse().unwrap(),
                status,
                current_period_start: ts(period_start),
                current_period_end: ts(period_end),
                cancel_at_period_end: false,
                canceled_at: None,
            },
            feature_codes: features.iter().map(|f| feature(f)).collect(),
        }
    }

    fn purchase_grant(
        id: &str,
        status: PurchaseStatus,
        valid_from: i64,
        valid_to: Option<i64>,
        features: &[&str],
    ) -> PurchaseGrant {
        PurchaseGrant {
            purchase: Purchase {
                provider_charge_id: id.parse().unwrap(),
                tenant_id: "acme".parse().unwrap(),
                user_id: "u1".parse().unwrap(),
                price_id: "price_l".parse().unwrap(),
                amount_minor: 999,
                currency: "usd".to_owned(),
                status,
                refunded_at: None,
                valid_from: ts(valid_from),
                valid_to: valid_to.map(ts),
            },
            feature_codes: features.iter().map(|f| feature(f)).collect(),
        }
    }

    fn manual(
        id: i64,
        valid_from: i64,
        valid_to: Option<i64>,
        revoked_at: Option<i64>,
        code: &str,
    ) -> ManualGrant {
        ManualGrant {
            id,
            tenant_id: "acme".parse().unwrap(),
            user_id: "u1".parse().unwrap(),
            feature_code: feature(code),
            valid_from: ts(valid_from),
            valid_to: valid_to.map(ts),
            reason: "trial".to_owned(),
            granted_by: "ops".to_owned(),
            granted_at: ts(valid_from),
            revoked_at: revoked_at.map(ts),
            revoked_by: revoked_at.map(|_| "ops".to_owned()),
            revoke_reason: None,
        }
    }

    const NO_GRACE: Duration = Duration::ZERO;

    #[test]
    fn active_subscription_grants_through_period() {
        let subs = [sub_grant(
            "sub_1",
            SubscriptionStatus::Active,
            1000,
            2000,
            &["pro", "teams"],
        )];
        let rows = compute_rows(&subs, &[], &[], ts(1500), NO_GRACE);
        assert_eq!(rows.len(), 2);
        for row in &rows {
            assert_eq!(row.source, EntitlementSource::Subscription);
            assert_eq!(row.source_ref, "sub_1");
            assert_eq!(row.valid_from, ts(1000));
            assert_eq!(row.valid_to, Some(ts(2000)));
        }
        assert_eq!(rows[0].feature_code, feature("pro"));
        assert_eq!(rows[1].feature_code, feature("teams"));
    }

    // A subscription with current_period_end == now is not active.
    #[test]
    fn subscription_period_end_is_exclusive()  {
        let subs = [sub_grant(
            "sub_1",
            SubscriptionStatus::Active,
            1000,
            2000,
            &["pro"],
        )];
        assert_eq!(compute_rows(&subs, &[], &[], ts(1999), NO_GRACE).len(), 1);
        assert!(compute_rows(&subs, &[], &[], ts(2000), NO_GRACE).is_empty());
        assert!(compute_rows(&subs, &[], &[], ts(2001), NO_GRACE).is_empty());
    }

    #[test]
    fn trialing_grants_but_terminal_statuses_do_not() {
        let grants = |status| {
            let subs = [sub_grant("sub_1", status, 1000, 2000, &["pro"])];
            compute_rows(&subs, &[], &[], ts(1500), NO_GRACE).len()
        };
        assert_eq!(grants(SubscriptionStatus::Active), 1);
        assert_eq!(grants(SubscriptionStatus::Trialing), 1);
        assert_eq!(grants(SubscriptionStatus::Canceled), 0);
        assert_eq!(grants(SubscriptionStatus::Unpaid), 0);
        assert_eq!(grants(SubscriptionStatus::Incomplete), 0);
        // past_due with zero grace: no window beyond period end, but the
        // period itself still applies.
        assert_eq!(grants(SubscriptionStatus::PastDue), 1);
    }

    #[test]
    fn past_due_grace_window() {
        let subs = [sub_grant(
            "sub_1",
            SubscriptionStatus::PastDue,
            1000,
            2000,
            &["pro"],
        )];
        let grace = Duration::from_millis(500);

        // Zero grace: inactive once the period ends.
        assert!(compute_rows(&subs, &[], &[], ts(2000), NO_GRACE).is_empty());

        // With grace: active until period_end + grace, exclusive.
        let rows = compute_rows(&subs, &[], &[], ts(2400), grace);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].valid_to, Some(ts(2500)));
        assert!(compute_rows(&subs, &[], &[], ts(2500), grace).is_empty());
    }

    #[test]
    fn purchase_windows() {
        // Lifetime purchase: active indefinitely.
        let lifetime = [purchase_grant(
            "ch_1",
            PurchaseStatus::Succeeded,
            1000,
            None,
            &["lifetime_x"],
        )];
        let rows =
            compute_rows(&[], &lifetime, &[], ts(i64::MAX - 1), NO_GRACE);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].valid_to, None);

        // Time-boxed purchase: inactive at valid_to and after.
        let boxed = [purchase_grant(
            "ch_2",
            PurchaseStatus::Succeeded,
            1000,
            Some(2000),
            &["boxed_x"],
        )];
        assert_eq!(compute_rows(&[], &boxed, &[], ts(1999), NO_GRACE).len(), 1);
        assert!(compute_rows(&[], &boxed, &[], ts(2000), NO_GRACE).is_empty());

        // Not yet valid.
        assert!(compute_rows(&[], &boxed, &[], ts(999), NO_GRACE).is_empty());

        // Only succeeded purchases grant.
        for status in [
            PurchaseStatus::Pending,
            PurchaseStatus::Failed,
            PurchaseStatus::Refunded,
        ] {
            let purchases =
                [purchase_grant("ch_3", status, 1000, None, &["x"])];
            assert!(
                compute_rows(&[], &purchases, &[], ts(1500), NO_GRACE)
                    .is_empty()
            );
        }
    }

    #[test]
    fn manual_grant_rules() {
        // Active grant contributes.
        let active = [manual(1, 1000, Some(2000), None, "pro")];
        let rows = compute_rows(&[], &[], &active, ts(1500), NO_GRACE);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].source, EntitlementSource::Manual);
        assert_eq!(rows[0].source_ref, "grant_1");

        // A grant revoked in the past is inactive regardless of window.
        let revoked = [manual(2, 1000, Some(2000), Some(1200), "pro")];
        assert!(compute_rows(&[], &[], &revoked, ts(1500), NO_GRACE).is_empty());
    }

    #[test]
    fn repeated_invocations_are_identical() {
        let subs = [
            sub_grant("sub_2", SubscriptionStatus::Active, 0, 5000, &["b", "a"]),
            sub_grant("sub_1", SubscriptionStatus::Trialing, 0, 4000, &["a"]),
        ];
        let purchases = [purchase_grant(
            "ch_1",
            PurchaseStatus::Succeeded,
            0,
            None,
            &["a", "c"],
        )];
        let grants = [manual(7, 0, None, None, "b")];
        let now = ts(1000);

        let rows1 = compute_rows(&subs, &purchases, &grants, now, NO_GRACE);
        let rows2 = compute_rows(&subs, &purchases, &grants, now, NO_GRACE);
        assert_eq!(rows1, rows2);

        // Canonical order: feature, then source precedence, then ref.
        let keys = rows1
            .iter()
            .map(|r| {
                (
                    r.feature_code.to_string(),
                    r.source.precedence(),
                    r.source_ref.clone(),
                )
            })
            .collect::<Vec<_>>();
        let mut sorted = keys.clone();
        sorted.sort();
        assert_eq!(keys, sorted);

        // Every contributing (feature, source, ref) is materialized:
        // a=sub_1, a=sub_2, a=ch_1, b=sub_2, b=grant_7, c=ch_1.
        assert_eq!(rows1.len(), 6);
    }

    #[test]
    fn empty_inputs_produce_no_rows() {
        assert!(compute_rows(&[], &[], &[], ts(1000), NO_GRACE).is_empty());
    }

    // --- aggregate --- //

    fn ent(
        code: &str,
        source: EntitlementSource,
        source_ref: &str,
        valid_from: i64,
        valid_to: Option<i64>,
    ) -> Entitlement {
        Entitlement {
            tenant_id: "acme".parse().unwrap(),
            user_id: "u1".parse().unwrap(),
            feature_code: feature(code),
            source,
            source_ref: source_ref.to_owned(),
            valid_from: ts(valid_from),
            valid_to: valid_to.map(ts),
            computed_at: ts(0),
        }
    }

    #[test]
    fn aggregate_latest_valid_to_wins() {
        use EntitlementSource::*;
        let rows = [
            ent("pro", Subscription, "sub_1", 0, Some(2000)),
            ent("pro", Purchase, "ch_1", 0, Some(3000)),
        ];
        let view = aggregate(&rows, ts(1000));
        assert_eq!(view.len(), 1);
        assert_eq!(view[0].source, Purchase);
        assert_eq!(view[0].valid_to, Some(ts(3000)));
        assert!(view[0].is_active);
    }

    #[test]
    fn aggregate_lifetime_beats_finite() {
        use EntitlementSource::*;
        let rows = [
            ent("pro", Manual, "grant_1", 0, Some(9000)),
            ent("pro", Subscription, "sub_1", 0, None),
        ];
        let view = aggregate(&rows, ts(1000));
        assert_eq!(view[0].source, Subscription);
        assert_eq!(view[0].valid_to, None);
    }

    #[test]
    fn aggregate_ties_break_by_source_precedence() {
        use EntitlementSource::*;
        let rows = [
            ent("pro", Subscription, "sub_1", 0, Some(2000)),
            ent("pro", Manual, "grant_1", 0, Some(2000)),
            ent("pro", Purchase, "ch_1", 0, Some(2000)),
        ];
        let view = aggregate(&rows, ts(1000));
        assert_eq!(view[0].source, Manual);

        let rows = [
            ent("pro", Subscription, "sub_1", 0, None),
            ent("pro", Purchase, "ch_1", 0, None),
        ];
        let view = aggregate(&rows, ts(1000));
        assert_eq!(view[0].source, Purchase);
    }

    #[test]
    fn aggregate_is_active_reflects_any_qualifying_row() {
        use EntitlementSource::*;
        // Stored rows can outlive their windows between recomputations;
        // the view must then report is_active = false.
        let rows = [ent("pro", Subscription, "sub_1", 0, Some(2000))];
        let view = aggregate(&rows, ts(2000));
        assert_eq!(view.len(), 1);
        assert!(!view[0].is_active);

        // One expired row + one qualifying row => active.
        let rows = [
            ent("pro", Subscription, "sub_1", 0, Some(2000)),
            ent("pro", Manual, "grant_1", 0, Some(1500)),
        ];
        let view = aggregate(&rows, ts(1600));
        assert!(view[0].is_active);
        // Winner is still the latest valid_to even though it's the sub.
        assert_eq!(view[0].source, Subscription);
    }

    #[test]
    fn aggregate_sorts_by_feature_code() {
        use EntitlementSource::*;
        let rows = [
            ent("zeta", Subscription, "sub_1", 0, None),
            ent("alpha", Manual, "grant_1", 0, None),
        ];
        let view = aggregate(&rows, ts(0));
        assert_eq!(view[0].feature_code, feature("alpha"));
        assert_eq!(view[1].feature_code, feature("zeta"));
    }
}
