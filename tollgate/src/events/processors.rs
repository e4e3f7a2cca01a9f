//! Per-event-type processors.
//!
//! Each processor runs its full state transition inside one database
//! transaction: it takes a `FOR UPDATE` lock on the subscription or
//! purchase row being mutated, derives the new row purely from the event
//! payload, and upserts it. The transaction commits only if the whole
//! transition succeeds.
//!
//! Processors are idempotent by construction: new row values derive from
//! the event payload alone (windows come from the provider's event
//! timestamps, never from the local clock), so replaying an event maps to
//! the same upsert.
//!
//! Failures are split into two result values mapped to HTTP at the
//! boundary:
//!
//! - [`ProcessError::Permanent`]: the payload is semantically invalid
//!   (missing metadata, unknown price, unknown checkout mode). The event
//!   is recorded as `failed_permanent` and acknowledged so the provider
//!   stops retrying.
//! - [`ProcessError::Transient`]: infrastructure failure or an event that
//!   arrived before the record it references (out-of-order delivery). The
//!   provider is invited to retry; the reconciler converges any remainder.

use anyhow::{anyhow, Context};
use thiserror::Error;
use tollgate_common::{
    enums::{PurchaseStatus, SubscriptionStatus},
    ids::{TenantId, UserId},
    time::TimestampMs,
};
use tracing::{debug, info, instrument};

use super::{
    ChargeObject, EventType, InvoiceObject, ProviderEvent, SessionObject,
    SubscriptionObject,
};
use crate::db::{
    self,
    models::{Price, Purchase, Subscription},
    Store,
};

/// What a successful processing pass did.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ProcessOutcome {
    /// State changed (or was re-asserted) for this pair; the caller must
    /// recompute entitlements and evict the cache entry.
    Processed {
        tenant_id: TenantId,
        user_id: UserId,
    },
    /// Nothing to do (unknown event type).
    Ignored,
}

#[derive(Debug, Error)]
pub enum ProcessError {
    /// The event can never be processed; acknowledge and stop retries.
    #[error("permanent processing failure: {0:#}")]
    Permanent(anyhow::Error),
    /// Infrastructure failure or out-of-order delivery; invite a retry.
    #[error("transient processing failure: {0:#}")]
    Transient(anyhow::Error),
}

fn permanent(err: impl Into<anyhow::Error>) -> ProcessError {
    ProcessError::Permanent(err.into())
}

fn transient(err: impl Into<anyhow::Error>) -> ProcessError {
    ProcessError::Transient(err.into())
}

/// Dispatches an event to the processor for its type.
#[instrument(skip_all, fields(event_id = %event.id, event_type = event.event_type.as_wire()))]
pub async fn process(
    store: &Store,
    event: &ProviderEvent,
) -> Result<ProcessOutcome, ProcessError> {
    match &event.event_type {
        EventType::CheckoutSessionCompleted =>
            checkout_session_completed(store, event).await,
        EventType::InvoicePaymentSucceeded =>
            invoice_payment_succeeded(store, event).await,
        EventType::SubscriptionUpdated =>
            subscription_updated(store, event).await,
        EventType::SubscriptionDeleted =>
            subscription_deleted(store, event).await,
        EventType::ChargeRefunded => charge_refunded(store, event).await,
        EventType::Unknown(event_type) => {
            debug!("Ignoring unknown event type '{event_type}'");
            Ok(ProcessOutcome::Ignored)
        }
    }
}

// --- checkout.session.completed --- //

async fn checkout_session_completed(
    store: &Store,
    event: &ProviderEvent,
) -> Result<ProcessOutcome, ProcessError> {
    let session = event.object_as::<SessionObject>().map_err(permanent)?;
    let (tenant_id, user_id) = session.metadata.require().map_err(permanent)?;

    match session.mode.as_str() {
        "subscription" => {
            let wire = session.subscription.as_ref().ok_or_else(|| {
                permanent(anyhow!(
                    "mode=subscription session has no subscription object"
                ))
            })?;

            let mut tx = store.begin().await.map_err(transient)?;
            let price =
                resolve_price(&mut tx, &wire.price, &tenant_id).await?;
            let sub = derive_subscription(&tenant_id, &user_id, &price, wire)
                .map_err(permanent)?;

            // Serialize concurrent processors for this subscription.
            db::subscriptions::lock_for_update(
                &mut tx,
                &sub.provider_subscription_id,
            )
            .await
            .map_err(transient)?;
            db::subscriptions::upsert(&mut *tx, &sub)
                .await
                .map_err(transient)?;
            tx.commit().await.map_err(transient)?;

            info!(
                "Upserted subscription {} for ({tenant_id}, {user_id})",
                sub.provider_subscription_id,
            );
            Ok(ProcessOutcome::Processed { tenant_id, user_id })
        }
        "payment" => {
            let wire = session.payment.as_ref().ok_or_else(|| {
                permanent(anyhow!(
                    "mode=payment session has no payment object"
                ))
            })?;

            let mut tx = store.begin().await.map_err(transient)?;
            let price =
                resolve_price(&mut tx, &wire.price, &tenant_id).await?;
            let purchase = derive_purchase(
                &tenant_id,
                &user_id,
                &price,
                wire,
                event.created,
            )
            .map_err(permanent)?;

            db::purchases::lock_for_update(
                &mut tx,
                &purchase.provider_charge_id,
            )
            .await
            .map_err(transient)?;
            db::purchases::upsert(&mut *tx, &purchase)
                .await
                .map_err(transient)?;
            tx.commit().await.map_err(transient)?;

            info!(
                "Upserted purchase {} for ({tenant_id}, {user_id})",
                purchase.provider_charge_id,
            );
            Ok(ProcessOutcome::Processed { tenant_id, user_id })
        }
        other => Err(permanent(anyhow!("Unknown checkout mode '{other}'"))),
    }
}

/// Resolves a provider price id against the local catalog and checks it
/// belongs to the event's tenant. An unknown or mismatched price is a
/// permanent failure: prices are operator-managed, so retrying cannot
/// help.
async fn resolve_price(
    tx: &mut sqlx::PgConnection,
    provider_price_id: &str,
    tenant_id: &TenantId,
) -> Result<Price, ProcessError> {
    let provider_price_id = provider_price_id
        .parse()
        .map_err(|err| permanent(anyhow!("Bad provider price id: {err}")))?;
    let price = db::tenants::price_by_provider_id(&mut *tx, &provider_price_id)
        .await
        .map_err(transient)?
        .ok_or_else(|| {
            permanent(anyhow!("Unknown price '{provider_price_id}'"))
        })?;
    if price.tenant_id != *tenant_id {
        return Err(permanent(anyhow!(
            "Price '{provider_price_id}' does not belong to the session's \
             tenant"
        )));
    }
    Ok(price)
}

// --- invoice.payment_succeeded --- //

async fn invoice_payment_succeeded(
    store: &Store,
    event: &ProviderEvent,
) -> Result<ProcessOutcome, ProcessError> {
    let invoice = event.object_as::<InvoiceObject>().map_err(permanent)?;
    let sub_id = invoice
        .subscription
        .parse()
        .map_err(|err| permanent(anyhow!("Bad subscription id: {err}")))?;

    let mut tx = store.begin().await.map_err(transient)?;
    let sub = db::subscriptions::lock_for_update(&mut tx, &sub_id)
        .await
        .map_err(transient)?
        // The renewal raced ahead of the checkout event; a provider retry
        // (or the reconciler) will land it once the subscription exists.
        .ok_or_else(|| {
            transient(anyhow!("Subscription '{sub_id}' not seen yet"))
        })?;

    let sub = apply_invoice_paid(sub, invoice.period_start, invoice.period_end)
        .map_err(permanent)?;
    db::subscriptions::upsert(&mut *tx, &sub)
        .await
        .map_err(transient)?;
    tx.commit().await.map_err(transient)?;

    info!("Advanced period for subscription {sub_id}");
    Ok(ProcessOutcome::Processed {
        tenant_id: sub.tenant_id,
        user_id: sub.user_id,
    })
}

// --- customer.subscription.updated --- //

async fn subscription_updated(
    store: &Store,
    event: &ProviderEvent,
) -> Result<ProcessOutcome, ProcessError> {
    let object = event.object_as::<SubscriptionObject>().map_err(permanent)?;
    let sub_id = object
        .id
        .parse()
        .map_err(|err| permanent(anyhow!("Bad subscription id: {err}")))?;

    let mut tx = store.begin().await.map_err(transient)?;
    let existing = db::subscriptions::lock_for_update(&mut tx, &sub_id)
        .await
        .map_err(transient)?;

    let sub = match existing {
        Some(sub) =>
            apply_subscription_update(sub, &object).map_err(permanent)?,
        // Never seen: bind it from the payload's own metadata if the
        // checkout component stamped it there, otherwise wait for the
        // checkout event (or the reconciler).
        None => {
            let (tenant_id, user_id) =
                object.metadata.require().map_err(|err| {
                    transient(err.context(format!(
                        "Subscription '{sub_id}' not seen yet and the \
                         payload has no usable metadata"
                    )))
                })?;
            let provider_price = object.price.as_deref().ok_or_else(|| {
                transient(anyhow!(
                    "Subscription '{sub_id}' not seen yet and the payload \
                     has no price"
                ))
            })?;
            let price =
                resolve_price(&mut tx, provider_price, &tenant_id).await?;
            derive_subscription_from_object(
                &tenant_id, &user_id, &price, &object,
            )
            .map_err(permanent)?
        }
    };

    db::subscriptions::upsert(&mut *tx, &sub)
        .await
        .map_err(transient)?;
    tx.commit().await.map_err(transient)?;

    info!("Reflected update for subscription {sub_id}");
    Ok(ProcessOutcome::Processed {
        tenant_id: sub.tenant_id,
        user_id: sub.user_id,
    })
}

// --- customer.subscription.deleted --- //

async fn subscription_deleted(
    store: &Store,
    event: &ProviderEvent,
) -> Result<ProcessOutcome, ProcessError> {
    let object = event.object_as::<SubscriptionObject>().map_err(permanent)?;
    let sub_id = object
        .id
        .parse()
        .map_err(|err| permanent(anyhow!("Bad subscription id: {err}")))?;

    let mut tx = store.begin().await.map_err(transient)?;
    let sub = db::subscriptions::lock_for_update(&mut tx, &sub_id)
        .await
        .map_err(transient)?
        .ok_or_else(|| {
            // Deleting a subscription we never saw grants nothing anyway;
            // retry until the checkout event lands or the provider gives
            // up, after which the reconciler converges.
            transient(anyhow!("Subscription '{sub_id}' not seen yet"))
        })?;

    let sub = apply_subscription_deleted(sub, event.created);
    db::subscriptions::upsert(&mut *tx, &sub)
        .await
        .map_err(transient)?;
    tx.commit().await.map_err(transient)?;

    info!("Canceled subscription {sub_id}");
    Ok(ProcessOutcome::Processed {
        tenant_id: sub.tenant_id,
        user_id: sub.user_id,
    })
}

// --- charge.refunded --- //

async fn charge_refunded(
    store: &Store,
    event: &ProviderEvent,
) -> Result<ProcessOutcome, ProcessError> {
    let charge = event.object_as::<ChargeObject>().map_err(permanent)?;
    let charge_id = charge
        .id
        .parse()
        .map_err(|err| permanent(anyhow!("Bad charge id: {err}")))?;

    let mut tx = store.begin().await.map_err(transient)?;
    let purchase = db::purchases::lock_for_update(&mut tx, &charge_id)
        .await
        .map_err(transient)?
        .ok_or_else(|| {
            transient(anyhow!("Purchase '{charge_id}' not seen yet"))
        })?;

    let purchase = apply_refund(purchase, event.created);
    db::purchases::upsert(&mut *tx, &purchase)
        .await
        .map_err(transient)?;
    tx.commit().await.map_err(transient)?;

    info!("Refunded purchase {charge_id}");
    Ok(ProcessOutcome::Processed {
        tenant_id: purchase.tenant_id,
        user_id: purchase.user_id,
    })
}

// --- Pure state-transition derivations --- //
//
// Everything below is a pure function of (existing row, event payload), so
// the idempotency property is testable without a database: deriving twice
// from the same payload yields identical rows.

fn derive_subscription(
    tenant_id: &TenantId,
    user_id: &UserId,
    price: &Price,
    wire: &super::SessionSubscription,
) -> anyhow::Result<Subscription> {
    let sub = Subscription {
        provider_subscription_id: wire
            .id
            .parse()
            .context("Bad provider subscription id")?,
        tenant_id: tenant_id.clone(),
        user_id: user_id.clone(),
        price_id: price.price_id.clone(),
        status: wire.status.parse().context("Bad subscription status")?,
        current_period_start: TimestampMs::try_from_secs(
            wire.current_period_start,
        )?,
        current_period_end: TimestampMs::try_from_secs(
            wire.current_period_end,
        )?,
        cancel_at_period_end: wire.cancel_at_period_end,
        canceled_at: None,
    };
    sub.validate()?;
    Ok(sub)
}

fn derive_subscription_from_object(
    tenant_id: &TenantId,
    user_id: &UserId,
    price: &Price,
    object: &SubscriptionObject,
) -> anyhow::Result<Subscription> {
    let sub = Subscription {
        provider_subscription_id: object
            .id
            .parse()
            .context("Bad provider subscription id")?,
        tenant_id: tenant_id.clone(),
        user_id: user_id.clone(),
        price_id: price.price_id.clone(),
        status: object.status.parse().context("Bad subscription status")?,
        current_period_start: TimestampMs::try_from_secs(
            object.current_period_start,
        )?,
        current_period_end: TimestampMs::try_from_secs(
            object.current_period_end,
        )?,
        cancel_at_period_end: object.cancel_at_period_end,
        canceled_at: object
            .canceled_at
            .map(TimestampMs::try_from_secs)
            .transpose()?,
    };
    sub.validate()?;
    Ok(sub)
}

fn derive_purchase(
    tenant_id: &TenantId,
    user_id: &UserId,
    price: &Price,
    wire: &super::SessionPayment,
    event_time: TimestampMs,
) -> anyhow::Result<Purchase> {
    Ok(Purchase {
        provider_charge_id: wire
            .charge
            .parse()
            .context("Bad provider charge id")?,
        tenant_id: tenant_id.clone(),
        user_id: user_id.clone(),
        price_id: price.price_id.clone(),
        amount_minor: wire.amount,
        currency: wire.currency.clone(),
        status: PurchaseStatus::Succeeded,
        refunded_at: None,
        // The window derives from the event timestamp, not the local
        // clock, so replays produce identical rows.
        valid_from: event_time,
        valid_to: purchase_valid_to(event_time, price.access_duration_days),
    })
}

/// Derives a purchase's `valid_to` from the price's access policy:
/// `None` (lifetime) or a window of whole days from the purchase time.
pub(crate) fn purchase_valid_to(
    valid_from: TimestampMs,
    access_duration_days: Option<i32>,
) -> Option<TimestampMs> {
    access_duration_days.map(|days| {
        let days = u64::try_from(days).unwrap_or(0);
        valid_from
            .saturating_add(std::time::Duration::from_secs(days * 24 * 60 * 60))
    })
}

/// `invoice.payment_succeeded`: advance the period window; a previously
/// `past_due` or `trialing` subscription becomes `active`.
fn apply_invoice_paid(
    mut sub: Subscription,
    period_start: Option<i64>,
    period_end: i64,
) -> anyhow::Result<Subscription> {
    if let Some(period_start) = period_start {
        sub.current_period_start = TimestampMs::try_from_secs(period_start)?;
    }
    sub.current_period_end = TimestampMs::try_from_secs(period_end)?;
    if matches!(
        sub.status,
        SubscriptionStatus::PastDue | SubscriptionStatus::Trialing
    ) {
        sub.status = SubscriptionStatus::Active;
    }
    sub.validate()?;
    Ok(sub)
}

/// `customer.subscription.updated`: reflect status, period window, and
/// `cancel_at_period_end` from the payload.
fn apply_subscription_update(
    mut sub: Subscription,
    object: &SubscriptionObject,
) -> anyhow::Result<Subscription> {
    sub.status = object.status.parse().context("Bad subscription status")?;
    sub.current_period_start =
        TimestampMs::try_from_secs(object.current_period_start)?;
    sub.current_period_end =
        TimestampMs::try_from_secs(object.current_period_end)?;
    sub.cancel_at_period_end = object.cancel_at_period_end;
    if let Some(canceled_at) = object.canceled_at {
        sub.canceled_at = Some(TimestampMs::try_from_secs(canceled_at)?);
    }
    sub.validate()?;
    Ok(sub)
}

/// `customer.subscription.deleted`: status becomes `canceled` at the
/// event time.
fn apply_subscription_deleted(
    mut sub: Subscription,
    event_time: TimestampMs,
) -> Subscription {
    sub.status = SubscriptionStatus::Canceled;
    sub.canceled_at = Some(event_time);
    sub
}

/// `charge.refunded`: status becomes `refunded` at the event time.
fn apply_refund(mut purchase: Purchase, event_time: TimestampMs) -> Purchase {
    purchase.status = PurchaseStatus::Refunded;
    purchase.refunded_at = Some(event_time);
    purchase
}

#[cfg(test)]
mod test {
    use tollgate_common::enums::PriceCadence;

    use super::*;

    fn ts(secs: i64) -> TimestampMs {
        TimestampMs::try_from_secs(secs).unwrap()
    }

    fn price(access_duration_days: Option<i32>) -> Price {
        Price {
            tenant_id: "acme".parse().unwrap(),
            price_id: "price_m".parse().unwrap(),
            product_id: "prod_1".parse().unwrap(),
            provider_price_id: "pprice_1".parse().unwrap(),
            amount_minor: 999,
            currency: "usd".to_owned(),
            cadence: PriceCadence::Month,
            access_duration_days,
        }
    }

    fn session_subscription() -> super::super::SessionSubscription {
        super::super::SessionSubscription {
            id: "sub_1".to_owned(),
            price: "pprice_1".to_owned(),
            status: "active".to_owned(),
            current_period_start: 1_700_000_000,
            current_period_end: 1_702_592_000,
            cancel_at_period_end: false,
        }
    }

    #[test]
    fn derive_subscription_is_idempotent() {
        let tenant = "acme".parse().unwrap();
        let user = "u1".parse().unwrap();
        let price = price(None);
        let wire = session_subscription();

        let sub1 =
            derive_subscription(&tenant, &user, &price, &wire).unwrap();
        let sub2 =
            derive_subscription(&tenant, &user, &price, &wire).unwrap();
        assert_eq!(sub1, sub2);

        assert_eq!(sub1.provider_subscription_id.as_str(), "sub_1");
        assert_eq!(sub1.status, SubscriptionStatus::Active);
        assert_eq!(sub1.current_period_start, ts(1_700_000_000));
        assert_eq!(sub1.current_period_end, ts(1_702_592_000));
    }

    #[test]
    fn derive_subscription_rejects_bad_payloads() {
        let tenant = "acme".parse().unwrap();
        let user = "u1".parse().unwrap();
        let price = price(None);

        let mut bad_status = session_subscription();
        bad_status.status = "exploded".to_owned();
        assert!(
            derive_subscription(&tenant, &user, &price, &bad_status).is_err()
        );

        // Period inverted violates the data invariant.
        let mut inverted = session_subscription();
        inverted.current_period_end = inverted.current_period_start - 1;
        assert!(
            derive_subscription(&tenant, &user, &price, &inverted).is_err()
        );
    }

    #[test]
    fn derive_purchase_windows_from_price_policy() {
        let tenant = "acme".parse().unwrap();
        let user = "u1".parse().unwrap();
        let wire = super::super::SessionPayment {
            charge: "ch_1".to_owned(),
            price: "pprice_1".to_owned(),
            amount: 4999,
            currency: "usd".to_owned(),
        };
        let event_time = ts(1_700_000_000);

        // Lifetime price: valid_to is None.
        let lifetime =
            derive_purchase(&tenant, &user, &price(None), &wire, event_time)
                .unwrap();
        assert_eq!(lifetime.valid_from, event_time);
        assert_eq!(lifetime.valid_to, None);
        assert_eq!(lifetime.status, PurchaseStatus::Succeeded);

        // Time-boxed price: valid_to = valid_from + days.
        let boxed = derive_purchase(
            &tenant,
            &user,
            &price(Some(30)),
            &wire,
            event_time,
        )
        .unwrap();
        assert_eq!(
            boxed.valid_to,
            Some(ts(1_700_000_000 + 30 * 24 * 60 * 60)),
        );

        // Identical on replay.
        let replay = derive_purchase(
            &tenant,
            &user,
            &price(Some(30)),
            &wire,
            event_time,
        )
        .unwrap();
        assert_eq!(boxed, replay);
    }

    fn existing_subscription() -> Subscription {
        Subscription {
            provider_subscription_id: "sub_1".parse().unwrap(),
            tenant_id: "acme".parse().unwrap(),
            user_id: "u1".parse().unwrap(),
            price_id: "price_m".parse().unwrap(),
            status: SubscriptionStatus::PastDue,
            current_period_start: ts(1_700_000_000),
            current_period_end: ts(1_702_592_000),
            cancel_at_period_end: false,
            canceled_at: None,
        }
    }

    #[test]
    fn invoice_paid_advances_period_and_reactivates() {
        let sub = existing_subscription();
        let updated =
            apply_invoice_paid(sub, None, 1_705_184_000).unwrap();
        assert_eq!(updated.status, SubscriptionStatus::Active);
        assert_eq!(updated.current_period_end, ts(1_705_184_000));
        // Start untouched when the payload omits it.
        assert_eq!(updated.current_period_start, ts(1_700_000_000));

        // Applying the same invoice again changes nothing.
        let replayed =
            apply_invoice_paid(updated.clone(), None, 1_705_184_000).unwrap();
        assert_eq!(updated, replayed);

        // An already-canceled subscription keeps its status.
        let mut canceled = existing_subscription();
        canceled.status = SubscriptionStatus::Canceled;
        let updated =
            apply_invoice_paid(canceled, None, 1_705_184_000).unwrap();
        assert_eq!(updated.status, SubscriptionStatus::Canceled);
    }

    #[test]
    fn subscription_update_reflects_payload() {
        let object = SubscriptionObject {
            id: "sub_1".to_owned(),
            status: "active".to_owned(),
            current_period_start: 1_702_592_000,
            current_period_end: 1_705_184_000,
            cancel_at_period_end: true,
            canceled_at: None,
            price: None,
            metadata: Default::default(),
        };
        let updated =
            apply_subscription_update(existing_subscription(), &object)
                .unwrap();
        assert_eq!(updated.status, SubscriptionStatus::Active);
        assert_eq!(updated.current_period_start, ts(1_702_592_000));
        assert_eq!(updated.current_period_end, ts(1_705_184_000));
        assert!(updated.cancel_at_period_end);

        let replayed =
            apply_subscription_update(updated.clone(), &object).unwrap();
        assert_eq!(updated, replayed);
    }

    #[test]
    fn deletion_and_refund_are_idempotent() {
        let at = ts(1_700_000_500);

        let once = apply_subscription_deleted(existing_subscription(), at);
        let twice = apply_subscription_deleted(once.clone(), at);
        assert_eq!(once, twice);
        assert_eq!(once.status, SubscriptionStatus::Canceled);
        assert_eq!(once.canceled_at, Some(at));

        let purchase = Purchase {
            provider_charge_id: "ch_1".parse().unwrap(),
            tenant_id: "acme".parse().unwrap(),
            user_id: "u1".parse().unwrap(),
            price_id: "price_l".parse().unwrap(),
            amount_minor: 4999,
            currency: "usd".to_owned(),
            status: PurchaseStatus::Succeeded,
            refunded_at: None,
            valid_from: ts(1_699_000_000),
            valid_to: None,
        };
        let once = apply_refund(purchase, at);
        let twice = apply_refund(once.clone(), at);
        assert_eq!(once, twice);
        assert_eq!(once.status, PurchaseStatus::Refunded);
        assert_eq!(once.refunded_at, Some(at));
    }

    #[test]
    fn purchase_valid_to_policy() {
        let from = ts(1_700_000_000);
        assert_eq!(purchase_valid_to(from, None), None);
        assert_eq!(
            purchase_valid_to(from, Some(1)),
            Some(ts(1_700_000_000 + 86_400)),
        );
        // A non-positive duration collapses to an empty window rather
        // than panicking.
        assert_eq!(purchase_valid_to(from, Some(-3)), Some(from));
    }
}
