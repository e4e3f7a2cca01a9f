//! Scheduled drift detection and repair.
//!
//! Once a day (at a configured UTC hour), the replica that wins the lease
//! sweeps provider-side subscriptions and charges modified within the
//! lookback window and repairs local drift: absent records are inserted
//! (when the provider-side metadata permits binding them), differing
//! records are overwritten with the provider's view. Every touched
//! (tenant, user) pair then goes through the same recomputation +
//! eviction path the webhook processors use, so both writers converge on
//! one code path.
//!
//! Partial failure is the normal case: an error on one record or one
//! tenant is counted and skipped, never aborting the run.

use std::{collections::BTreeSet, sync::Arc, time::Duration};

use tollgate_common::{
    ids::{TenantId, UserId},
    shutdown::Shutdown,
    task::NamedTask,
    time::TimestampMs,
};
use tracing::{info, info_span, instrument, warn};

use crate::{
    db::{
        self,
        models::{Purchase, Subscription},
        Store,
    },
    entitlements::EntitlementEngine,
    provider::{ProviderApi, RemoteCharge, RemoteSubscription},
};

/// How long a won lease suppresses other replicas. Well under the daily
/// cadence, well over a run's duration.
const LEASE_TTL: Duration = Duration::from_secs(60 * 60);

const MS_PER_DAY: i64 = 24 * 60 * 60 * 1000;
const MS_PER_HOUR: i64 = 60 * 60 * 1000;

/// Per-run counters, logged as the run summary.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ReconcileSummary {
    pub tenants: usize,
    pub records_checked: usize,
    pub inserted: usize,
    pub drift_corrected: usize,
    pub recomputed: usize,
    pub errors: usize,
}

pub struct Reconciler {
    store: Store,
    engine: Arc<EntitlementEngine>,
    provider: Arc<dyn ProviderApi>,
    hour_utc: u8,
    lookback: Duration,
    holder: String,
}

impl Reconciler {
    pub fn new(
        store: Store,
        engine: Arc<EntitlementEngine>,
        provider: Arc<dyn ProviderApi>,
        hour_utc: u8,
        lookback: Duration,
    ) -> Self {
        // Identifies this replica in the lease row, for debugging.
        let holder = format!("reconciler-{}", std::process::id());
        Self {
            store,
            engine,
            provider,
            hour_utc,
            lookback,
            holder,
        }
    }

    /// Spawns the scheduler loop. Owned by the application root; stops on
    /// shutdown.
    pub fn spawn(self, shutdown: Shutdown) -> NamedTask<()> {
        let span = info_span!(parent: None, "(reconciler)");
        NamedTask::spawn_with_span("reconciler", span.clone(), async move {
            loop {
                let now = TimestampMs::now();
                let next_run = next_run_after(now, self.hour_utc);
                let delay = next_run
                    .duration_since(now)
                    .unwrap_or(Duration::ZERO);
                info!("Next reconciliation at {next_run} (in {delay:?})");

                tokio::select! {
                    _ = shutdown.wait() => break,
                    () = tokio::time::sleep(delay) => (),
                }

                let now = TimestampMs::now();
                match db::lease::try_acquire(
                    self.store.pool(),
                    &self.holder,
                    now,
                    LEASE_TTL,
                )
                .await
                {
                    Ok(true) => (),
                    Ok(false) => {
                        info!("Another replica holds the lease; skipping");
                        continue;
                    }
                    Err(err) => {
                        warn!("Could not acquire lease: {err:#}");
                        continue;
                    }
                }

                let summary = self.run_once(now, &shutdown).await;
                info!("Reconciliation finished: {summary:?}");
            }
            info!("Reconciler shut down");
        })
    }

    /// One full reconciliation pass.
    #[instrument(skip_all, name = "(reconcile-run)")]
    pub async fn run_once(
        &self,
        now: TimestampMs,
        shutdown: &Shutdown,
    ) -> ReconcileSummary {
        let mut summary = ReconcileSummary::default();
        let since = now.saturating_sub(self.lookback);

        // One provider sweep per run; records are grouped to tenants by
        // the metadata the checkout component stamped on them.
        let remote_subs = match self.provider.list_subscriptions(since).await {
            Ok(records) => records,
            Err(err) => {
                warn!("Provider subscription sweep failed: {err}");
                summary.errors += 1;
                Vec::new()
            }
        };
        let remote_charges = match self.provider.list_charges(since).await {
            Ok(records) => records,
            Err(err) => {
                warn!("Provider charge sweep failed: {err}");
                summary.errors += 1;
                Vec::new()
            }
        };

        let tenants = match db::tenants::active_tenants(self.store.pool()).await
        {
            Ok(tenants) => tenants,
            Err(err) => {
                warn!("Could not enumerate tenants: {err:#}");
                summary.errors += 1;
                return summary;
            }
        };

        let mut touched = BTreeSet::new();

        for tenant in &tenants {
            if shutdown.is_triggered() {
                info!("Shutdown requested; aborting reconciliation");
                break;
            }
            summary.tenants += 1;

            for remote in remote_subs
                .iter()
                .filter(|r| r.tenant_id.as_ref() == Some(&tenant.tenant_id))
            {
                summary.records_checked += 1;
                match self.reconcile_subscription(remote).await {
                    Ok(Some(action)) => {
                        match action {
                            DriftAction::Inserted => summary.inserted += 1,
                            DriftAction::Overwritten =>
                                summary.drift_corrected += 1,
                        }
                        if let (Some(tenant_id), Some(user_id)) =
                            (&remote.tenant_id, &remote.user_id)
                        {
                            touched
                                .insert((tenant_id.clone(), user_id.clone()));
                        }
                    }
                    Ok(None) => (),
                    Err(err) => {
                        warn!(
                            "Could not reconcile subscription {}: {err:#}",
                            remote.id,
                        );
                        summary.errors += 1;
                    }
                }
            }

            for remote in remote_charges
                .iter()
                .filter(|r| r.tenant_id.as_ref() == Some(&tenant.tenant_id))
            {
                summary.records_checked += 1;
                match self.reconcile_charge(remote).await {
                    Ok(Some(action)) => {
                        match action {
                            DriftAction::Inserted => summary.inserted += 1,
                            DriftAction::Overwritten =>
                                summary.drift_corrected += 1,
                        }
                        if let (Some(tenant_id), Some(user_id)) =
                            (&remote.tenant_id, &remote.user_id)
                        {
                            touched
                                .insert((tenant_id.clone(), user_id.clone()));
                        }
                    }
                    Ok(None) => (),
                    Err(err) => {
                        warn!(
                            "Could not reconcile charge {}: {err:#}",
                            remote.id,
                        );
                        summary.errors += 1;
                    }
                }
            }
        }

        // Repair goes through the same recompute + evict path as the
        // webhook processors.
        for (tenant_id, user_id) in touched {
            match self
                .engine
                .recompute_and_evict(&tenant_id, &user_id, TimestampMs::now())
                .await
            {
                Ok(_) => summary.recomputed += 1,
                Err(err) => {
                    warn!(
                        "Recomputation failed for ({tenant_id}, {user_id}): \
                         {err:#}"
                    );
                    summary.errors += 1;
                }
            }
        }

        summary
    }

    /// Repairs one remote subscription. Returns what was done, if
    /// anything.
    async fn reconcile_subscription(
        &self,
        remote: &RemoteSubscription,
    ) -> anyhow::Result<Option<DriftAction>> {
        let local =
            db::subscriptions::by_provider_id(self.store.pool(), &remote.id)
                .await?;

        match local {
            None => {
                // Absent locally: insert, if the remote record carries
                // enough to bind it.
                let Some(sub) = self.bind_remote_subscription(remote).await?
                else {
                    return Ok(None);
                };
                db::subscriptions::upsert(self.store.pool(), &sub).await?;
                info!("Inserted missing subscription {}", remote.id);
                Ok(Some(DriftAction::Inserted))
            }
            Some(local) => {
                if !subscription_differs(&local, remote) {
                    return Ok(None);
                }
                let repaired = overwrite_subscription(local, remote);
                db::subscriptions::upsert(self.store.pool(), &repaired)
                    .await?;
                info!("Corrected drift on subscription {}", remote.id);
                Ok(Some(DriftAction::Overwritten))
            }
        }
    }

    /// Builds a local subscription from a remote record, resolving the
    /// price through the catalog. Returns `None` (skip, not an error)
    /// when the record lacks the metadata or price needed to bind it.
    async fn bind_remote_subscription(
        &self,
        remote: &RemoteSubscription,
    ) -> anyhow::Result<Option<Subscription>> {
        let (Some(tenant_id), Some(user_id), Some(provider_price_id)) = (
            remote.tenant_id.clone(),
            remote.user_id.clone(),
            remote.provider_price_id.clone(),
        ) else {
            warn!(
                "Remote subscription {} is missing binding metadata; \
                 skipping",
                remote.id,
            );
            return Ok(None);
        };

        let Some(price) = db::tenants::price_by_provider_id(
            self.store.pool(),
            &provider_price_id,
        )
        .await?
        else {
            warn!(
                "Remote subscription {} references unknown price {}; \
                 skipping",
                remote.id, provider_price_id,
            );
            return Ok(None);
        };

        let sub = Subscription {
            provider_subscription_id: remote.id.clone(),
            tenant_id,
            user_id,
            price_id: price.price_id,
            status: remote.status,
            current_period_start: remote.current_period_start,
            current_period_end: remote.current_period_end,
            cancel_at_period_end: remote.cancel_at_period_end,
            canceled_at: remote.canceled_at,
        };
        sub.validate()?;
        Ok(Some(sub))
    }

    async fn reconcile_charge(
        &self,
        remote: &RemoteCharge,
    ) -> anyhow::Result<Option<DriftAction>> {
        let local =
            db::purchases::by_provider_id(self.store.pool(), &remote.id)
                .await?;

        match local {
            None => {
                let Some(purchase) = self.bind_remote_charge(remote).await?
                else {
                    return Ok(None);
                };
                db::purchases::upsert(self.store.pool(), &purchase).await?;
                info!("Inserted missing purchase {}", remote.id);
                Ok(Some(DriftAction::Inserted))
            }
            Some(local) => {
                if !charge_differs(&local, remote) {
                    return Ok(None);
                }
                let repaired = overwrite_purchase(local, remote);
                db::purchases::upsert(self.store.pool(), &repaired).await?;
                info!("Corrected drift on purchase {}", remote.id);
                Ok(Some(DriftAction::Overwritten))
            }
        }
    }

    async fn bind_remote_charge(
        &self,
        remote: &RemoteCharge,
    ) -> anyhow::Result<Option<Purchase>> {
        let (Some(tenant_id), Some(user_id), Some(provider_price_id)) = (
            remote.tenant_id.clone(),
            remote.user_id.clone(),
            remote.provider_price_id.clone(),
        ) else {
            warn!(
                "Remote charge {} is missing binding metadata; skipping",
                remote.id,
            );
            return Ok(None);
        };

        let Some(price) = db::tenants::price_by_provider_id(
            self.store.pool(),
            &provider_price_id,
        )
        .await?
        else {
            warn!(
                "Remote charge {} references unknown price {}; skipping",
                remote.id, provider_price_id,
            );
            return Ok(None);
        };

        Ok(Some(Purchase {
            provider_charge_id: remote.id.clone(),
            tenant_id,
            user_id,
            price_id: price.price_id.clone(),
            amount_minor: remote.amount_minor,
            currency: remote.currency.clone(),
            status: remote.status,
            refunded_at: remote.refunded_at,
            valid_from: remote.created,
            valid_to: crate::events::processors::purchase_valid_to(
                remote.created,
                price.access_duration_days,
            ),
        }))
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum DriftAction {
    Inserted,
    Overwritten,
}

// --- Pure drift helpers --- //

/// Whether the provider's view of a subscription differs from ours in any
/// field the provider owns.
fn subscription_differs(
    local: &Subscription,
    remote: &RemoteSubscription,
) -> bool {
    local.status != remote.status
        || local.current_period_start != remote.current_period_start
        || local.current_period_end != remote.current_period_end
        || local.cancel_at_period_end != remote.cancel_at_period_end
        || local.canceled_at != remote.canceled_at
}

/// Overwrites the provider-owned fields, keeping the local binding
/// (tenant, user, price).
fn overwrite_subscription(
    mut local: Subscription,
    remote: &RemoteSubscription,
) -> Subscription {
    local.status = remote.status;
    local.current_period_start = remote.current_period_start;
    local.current_period_end = remote.current_period_end;
    local.cancel_at_period_end = remote.cancel_at_period_end;
    local.canceled_at = remote.canceled_at;
    local
}

fn charge_differs(local: &Purchase, remote: &RemoteCharge) -> bool {
    local.status != remote.status || local.refunded_at != remote.refunded_at
}

fn overwrite_purchase(mut local: Purchase, remote: &RemoteCharge) -> Purchase {
    local.status = remote.status;
    local.refunded_at = remote.refunded_at;
    local
}

/// The next timestamp strictly after `now` whose UTC time-of-day is
/// `hour_utc:00:00`.
fn next_run_after(now: TimestampMs, hour_utc: u8) -> TimestampMs {
    let now_ms = now.as_i64();
    let day_start = now_ms - now_ms.rem_euclid(MS_PER_DAY);
    let candidate = day_start + i64::from(hour_utc) * MS_PER_HOUR;
    let next = if candidate > now_ms {
        candidate
    } else {
        candidate + MS_PER_DAY
    };
    TimestampMs::try_from_ms(next).expect("non-negative by construction")
}
