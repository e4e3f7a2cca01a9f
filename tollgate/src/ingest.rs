//! The webhook ingest flow.
//!
//! One signed payload comes in; this module verifies the signature, parses
//! the envelope, persists the raw event keyed by `provider_event_id` (the
//! dedup point), dispatches to the processor for the event type, then runs
//! the post-commit sequence: (1) the processor's transaction has
//! committed, (2) entitlements are recomputed and the cache entry evicted,
//! (3) the raw event outcome is recorded.
//!
//! Response policy (mapped by the HTTP handler):
//!
//! - 200: processed, duplicate of a previously-succeeded event, unknown
//!   event type, or *permanent* failure (so the provider stops retrying).
//! - 400: body that cannot be parsed as an event envelope.
//! - 401: bad signature or stale timestamp.
//! - 503: transient infrastructure failure, inviting a retry.

use std::{sync::Arc, time::Duration};

use tollgate_api::{error::BillingApiError, models::WebhookAck};
use tollgate_common::{enums::EventOutcome, time::TimestampMs};
use tracing::{error, info, instrument, warn};

use crate::{
    db::{self, events::InsertEventOutcome, Store},
    entitlements::EntitlementEngine,
    events::{processors, ProviderEvent},
    webhook::{self, SignatureError},
};

pub struct Ingestor {
    store: Store,
    engine: Arc<EntitlementEngine>,
    signing_secret: Vec<u8>,
    skew_tolerance: Duration,
}

impl Ingestor {
    pub fn new(
        store: Store,
        engine: Arc<EntitlementEngine>,
        signing_secret: impl Into<Vec<u8>>,
        skew_tolerance: Duration,
    ) -> Self {
        Self {
            store,
            engine,
            signing_secret: signing_secret.into(),
            skew_tolerance,
        }
    }

    /// Handles one webhook delivery end to end.
    #[instrument(skip_all, name = "(webhook)")]
    pub async fn handle(
        &self,
        body: &[u8],
        signature_header: Option<&str>,
        now: TimestampMs,
    ) -> Result<WebhookAck, BillingApiError> {
        // 1. Verify the signature before touching the body.
        webhook::verify(
            signature_header,
            body,
            &self.signing_secret,
            now,
            self.skew_tolerance,
        )
        .map_err(|err| match err {
            SignatureError::Stale =>
                BillingApiError::stale_timestamp(err.to_string()),
            _ => BillingApiError::bad_signature(err.to_string()),
        })?;

        // 2. Parse just enough to extract the event id and type.
        let event = ProviderEvent::parse(body).map_err(|err| {
            BillingApiError::invalid_request(format!("{err:#}"))
        })?;

        // 3. Dedup on provider_event_id. The raw event row must exist
        //    before any processor transaction commits.
        let payload = String::from_utf8_lossy(body);
        let inserted = db::events::insert(
            self.store.pool(),
            &event.id,
            event.event_type.as_wire(),
            &payload,
            now,
        )
        .await
        .map_err(BillingApiError::database)?;

        match inserted {
            InsertEventOutcome::Inserted => (),
            InsertEventOutcome::DuplicateSucceeded => {
                info!("Duplicate of already-processed event {}", event.id);
                return Ok(WebhookAck::RECEIVED);
            }
            // Concurrent duplicate or provider retry of a failed attempt:
            // processors are idempotent, so run again.
            InsertEventOutcome::DuplicateRetryable => (),
        }

        // 4. Dispatch to the processor, then finish the post-commit
        //    sequence.
        match processors::process(&self.store, &event).await {
            Ok(processors::ProcessOutcome::Processed {
                tenant_id,
                user_id,
            }) => {
                // Recompute + evict after the processor's commit. A
                // failure here leaves committed state without fresh
                // entitlements, so invite a retry (the rerun is
                // idempotent).
                if let Err(err) = self
                    .engine
                    .recompute_and_evict(&tenant_id, &user_id, now)
                    .await
                {
                    warn!(
                        "Recomputation failed for ({tenant_id}, {user_id}): \
                         {err:#}"
                    );
                    self.record_outcome(&event, EventOutcome::FailedTransient)
                        .await;
                    return Err(BillingApiError::unavailable(
                        "Recomputation failed; retry",
                    ));
                }
                self.record_outcome(&event, EventOutcome::Succeeded).await;
                Ok(WebhookAck::RECEIVED)
            }
            Ok(processors::ProcessOutcome::Ignored) => {
                self.record_outcome(&event, EventOutcome::Succeeded).await;
                Ok(WebhookAck::RECEIVED)
            }
            Err(processors::ProcessError::Permanent(err)) => {
                // Acknowledge so the provider stops retrying, but keep the
                // full diagnostic.
                error!(
                    "Permanent failure processing event {}: {err:#}",
                    event.id,
                );
                self.record_outcome(&event, EventOutcome::FailedPermanent)
                    .await;
                Ok(WebhookAck::RECEIVED)
            }
            Err(processors::ProcessError::Transient(err)) => {
                warn!(
                    "Transient failure processing event {}: {err:#}",
                    event.id,
                );
                self.record_outcome(&event, EventOutcome::FailedTransient)
                    .await;
                Err(BillingApiError::unavailable(
                    "Transient failure; retry",
                ))
            }
        }
    }

    /// Records the processing outcome on the raw event. Failing to record
    /// is itself only logged: the next delivery re-runs the idempotent
    /// processor.
    async fn record_outcome(&self, event: &ProviderEvent, outcome: EventOutcome) {
        let result = db::events::record_outcome(
            self.store.pool(),
            &event.id,
            outcome,
            TimestampMs::now(),
        )
        .await;
        if let Err(err) = result {
            warn!("Could not record outcome for event {}: {err:#}", event.id);
        }
    }
}
