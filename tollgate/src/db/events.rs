//! Accessors for ingested raw provider events.
//!
//! `provider_event_id` is the primary dedup key. The row must exist before
//! the processor's transaction commits, so the ingest path inserts it
//! first (outcome `pending`) and records the final outcome afterwards.

use anyhow::Context;
use sqlx::PgExecutor;
use tollgate_common::{
    enums::EventOutcome, ids::ProviderEventId, time::TimestampMs,
};

/// The result of attempting to insert a raw event.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum InsertEventOutcome {
    /// First time we've seen this event id; processing should proceed.
    Inserted,
    /// The event was already processed successfully; acknowledge without
    /// further work.
    DuplicateSucceeded,
    /// The event exists but is pending or previously failed transiently;
    /// this delivery is a concurrent duplicate or a provider retry, and
    /// processing should proceed (processors are idempotent).
    DuplicateRetryable,
}

pub async fn insert(
    db: impl PgExecutor<'_> + Copy,
    event_id: &ProviderEventId,
    event_type: &str,
    payload: &str,
    received_at: TimestampMs,
) -> anyhow::Result<InsertEventOutcome> {
    let result = sqlx::query(
        "INSERT INTO raw_events \
           (provider_event_id, event_type, payload, received_at, \
            processing_outcome, attempt_count) \
         VALUES ($1, $2, $3, $4, $5, 0) \
         ON CONFLICT (provider_event_id) DO NOTHING",
    )
    .bind(event_id.as_str())
    .bind(event_type)
    .bind(payload)
    .bind(received_at.as_i64())
    .bind(EventOutcome::Pending.as_str())
    .execute(db)
    .await
    .context("Could not insert raw event")?;

    if result.rows_affected() == 1 {
        return Ok(InsertEventOutcome::Inserted);
    }

    // The row already exists; look up its outcome.
    let outcome = sqlx::query_scalar::<_, String>(
        "SELECT processing_outcome FROM raw_events \
         WHERE provider_event_id = $1",
    )
    .bind(event_id.as_str())
    .fetch_optional(db)
    .await
    .context("Could not query existing raw event")?;

    match outcome.as_deref().map(str::parse::<EventOutcome>) {
        Some(Ok(EventOutcome::Succeeded)) =>
            Ok(InsertEventOutcome::DuplicateSucceeded),
        // `pending`, either failure, an unparseable outcome, or a row that
        // vanished between the two statements: let the idempotent
        // processor run again.
        _ => Ok(InsertEventOutcome::DuplicateRetryable),
    }
}

/// Records the outcome of one processing attempt.
pub async fn record_outcome(
    db: impl PgExecutor<'_>,
    event_id: &ProviderEventId,
    outcome: EventOutcome,
    processed_at: TimestampMs,
) -> anyhow::Result<()> {
    sqlx::query(
        "UPDATE raw_events \
         SET processing_outcome = $2, processed_at = $3, \
             attempt_count = attempt_count + 1 \
         WHERE provider_event_id = $1",
    )
    .bind(event_id.as_str())
    .bind(outcome.as_str())
    .bind(processed_at.as_i64())
    .execute(db)
    .await
    .context("Could not record event outcome")?;
    Ok(())
}
