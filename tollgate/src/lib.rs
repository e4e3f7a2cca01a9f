//! The tollgate billing and entitlements service.
//!
//! Tollgate brokers a third-party payment provider for a portfolio of
//! tenant micro-applications. Its core is the entitlement state machine:
//! provider webhook events are ingested idempotently, converted into
//! persisted subscription / purchase / refund records, and each affected
//! user's effective entitlements are recomputed from the union of three
//! independent sources (subscriptions, one-time purchases, manual grants)
//! and served fast behind a coherency-preserving cache.
//!
//! The provider remains the transactional system of record for money
//! movement; the local database is the system of record for entitlements.

/// Admin grant / revoke operations.
pub mod admin;
/// Credential hashing, tenant resolution, tenant-scope enforcement.
pub mod auth;
/// The entitlement cache and its invalidation protocol.
pub mod cache;
/// Service configuration, read once from the environment.
pub mod config;
/// Typed database accessors and transactional boundaries.
pub mod db;
/// Entitlement computation: the pure engine and the recompute path.
pub mod entitlements;
/// Per-event-type processors: provider events -> persisted state.
pub mod events;
/// The webhook ingest flow: verify, dedupe, dispatch, recompute.
pub mod ingest;
/// Provider API client used by the reconciler.
pub mod provider;
/// Scheduled drift detection and repair.
pub mod reconciler;
/// The application root: init, run, shutdown.
pub mod run;
/// HTTP routers and handlers.
pub mod server;
/// Webhook signature scheme.
pub mod webhook;
