//! Shared foundational types and utilities for the tollgate billing and
//! entitlements service.

/// Domain enums: subscription/purchase statuses, event outcomes, sources.
pub mod enums;
/// Environment variable helpers.
pub mod env;
/// Minimal hex encode/decode.
pub mod hex;
/// String id newtypes: tenants, users, feature codes, provider objects.
pub mod ids;
/// Global `tracing` logger configuration.
pub mod logger;
/// Graceful shutdown coordination with a recorded cause.
pub mod shutdown;
/// Named task handles and the join-until-shutdown loop.
pub mod task;
/// Millisecond Unix timestamps.
pub mod time;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
