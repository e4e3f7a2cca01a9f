//! The entitlement cache.
//!
//! Single-key protocol: `ent:{tenant_id}:{user_id}` maps to the JSON
//! serialization of the aggregated entitlement view. The TTL defaults to
//! 5 minutes.
//!
//! The cache is advisory; the database is the source of truth. Every
//! operation here fails open:
//!
//! - a failed GET is a miss (the reader recomputes from the database),
//! - a failed PUT is ignored,
//! - a failed DEL (eviction) is logged and the writer proceeds; readers
//!   self-correct once the TTL lapses.
//!
//! Writers must evict strictly *after* their transaction commits, and
//! never populate the cache from inside a transaction, so a reader can
//! never repopulate the cache with pre-commit data.

use std::time::Duration;

use anyhow::Context;
use redis::{aio::ConnectionManager, AsyncCommands};
use tollgate_api::models::EntitlementsResponse;
use tollgate_common::ids::{TenantId, UserId};
use tracing::{debug, warn};

#[derive(Clone)]
pub struct EntitlementCache {
    conn: ConnectionManager,
    ttl: Duration,
}

impl EntitlementCache {
    /// Connects to the cache. Startup fails if the cache is unreachable;
    /// once running, all operations fail open instead.
    pub async fn connect(url: &str, ttl: Duration) -> anyhow::Result<Self> {
        let client =
            redis::Client::open(url).context("Invalid CACHE_URL")?;
        let conn = ConnectionManager::new(client)
            .await
            .context("Could not connect to cache")?;
        Ok(Self { conn, ttl })
    }

    /// The cache key for a (tenant, user) pair.
    pub fn key(tenant_id: &TenantId, user_id: &UserId) -> String {
        format!("ent:{tenant_id}:{user_id}")
    }

    /// Cache read. Any error (connectivity, timeout, deserialization)
    /// degrades to a miss.
    pub async fn get(
        &self,
        tenant_id: &TenantId,
        user_id: &UserId,
    ) -> Option<EntitlementsResponse> {
        let key = Self::key(tenant_id, user_id);
        let mut conn = self.conn.clone();
        let value: Option<String> = match conn.get(&key).await {
            Ok(value) => value,
            Err(err) => {
                warn!("Cache GET failed for {key}: {err}");
                return None;
            }
        };
        let value = value?;
        match serde_json::from_str(&value) {
            Ok(response) => Some(response),
            Err(err) => {
                // A corrupt entry is as good as a miss; eviction or TTL
                // will replace it.
                warn!("Cache entry for {key} failed to deserialize: {err}");
                None
            }
        }
    }

    /// Best-effort cache population after a database read.
    pub async fn put(&self, response: &EntitlementsResponse) {
        let key = Self::key(&response.tenant_id, &response.user_id);
        let value = match serde_json::to_string(response) {
            Ok(value) => value,
            Err(err) => {
                warn!("Could not serialize cache entry for {key}: {err}");
                return;
            }
        };
        let mut conn = self.conn.clone();
        let result: redis::RedisResult<()> =
            conn.set_ex(&key, value, self.ttl.as_secs()).await;
        if let Err(err) = result {
            debug!("Cache PUT failed for {key}: {err}");
        }
    }

    /// Evicts the entry for a (tenant, user) pair. Called strictly after a
    /// state-changing transaction commits. A failed eviction is logged and
    /// otherwise ignored.
    pub async fn evict(&self, tenant_id: &TenantId, user_id: &UserId) {
        let key = Self::key(tenant_id, user_id);
        let mut conn = self.conn.clone();
        let result: redis::RedisResult<()> = conn.del(&key).await;
        if let Err(err) = result {
            warn!(
                "Cache eviction failed for {key}: {err}; \
                 readers will self-correct at TTL"
            );
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn key_protocol() {
        let tenant: TenantId = "acme".parse().unwrap();
        let user: UserId = "u_42".parse().unwrap();
        assert_eq!(EntitlementCache::key(&tenant, &user), "ent:acme:u_42");
    }
}
