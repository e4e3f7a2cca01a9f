//! Service configuration.
//!
//! A single immutable [`Config`] is constructed once at startup from
//! environment variables and passed explicitly into constructors; there is
//! no ambient configuration state. Secrets are loaded once and never
//! re-read.

use std::{net::SocketAddr, time::Duration};

use anyhow::ensure;
use tollgate_common::env;

/// How long to wait for a pooled database connection.
pub const DB_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(5);
/// Per-statement timeout applied to every database session.
pub const DB_STATEMENT_TIMEOUT: Duration = Duration::from_secs(10);
/// Timeout for calls to the payment provider's API.
pub const PROVIDER_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Clone)]
pub struct Config {
    /// `BIND_ADDR`: socket address the API server listens on.
    pub bind_addr: SocketAddr,
    /// `DATABASE_URL`: Postgres connection string.
    pub database_url: String,
    /// `DB_MAX_CONNECTIONS`: connection pool size.
    pub db_max_connections: u32,
    /// `CACHE_URL`: Redis connection string.
    pub cache_url: String,
    /// `CACHE_TTL_SECS`: entitlement cache TTL. The reference value is 5
    /// minutes; overriding it changes only how long readers may observe
    /// stale data after a failed eviction.
    pub cache_ttl: Duration,
    /// `PROVIDER_API_URL`: base url of the payment provider's API.
    pub provider_api_url: String,
    /// `PROVIDER_SECRET_KEY`: secret key for the provider's API.
    pub provider_secret_key: String,
    /// `WEBHOOK_SIGNING_SECRET`: shared secret for webhook signatures.
    pub webhook_signing_secret: String,
    /// `WEBHOOK_SKEW_TOLERANCE_SECS`: maximum allowed age of a webhook
    /// signature timestamp; bounds the replay window.
    pub webhook_skew_tolerance: Duration,
    /// `ADMIN_TOKEN`: the elevated credential for admin endpoints,
    /// distinct from all tenant credentials.
    pub admin_token: String,
    /// `RECONCILE_ENABLED`: whether this replica runs the reconciler.
    pub reconcile_enabled: bool,
    /// `RECONCILE_HOUR_UTC`: hour of day (UTC) the reconciler runs at.
    pub reconcile_hour_utc: u8,
    /// `RECONCILE_LOOKBACK_DAYS`: how far back to sweep provider records.
    pub reconcile_lookback: Duration,
    /// `PAST_DUE_GRACE_SECS`: grace window granted to `past_due`
    /// subscriptions beyond `current_period_end`. Defaults to zero.
    pub past_due_grace: Duration,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        let bind_addr = env::parse_var_or::<SocketAddr>(
            "BIND_ADDR",
            "0.0.0.0:8080".parse().unwrap(),
        )?;
        let database_url = env::var("DATABASE_URL")?;
        let db_max_connections = env::parse_var_or("DB_MAX_CONNECTIONS", 10)?;
        let cache_url = env::var("CACHE_URL")?;
        let cache_ttl =
            Duration::from_secs(env::parse_var_or("CACHE_TTL_SECS", 300)?);
        let provider_api_url = env::var_or(
            "PROVIDER_API_URL",
            "https://api.payment-provider.example",
        );
        let provider_secret_key = env::var("PROVIDER_SECRET_KEY")?;
        let webhook_signing_secret = env::var("WEBHOOK_SIGNING_SECRET")?;
        let webhook_skew_tolerance = Duration::from_secs(env::parse_var_or(
            "WEBHOOK_SKEW_TOLERANCE_SECS",
            300,
        )?);
        let admin_token = env::var("ADMIN_TOKEN")?;
        let reconcile_enabled =
            env::parse_var_or("RECONCILE_ENABLED", false)?;
        let reconcile_hour_utc = env::parse_var_or("RECONCILE_HOUR_UTC", 4u8)?;
        let reconcile_lookback_days: u32 =
            env::parse_var_or("RECONCILE_LOOKBACK_DAYS", 7)?;
        let past_due_grace =
            Duration::from_secs(env::parse_var_or("PAST_DUE_GRACE_SECS", 0)?);

        ensure!(
            reconcile_hour_utc < 24,
            "RECONCILE_HOUR_UTC must be in 0..24, got {reconcile_hour_utc}"
        );
        ensure!(
            !webhook_signing_secret.is_empty(),
            "WEBHOOK_SIGNING_SECRET must be non-empty"
        );
        ensure!(!admin_token.is_empty(), "ADMIN_TOKEN must be non-empty");

        Ok(Self {
            bind_addr,
            database_url,
            db_max_connections,
            cache_url,
            cache_ttl,
            provider_api_url,
            provider_secret_key,
            webhook_signing_secret,
            webhook_skew_tolerance,
            admin_token,
            reconcile_enabled,
            reconcile_hour_utc,
            reconcile_lookback: Duration::from_secs(
                u64::from(reconcile_lookback_days) * 24 * 60 * 60,
            ),
            past_due_grace,
        })
    }
}

// The config carries several secrets; keep them out of Debug output.
impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("bind_addr", &self.bind_addr)
            .field("db_max_connections", &self.db_max_connections)
            .field("cache_ttl", &self.cache_ttl)
            .field("provider_api_url", &self.provider_api_url)
            .field("webhook_skew_tolerance", &self.webhook_skew_tolerance)
            .field("reconcile_enabled", &self.reconcile_enabled)
            .field("reconcile_hour_utc", &self.reconcile_hour_utc)
            .field("reconcile_lookback", &self.reconcile_lookback)
            .field("past_due_grace", &self.past_due_grace)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    // All env manipulation lives in one test to avoid racing over
    // process-global state.
    #[test]
    fn from_env_defaults_and_overrides() {
        std::env::set_var("DATABASE_URL", "postgres://localhost/tollgate");
        std::env::set_var("CACHE_URL", "redis://localhost");
        std::env::set_var("PROVIDER_SECRET_KEY", "sk_test_123");
        std::env::set_var("WEBHOOK_SIGNING_SECRET", "whsec_123");
        std::env::set_var("ADMIN_TOKEN", "admin_123");

        let config = Config::from_env().unwrap();
        assert_eq!(config.bind_addr, "0.0.0.0:8080".parse().unwrap());
        assert_eq!(config.cache_ttl, Duration::from_secs(300));
        assert_eq!(config.webhook_skew_tolerance, Duration::from_secs(300));
        assert!(!config.reconcile_enabled);
        assert_eq!(config.reconcile_hour_utc, 4);
        assert_eq!(
            config.reconcile_lookback,
            Duration::from_secs(7 * 24 * 60 * 60)
        );
        assert_eq!(config.past_due_grace, Duration::ZERO);

        std::env::set_var("RECONCILE_ENABLED", "true");
        std::env::set_var("RECONCILE_HOUR_UTC", "23");
        std::env::set_var("CACHE_TTL_SECS", "60");
        let config = Config::from_env().unwrap();
        assert!(config.reconcile_enabled);
        assert_eq!(config.reconcile_hour_utc, 23);
        assert_eq!(config.cache_ttl, Duration::from_secs(60));

        std::env::set_var("RECONCILE_HOUR_UTC", "24");
        assert!(Config::from_env().is_err());
        std::env::remove_var("RECONCILE_HOUR_UTC");

        // Debug output must not leak secrets.
        let config = Config::from_env().unwrap();
        let debug = format!("{config:?}");
        assert!(!debug.contains("sk_test_123"));
        assert!(!debug.contains("whsec_123"));
        assert!(!debug.contains("admin_123"));

        for name in [
            "DATABASE_URL",
            "CACHE_URL",
            "PROVIDER_SECRET_KEY",
            "WEBHOOK_SIGNING_SECRET",
            "ADMIN_TOKEN",
            "RECONCILE_ENABLED",
            "CACHE_TTL_SECS",
        ] {
            std::env::remove_var(name);
        }
    }
}
