//! Client for the payment provider's API, used by the reconciler.
//!
//! The reconciler only needs two sweeps: subscriptions and charges
//! modified within a lookback window. [`ProviderApi`] is the seam; the
//! real [`ProviderClient`] speaks the provider's paginated list endpoints
//! over HTTPS, and tests substitute an in-memory impl.

use std::{collections::HashMap, time::Duration};

use anyhow::Context;
use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;
use tollgate_common::{
    enums::{PurchaseStatus, SubscriptionStatus},
    ids::{
        ProviderChargeId, ProviderPriceId, ProviderSubscriptionId, TenantId,
        UserId,
    },
    time::TimestampMs,
};
use tracing::warn;

use crate::config::{Config, PROVIDER_TIMEOUT};

const PAGE_LIMIT: usize = 100;
/// Retry policy for one page fetch during a reconciliation sweep. A sweep
/// is daily and latency-insensitive, so a couple of short, doubling waits
/// is all that's worth spending before handing the failure to the run
/// summary (the next sweep covers the same lookback window anyway).
const MAX_ATTEMPTS: usize = 3;
const INITIAL_RETRY_WAIT: Duration = Duration::from_millis(500);

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("Error building provider request: {0}")]
    Building(String),
    #[error("Error connecting to the provider: {0}")]
    Connect(String),
    #[error("Provider request timed out: {0}")]
    Timeout(String),
    #[error("Provider returned HTTP {0}")]
    Status(u16),
    #[error("Error decoding provider response: {0}")]
    Decode(String),
}

impl ProviderError {
    /// Whether a retry within the same run could plausibly succeed.
    fn is_retryable(&self) -> bool {
        match self {
            Self::Connect(_) | Self::Timeout(_) => true,
            Self::Status(status) => *status >= 500,
            Self::Building(_) | Self::Decode(_) => false,
        }
    }
}

// Be more granular than just wrapping a general reqwest::Error.
impl From<reqwest::Error> for ProviderError {
    fn from(err: reqwest::Error) -> Self {
        let msg = format!("{err}");
        if err.is_builder() {
            Self::Building(msg)
        } else if err.is_timeout() {
            Self::Timeout(msg)
        } else if err.is_connect() {
            Self::Connect(msg)
        } else if err.is_decode() {
            Self::Decode(msg)
        } else {
            Self::Connect(msg)
        }
    }
}

/// A provider-side subscription record, as far as reconciliation cares.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RemoteSubscription {
    pub id: ProviderSubscriptionId,
    pub tenant_id: Option<TenantId>,
    pub user_id: Option<UserId>,
    pub provider_price_id: Option<ProviderPriceId>,
    pub status: SubscriptionStatus,
    pub current_period_start: TimestampMs,
    pub current_period_end: TimestampMs,
    pub cancel_at_period_end: bool,
    pub canceled_at: Option<TimestampMs>,
}

/// A provider-side charge record, as far as reconciliation cares.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RemoteCharge {
    pub id: ProviderChargeId,
    pub tenant_id: Option<TenantId>,
    pub user_id: Option<UserId>,
    pub provider_price_id: Option<ProviderPriceId>,
    pub amount_minor: i64,
    pub currency: String,
    pub status: PurchaseStatus,
    pub refunded_at: Option<TimestampMs>,
    pub created: TimestampMs,
}

/// The seam between the reconciler and the provider's API.
#[async_trait]
pub trait ProviderApi: Send + Sync {
    /// Subscriptions modified at or after `modified_since`.
    async fn list_subscriptions(
        &self,
        modified_since: TimestampMs,
    ) -> Result<Vec<RemoteSubscription>, ProviderError>;

    /// Charges modified at or after `modified_since`.
    async fn list_charges(
        &self,
        modified_since: TimestampMs,
    ) -> Result<Vec<RemoteCharge>, ProviderError>;
}

// --- Wire models --- //

#[derive(Deserialize)]
struct ListResponse<T> {
    data: Vec<T>,
    #[serde(default)]
    has_more: bool,
}

#[derive(Deserialize)]
struct WireSubscription {
    id: String,
    status: String,
    #[serde(default)]
    metadata: HashMap<String, String>,
    #[serde(default)]
    price: Option<String>,
    current_period_start: i64,
    current_period_end: i64,
    #[serde(default)]
    cancel_at_period_end: bool,
    #[serde(default)]
    canceled_at: Option<i64>,
}

#[derive(Deserialize)]
struct WireCharge {
    id: String,
    status: String,
    #[serde(default)]
    metadata: HashMap<String, String>,
    #[serde(default)]
    price: Option<String>,
    #[serde(default)]
    amount: i64,
    #[serde(default)]
    currency: String,
    #[serde(default)]
    refunded_at: Option<i64>,
    created: i64,
}

fn metadata_id<T: std::str::FromStr>(
    metadata: &HashMap<String, String>,
    key: &str,
) -> Option<T> {
    metadata.get(key).and_then(|value| value.parse().ok())
}

impl TryFrom<WireSubscription> for RemoteSubscription {
    type Error = anyhow::Error;
    fn try_from(wire: WireSubscription) -> anyhow::Result<Self> {
        Ok(Self {
            id: wire.id.parse().context("Bad subscription id")?,
            tenant_id: metadata_id(&wire.metadata, "tenant_id"),
            user_id: metadata_id(&wire.metadata, "user_id"),
            provider_price_id: wire
                .price
                .as_deref()
                .and_then(|price| price.parse().ok()),
            status: wire.status.parse().context("Bad subscription status")?,
            current_period_start: TimestampMs::try_from_secs(
                wire.current_period_start,
            )?,
            current_period_end: TimestampMs::try_from_secs(
                wire.current_period_end,
            )?,
            cancel_at_period_end: wire.cancel_at_period_end,
            canceled_at: wire
                .canceled_at
                .map(TimestampMs::try_from_secs)
                .transpose()?,
        })
    }
}

impl TryFrom<WireCharge> for RemoteCharge {
    type Error = anyhow::Error;
    fn try_from(wire: WireCharge) -> anyhow::Result<Self> {
        Ok(Self {
            id: wire.id.parse().context("Bad charge id")?,
            tenant_id: metadata_id(&wire.metadata, "tenant_id"),
            user_id: metadata_id(&wire.metadata, "user_id"),
            provider_price_id: wire
                .price
                .as_deref()
                .and_then(|price| price.parse().ok()),
            amount_minor: wire.amount,
            currency: wire.currency,
            status: wire.status.parse().context("Bad charge status")?,
            refunded_at: wire
                .refunded_at
                .map(TimestampMs::try_from_secs)
                .transpose()?,
            created: TimestampMs::try_from_secs(wire.created)?,
        })
    }
}

// --- ProviderClient --- //

pub struct ProviderClient {
    http: reqwest::Client,
    base_url: String,
    secret_key: String,
}

impl ProviderClient {
    pub fn new(config: &Config) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(PROVIDER_TIMEOUT)
            .build()
            .context("Could not build provider HTTP client")?;
        Ok(Self {
            http,
            base_url: config.provider_api_url.trim_end_matches('/').to_owned(),
            secret_key: config.provider_secret_key.clone(),
        })
    }

    /// One GET, retried per the sweep retry policy on retryable failures.
    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        url: &str,
    ) -> Result<T, ProviderError> {
        let mut wait = INITIAL_RETRY_WAIT;
        for attempt in 1..=MAX_ATTEMPTS {
            match self.get_json_once(url).await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_retryable() && attempt < MAX_ATTEMPTS => {
                    warn!(
                        "Provider request failed \
                         (attempt {attempt}/{MAX_ATTEMPTS}): {err}; \
                         retrying in {wait:?}"
                    );
                    tokio::time::sleep(wait).await;
                    wait = wait.saturating_mul(2);
                }
                Err(err) => return Err(err),
            }
        }
        unreachable!("loop returns on the final attempt")
    }

    async fn get_json_once<T: serde::de::DeserializeOwned>(
        &self,
        url: &str,
    ) -> Result<T, ProviderError> {
        let response = self
            .http
            .get(url)
            .bearer_auth(&self.secret_key)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(ProviderError::Status(status.as_u16()));
        }
        response
            .json::<T>()
            .await
            .map_err(|err| ProviderError::Decode(format!("{err}")))
    }

    /// Pages through a list endpoint, converting each record. Records that
    /// fail conversion are logged and skipped; one malformed remote record
    /// must not abort the sweep.
    async fn list_all<W, R>(
        &self,
        path: &str,
        modified_since: TimestampMs,
    ) -> Result<Vec<R>, ProviderError>
    where
        W: serde::de::DeserializeOwned + WireRecord,
        R: TryFrom<W, Error = anyhow::Error>,
    {
        let mut records = Vec::new();
        let mut starting_after: Option<String> = None;

        loop {
            let mut url = format!(
                "{}{path}?limit={PAGE_LIMIT}&modified_since={}",
                self.base_url,
                modified_since.as_secs(),
            );
            if let Some(cursor) = &starting_after {
                url.push_str("&starting_after=");
                url.push_str(cursor);
            }

            let page = self.get_json::<ListResponse<W>>(&url).await?;
            // The pagination cursor is the last *wire* record of the page,
            // regardless of whether it converts.
            let cursor = page.data.last().map(|wire| wire.id().to_owned());
            for wire in page.data {
                match R::try_from(wire) {
                    Ok(record) => records.push(record),
                    Err(err) =>
                        warn!("Skipping undecodable provider record: {err:#}"),
                }
            }

            match (page.has_more, cursor) {
                (true, Some(cursor)) => starting_after = Some(cursor),
                _ => break,
            }
        }

        Ok(records)
    }
}

/// Gives [`ProviderClient::list_all`] access to the pagination cursor.
trait WireRecord {
    fn id(&self) -> &str;
}

impl WireRecord for WireSubscription {
    fn id(&self) -> &str {
        &self.id
    }
}

impl WireRecord for WireCharge {
    fn id(&self) -> &str {
        &self.id
    }
}

#[async_trait]
impl ProviderApi for ProviderClient {
    async fn list_subscriptions(
        &self,
        modified_since: TimestampMs,
    ) -> Result<Vec<RemoteSubscription>, ProviderError> {
        self.list_all::<WireSubscription, RemoteSubscription>(
            "/v1/subscriptions",
            modified_since,
        )
        .await
    }

    async fn list_charges(
        &self,
        modified_since: TimestampMs,
    ) -> Result<Vec<RemoteCharge>, ProviderError> {
        self.list_all::<WireCharge, RemoteCharge>("/v1/charges", modified_since)
            .await
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn wire_subscription_conversion() {
        let json = serde_json::json!({
            "id": "sub_1",
            "status": "active",
            "metadata": { "tenant_id": "acme", "user_id": "u1" },
            "price": "pprice_1",
            "current_period_start": 1_700_000_000,
            "current_period_end": 1_702_592_000,
            "cancel_at_period_end": false,
        });
        let wire =
            serde_json::from_value::<WireSubscription>(json).unwrap();
        let remote = RemoteSubscription::try_from(wire).unwrap();
        assert_eq!(remote.id.as_str(), "sub_1");
        assert_eq!(remote.tenant_id.as_ref().unwrap().as_str(), "acme");
        assert_eq!(remote.user_id.as_ref().unwrap().as_str(), "u1");
        assert_eq!(remote.status, SubscriptionStatus::Active);
        assert_eq!(remote.canceled_at, None);
    }

    #[test]
    fn wire_subscription_without_metadata() {
        let json = serde_json::json!({
            "id": "sub_2",
            "status": "canceled",
            "current_period_start": 1_700_000_000,
            "current_period_end": 1_702_592_000,
            "canceled_at": 1_701_000_000,
        });
        let wire =
            serde_json::from_value::<WireSubscription>(json).unwrap();
        let remote = RemoteSubscription::try_from(wire).unwrap();
        assert_eq!(remote.tenant_id, None);
        assert_eq!(remote.user_id, None);
        assert_eq!(remote.status, SubscriptionStatus::Canceled);
        assert_eq!(
            remote.canceled_at,
            Some(TimestampMs::try_from_secs(1_701_000_000).unwrap()),
        );
    }

    #[test]
    fn wire_charge_conversion() {
        let json = serde_json::json!({
            "id": "ch_1",
            "status": "succeeded",
            "metadata": { "tenant_id": "acme", "user_id": "u1" },
            "price": "pprice_2",
            "amount": 4999,
            "currency": "usd",
            "created": 1_700_000_000,
        });
        let wire = serde_json::from_value::<WireCharge>(json).unwrap();
        let remote = RemoteCharge::try_from(wire).unwrap();
        assert_eq!(remote.id.as_str(), "ch_1");
        assert_eq!(remote.status, PurchaseStatus::Succeeded);
        assert_eq!(remote.refunded_at, None);
        assert_eq!(remote.amount_minor, 4999);
    }

    #[test]
    fn bad_wire_records_fail_conversion() {
        let json = serde_json::json!({
            "id": "sub_3",
            "status": "definitely_not_a_status",
            "current_period_start": 1,
            "current_period_end": 2,
        });
        let wire =
            serde_json::from_value::<WireSubscription>(json).unwrap();
        assert!(RemoteSubscription::try_from(wire).is_err());
    }
}
