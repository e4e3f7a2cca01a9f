//! Provider event parsing.
//!
//! A provider notification is a JSON envelope:
//!
//! ```json
//! {
//!   "id": "evt_123",
//!   "type": "customer.subscription.updated",
//!   "created": 1700000000,
//!   "data": { "object": { ... } }
//! }
//! ```
//!
//! The ingest path parses only the envelope; each processor deserializes
//! `data.object` into its own payload model. Event types are dispatched
//! through a static registry ([`EventType`]): unknown types map to
//! [`EventType::Unknown`] and are persisted and acknowledged without
//! further effect.

pub mod processors;

use anyhow::Context;
use serde::Deserialize;
use tollgate_common::{
    ids::{TenantId, UserId},
    time::TimestampMs,
};

/// The event types this service reacts to.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum EventType {
    CheckoutSessionCompleted,
    InvoicePaymentSucceeded,
    SubscriptionUpdated,
    SubscriptionDeleted,
    ChargeRefunded,
    /// Anything else; persisted, acknowledged, no effect.
    Unknown(String),
}

impl EventType {
    pub fn from_wire(s: &str) -> Self {
        match s {
            "checkout.session.completed" => Self::CheckoutSessionCompleted,
            "invoice.payment_succeeded" => Self::InvoicePaymentSucceeded,
            "customer.subscription.updated" => Self::SubscriptionUpdated,
            "customer.subscription.deleted" => Self::SubscriptionDeleted,
            "charge.refunded" => Self::ChargeRefunded,
            other => Self::Unknown(other.to_owned()),
        }
    }

    pub fn as_wire(&self) -> &str {
        match self {
            Self::CheckoutSessionCompleted => "checkout.session.completed",
            Self::InvoicePaymentSucceeded => "invoice.payment_succeeded",
            Self::SubscriptionUpdated => "customer.subscription.updated",
            Self::SubscriptionDeleted => "customer.subscription.deleted",
            Self::ChargeRefunded => "charge.refunded",
            Self::Unknown(other) => other,
        }
    }
}

/// A parsed provider event envelope.
#[derive(Clone, Debug)]
pub struct ProviderEvent {
    pub id: tollgate_common::ids::ProviderEventId,
    pub event_type: EventType,
    /// When the provider created the event (their clock).
    pub created: TimestampMs,
    /// The `data.object` payload, deserialized per event type by each
    /// processor.
    pub object: serde_json::Value,
}

#[derive(Deserialize)]
struct Envelope {
    id: String,
    #[serde(rename = "type")]
    event_type: String,
    created: i64,
    #[serde(default)]
    data: EnvelopeData,
}

#[derive(Default, Deserialize)]
struct EnvelopeData {
    #[serde(default)]
    object: serde_json::Value,
}

impl ProviderEvent {
    /// Parses the envelope from a raw webhook body.
    pub fn parse(body: &[u8]) -> anyhow::Result<Self> {
        let envelope = serde_json::from_slice::<Envelope>(body)
            .context("Event envelope is not valid JSON")?;
        Ok(Self {
            id: envelope.id.parse().context("Bad provider event id")?,
            event_type: EventType::from_wire(&envelope.event_type),
            created: TimestampMs::try_from_secs(envelope.created)
                .context("Bad event timestamp")?,
            object: envelope.data.object,
        })
    }

    /// Deserializes `data.object` into a processor's payload model.
    pub fn object_as<T: serde::de::DeserializeOwned>(
        &self,
    ) -> anyhow::Result<T> {
        serde_json::from_value(self.object.clone())
            .context("Event object does not match the expected shape")
    }
}

// --- Payload models --- //

/// Tenant/user association stamped onto provider-side objects by the
/// external checkout/portal creation component. Processors must never
/// guess: events without the required metadata fail permanently.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct Metadata {
    #[serde(default)]
    pub tenant_id: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
}

impl Metadata {
    /// Extracts the required (tenant, user) binding, or explains exactly
    /// which part is missing or malformed.
    pub fn require(&self) -> anyhow::Result<(TenantId, UserId)> {
        let tenant = self
            .tenant_id
            .as_deref()
            .context("Metadata is missing tenant_id")?
            .parse::<TenantId>()
            .context("Metadata tenant_id is malformed")?;
        let user = self
            .user_id
            .as_deref()
            .context("Metadata is missing user_id")?
            .parse::<UserId>()
            .context("Metadata user_id is malformed")?;
        Ok((tenant, user))
    }
}

/// `data.object` for `checkout.session.completed`.
#[derive(Clone, Debug, Deserialize)]
pub struct SessionObject {
    pub mode: String,
    #[serde(default)]
    pub metadata: Metadata,
    /// Present when `mode == "subscription"`.
    #[serde(default)]
    pub subscription: Option<SessionSubscription>,
    /// Present when `mode == "payment"`.
    #[serde(default)]
    pub payment: Option<SessionPayment>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct SessionSubscription {
    pub id: String,
    pub price: String,
    pub status: String,
    pub current_period_start: i64,
    pub current_period_end: i64,
    #[serde(default)]
    pub cancel_at_period_end: bool,
}

#[derive(Clone, Debug, Deserialize)]
pub struct SessionPayment {
    pub charge: String,
    pub price: String,
    pub amount: i64,
    pub currency: String,
}

/// `data.object` for `invoice.payment_succeeded`.
#[derive(Clone, Debug, Deserialize)]
pub struct InvoiceObject {
    pub subscription: String,
    #[serde(default)]
    pub period_start: Option<i64>,
    pub period_end: i64,
}

/// `data.object` for `customer.subscription.updated` / `.deleted`.
#[derive(Clone, Debug, Deserialize)]
pub struct SubscriptionObject {
    pub id: String,
    pub status: String,
    pub current_period_start: i64,
    pub current_period_end: i64,
    #[serde(default)]
    pub cancel_at_period_end: bool,
    #[serde(default)]
    pub canceled_at: Option<i64>,
    /// The provider price id; present on provider-originated payloads.
    #[serde(default)]
    pub price: Option<String>,
    #[serde(default)]
    pub metadata: Metadata,
}

/// `data.object` for `charge.refunded`.
#[derive(Clone, Debug, Deserialize)]
pub struct ChargeObject {
    pub id: String,
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn event_type_registry_roundtrip() {
        let known = [
            "checkout.session.completed",
            "invoice.payment_succeeded",
            "customer.subscription.updated",
            "customer.subscription.deleted",
            "charge.refunded",
        ];
        for wire in known {
            let event_type = EventType::from_wire(wire);
            assert!(!matches!(event_type, EventType::Unknown(_)));
            assert_eq!(event_type.as_wire(), wire);
        }

        let unknown = EventType::from_wire("invoice.finalized");
        assert_eq!(
            unknown,
            EventType::Unknown("invoice.finalized".to_owned())
        );
        assert_eq!(unknown.as_wire(), "invoice.finalized");
    }

    #[test]
    fn parse_envelope() {
        let body = br#"{
            "id": "evt_1",
            "type": "charge.refunded",
            "created": 1700000000,
            "data": { "object": { "id": "ch_1" } }
        }"#;
        let event = ProviderEvent::parse(body).unwrap();
        assert_eq!(event.id.as_str(), "evt_1");
        assert_eq!(event.event_type, EventType::ChargeRefunded);
        assert_eq!(event.created.as_secs(), 1_700_000_000);

        let charge = event.object_as::<ChargeObject>().unwrap();
        assert_eq!(charge.id, "ch_1");
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!(ProviderEvent::parse(b"not json").is_err());
        assert!(ProviderEvent::parse(b"{}").is_err());
        // Negative timestamp
        let body = br#"{"id":"evt_1","type":"x","created":-1}"#;
        assert!(ProviderEvent::parse(body).is_err());
        // Empty event id
        let body = br#"{"id":"","type":"x","created":1}"#;
        assert!(ProviderEvent::parse(body).is_err());
    }

    #[test]
    fn metadata_require() {
        let both = Metadata {
            tenant_id: Some("acme".to_owned()),
            user_id: Some("u1".to_owned()),
        };
        let (tenant, user) = both.require().unwrap();
        assert_eq!(tenant.as_str(), "acme");
        assert_eq!(user.as_str(), "u1");

        let missing_user = Metadata {
            tenant_id: Some("acme".to_owned()),
            user_id: None,
        };
        let err = missing_user.require().unwrap_err();
        assert!(format!("{err:#}").contains("user_id"));

        let bad_tenant = Metadata {
            tenant_id: Some("a b".to_owned()),
            user_id: Some("u1".to_owned()),
        };
        assert!(bad_tenant.require().is_err());
    }
}
