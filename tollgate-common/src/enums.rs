//! Domain enums shared between the persistence layer, the entitlement
//! engine, and the wire models.
//!
//! All variants serialize as `snake_case` strings, and the same strings are
//! what the persistence layer stores in `TEXT` columns, so `as_str` /
//! `FromStr` must stay in sync with the serde representation (tests below
//! enforce this).

use std::{
    fmt::{self, Display},
    str::FromStr,
};

use anyhow::anyhow;
use serde::{Deserialize, Serialize};
use strum::VariantArray;

/// Provider-reported lifecycle state of a recurring subscription.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
#[derive(Serialize, Deserialize, VariantArray)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Trialing,
    Active,
    PastDue,
    Canceled,
    Unpaid,
    Incomplete,
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Trialing => "trialing",
            Self::Active => "active",
            Self::PastDue => "past_due",
            Self::Canceled => "canceled",
            Self::Unpaid => "unpaid",
            Self::Incomplete => "incomplete",
        }
    }

    /// Whether this status grants the price's features within the current
    /// period. `past_due` is handled separately via the grace window.
    #[inline]
    pub fn grants_access(&self) -> bool {
        matches!(self, Self::Active | Self::Trialing)
    }
}

/// Lifecycle state of a one-time purchase.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
#[derive(Serialize, Deserialize, VariantArray)]
#[serde(rename_all = "snake_case")]
pub enum PurchaseStatus {
    Succeeded,
    Pending,
    Failed,
    Refunded,
}

impl PurchaseStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Succeeded => "succeeded",
            Self::Pending => "pending",
            Self::Failed => "failed",
            Self::Refunded => "refunded",
        }
    }
}

/// Processing outcome recorded on an ingested provider event.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
#[derive(Serialize, Deserialize, VariantArray)]
#[serde(rename_all = "snake_case")]
pub enum EventOutcome {
    Pending,
    Succeeded,
    FailedPermanent,
    FailedTransient,
}

impl EventOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Succeeded => "succeeded",
            Self::FailedPermanent => "failed_permanent",
            Self::FailedTransient => "failed_transient",
        }
    }
}

/// Which of the three independent sources produced an entitlement row.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
#[derive(Serialize, Deserialize, VariantArray)]
#[serde(rename_all = "snake_case")]
pub enum EntitlementSource {
    Subscription,
    Purchase,
    Manual,
}

impl EntitlementSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Subscription => "subscription",
            Self::Purchase => "purchase",
            Self::Manual => "manual",
        }
    }

    /// Tie-break precedence when two sources grant the same feature with
    /// equal `valid_to`: manual > purchase > subscription.
    #[inline]
    pub fn precedence(&self) -> u8 {
        match self {
            Self::Subscription => 0,
            Self::Purchase => 1,
            Self::Manual => 2,
        }
    }
}

/// Billing cadence of a price.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
#[derive(Serialize, Deserialize, VariantArray)]
#[serde(rename_all = "snake_case")]
pub enum PriceCadence {
    Month,
    Year,
    OneTime,
}

impl PriceCadence {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Month => "month",
            Self::Year => "year",
            Self::OneTime => "one_time",
        }
    }
}

macro_rules! impl_fromstr_display {
    ($name:ident) => {
        impl FromStr for $name {
            type Err = anyhow::Error;
            fn from_str(s: &str) -> anyhow::Result<Self> {
                <Self as VariantArray>::VARIANTS
                    .iter()
                    .find(|variant| variant.as_str() == s)
                    .copied()
                    .ok_or_else(|| {
                        anyhow!(concat!(
                            "Unrecognized ",
                            stringify!($name),
                            ": '{}'"
                        ), s)
                    })
            }
        }

        impl Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

impl_fromstr_display!(SubscriptionStatus);
impl_fromstr_display!(PurchaseStatus);
impl_fromstr_display!(EventOutcome);
impl_fromstr_display!(EntitlementSource);
impl_fromstr_display!(PriceCadence);

#[cfg(any(test, feature = "test-utils"))]
mod arbitrary_impls {
    use proptest::{
        arbitrary::Arbitrary,
        sample,
        strategy::{BoxedStrategy, Strategy},
    };
    use strum::VariantArray;

    use super::*;

    macro_rules! impl_arbitrary {
        ($name:ident) => {
            impl Arbitrary for $name {
                type Parameters = ();
                type Strategy = BoxedStrategy<Self>;
                fn arbitrary_with(_args: Self::Parameters) -> Self::Strategy {
                    sample::select(<Self as VariantArray>::VARIANTS).boxed()
                }
            }
        };
    }

    impl_arbitrary!(SubscriptionStatus);
    impl_arbitrary!(PurchaseStatus);
    impl_arbitrary!(EventOutcome);
    impl_arbitrary!(EntitlementSource);
    impl_arbitrary!(PriceCadence);
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::test_utils::roundtrip;

    #[test]
    fn enum_serde_roundtrips() {
        roundtrip::json_unit_enum_backwards_compat::<SubscriptionStatus>(
            r#"["trialing","active","past_due","canceled","unpaid","incomplete"]"#,
        );
        roundtrip::json_unit_enum_backwards_compat::<PurchaseStatus>(
            r#"["succeeded","pending","failed","refunded"]"#,
        );
        roundtrip::json_unit_enum_backwards_compat::<EventOutcome>(
            r#"["pending","succeeded","failed_permanent","failed_transient"]"#,
        );
        roundtrip::json_unit_enum_backwards_compat::<EntitlementSource>(
            r#"["subscription","purchase","manual"]"#,
        );
        roundtrip::json_unit_enum_backwards_compat::<PriceCadence>(
            r#"["month","year","one_time"]"#,
        );
    }

    #[test]
    fn enum_fromstr_display_roundtrips() {
        roundtrip::fromstr_display_roundtrip_proptest::<SubscriptionStatus>();
        roundtrip::fromstr_display_roundtrip_proptest::<PurchaseStatus>();
        roundtrip::fromstr_display_roundtrip_proptest::<EventOutcome>();
        roundtrip::fromstr_display_roundtrip_proptest::<EntitlementSource>();
        roundtrip::fromstr_display_roundtrip_proptest::<PriceCadence>();
    }

    // `as_str` and the serde representation must agree since the database
    // stores `as_str` but the wire uses serde.
    #[test]
    fn as_str_matches_serde() {
        fn check<T>(as_str: fn(&T) -> &'static str)
        where
            T: VariantArray + Copy + Serialize,
        {
            for variant in T::VARIANTS {
                let json = serde_json::to_value(variant).unwrap();
                assert_eq!(json.as_str().unwrap(), as_str(variant));
            }
        }
        check::<SubscriptionStatus>(SubscriptionStatus::as_str);
        check::<PurchaseStatus>(PurchaseStatus::as_str);
        check::<EventOutcome>(EventOutcome::as_str);
        check::<EntitlementSource>(EntitlementSource::as_str);
        check::<PriceCadence>(PriceCadence::as_str);

        assert_eq!(SubscriptionStatus::PastDue.as_str(), "past_due");
        assert_eq!(EventOutcome::FailedPermanent.as_str(), "failed_permanent");
        assert_eq!(PriceCadence::OneTime.as_str(), "one_time");
    }

    #[test]
    fn source_precedence() {
        assert!(
            EntitlementSource::Manual.precedence()
                > EntitlementSource::Purchase.precedence()
        );
        assert!(
            EntitlementSource::Purchase.precedence()
                > EntitlementSource::Subscription.precedence()
        );
    }

    #[test]
    fn grants_access() {
        assert!(SubscriptionStatus::Active.grants_access());
        assert!(SubscriptionStatus::Trialing.grants_access());
        assert!(!SubscriptionStatus::PastDue.grants_access());
        assert!(!SubscriptionStatus::Canceled.grants_access());
        assert!(!SubscriptionStatus::Unpaid.grants_access());
        assert!(!SubscriptionStatus::Incomplete.grants_access());
    }
}
