//! String id newtypes for the tollgate domain.
//!
//! All ids share the same shape: a non-empty printable-ASCII string with a
//! bounded length. `':'` is additionally rejected because ids are embedded
//! in `':'`-delimited cache keys.

use std::{
    fmt::{self, Display},
    str::FromStr,
};

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

/// The maximum length of any id string.
pub const MAX_ID_LEN: usize = 128;

#[derive(Clone, Debug, Eq, PartialEq, Error)]
pub enum IdError {
    #[error("id must be non-empty")]
    Empty,
    #[error("id is longer than {MAX_ID_LEN} bytes")]
    TooLong,
    #[error("id contains a disallowed character: {0:?}")]
    BadChar(char),
}

fn validate_id(s: &str) -> Result<(), IdError> {
    if s.is_empty() {
        return Err(IdError::Empty);
    }
    if s.len() > MAX_ID_LEN {
        return Err(IdError::TooLong);
    }
    for c in s.chars() {
        if !c.is_ascii_graphic() || c == ':' {
            return Err(IdError::BadChar(c));
        }
    }
    Ok(())
}

/// Generates a validated string id newtype along with its standard impls:
/// `Display`, `FromStr`, serde as a plain JSON string, and (in tests) a
/// proptest [`Arbitrary`](proptest::arbitrary::Arbitrary) strategy.
macro_rules! string_id {
    (
        $(#[$meta:meta])*
        $name:ident
    ) => {
        $(#[$meta])*
        #[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
        pub struct $name(String);

        impl $name {
            pub fn new(inner: impl Into<String>) -> Result<Self, IdError> {
                let inner = inner.into();
                validate_id(&inner)?;
                Ok(Self(inner))
            }

            #[inline]
            pub fn as_str(&self) -> &str {
                &self.0
            }

            #[inline]
            pub fn into_inner(self) -> String {
                self.0
            }
        }

        impl FromStr for $name {
            type Err = IdError;
            fn from_str(s: &str) -> Result<Self, IdError> {
                Self::new(s)
            }
        }

        impl Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl Serialize for $name {
            fn serialize<S: Serializer>(
                &self,
                serializer: S,
            ) -> Result<S::Ok, S::Error> {
                serializer.serialize_str(&self.0)
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(
                deserializer: D,
            ) -> Result<Self, D::Error> {
                let s = String::deserialize(deserializer)?;
                Self::new(s).map_err(de::Error::custom)
            }
        }

        #[cfg(any(test, feature = "test-utils"))]
        impl proptest::arbitrary::Arbitrary for $name {
            type Parameters = ();
            type Strategy = proptest::strategy::BoxedStrategy<Self>;
            fn arbitrary_with(_args: Self::Parameters) -> Self::Strategy {
                use proptest::strategy::Strategy;
                crate::test_utils::arbitrary::any_id_string()
                    .prop_map(|s| Self::new(s).unwrap())
                    .boxed()
            }
        }
    };
}

string_id! {
    /// Identifies one tenant micro-application. Globally unique.
    TenantId
}

string_id! {
    /// Identifies one end user *within* a tenant. Tenant-scoped; the same
    /// string under two tenants names two unrelated users.
    UserId
}

string_id! {
    /// An opaque string that tenant code uses to gate access to a feature.
    FeatureCode
}

string_id! {
    /// Identifies a sellable bundle within a tenant.
    ProductId
}

string_id! {
    /// Internal id of a commercial term (price) within a tenant.
    PriceId
}

string_id! {
    /// The provider's immutable id for a price object.
    ProviderPriceId
}

string_id! {
    /// The provider's globally-unique id for one webhook event.
    /// Primary dedup key for ingested events.
    ProviderEventId
}

string_id! {
    /// The provider's id for a recurring subscription object.
    ProviderSubscriptionId
}

string_id! {
    /// The provider's id for a one-time charge object.
    ProviderChargeId
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::test_utils::roundtrip;

    #[test]
    fn id_validation() {
        assert!(TenantId::new("acme").is_ok());
        assert!(TenantId::new("acme-app_2").is_ok());
        assert_eq!(TenantId::new(""), Err(IdError::Empty));
        assert_eq!(TenantId::new("a:b"), Err(IdError::BadChar(':')));
        assert_eq!(TenantId::new("a b"), Err(IdError::BadChar(' ')));
        assert_eq!(TenantId::new("a\nb"), Err(IdError::BadChar('\n')));
        assert_eq!(TenantId::new("é"), Err(IdError::BadChar('é')));
        assert_eq!(TenantId::new("x".repeat(129)), Err(IdError::TooLong));
        assert!(TenantId::new("x".repeat(128)).is_ok());
    }

    #[test]
    fn id_serde_roundtrips() {
        roundtrip::json_string_roundtrip_proptest::<TenantId>();
        roundtrip::json_string_roundtrip_proptest::<UserId>();
        roundtrip::json_string_roundtrip_proptest::<FeatureCode>();
        roundtrip::json_string_roundtrip_proptest::<ProviderEventId>();
        roundtrip::json_string_roundtrip_proptest::<ProviderSubscriptionId>();
        roundtrip::json_string_roundtrip_proptest::<ProviderChargeId>();
    }

    #[test]
    fn id_fromstr_display_roundtrips() {
        roundtrip::fromstr_display_roundtrip_proptest::<TenantId>();
        roundtrip::fromstr_display_roundtrip_proptest::<UserId>();
        roundtrip::fromstr_display_roundtrip_proptest::<FeatureCode>();
    }

    #[test]
    fn deserialize_rejects_invalid() {
        assert!(serde_json::from_str::<TenantId>(r#""ok-id""#).is_ok());
        assert!(serde_json::from_str::<TenantId>(r#""""#).is_err());
        assert!(serde_json::from_str::<TenantId>(r#""a:b""#).is_err());
    }
}
