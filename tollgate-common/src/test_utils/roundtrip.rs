//! Quick roundtrip proptests for serializable types.

use std::{fmt::Debug, fmt::Display, str::FromStr};

use proptest::{
    arbitrary::{any, Arbitrary},
    prop_assert_eq, proptest,
};
use serde::{de::DeserializeOwned, Serialize};

/// Quickly create a JSON string roundtrip proptest. This test is useful for
/// simple data types that map to/from a single base JSON type (string, int,
/// object, ..).
///
/// ```ignore
/// json_string_roundtrip_proptest::<TenantId>();
/// ```
pub fn json_string_roundtrip_proptest<T>()
where
    T: Arbitrary + PartialEq + Serialize + DeserializeOwned,
{
    proptest!(|(value1 in any::<T>())| {
        let json_value1 = serde_json::to_string(&value1).unwrap();
        let value2 = serde_json::from_str::<T>(&json_value1).unwrap();
        prop_assert_eq!(&value1, &value2);
    });
}

/// Quickly create a `FromStr` / `Display` roundtrip proptest.
///
/// ```ignore
/// fromstr_display_roundtrip_proptest::<FeatureCode>();
/// ```
pub fn fromstr_display_roundtrip_proptest<T>()
where
    T: Arbitrary + PartialEq + FromStr + Display,
    <T as FromStr>::Err: Debug,
{
    proptest!(|(value1 in any::<T>())| {
        let string1 = value1.to_string();
        let value2 = T::from_str(&string1).unwrap();
        prop_assert_eq!(&value1, &value2);
    });
}

/// Assert that a unit enum's JSON serialization matches an expected
/// serialization of all variants, e.g.
/// `["trialing","active","past_due",..]`. Protects against accidental
/// backwards-incompatible renames; the database stores these strings.
pub fn json_unit_enum_backwards_compat<T>(expected_ser: &str)
where
    T: strum::VariantArray + Copy + PartialEq + Debug + Serialize + DeserializeOwned,
{
    let variants = T::VARIANTS;
    let actual_ser = serde_json::to_string(variants).unwrap();
    assert_eq!(actual_ser, expected_ser);
    let deserialized = serde_json::from_str::<Vec<T>>(&actual_ser).unwrap();
    assert_eq!(variants, deserialized.as_slice());
}
