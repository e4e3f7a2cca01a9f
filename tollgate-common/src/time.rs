use std::{
    fmt::{self, Display},
    str::FromStr,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use anyhow::Context;
use serde::{de, Deserialize, Deserializer, Serialize};

/// The number of milliseconds since the [`UNIX_EPOCH`].
///
/// - Internally represented by a non-negative [`i64`] so the same value can
///   round-trip through Postgres `BIGINT` columns and JSON numbers without a
///   sign change.
/// - Can represent any time from January 1st, 1970 00:00:00.000 UTC to
///   roughly 292 million years in the future.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize)]
pub struct TimestampMs(i64);

impl TimestampMs {
    pub const ZERO: Self = TimestampMs(0);
    pub const MAX: Self = TimestampMs(i64::MAX);

    /// Creates a new [`TimestampMs`] from the current [`SystemTime`].
    ///
    /// Panics if the current time is not within bounds.
    pub fn now() -> Self {
        Self::try_from(SystemTime::now()).unwrap()
    }

    /// Constructs a [`TimestampMs`] from a number of milliseconds.
    /// Errors if the value is negative.
    pub fn try_from_ms(ms: i64) -> anyhow::Result<Self> {
        anyhow::ensure!(ms >= 0, "Unix timestamp must be non-negative: {ms}");
        Ok(Self(ms))
    }

    /// Constructs a [`TimestampMs`] from a number of *seconds*, the unit
    /// used by the provider's wire format.
    pub fn try_from_secs(secs: i64) -> anyhow::Result<Self> {
        anyhow::ensure!(secs >= 0, "Unix timestamp must be non-negative: {secs}");
        secs.checked_mul(1000)
            .map(Self)
            .context("Unix timestamp too large")
    }

    /// Returns the contained [`i64`] in milliseconds.
    #[inline]
    pub fn as_i64(self) -> i64 {
        self.0
    }

    /// Whole seconds since the epoch, rounding towards zero.
    #[inline]
    pub fn as_secs(self) -> i64 {
        self.0 / 1000
    }

    /// Adds a [`Duration`], saturating at [`TimestampMs::MAX`].
    pub fn saturating_add(self, duration: Duration) -> Self {
        i64::try_from(duration.as_millis())
            .ok()
            .and_then(|ms| self.0.checked_add(ms))
            .map(Self)
            .unwrap_or(Self::MAX)
    }

    /// Subtracts a [`Duration`], saturating at [`TimestampMs::ZERO`].
    pub fn saturating_sub(self, duration: Duration) -> Self {
        i64::try_from(duration.as_millis())
            .ok()
            .and_then(|ms| self.0.checked_sub(ms))
            .filter(|ms| *ms >= 0)
            .map(Self)
            .unwrap_or(Self::ZERO)
    }

    /// The [`Duration`] elapsed since `earlier`, or [`None`] if `earlier`
    /// is actually later than `self`.
    pub fn duration_since(self, earlier: TimestampMs) -> Option<Duration> {
        u64::try_from(self.0.checked_sub(earlier.0)?)
            .ok()
            .map(Duration::from_millis)
    }

    /// Absolute difference between two timestamps.
    pub fn abs_diff(self, other: TimestampMs) -> Duration {
        Duration::from_millis(self.0.abs_diff(other.0))
    }
}

/// Get a [`SystemTime`] corresponding to this timestamp.
impl From<TimestampMs> for SystemTime {
    fn from(timestamp: TimestampMs) -> Self {
        let timestamp_u64 = u64::try_from(timestamp.0)
            .expect("Non-negative invariant was violated");
        UNIX_EPOCH + Duration::from_millis(timestamp_u64)
    }
}

/// Attempts to convert a [`SystemTime`] into a [`TimestampMs`].
///
/// Returns an error if the [`SystemTime`] is not within bounds.
impl TryFrom<SystemTime> for TimestampMs {
    type Error = anyhow::Error;
    fn try_from(system_time: SystemTime) -> anyhow::Result<Self> {
        system_time
            .duration_since(UNIX_EPOCH)
            .map(|duration| duration.as_millis())
            .map(i64::try_from)
            .map(|res| res.map(Self))
            .context("Current time is before January 1st, 1970")?
            .context("Current time is more than 292 million years past epoch")
    }
}

/// Enforces that the inner [`i64`] is non-negative.
impl<'de> Deserialize<'de> for TimestampMs {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = i64::deserialize(deserializer)?;
        if value >= 0 {
            Ok(TimestampMs(value))
        } else {
            Err(de::Error::invalid_value(
                de::Unexpected::Signed(value),
                &"Unix timestamp must be non-negative",
            ))
        }
    }
}

impl Display for TimestampMs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}

impl FromStr for TimestampMs {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> anyhow::Result<Self> {
        let ms = i64::from_str(s).context("Not a valid i64")?;
        Self::try_from_ms(ms)
    }
}

#[cfg(any(test, feature = "test-utils"))]
mod arbitrary_impl {
    use proptest::{
        arbitrary::Arbitrary,
        strategy::{BoxedStrategy, Strategy},
    };

    use super::*;

    impl Arbitrary for TimestampMs {
        type Parameters = ();
        type Strategy = BoxedStrategy<Self>;
        fn arbitrary_with(_args: Self::Parameters) -> Self::Strategy {
            (0..i64::MAX).prop_map(TimestampMs).boxed()
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::test_utils::roundtrip;

    #[test]
    fn timestamp_json_roundtrip() {
        roundtrip::json_string_roundtrip_proptest::<TimestampMs>();
    }

    #[test]
    fn timestamp_fromstr_display_roundtrip() {
        roundtrip::fromstr_display_roundtrip_proptest::<TimestampMs>();
    }

    #[test]
    fn deserialize_enforces_nonnegative() {
        assert_eq!(serde_json::from_str::<TimestampMs>("42").unwrap().0, 42);
        assert_eq!(serde_json::from_str::<TimestampMs>("0").unwrap().0, 0);
        assert!(serde_json::from_str::<TimestampMs>("-42").is_err());
    }

    #[test]
    fn seconds_conversion() {
        let ts = TimestampMs::try_from_secs(1_700_000_000).unwrap();
        assert_eq!(ts.as_i64(), 1_700_000_000_000);
        assert_eq!(ts.as_secs(), 1_700_000_000);
        assert!(TimestampMs::try_from_secs(-1).is_err());
        assert!(TimestampMs::try_from_secs(i64::MAX).is_err());
    }

    #[test]
    fn saturating_arithmetic() {
        let ts = TimestampMs(1000);
        assert_eq!(ts.saturating_add(Duration::from_millis(500)).0, 1500);
        assert_eq!(ts.saturating_sub(Duration::from_millis(500)).0, 500);
        assert_eq!(ts.saturating_sub(Duration::from_secs(10)), TimestampMs::ZERO);
        assert_eq!(
            TimestampMs::MAX.saturating_add(Duration::from_millis(1)),
            TimestampMs::MAX,
        );
    }

    #[test]
    fn duration_since_ordering() {
        let t1 = TimestampMs(1000);
        let t2 = TimestampMs(4000);
        assert_eq!(t2.duration_since(t1), Some(Duration::from_millis(3000)));
        assert_eq!(t1.duration_since(t2), None);
        assert_eq!(t1.abs_diff(t2), Duration::from_millis(3000));
        assert_eq!(t2.abs_diff(t1), Duration::from_millis(3000));
    }
}
