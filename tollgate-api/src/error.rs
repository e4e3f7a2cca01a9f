//! Serializable api error types and error kinds returned by the tollgate
//! service.

// Deny suspicious match names that are probably non-existent variants.
#![deny(non_snake_case)]

use std::fmt;

use http::status::StatusCode;
#[cfg(any(test, feature = "test-utils"))]
use proptest_derive::Arbitrary;
use serde::{Deserialize, Serialize};
use thiserror::Error;
#[cfg(any(test, feature = "test-utils"))]
use tollgate_common::test_utils::arbitrary;

// Associated constants can't be imported.
pub const CLIENT_400_BAD_REQUEST: StatusCode = StatusCode::BAD_REQUEST;
pub const CLIENT_401_UNAUTHORIZED: StatusCode = StatusCode::UNAUTHORIZED;
pub const CLIENT_403_FORBIDDEN: StatusCode = StatusCode::FORBIDDEN;
pub const CLIENT_404_NOT_FOUND: StatusCode = StatusCode::NOT_FOUND;
pub const CLIENT_409_CONFLICT: StatusCode = StatusCode::CONFLICT;
pub const SERVER_500_INTERNAL_SERVER_ERROR: StatusCode =
    StatusCode::INTERNAL_SERVER_ERROR;
pub const SERVER_503_SERVICE_UNAVAILABLE: StatusCode =
    StatusCode::SERVICE_UNAVAILABLE;
pub const SERVER_504_GATEWAY_TIMEOUT: StatusCode = StatusCode::GATEWAY_TIMEOUT;

/// `ErrorCode` is the serialized wire representation of an error kind.
pub type ErrorCode = u16;

/// `ErrorResponse` is the JSON-serialized representation of all api errors.
/// It is the only error struct actually sent across the wire. Everything
/// else is converted to / from it.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[cfg_attr(any(test, feature = "test-utils"), derive(Arbitrary))]
pub struct ErrorResponse {
    pub code: ErrorCode,
    #[cfg_attr(
        any(test, feature = "test-utils"),
        proptest(strategy = "arbitrary::any_string()")
    )]
    pub msg: String,
}

/// A trait to get the HTTP status code for a given error.
pub trait ToHttpStatus {
    fn to_http_status(&self) -> StatusCode;
}

// --- Error structs --- //

/// Errors generated by shared server plumbing (middleware, extractors)
/// which cannot assume the concrete api error type.
///
/// This is an intermediate error type; [`BillingApiError`] must impl
/// `From<CommonApiError>` to ensure all cases are covered.
pub struct CommonApiError {
    pub kind: CommonErrorKind,
    pub msg: String,
}

/// The primary error type returned by the tollgate service.
#[derive(Clone, Debug, Default, Eq, PartialEq, Error)]
pub struct BillingApiError {
    pub kind: BillingErrorKind,
    pub msg: String,
}

// --- Error variants --- //

/// Error variants common to all api errors.
#[derive(Copy, Clone, Debug)]
pub enum CommonErrorKind {
    /// General server error
    Server,
    /// Client provided a bad request that the server rejected
    Rejection,
    /// Server is currently at capacity; retry later
    AtCapacity,
    /// Server timed out handling the request
    Timeout,
    // NOTE: If adding a variant, be sure to also update Self::KINDS!
}

/// All variants of errors that the billing service can return.
///
/// Every kind has a stable wire code. `Unknown` carries codes this
/// version of the software doesn't recognize, so errors from newer
/// replicas round-trip through older clients unharmed.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum BillingErrorKind {
    /// An unrecognized error code.
    Unknown(ErrorCode),

    // --- Common (shared server plumbing); codes 1..100 --- //
    Server,
    Rejection,
    AtCapacity,
    Timeout,

    // --- Billing service; codes from 100 --- //
    /// Database unreachable on a path with no fallback.
    Database,
    NotFound,
    /// Missing/unknown credential (including webhook signature failures'
    /// cousins below, all of which map to 401).
    Unauthenticated,
    /// Credential is valid but scoped to a different tenant.
    Forbidden,
    InvalidRequest,
    BadSignature,
    StaleTimestamp,
    /// Transient failure worth a retry (e.g. recomputation after an
    /// event commit).
    Unavailable,
}

// --- CommonErrorKind impls --- //

impl CommonErrorKind {
    pub(crate) const KINDS: &'static [Self] = &[
        Self::Server,
        Self::Rejection,
        Self::AtCapacity,
        Self::Timeout,
    ];

    /// The wire code; must agree with the corresponding
    /// [`BillingErrorKind`] code (enforced by test).
    pub fn to_code(self) -> ErrorCode {
        BillingErrorKind::from(self).to_code()
    }
}

impl ToHttpStatus for CommonErrorKind {
    fn to_http_status(&self) -> StatusCode {
        BillingErrorKind::from(*self).to_http_status()
    }
}

// --- BillingErrorKind impls --- //

impl BillingErrorKind {
    /// All known kinds, excluding `Unknown`.
    pub const KINDS: &'static [Self] = &[
        Self::Server,
        Self::Rejection,
        Self::AtCapacity,
        Self::Timeout,
        Self::Database,
        Self::NotFound,
        Self::Unauthenticated,
        Self::Forbidden,
        Self::InvalidRequest,
        Self::BadSignature,
        Self::StaleTimestamp,
        Self::Unavailable,
    ];

    #[inline]
    pub fn is_unknown(&self) -> bool {
        matches!(self, Self::Unknown(_))
    }

    /// The stable wire code for this kind.
    pub fn to_code(self) -> ErrorCode {
        match self {
            Self::Unknown(code) => code,

            Self::Server => 1,
            Self::Rejection => 2,
            Self::AtCapacity => 3,
            Self::Timeout => 4,

            Self::Database => 100,
            Self::NotFound => 101,
            Self::Unauthenticated => 102,
            Self::Forbidden => 103,
            Self::InvalidRequest => 104,
            Self::BadSignature => 105,
            Self::StaleTimestamp => 106,
            Self::Unavailable => 107,
        }
    }

    /// Total: codes this version doesn't know map to `Unknown` and are
    /// preserved for debugging / re-serialization.
    pub fn from_code(code: ErrorCode) -> Self {
        match code {
            1 => Self::Server,
            2 => Self::Rejection,
            3 => Self::AtCapacity,
            4 => Self::Timeout,

            100 => Self::Database,
            101 => Self::NotFound,
            102 => Self::Unauthenticated,
            103 => Self::Forbidden,
            104 => Self::InvalidRequest,
            105 => Self::BadSignature,
            106 => Self::StaleTimestamp,
            107 => Self::Unavailable,

            other => Self::Unknown(other),
        }
    }

    /// A generic human-readable message for this kind; prefixed onto the
    /// specific message in [`BillingApiError`]'s `Display`.
    pub fn to_msg(self) -> &'static str {
        match self {
            Self::Unknown(_) => "Unknown error",

            Self::Server => "General server error",
            Self::Rejection => "Bad request",
            Self::AtCapacity => "Service is at capacity; retry later",
            Self::Timeout => "Server timed out handling the request",

            Self::Database => "Database unavailable; retry later",
            Self::NotFound => "Resource not found",
            Self::Unauthenticated => "Missing or invalid credential",
            Self::Forbidden =>
                "Credential does not grant access to this tenant",
            Self::InvalidRequest => "Invalid request",
            Self::BadSignature => "Webhook signature verification failed",
            Self::StaleTimestamp =>
                "Webhook timestamp outside the allowed skew tolerance",
            Self::Unavailable =>
                "Service temporarily unavailable; retry later",
        }
    }
}

impl Default for BillingErrorKind {
    fn default() -> Self {
        Self::Unknown(0)
    }
}

impl fmt::Display for BillingErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // No ':' because BillingApiError's Display impl adds it.
        f.write_str(self.to_msg())
    }
}

impl From<CommonErrorKind> for BillingErrorKind {
    fn from(common: CommonErrorKind) -> Self {
        // An exhaustive match, so adding a common kind without a billing
        // counterpart is a compile error rather than an `Unknown` at
        // runtime.
        match common {
            CommonErrorKind::Server => Self::Server,
            CommonErrorKind::Rejection => Self::Rejection,
            CommonErrorKind::AtCapacity => Self::AtCapacity,
            CommonErrorKind::Timeout => Self::Timeout,
        }
    }
}

impl ToHttpStatus for BillingErrorKind {
    fn to_http_status(&self) -> StatusCode {
        use BillingErrorKind::*;
        match self {
            Unknown(_) => SERVER_500_INTERNAL_SERVER_ERROR,

            Server => SERVER_500_INTERNAL_SERVER_ERROR,
            Rejection => CLIENT_400_BAD_REQUEST,
            AtCapacity => SERVER_503_SERVICE_UNAVAILABLE,
            Timeout => SERVER_504_GATEWAY_TIMEOUT,

            Database => SERVER_503_SERVICE_UNAVAILABLE,
            NotFound => CLIENT_404_NOT_FOUND,
            Unauthenticated => CLIENT_401_UNAUTHORIZED,
            Forbidden => CLIENT_403_FORBIDDEN,
            InvalidRequest => CLIENT_400_BAD_REQUEST,
            BadSignature => CLIENT_401_UNAUTHORIZED,
            StaleTimestamp => CLIENT_401_UNAUTHORIZED,
            Unavailable => SERVER_503_SERVICE_UNAVAILABLE,
        }
    }
}

// The derived Arbitrary would generate `Unknown(code)` with codes that
// actually name valid variants, breaking the code <-> kind isomorphism,
// so sample from the known kinds and only occasionally from raw codes.
#[cfg(any(test, feature = "test-utils"))]
impl proptest::arbitrary::Arbitrary for BillingErrorKind {
    type Parameters = ();
    type Strategy = proptest::strategy::BoxedStrategy<Self>;

    fn arbitrary_with(_args: Self::Parameters) -> Self::Strategy {
        use proptest::{arbitrary::any, prop_oneof, sample, strategy::Strategy};
        prop_oneof![
            9 => sample::select(Self::KINDS),
            1 => any::<ErrorCode>().prop_map(Self::from_code),
        ]
        .boxed()
    }
}

// --- CommonApiError impls --- //

impl CommonApiError {
    pub fn new(kind: CommonErrorKind, msg: String) -> Self {
        Self { kind, msg }
    }
}

impl axum::response::IntoResponse for CommonApiError {
    fn into_response(self) -> http::Response<axum::body::Body> {
        BillingApiError::from(self).into_response()
    }
}

// --- BillingApiError impls --- //

impl BillingApiError {
    pub fn new(kind: BillingErrorKind, msg: impl Into<String>) -> Self {
        Self {
            kind,
            msg: msg.into(),
        }
    }

    /// An internal error whose details should not reach the client.
    pub fn server(msg: impl Into<String>) -> Self {
        Self::new(BillingErrorKind::Server, msg)
    }

    /// The database was unreachable or errored; invites a retry.
    pub fn database(err: impl fmt::Display) -> Self {
        Self::new(BillingErrorKind::Database, format!("{err:#}"))
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::new(BillingErrorKind::NotFound, msg)
    }

    pub fn unauthenticated(msg: impl Into<String>) -> Self {
        Self::new(BillingErrorKind::Unauthenticated, msg)
    }

    pub fn forbidden(msg: impl Into<String>) -> Self {
        Self::new(BillingErrorKind::Forbidden, msg)
    }

    pub fn invalid_request(msg: impl Into<String>) -> Self {
        Self::new(BillingErrorKind::InvalidRequest, msg)
    }

    pub fn bad_signature(msg: impl Into<String>) -> Self {
        Self::new(BillingErrorKind::BadSignature, msg)
    }

    pub fn stale_timestamp(msg: impl Into<String>) -> Self {
        Self::new(BillingErrorKind::StaleTimestamp, msg)
    }

    pub fn unavailable(msg: impl Into<String>) -> Self {
        Self::new(BillingErrorKind::Unavailable, msg)
    }

    /// Log this error and get its HTTP [`StatusCode`].
    fn log_and_status(&self) -> StatusCode {
        let status = self.to_http_status();

        if status.is_server_error() {
            tracing::error!("{self}");
        } else if status.is_client_error() {
            tracing::warn!("{self}");
        } else {
            // All other statuses are unexpected. Log these at error.
            tracing::error!("Unexpected status code {status} for error: {self}");
        }

        status
    }
}

impl fmt::Display for BillingApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind_msg = self.kind.to_msg();
        let msg = &self.msg;
        write!(f, "{kind_msg}: {msg}")
    }
}

impl From<ErrorResponse> for BillingApiError {
    fn from(ErrorResponse { code, msg }: ErrorResponse) -> Self {
        let kind = BillingErrorKind::from_code(code);
        Self { kind, msg }
    }
}

impl From<BillingApiError> for ErrorResponse {
    fn from(BillingApiError { kind, msg }: BillingApiError) -> Self {
        let code = kind.to_code();
        Self { code, msg }
    }
}

impl From<CommonApiError> for BillingApiError {
    fn from(CommonApiError { kind, msg }: CommonApiError) -> Self {
        let kind = BillingErrorKind::from(kind);
        Self { kind, msg }
    }
}

impl ToHttpStatus for BillingApiError {
    fn to_http_status(&self) -> StatusCode {
        self.kind.to_http_status()
    }
}

impl axum::response::IntoResponse for BillingApiError {
    fn into_response(self) -> http::Response<axum::body::Body> {
        // Server-side errors need to be logged here, since the error will
        // have been converted to an `http::Response` by the time `axum`'s
        // layers can access it.
        let status = self.log_and_status();
        let error_response = ErrorResponse::from(self);
        crate::server::build_json_response(status, &error_response)
    }
}

#[cfg(any(test, feature = "test-utils"))]
impl proptest::arbitrary::Arbitrary for BillingApiError {
    type Parameters = ();
    type Strategy = proptest::strategy::BoxedStrategy<Self>;
    fn arbitrary_with(_args: Self::Parameters) -> Self::Strategy {
        use proptest::{arbitrary::any, strategy::Strategy};
        (any::<BillingErrorKind>(), arbitrary::any_string())
            .prop_map(|(kind, msg)| Self { kind, msg })
            .boxed()
    }
}

// --- Tests --- //

#[cfg(test)]
mod test {
    use proptest::{arbitrary::any, prop_assert_eq, proptest};

    use super::*;

    // kind -> code -> kind and code -> kind -> code must both round-trip,
    // including for codes this version doesn't recognize.
    #[test]
    fn kind_code_isomorphism() {
        for kind in BillingErrorKind::KINDS {
            let code = kind.to_code();
            assert_ne!(code, 0, "0 is reserved for Unknown");
            assert_eq!(*kind, BillingErrorKind::from_code(code));
        }

        // Sweep the first 200 codes, which covers every assigned code
        // plus plenty of unassigned ones.
        for code in 0_u16..200 {
            let kind = BillingErrorKind::from_code(code);
            assert_eq!(code, kind.to_code());
        }

        // The proptest generator must be equally well-behaved.
        proptest!(|(kind in any::<BillingErrorKind>())| {
            let code = kind.to_code();
            prop_assert_eq!(kind, BillingErrorKind::from_code(code));
        });
    }

    #[test]
    fn zero_and_default_are_unknown() {
        assert!(BillingErrorKind::from_code(0).is_unknown());
        assert!(BillingErrorKind::default().is_unknown());
        assert_eq!(BillingErrorKind::default().to_code(), 0);
    }

    // Middleware errors (CommonErrorKind) embed into the billing kinds
    // with the same wire codes and the same HTTP statuses.
    #[test]
    fn common_kinds_embed_consistently() {
        for common in CommonErrorKind::KINDS {
            let billing = BillingErrorKind::from(*common);
            assert!(!billing.is_unknown());
            assert_eq!(common.to_code(), billing.to_code());
            assert_eq!(common.to_http_status(), billing.to_http_status());
        }
    }

    #[test]
    fn api_error_roundtrips() {
        // The errors should be equal in serialized & unserialized form.
        proptest!(|(e1 in any::<BillingApiError>())| {
            let err_resp1 = ErrorResponse::from(e1.clone());
            let e2 = BillingApiError::from(err_resp1.clone());
            let err_resp2 = ErrorResponse::from(e2.clone());
            prop_assert_eq!(&e1, &e2);
            prop_assert_eq!(&err_resp1, &err_resp2);
        });
    }

    #[test]
    fn error_response_serde_roundtrip() {
        proptest!(|(code in any::<ErrorCode>(), msg in "[A-Za-z0-9]*")| {
            let e1 = ErrorResponse { code, msg };
            let e1_str = serde_json::to_string(&e1).unwrap();

            // Sanity test the serialized form is what we expect
            let msg = &e1.msg;
            prop_assert_eq!(
                &e1_str,
                &format!("{{\"code\":{code},\"msg\":\"{msg}\"}}")
            );

            let e2 = serde_json::from_str::<ErrorResponse>(&e1_str).unwrap();
            prop_assert_eq!(e1, e2);
        })
    }

    #[test]
    fn display_prefixes_kind_message() {
        let err = BillingApiError::not_found("no grant to revoke");
        assert_eq!(
            err.to_string(),
            "Resource not found: no grant to revoke",
        );
    }

    #[test]
    fn status_mapping() {
        use BillingErrorKind::*;
        let err = |kind| BillingApiError::new(kind, "");
        assert_eq!(err(NotFound).to_http_status(), CLIENT_404_NOT_FOUND);
        assert_eq!(
            err(Unauthenticated).to_http_status(),
            CLIENT_401_UNAUTHORIZED
        );
        assert_eq!(err(BadSignature).to_http_status(), CLIENT_401_UNAUTHORIZED);
        assert_eq!(
            err(StaleTimestamp).to_http_status(),
            CLIENT_401_UNAUTHORIZED
        );
        assert_eq!(err(Forbidden).to_http_status(), CLIENT_403_FORBIDDEN);
        assert_eq!(err(InvalidRequest).to_http_status(), CLIENT_400_BAD_REQUEST);
        assert_eq!(
            err(Database).to_http_status(),
            SERVER_503_SERVICE_UNAVAILABLE
        );
        assert_eq!(
            err(Unavailable).to_http_status(),
            SERVER_503_SERVICE_UNAVAILABLE
        );
        assert_eq!(
            err(Unknown(9999)).to_http_status(),
            SERVER_500_INTERNAL_SERVER_ERROR
        );
    }
}
