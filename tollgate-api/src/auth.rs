//! Bearer credential wire type.
//!
//! Tenants and admins authenticate with a static bearer credential in the
//! `Authorization` header. The credential value is a secret: it never
//! appears in logs (redacted `Debug`) and is only ever persisted as a hash.

use std::fmt;

use http::{header, HeaderMap};
use thiserror::Error;

#[derive(Clone, Debug, Eq, PartialEq, Error)]
pub enum BearerAuthError {
    #[error("missing Authorization header")]
    Missing,
    #[error("Authorization header is not valid UTF-8")]
    NotUtf8,
    #[error("Authorization header is not a Bearer credential")]
    BadScheme,
    #[error("Bearer credential is empty")]
    Empty,
}

/// An opaque bearer credential presented by a caller.
#[derive(Clone, Eq, PartialEq)]
pub struct BearerToken(String);

impl BearerToken {
    pub fn new(token: impl Into<String>) -> Result<Self, BearerAuthError> {
        let token = token.into();
        if token.is_empty() {
            return Err(BearerAuthError::Empty);
        }
        Ok(Self(token))
    }

    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Extracts the bearer credential from request headers.
    pub fn from_headers(headers: &HeaderMap) -> Result<Self, BearerAuthError> {
        let value = headers
            .get(header::AUTHORIZATION)
            .ok_or(BearerAuthError::Missing)?;
        let value_str =
            value.to_str().map_err(|_| BearerAuthError::NotUtf8)?;
        let token = value_str
            .strip_prefix("Bearer ")
            .ok_or(BearerAuthError::BadScheme)?;
        Self::new(token)
    }
}

// The credential must never appear in logs.
impl fmt::Debug for BearerToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("BearerToken(..)")
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn headers_with(value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, value.parse().unwrap());
        headers
    }

    #[test]
    fn from_headers_cases() {
        let token = BearerToken::from_headers(&headers_with("Bearer tok_123"))
            .unwrap();
        assert_eq!(token.as_str(), "tok_123");

        assert_eq!(
            BearerToken::from_headers(&HeaderMap::new()),
            Err(BearerAuthError::Missing),
        );
        assert_eq!(
            BearerToken::from_headers(&headers_with("Basic dXNlcg==")),
            Err(BearerAuthError::BadScheme),
        );
        assert_eq!(
            BearerToken::from_headers(&headers_with("Bearer ")),
            Err(BearerAuthError::Empty),
        );
    }

    #[test]
    fn debug_is_redacted() {
        let token = BearerToken::new("super-secret").unwrap();
        let debug = format!("{token:?}");
        assert!(!debug.contains("super-secret"));
        assert_eq!(debug, "BearerToken(..)");
    }
}
