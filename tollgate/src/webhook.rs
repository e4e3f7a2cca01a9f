//! Webhook signature verification.
//!
//! The provider signs each webhook delivery with a header of the form
//! `t=<unix seconds>,v1=<hex hmac>[,v1=<hex hmac>...]` where each digest is
//! HMAC-SHA-256 over the string `"{t}.{body}"` under a shared secret.
//! Multiple `v1` digests appear while the endpoint secret is being rolled;
//! the signature is valid if *any* presented digest matches.
//!
//! The timestamp bounds the replay window: deliveries whose timestamp is
//! further than the configured tolerance from the local clock are rejected
//! even when the digest is valid.

use std::time::Duration;

use ring::hmac;
use thiserror::Error;
use tollgate_common::{hex, time::TimestampMs};

/// The name of the signature header on webhook requests.
pub const SIGNATURE_HEADER: &str = "signature";

const SCHEME_TIMESTAMP: &str = "t";
const SCHEME_V1: &str = "v1";

#[derive(Clone, Debug, Eq, PartialEq, Error)]
pub enum SignatureError {
    #[error("signature header is missing")]
    Missing,
    #[error("signature header is malformed")]
    Malformed,
    #[error("signature timestamp is outside the allowed tolerance")]
    Stale,
    #[error("no presented digest matches the expected signature")]
    Mismatch,
}

/// A parsed `signature` header.
#[derive(Debug, Eq, PartialEq)]
pub struct SignatureHeader {
    /// Unix *seconds* at which the provider signed the payload.
    pub timestamp: i64,
    /// All presented `v1` digests.
    pub digests: Vec<[u8; 32]>,
}

impl SignatureHeader {
    /// Parses a header of the form `t=1700000000,v1=abcdef...`.
    /// Unknown schemes are ignored for forwards compatibility.
    pub fn parse(header: &str) -> Result<Self, SignatureError> {
        let mut timestamp = None;
        let mut digests = Vec::new();

        for part in header.split(',') {
            let (scheme, value) =
                part.trim().split_once('=').ok_or(SignatureError::Malformed)?;
            match scheme {
                SCHEME_TIMESTAMP => {
                    let parsed = value
                        .parse::<i64>()
                        .map_err(|_| SignatureError::Malformed)?;
                    // Two timestamps is malformed, not a rolled secret.
                    if timestamp.replace(parsed).is_some() {
                        return Err(SignatureError::Malformed);
                    }
                }
                SCHEME_V1 => {
                    let digest = hex::decode_array::<32>(value)
                        .map_err(|_| SignatureError::Malformed)?;
                    digests.push(digest);
                }
                _ => (),
            }
        }

        let timestamp = timestamp.ok_or(SignatureError::Malformed)?;
        if digests.is_empty() {
            return Err(SignatureError::Malformed);
        }

        Ok(Self { timestamp, digests })
    }
}

/// Computes the expected digest for a payload signed at `timestamp`.
pub fn sign(secret: &[u8], timestamp: i64, body: &[u8]) -> [u8; 32] {
    let key = hmac::Key::new(hmac::HMAC_SHA256, secret);
    let mut ctx = hmac::Context::with_key(&key);
    ctx.update(timestamp.to_string().as_bytes());
    ctx.update(b".");
    ctx.update(body);
    let tag = ctx.sign();
    <[u8; 32]>::try_from(tag.as_ref()).expect("HMAC-SHA256 tags are 32 bytes")
}

/// Renders a valid signature header for a payload. Used by tests and the
/// local development tooling to fabricate provider deliveries.
pub fn sign_header(secret: &[u8], timestamp: i64, body: &[u8]) -> String {
    let digest = sign(secret, timestamp, body);
    format!("t={timestamp},v1={}", hex::Display(&digest))
}

/// Verifies a webhook delivery.
///
/// Checks, in order: header presence, header shape, timestamp skew against
/// `now` (both past and future skew are rejected), then digest equality in
/// constant time. Any matching `v1` digest accepts the delivery.
pub fn verify(
    header: Option<&str>,
    body: &[u8],
    secret: &[u8],
    now: TimestampMs,
    tolerance: Duration,
) -> Result<(), SignatureError> {
    let header = header.ok_or(SignatureError::Missing)?;
    let parsed = SignatureHeader::parse(header)?;

    let signed_at = TimestampMs::try_from_secs(parsed.timestamp)
        .map_err(|_| SignatureError::Malformed)?;
    if now.abs_diff(signed_at) > tolerance {
        return Err(SignatureError::Stale);
    }

    let expected = sign(secret, parsed.timestamp, body);
    let any_match = parsed.digests.iter().any(|digest| {
        ring::constant_time::verify_slices_are_equal(digest, &expected).is_ok()
    });
    if any_match {
        Ok(())
    } else {
        Err(SignatureError::Mismatch)
    }
}
