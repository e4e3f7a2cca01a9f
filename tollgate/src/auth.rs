//! Credential verification and tenant-scope enforcement.
//!
//! Credentials are random ≥128-bit bearer secrets; the database stores
//! only their SHA-256 hashes. Tenant resolution hashes the presented
//! credential and looks the hash up, so the secret itself never reaches a
//! query. The admin credential is compared hash-to-hash in constant time.

use tollgate_api::{auth::BearerToken, error::BillingApiError};
use tollgate_common::{hex, ids::TenantId};

use crate::db::{self, models::Tenant, Store};

/// SHA-256 of a credential, hex-encoded; the only form ever persisted or
/// compared.
pub fn credential_hash_hex(credential: &str) -> String {
    let digest =
        ring::digest::digest(&ring::digest::SHA256, credential.as_bytes());
    hex::encode(digest.as_ref())
}

/// Constant-time equality on two byte slices. Returns `false` for length
/// mismatches without inspecting contents.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    ring::constant_time::verify_slices_are_equal(a, b).is_ok()
}

pub struct Authenticator {
    store: Store,
    /// SHA-256 of the admin credential; the plaintext is dropped at
    /// construction.
    admin_token_hash: [u8; 32],
}

impl Authenticator {
    pub fn new(store: Store, admin_token: &str) -> Self {
        let digest =
            ring::digest::digest(&ring::digest::SHA256, admin_token.as_bytes());
        let admin_token_hash = <[u8; 32]>::try_from(digest.as_ref())
            .expect("SHA-256 digests are 32 bytes");
        Self {
            store,
            admin_token_hash,
        }
    }

    /// Resolves the tenant a credential belongs to.
    pub async fn authenticate_tenant(
        &self,
        token: &BearerToken,
    ) -> Result<Tenant, BillingApiError> {
        let hash_hex = credential_hash_hex(token.as_str());
        let tenant = db::tenants::tenant_by_credential_hash(
            self.store.pool(),
            &hash_hex,
        )
        .await
        .map_err(BillingApiError::database)?
        .ok_or_else(|| {
            BillingApiError::unauthenticated("Unknown credential")
        })?;

        if !tenant.active {
            return Err(BillingApiError::forbidden("Tenant is inactive"));
        }
        Ok(tenant)
    }

    /// Verifies the elevated admin credential. Hashing both sides first
    /// makes the comparison inputs fixed-length; the comparison itself is
    /// constant-time.
    pub fn verify_admin(
        &self,
        token: &BearerToken,
    ) -> Result<(), BillingApiError> {
        let digest = ring::digest::digest(
            &ring::digest::SHA256,
            token.as_str().as_bytes(),
        );
        if constant_time_eq(digest.as_ref(), &self.admin_token_hash) {
            Ok(())
        } else {
            Err(BillingApiError::unauthenticated("Bad admin credential"))
        }
    }
}

/// Enforces that the tenant id implied by a request parameter matches the
/// tenant resolved from the credential.
pub fn check_tenant_scope(
    tenant: &Tenant,
    requested: Option<&TenantId>,
) -> Result<(), BillingApiError> {
    match requested {
        Some(requested) if *requested != tenant.tenant_id =>
            Err(BillingApiError::forbidden(
                "Credential does not grant access to this tenant",
            )),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod test {
    use tollgate_api::error::BillingErrorKind;

    use super::*;

    #[test]
    fn credential_hash_is_stable_hex_sha256() {
        // SHA-256("abc")
        assert_eq!(
            credential_hash_hex("abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad",
        );
        assert_eq!(credential_hash_hex("abc"), credential_hash_hex("abc"));
        assert_ne!(credential_hash_hex("abc"), credential_hash_hex("abd"));
    }

    #[test]
    fn constant_time_eq_behavior() {
        assert!(constant_time_eq(b"same-bytes", b"same-bytes"));
        assert!(!constant_time_eq(b"same-bytes", b"same-bytez"));
        assert!(!constant_time_eq(b"short", b"longer-input"));
        assert!(constant_time_eq(b"", b""));
    }

    #[test]
    fn tenant_scope_check() {
        let tenant = Tenant {
            tenant_id: "acme".parse().unwrap(),
            display_name: "Acme".to_owned(),
            active: true,
        };

        // No tenant param: scoped implicitly to the credential's tenant.
        assert!(check_tenant_scope(&tenant, None).is_ok());

        let same: TenantId = "acme".parse().unwrap();
        assert!(check_tenant_scope(&tenant, Some(&same)).is_ok());

        let other: TenantId = "other".parse().unwrap();
        let err = check_tenant_scope(&tenant, Some(&other)).unwrap_err();
        assert_eq!(err.kind, BillingErrorKind::Forbidden);
    }
}
