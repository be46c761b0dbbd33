//! Tenant context resolution from signed credentials.

use crate::error::BillingError;
use chrono::{DateTime, TimeZone, Utc};
use jsonwebtoken::{decode, errors::ErrorKind, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use thiserror::Error;
use uuid::Uuid;

pub const SCOPE_USAGE_WRITE: &str = "usage:write";
pub const SCOPE_INVOICES_WRITE: &str = "invoices:write";
pub const SCOPE_INVOICES_READ: &str = "invoices:read";
pub const SCOPE_PLANS_WRITE: &str = "plans:write";

/// Claims carried by a tenant credential.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TenantClaims {
    pub tenant_id: Uuid,
    #[serde(default)]
    pub scopes: Vec<String>,
    pub iat: i64,
    pub exp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iss: Option<String>,
}

/// Verified tenant identity.
///
/// Only [`TenantResolver::resolve`] constructs one, so holding a
/// `TenantContext` means the credential was checked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TenantContext {
    tenant_id: Uuid,
    scopes: BTreeSet<String>,
    issued_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
}

impl TenantContext {
    pub fn tenant_id(&self) -> Uuid {
        self.tenant_id
    }

    pub fn scopes(&self) -> &BTreeSet<String> {
        &self.scopes
    }

    pub fn issued_at(&self) -> DateTime<Utc> {
        self.issued_at
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }

    pub fn has_scope(&self, scope: &str) -> bool {
        self.scopes.contains(scope)
    }

    pub fn require_scope(&self, scope: &str) -> Result<(), BillingError> {
        if self.has_scope(scope) {
            Ok(())
        } else {
            Err(BillingError::Forbidden(scope.to_string()))
        }
    }
}

#[cfg(test)]
impl TenantContext {
    pub(crate) fn for_tenant(tenant_id: Uuid, scopes: &[&str]) -> Self {
        let now = Utc::now();
        Self {
            tenant_id,
            scopes: scopes.iter().map(|s| s.to_string()).collect(),
            issued_at: now,
            expires_at: now + chrono::Duration::hours(1),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CredentialError {
    #[error("credential rejected")]
    Unauthenticated,
    #[error("credential expired")]
    Expired,
    #[error("malformed credential: {0}")]
    Malformed(String),
}

impl From<CredentialError> for BillingError {
    fn from(err: CredentialError) -> Self {
        match err {
            CredentialError::Unauthenticated => BillingError::Unauthenticated,
            CredentialError::Expired => BillingError::CredentialExpired,
            CredentialError::Malformed(reason) => BillingError::MalformedCredential(reason),
        }
    }
}

/// Verifies HS256 tenant credentials.
#[derive(Clone)]
pub struct TenantResolver {
    decoding_key: DecodingKey,
    validation: Validation,
}

impl TenantResolver {
    pub fn new(secret: &str, issuer: Option<&str>) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = true;
        validation.leeway = 0;
        validation.set_required_spec_claims(&["exp", "iat"]);
        if let Some(iss) = issuer {
            validation.set_issuer(&[iss]);
        }

        Self {
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            validation,
        }
    }

    /// Resolve a raw credential into a tenant context.
    ///
    /// The tenant id is taken only from the verified claims.
    pub fn resolve(&self, credential: &str) -> Result<TenantContext, CredentialError> {
        let credential = credential.trim();
        if credential.is_empty() {
            return Err(CredentialError::Unauthenticated);
        }

        let data = decode::<TenantClaims>(credential, &self.decoding_key, &self.validation)
            .map_err(|e| match e.kind() {
                ErrorKind::ExpiredSignature => CredentialError::Expired,
                ErrorKind::InvalidToken
                | ErrorKind::Base64(_)
                | ErrorKind::Json(_)
                | ErrorKind::Utf8(_)
                | ErrorKind::MissingRequiredClaim(_) => CredentialError::Malformed(e.to_string()),
                _ => CredentialError::Unauthenticated,
            })?;

        let claims = data.claims;
        let issued_at = Utc
            .timestamp_opt(claims.iat, 0)
            .single()
            .ok_or_else(|| CredentialError::Malformed("iat out of range".to_string()))?;
        let expires_at = Utc
            .timestamp_opt(claims.exp, 0)
            .single()
            .ok_or_else(|| CredentialError::Malformed("exp out of range".to_string()))?;

        Ok(TenantContext {
            tenant_id: claims.tenant_id,
            scopes: claims.scopes.into_iter().collect(),
            issued_at,
            expires_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use jsonwebtoken::{encode, EncodingKey, Header};

    const SECRET: &str = "test-secret";

    fn token(tenant_id: Uuid, scopes: &[&str], exp_offset: i64, iss: Option<&str>) -> String {
        let now = Utc::now();
        let claims = TenantClaims {
            tenant_id,
            scopes: scopes.iter().map(|s| s.to_string()).collect(),
            iat: now.timestamp(),
            exp: (now + Duration::seconds(exp_offset)).timestamp(),
            iss: iss.map(str::to_string),
        };
        encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(SECRET.as_bytes()),
        )
        .unwrap()
    }

    #[test]
    fn test_resolves_tenant_from_claims() {
        let tenant = Uuid::new_v4();
        let resolver = TenantResolver::new(SECRET, None);
        let ctx = resolver
            .resolve(&token(tenant, &[SCOPE_USAGE_WRITE], 300, None))
            .unwrap();

        assert_eq!(ctx.tenant_id(), tenant);
        assert!(ctx.require_scope(SCOPE_USAGE_WRITE).is_ok());
        assert!(matches!(
            ctx.require_scope(SCOPE_INVOICES_WRITE),
            Err(BillingError::Forbidden(_))
        ));
    }

    #[test]
    fn test_expired_credential() {
        let resolver = TenantResolver::new(SECRET, None);
        let err = resolver
            .resolve(&token(Uuid::new_v4(), &[], -120, None))
            .unwrap_err();
        assert_eq!(err, CredentialError::Expired);
    }

    #[test]
    fn test_wrong_secret_is_unauthenticated() {
        let resolver = TenantResolver::new("another-secret", None);
        let err = resolver
            .resolve(&token(Uuid::new_v4(), &[], 300, None))
            .unwrap_err();
        assert_eq!(err, CredentialError::Unauthenticated);
    }

    #[test]
    fn test_garbage_is_malformed() {
        let resolver = TenantResolver::new(SECRET, None);
        assert!(matches!(
            resolver.resolve("not-a-token"),
            Err(CredentialError::Malformed(_))
        ));
        assert_eq!(resolver.resolve("  "), Err(CredentialError::Unauthenticated));
    }

    #[test]
    fn test_issuer_enforced_when_configured() {
        let resolver = TenantResolver::new(SECRET, Some("billing-gateway"));
        let tenant = Uuid::new_v4();
        assert!(resolver
            .resolve(&token(tenant, &[], 300, Some("billing-gateway")))
            .is_ok());
        assert_eq!(
            resolver
                .resolve(&token(tenant, &[], 300, Some("someone-else")))
                .unwrap_err(),
            CredentialError::Unauthenticated
        );
    }
}
