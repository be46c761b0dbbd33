//! Tenant context extraction.
//!
//! The tenant is resolved from the `Authorization: Bearer` credential only.
//! Tenant ids in paths or bodies are never trusted.

use crate::error::BillingError;
use crate::services::tenant::TenantContext;
use crate::startup::AppState;
use axum::async_trait;
use axum::extract::FromRequestParts;
use axum::http::{header, request::Parts, HeaderMap};

/// Raw bearer credential from the `Authorization` header, if any.
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = value.split_once(' ')?;
    if scheme.eq_ignore_ascii_case("bearer") {
        Some(token.trim())
    } else {
        None
    }
}

#[async_trait]
impl FromRequestParts<AppState> for TenantContext {
    type Rejection = BillingError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let token = bearer_token(&parts.headers)
            .ok_or_else(|| BillingError::Unauthenticated.recorded("resolve_tenant"))?;

        state
            .resolver
            .resolve(token)
            .map_err(|e| BillingError::from(e).recorded("resolve_tenant"))
    }
}
