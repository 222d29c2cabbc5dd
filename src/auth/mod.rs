/// Authentication Gate
///
/// Turns raw credential material into a verified [`Identity`] and an
/// authorization [`Scope`]. The directory API needs at least `ReadOnly`,
/// the management API needs `ReadWrite`.
pub mod presentation;
pub mod verifier;

pub use presentation::{KeyResolver, PresentationVerifier, StaticKeyResolver, TrustedIssuerRegistry};
pub use verifier::{AuthMethod, Credential, CredentialVerifier, Identity};

use crate::{
    api::middleware::extract_credential,
    context::AppContext,
    error::{BdrsError, BdrsResult},
    metrics,
};
use axum::{extract::FromRequestParts, http::request::Parts};
use serde::Serialize;
use std::{collections::HashSet, sync::Arc};
use tracing::{debug, warn};

/// Principal name of callers using the management API key
pub const API_KEY_PRINCIPAL: &str = "management-api-key";

/// Authorization scope, ordered by privilege
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Scope {
    ReadOnly,
    ReadWrite,
}

impl Scope {
    pub fn satisfies(self, required: Scope) -> bool {
        self >= required
    }
}

/// Rules that grant `ReadWrite`
#[derive(Debug, Clone, Default)]
pub struct ScopePolicy {
    /// DIDs or BPNs allowed to manage the directory
    pub management_principals: HashSet<String>,
    /// Credential type that grants management rights
    pub management_credential_type: Option<String>,
}

impl ScopePolicy {
    pub fn scope_for(&self, identity: &Identity) -> Scope {
        if identity.method == AuthMethod::ApiKey {
            return Scope::ReadWrite;
        }

        let principal = self.management_principals.contains(&identity.subject)
            || identity
                .bpn
                .as_ref()
                .is_some_and(|bpn| self.management_principals.contains(bpn));

        let credential = self
            .management_credential_type
            .as_deref()
            .is_some_and(|t| identity.has_credential_type(t));

        if principal || credential {
            Scope::ReadWrite
        } else {
            Scope::ReadOnly
        }
    }
}

/// Verified caller together with its scope
#[derive(Debug, Clone)]
pub struct Authorized {
    pub identity: Identity,
    pub scope: Scope,
}

/// Verifies callers and enforces the required scope
pub struct AuthGate {
    verifier: Arc<dyn CredentialVerifier>,
    policy: ScopePolicy,
    management_api_key: Option<String>,
}

impl AuthGate {
    pub fn new(
        verifier: Arc<dyn CredentialVerifier>,
        policy: ScopePolicy,
        management_api_key: Option<String>,
    ) -> Self {
        Self {
            verifier,
            policy,
            management_api_key,
        }
    }

    async fn identify(&self, credential: &Credential) -> BdrsResult<Identity> {
        match credential {
            Credential::Bearer(token) => self.verifier.verify(token).await,
            Credential::ApiKey(key) => match &self.management_api_key {
                Some(expected) if constant_time_eq(key.as_bytes(), expected.as_bytes()) => {
                    Ok(Identity {
                        subject: API_KEY_PRINCIPAL.to_string(),
                        bpn: None,
                        credential_types: Vec::new(),
                        method: AuthMethod::ApiKey,
                    })
                }
                _ => Err(BdrsError::Unauthorized("Invalid API key".to_string())),
            },
        }
    }

    /// Verify a credential and check it grants `required`.
    /// Missing or invalid credentials are `Unauthorized`, insufficient scope is `Forbidden`.
    pub async fn authorize(
        &self,
        credential: Option<Credential>,
        required: Scope,
        surface: &str,
    ) -> BdrsResult<Authorized> {
        let Some(credential) = credential else {
            metrics::record_auth_attempt(surface, false);
            return Err(BdrsError::Unauthorized(
                "Missing authorization header".to_string(),
            ));
        };

        let identity = match self.identify(&credential).await {
            Ok(identity) => identity,
            Err(e) => {
                warn!(surface, "Credential verification failed: {}", e);
                metrics::record_auth_attempt(surface, false);
                return Err(e);
            }
        };
        metrics::record_auth_attempt(surface, true);

        let scope = self.policy.scope_for(&identity);
        if !scope.satisfies(required) {
            debug!(subject = %identity.subject, ?scope, ?required, "Insufficient scope");
            return Err(BdrsError::Forbidden(format!(
                "{} may not use the {} API",
                identity.subject, surface
            )));
        }

        Ok(Authorized { identity, scope })
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// Caller of the directory API
#[derive(Debug, Clone)]
pub struct DirectoryCaller(pub Authorized);

impl FromRequestParts<AppContext> for DirectoryCaller {
    type Rejection = BdrsError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppContext,
    ) -> Result<Self, Self::Rejection> {
        let credential = extract_credential(&parts.headers);
        state
            .auth
            .authorize(credential, Scope::ReadOnly, "directory")
            .await
            .map(DirectoryCaller)
    }
}

/// Caller of the management API
#[derive(Debug, Clone)]
pub struct ManagementCaller(pub Authorized);

impl FromRequestParts<AppContext> for ManagementCaller {
    type Rejection = BdrsError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppContext,
    ) -> Result<Self, Self::Rejection> {
        let credential = extract_credential(&parts.headers);
        state
            .auth
            .authorize(credential, Scope::ReadWrite, "management")
            .await
            .map(ManagementCaller)
    }
}
