/// Credential verification interface
use crate::error::BdrsResult;
use async_trait::async_trait;
use serde::Serialize;

/// Raw credential material taken from a request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Credential {
    /// `Authorization: Bearer <token>`
    Bearer(String),
    /// `X-Api-Key: <key>`
    ApiKey(String),
}

/// How the caller proved who they are
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthMethod {
    Presentation,
    ApiKey,
}

/// Verified caller
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    /// Holder DID, or a fixed principal name for API key callers
    pub subject: String,
    /// BPN asserted by the membership credential
    pub bpn: Option<String>,
    /// Types of every verified credential
    pub credential_types: Vec<String>,
    pub method: AuthMethod,
}

impl Identity {
    pub fn has_credential_type(&self, credential_type: &str) -> bool {
        self.credential_types.iter().any(|t| t == credential_type)
    }
}

/// Verifies bearer credentials and extracts the caller's identity
///
/// Implementations must not retry; a failed verification is final for the
/// request.
#[async_trait]
pub trait CredentialVerifier: Send + Sync {
    async fn verify(&self, token: &str) -> BdrsResult<Identity>;
}
