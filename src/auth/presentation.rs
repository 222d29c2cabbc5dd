/// JWT verifiable presentation verifier
///
/// A caller authenticates with a presentation JWT signed by its holder key.
/// The presentation carries JWT credentials, each signed by a trusted issuer
/// and issued to that same holder. At least one of them must be a membership
/// credential, whose subject names the caller's BPN.
use crate::{
    auth::verifier::{AuthMethod, CredentialVerifier, Identity},
    error::{BdrsError, BdrsResult},
};
use async_trait::async_trait;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use jsonwebtoken::{decode, decode_header, Algorithm, DecodingKey, Validation};
use serde::Deserialize;
use std::{
    collections::{HashMap, HashSet},
    path::Path,
    sync::Arc,
};
use tracing::{debug, warn};

/// Verification key of a DID
#[derive(Clone)]
pub struct ResolvedKey {
    pub algorithm: Algorithm,
    pub key: DecodingKey,
}

/// Looks up verification keys for DIDs
#[async_trait]
pub trait KeyResolver: Send + Sync {
    async fn resolve(&self, did: &str, kid: Option<&str>) -> BdrsResult<ResolvedKey>;
}

/// Key file entry: `{"alg": "ES256", "pem": "..."}` or `{"alg": "HS256", "secret": "..."}`
#[derive(Debug, Deserialize)]
struct KeyFileEntry {
    alg: Algorithm,
    #[serde(default)]
    pem: Option<String>,
    #[serde(default)]
    secret: Option<String>,
}

/// Keys loaded once from a JSON file mapping DID to key
#[derive(Clone, Default)]
pub struct StaticKeyResolver {
    keys: HashMap<String, ResolvedKey>,
}

impl StaticKeyResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load keys from a JSON file
    pub fn from_file(path: &Path) -> BdrsResult<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json(&raw)
    }

    pub fn from_json(raw: &str) -> BdrsResult<Self> {
        let entries: HashMap<String, KeyFileEntry> = serde_json::from_str(raw)
            .map_err(|e| BdrsError::Internal(format!("Invalid DID key file: {}", e)))?;

        let mut resolver = Self::new();
        for (did, entry) in entries {
            let key = decoding_key(&did, &entry)?;
            resolver.keys.insert(
                did,
                ResolvedKey {
                    algorithm: entry.alg,
                    key,
                },
            );
        }
        Ok(resolver)
    }

    /// Register an HMAC key
    pub fn with_secret(mut self, did: &str, secret: &[u8]) -> Self {
        self.keys.insert(
            did.to_string(),
            ResolvedKey {
                algorithm: Algorithm::HS256,
                key: DecodingKey::from_secret(secret),
            },
        );
        self
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

fn decoding_key(did: &str, entry: &KeyFileEntry) -> BdrsResult<DecodingKey> {
    let invalid = |e: jsonwebtoken::errors::Error| {
        BdrsError::Internal(format!("Invalid key for {}: {}", did, e))
    };

    match (entry.alg, &entry.pem, &entry.secret) {
        (Algorithm::HS256 | Algorithm::HS384 | Algorithm::HS512, _, Some(secret)) => {
            Ok(DecodingKey::from_secret(secret.as_bytes()))
        }
        (Algorithm::ES256 | Algorithm::ES384, Some(pem), _) => {
            DecodingKey::from_ec_pem(pem.as_bytes()).map_err(invalid)
        }
        (Algorithm::EdDSA, Some(pem), _) => DecodingKey::from_ed_pem(pem.as_bytes()).map_err(invalid),
        (_, Some(pem), _) => DecodingKey::from_rsa_pem(pem.as_bytes()).map_err(invalid),
        _ => Err(BdrsError::Internal(format!(
            "Key for {} has no material matching {:?}",
            did, entry.alg
        ))),
    }
}

#[async_trait]
impl KeyResolver for StaticKeyResolver {
    async fn resolve(&self, did: &str, _kid: Option<&str>) -> BdrsResult<ResolvedKey> {
        self.keys
            .get(did)
            .cloned()
            .ok_or_else(|| BdrsError::Unauthorized(format!("No verification key known for {}", did)))
    }
}

/// DIDs whose credentials are accepted
#[derive(Debug, Clone, Default)]
pub struct TrustedIssuerRegistry {
    issuers: HashSet<String>,
}

impl TrustedIssuerRegistry {
    pub fn new<I, T>(issuers: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        Self {
            issuers: issuers.into_iter().map(Into::into).collect(),
        }
    }

    pub fn is_trusted(&self, issuer: &str) -> bool {
        self.issuers.contains(issuer)
    }

    pub fn len(&self) -> usize {
        self.issuers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.issuers.is_empty()
    }
}

#[derive(Debug, Deserialize)]
struct PresentationClaims {
    iss: String,
    vp: PresentationBody,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PresentationBody {
    #[serde(default)]
    holder: Option<String>,
    #[serde(default)]
    verifiable_credential: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct CredentialClaims {
    #[serde(default)]
    sub: Option<String>,
    vc: CredentialBody,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CredentialBody {
    #[serde(default, rename = "type")]
    types: Vec<String>,
    #[serde(default)]
    credential_subject: CredentialSubject,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CredentialSubject {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    holder_identifier: Option<String>,
    #[serde(default)]
    bpn: Option<String>,
}

/// Claims read before the signature is checked, to pick the key
#[derive(Debug, Deserialize)]
struct UnverifiedClaims {
    #[serde(default)]
    iss: Option<String>,
    #[serde(default)]
    aud: Option<serde_json::Value>,
}

fn unauthorized(reason: impl Into<String>) -> BdrsError {
    BdrsError::Unauthorized(reason.into())
}

/// Read the payload of a JWT without verifying it
fn peek_claims(token: &str) -> BdrsResult<UnverifiedClaims> {
    let payload = token
        .split('.')
        .nth(1)
        .ok_or_else(|| unauthorized("Token is not a JWT"))?;
    let bytes = URL_SAFE_NO_PAD
        .decode(payload)
        .map_err(|_| unauthorized("Token payload is not base64url"))?;
    serde_json::from_slice(&bytes).map_err(|_| unauthorized("Token payload is not a JSON object"))
}

/// JWT presentation verifier
pub struct PresentationVerifier {
    keys: Arc<dyn KeyResolver>,
    issuers: TrustedIssuerRegistry,
    expected_audience: Option<String>,
    membership_type: String,
}

impl PresentationVerifier {
    pub fn new(
        keys: Arc<dyn KeyResolver>,
        issuers: TrustedIssuerRegistry,
        expected_audience: Option<String>,
        membership_type: impl Into<String>,
    ) -> Self {
        Self {
            keys,
            issuers,
            expected_audience,
            membership_type: membership_type.into(),
        }
    }

    /// Check the signature of a JWT against the key of `signer`
    async fn verify_signed<T: serde::de::DeserializeOwned>(
        &self,
        token: &str,
        signer: &str,
        audience: Option<&str>,
    ) -> BdrsResult<T> {
        let header =
            decode_header(token).map_err(|e| unauthorized(format!("Malformed JWT header: {}", e)))?;
        let resolved = self.keys.resolve(signer, header.kid.as_deref()).await?;

        if resolved.algorithm != header.alg {
            return Err(unauthorized(format!(
                "Token of {} is signed with {:?}, key expects {:?}",
                signer, header.alg, resolved.algorithm
            )));
        }

        let mut validation = Validation::new(resolved.algorithm);
        validation.set_issuer(&[signer]);
        match audience {
            Some(aud) => validation.set_audience(&[aud]),
            None => validation.validate_aud = false,
        }

        decode::<T>(token, &resolved.key, &validation)
            .map(|data| data.claims)
            .map_err(|e| unauthorized(format!("Token of {} rejected: {}", signer, e)))
    }
}

/// `aud` as a string, or as an array holding exactly one string
fn single_audience(aud: Option<serde_json::Value>) -> Option<String> {
    match aud? {
        serde_json::Value::String(aud) => Some(aud),
        serde_json::Value::Array(mut values) if values.len() == 1 => match values.pop()? {
            serde_json::Value::String(aud) => Some(aud),
            _ => None,
        },
        _ => None,
    }
}

#[async_trait]
impl CredentialVerifier for PresentationVerifier {
    async fn verify(&self, token: &str) -> BdrsResult<Identity> {
        let unverified = peek_claims(token)?;

        let audience = single_audience(unverified.aud)
            .ok_or_else(|| unauthorized("Token misses a single string audience claim"))?;
        if let Some(expected) = &self.expected_audience {
            if &audience != expected {
                return Err(unauthorized(format!("Unexpected audience {}", audience)));
            }
        }

        let holder = unverified
            .iss
            .ok_or_else(|| unauthorized("Presentation has no issuer"))?;

        let presentation: PresentationClaims = self
            .verify_signed(token, &holder, Some(&audience))
            .await?;

        if let Some(declared) = &presentation.vp.holder {
            if declared != &presentation.iss {
                return Err(unauthorized("Presentation holder does not match its signer"));
            }
        }
        if presentation.vp.verifiable_credential.is_empty() {
            return Err(unauthorized("Presentation contains no credentials"));
        }

        let mut credential_types = Vec::new();
        let mut bpn = None;

        for vc_token in &presentation.vp.verifiable_credential {
            let issuer = peek_claims(vc_token)?
                .iss
                .ok_or_else(|| unauthorized("Credential has no issuer"))?;
            if !self.issuers.is_trusted(&issuer) {
                warn!(issuer = %issuer, "Credential from untrusted issuer");
                return Err(unauthorized(format!("Issuer {} is not trusted", issuer)));
            }

            let credential: CredentialClaims = self.verify_signed(vc_token, &issuer, None).await?;

            let subject = credential
                .vc
                .credential_subject
                .id
                .as_deref()
                .or(credential.sub.as_deref());
            if subject != Some(holder.as_str()) {
                return Err(unauthorized("Credential was not issued to the presentation holder"));
            }

            if credential.vc.types.iter().any(|t| t == &self.membership_type) {
                let subject = credential.vc.credential_subject;
                bpn = subject.holder_identifier.or(subject.bpn).or(bpn);
            }
            credential_types.extend(credential.vc.types);
        }

        if !credential_types.iter().any(|t| t == &self.membership_type) {
            return Err(unauthorized(format!(
                "Presentation carries no {}",
                self.membership_type
            )));
        }

        debug!(holder = %holder, bpn = ?bpn, "Verified presentation");

        Ok(Identity {
            subject: holder,
            bpn,
            credential_types,
            method: AuthMethod::Presentation,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};
    use serde_json::json;

    const HOLDER: &str = "did:web:holder.example";
    const ISSUER: &str = "did:web:issuer.example";
    const AUDIENCE: &str = "did:web:bdrs.example";

    fn exp() -> i64 {
        chrono::Utc::now().timestamp() + 300
    }

    fn sign(claims: serde_json::Value, secret: &[u8]) -> String {
        encode(&Header::default(), &claims, &EncodingKey::from_secret(secret)).unwrap()
    }

    fn membership_vc(subject: &str, issuer: &str, secret: &[u8]) -> String {
        sign(
            json!({
                "iss": issuer,
                "sub": subject,
                "exp": exp(),
                "vc": {
                    "type": ["VerifiableCredential", "MembershipCredential"],
                    "credentialSubject": { "id": subject, "holderIdentifier": "BPNL000000000001" }
                }
            }),
            secret,
        )
    }

    fn presentation(aud: serde_json::Value, credentials: Vec<String>) -> String {
        sign(
            json!({
                "iss": HOLDER,
                "aud": aud,
                "exp": exp(),
                "vp": { "holder": HOLDER, "verifiableCredential": credentials }
            }),
            b"holder-secret",
        )
    }

    fn verifier() -> PresentationVerifier {
        let keys = StaticKeyResolver::new()
            .with_secret(HOLDER, b"holder-secret")
            .with_secret(ISSUER, b"issuer-secret");
        PresentationVerifier::new(
            Arc::new(keys),
            TrustedIssuerRegistry::new([ISSUER]),
            Some(AUDIENCE.to_string()),
            "MembershipCredential",
        )
    }

    #[tokio::test]
    async fn test_valid_presentation() {
        let token = presentation(
            json!(AUDIENCE),
            vec![membership_vc(HOLDER, ISSUER, b"issuer-secret")],
        );

        let identity = verifier().verify(&token).await.unwrap();
        assert_eq!(identity.subject, HOLDER);
        assert_eq!(identity.bpn.as_deref(), Some("BPNL000000000001"));
        assert!(identity.has_credential_type("MembershipCredential"));
        assert_eq!(identity.method, AuthMethod::Presentation);
    }

    #[tokio::test]
    async fn test_audience_must_be_single_string() {
        let token = presentation(
            json!([AUDIENCE, "did:web:other"]),
            vec![membership_vc(HOLDER, ISSUER, b"issuer-secret")],
        );
        assert!(matches!(
            verifier().verify(&token).await,
            Err(BdrsError::Unauthorized(_))
        ));

        let token = presentation(
            json!("did:web:other"),
            vec![membership_vc(HOLDER, ISSUER, b"issuer-secret")],
        );
        assert!(verifier().verify(&token).await.is_err());
    }

    #[tokio::test]
    async fn test_audience_accepts_one_element_array() {
        let token = presentation(
            json!([AUDIENCE]),
            vec![membership_vc(HOLDER, ISSUER, b"issuer-secret")],
        );
        let identity = verifier().verify(&token).await.unwrap();
        assert_eq!(identity.subject, HOLDER);

        let token = presentation(
            json!([AUDIENCE, AUDIENCE]),
            vec![membership_vc(HOLDER, ISSUER, b"issuer-secret")],
        );
        assert!(matches!(
            verifier().verify(&token).await,
            Err(BdrsError::Unauthorized(_))
        ));

        let token = presentation(
            json!([42]),
            vec![membership_vc(HOLDER, ISSUER, b"issuer-secret")],
        );
        assert!(verifier().verify(&token).await.is_err());
    }

    #[tokio::test]
    async fn test_untrusted_issuer_rejected() {
        let keys = StaticKeyResolver::new()
            .with_secret(HOLDER, b"holder-secret")
            .with_secret("did:web:rogue.example", b"rogue-secret");
        let verifier = PresentationVerifier::new(
            Arc::new(keys),
            TrustedIssuerRegistry::new([ISSUER]),
            None,
            "MembershipCredential",
        );

        let token = presentation(
            json!(AUDIENCE),
            vec![membership_vc(HOLDER, "did:web:rogue.example", b"rogue-secret")],
        );
        assert!(matches!(
            verifier.verify(&token).await,
            Err(BdrsError::Unauthorized(_))
        ));
    }

    #[tokio::test]
    async fn test_bad_signature_rejected() {
        let token = presentation(
            json!(AUDIENCE),
            vec![membership_vc(HOLDER, ISSUER, b"wrong-secret")],
        );
        assert!(verifier().verify(&token).await.is_err());
    }

    #[tokio::test]
    async fn test_credential_for_other_subject_rejected() {
        let token = presentation(
            json!(AUDIENCE),
            vec![membership_vc("did:web:someone-else", ISSUER, b"issuer-secret")],
        );
        assert!(verifier().verify(&token).await.is_err());
    }

    #[tokio::test]
    async fn test_membership_credential_required() {
        let vc = sign(
            json!({
                "iss": ISSUER,
                "sub": HOLDER,
                "exp": exp(),
                "vc": { "type": ["VerifiableCredential"], "credentialSubject": { "id": HOLDER } }
            }),
            b"issuer-secret",
        );
        let token = presentation(json!(AUDIENCE), vec![vc]);
        assert!(verifier().verify(&token).await.is_err());
    }

    #[tokio::test]
    async fn test_garbage_token_rejected() {
        assert!(matches!(
            verifier().verify("not-a-jwt").await,
            Err(BdrsError::Unauthorized(_))
        ));
    }

    #[test]
    fn test_key_file_parsing() {
        let resolver = StaticKeyResolver::from_json(
            r#"{"did:web:issuer.example": {"alg": "HS256", "secret": "issuer-secret"}}"#,
        )
        .unwrap();
        assert_eq!(resolver.len(), 1);

        assert!(StaticKeyResolver::from_json(r#"{"did:web:x": {"alg": "ES256"}}"#).is_err());
        assert!(StaticKeyResolver::from_json("[]").is_err());
    }
}
