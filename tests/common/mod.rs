//! Shared fixtures for the HTTP surface tests
#![allow(dead_code)]
use axum::{
    body::{Body, Bytes},
    http::{HeaderMap, Request, StatusCode},
    Router,
};
use bdrs_server::{
    auth::{AuthGate, PresentationVerifier, ScopePolicy, StaticKeyResolver, TrustedIssuerRegistry},
    cache::{CacheConfig, MappingCache},
    config::ServerConfig,
    context::AppContext,
    engine::{EngineConfig, ResolutionEngine},
    server::{build_directory_router, build_management_router},
    store::{InMemoryMappingStore, StoreBackend},
};
use http_body_util::BodyExt;
use jsonwebtoken::{encode, EncodingKey, Header};
use serde_json::json;
use std::{collections::HashMap, sync::Arc};
use tower::ServiceExt;

pub const ISSUER: &str = "did:web:issuer.example";
pub const ISSUER_SECRET: &[u8] = b"issuer-secret";
pub const MEMBER: &str = "did:web:member.example";
pub const MEMBER_SECRET: &[u8] = b"member-secret";
pub const OPERATOR: &str = "did:web:operator.example";
pub const OPERATOR_SECRET: &[u8] = b"operator-secret";
pub const API_KEY: &str = "test-management-key-0001";

pub struct TestServer {
    pub ctx: AppContext,
    pub store: InMemoryMappingStore,
    pub directory: Router,
    pub management: Router,
}

pub fn test_server() -> TestServer {
    let vars: HashMap<&str, &str> = [
        ("BDRS_STORE_BACKEND", "memory"),
        ("BDRS_MANAGEMENT_API_KEY", API_KEY),
        ("BDRS_TRUSTED_ISSUERS", ISSUER),
        ("BDRS_MANAGEMENT_PRINCIPALS", OPERATOR),
    ]
    .into_iter()
    .collect();
    let config = ServerConfig::from_lookup(|key| vars.get(key).map(|v| v.to_string())).unwrap();

    let store = InMemoryMappingStore::new();
    let engine = Arc::new(ResolutionEngine::new(
        StoreBackend::Memory(store.clone()),
        Arc::new(MappingCache::new(CacheConfig::default())),
        EngineConfig::default(),
    ));

    let keys = StaticKeyResolver::new()
        .with_secret(ISSUER, ISSUER_SECRET)
        .with_secret(MEMBER, MEMBER_SECRET)
        .with_secret(OPERATOR, OPERATOR_SECRET);
    let verifier = PresentationVerifier::new(
        Arc::new(keys),
        TrustedIssuerRegistry::new([ISSUER]),
        None,
        "MembershipCredential",
    );
    let policy = ScopePolicy {
        management_principals: [OPERATOR.to_string()].into_iter().collect(),
        management_credential_type: None,
    };
    let auth = Arc::new(AuthGate::new(
        Arc::new(verifier),
        policy,
        Some(API_KEY.to_string()),
    ));

    let ctx = AppContext::from_parts(config, engine, auth);
    TestServer {
        directory: build_directory_router(ctx.clone()),
        management: build_management_router(ctx.clone()),
        ctx,
        store,
    }
}

fn sign(claims: serde_json::Value, secret: &[u8]) -> String {
    encode(&Header::default(), &claims, &EncodingKey::from_secret(secret)).unwrap()
}

/// Membership presentation signed by `holder`
pub fn presentation(holder: &str, holder_secret: &[u8], bpn: &str) -> String {
    let exp = chrono::Utc::now().timestamp() + 300;
    let credential = sign(
        json!({
            "iss": ISSUER,
            "sub": holder,
            "exp": exp,
            "vc": {
                "type": ["VerifiableCredential", "MembershipCredential"],
                "credentialSubject": { "id": holder, "holderIdentifier": bpn }
            }
        }),
        ISSUER_SECRET,
    );

    sign(
        json!({
            "iss": holder,
            "aud": "did:web:bdrs.example",
            "exp": exp,
            "vp": { "holder": holder, "verifiableCredential": [credential] }
        }),
        holder_secret,
    )
}

pub fn member_token() -> String {
    presentation(MEMBER, MEMBER_SECRET, "BPNL00000000MEMB")
}

pub fn operator_token() -> String {
    presentation(OPERATOR, OPERATOR_SECRET, "BPNL00000000OPER")
}

pub struct TestResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl TestResponse {
    pub fn json(&self) -> serde_json::Value {
        serde_json::from_slice(&self.body).unwrap()
    }
}

pub async fn send(router: &Router, request: Request<Body>) -> TestResponse {
    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let headers = response.headers().clone();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    TestResponse {
        status,
        headers,
        body,
    }
}

pub fn request(method: &str, uri: &str, bearer: Option<&str>, body: Option<serde_json::Value>) -> Request<Body> {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(token) = bearer {
        builder = builder.header("authorization", format!("Bearer {}", token));
    }
    match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    }
}

/// Management request authenticated with the API key
pub fn admin_request(method: &str, uri: &str, body: Option<serde_json::Value>) -> Request<Body> {
    let mut request = request(method, uri, None, body);
    request
        .headers_mut()
        .insert("x-api-key", API_KEY.parse().unwrap());
    request
}
