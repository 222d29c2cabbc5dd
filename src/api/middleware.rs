/// Request extraction helpers and HTTP middleware
use crate::{auth::Credential, error::BdrsError, metrics};
use axum::{
    extract::{
        rejection::JsonRejection, FromRequest, FromRequestParts, MatchedPath, Path, Request,
    },
    http::{header, request::Parts, HeaderMap},
    middleware::Next,
    response::Response,
    Json,
};
use serde::de::DeserializeOwned;
use std::time::Instant;

/// Header carrying the management API key
pub const API_KEY_HEADER: &str = "x-api-key";

/// Extract bearer token from Authorization header
pub fn extract_bearer_token(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = value.split_once(' ')?;
    let token = token.trim();
    if scheme.eq_ignore_ascii_case("bearer") && !token.is_empty() {
        Some(token.to_string())
    } else {
        None
    }
}

/// Credential presented with a request, bearer token first
pub fn extract_credential(headers: &HeaderMap) -> Option<Credential> {
    if let Some(token) = extract_bearer_token(headers) {
        return Some(Credential::Bearer(token));
    }

    headers
        .get(API_KEY_HEADER)
        .and_then(|h| h.to_str().ok())
        .map(str::trim)
        .filter(|key| !key.is_empty())
        .map(|key| Credential::ApiKey(key.to_string()))
}

/// Version from an `If-Match` header (`"3"`, `W/"3"` or `3`)
pub fn parse_if_match(headers: &HeaderMap) -> Result<Option<i64>, BdrsError> {
    let Some(value) = headers.get(header::IF_MATCH) else {
        return Ok(None);
    };

    let raw = value
        .to_str()
        .map_err(|_| BdrsError::Validation("If-Match is not valid ASCII".to_string()))?;
    let tag = raw.trim().trim_start_matches("W/").trim_matches('"');

    tag.parse()
        .map(Some)
        .map_err(|_| BdrsError::Validation(format!("If-Match must carry a version, got {}", raw)))
}

/// JSON body whose rejection uses the service's error format
pub struct JsonBody<T>(pub T);

impl<T, S> FromRequest<S> for JsonBody<T>
where
    Json<T>: FromRequest<S, Rejection = JsonRejection>,
    S: Send + Sync,
{
    type Rejection = BdrsError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        Json::<T>::from_request(req, state)
            .await
            .map(|Json(value)| JsonBody(value))
            .map_err(|rejection| BdrsError::Validation(rejection.body_text()))
    }
}

/// Path parameters whose rejection uses the service's error format
pub struct PathParam<T>(pub T);

impl<T, S> FromRequestParts<S> for PathParam<T>
where
    T: DeserializeOwned + Send,
    S: Send + Sync,
{
    type Rejection = BdrsError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        Path::<T>::from_request_parts(parts, state)
            .await
            .map(|Path(value)| PathParam(value))
            .map_err(|rejection| BdrsError::Validation(rejection.body_text()))
    }
}

/// Record request count and latency per route template
pub async fn track_metrics(req: Request, next: Next) -> Response {
    let path = req
        .extensions()
        .get::<MatchedPath>()
        .map(|p| p.as_str().to_string())
        .unwrap_or_else(|| "unmatched".to_string());
    let method = req.method().to_string();
    let start = Instant::now();

    metrics::HTTP_REQUESTS_ACTIVE.inc();
    let response = next.run(req).await;
    metrics::HTTP_REQUESTS_ACTIVE.dec();

    metrics::record_http_request(
        &method,
        &path,
        response.status().as_u16(),
        start.elapsed().as_secs_f64(),
    );

    response
}
