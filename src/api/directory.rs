/// Directory API: read-only resolution for authenticated members
use crate::{
    api::{
        directory_dump,
        middleware::{JsonBody, PathParam},
    },
    auth::DirectoryCaller,
    context::AppContext,
    engine::BatchOutcome,
    error::BdrsResult,
};
use axum::{
    extract::State,
    response::{Json, Response},
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Build directory routes
pub fn routes() -> Router<AppContext> {
    Router::new()
        .route("/bpn/{bpn}", get(resolve_bpn))
        .route("/bpn:batchResolve", post(batch_resolve))
        .route("/bpn-directory", get(get_directory))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ResolveResponse {
    pub bpn: String,
    pub did: String,
}

#[derive(Debug, Deserialize)]
pub struct BatchResolveRequest {
    pub bpns: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct BatchResolveResponse {
    pub results: BTreeMap<String, BatchOutcome>,
}

/// GET /bpn/{bpn}
async fn resolve_bpn(
    _caller: DirectoryCaller,
    State(ctx): State<AppContext>,
    PathParam(bpn): PathParam<String>,
) -> BdrsResult<Json<ResolveResponse>> {
    let did = ctx.engine.resolve(&bpn).await?;
    Ok(Json(ResolveResponse { bpn, did }))
}

/// POST /bpn:batchResolve
async fn batch_resolve(
    _caller: DirectoryCaller,
    State(ctx): State<AppContext>,
    JsonBody(req): JsonBody<BatchResolveRequest>,
) -> BdrsResult<Json<BatchResolveResponse>> {
    let results = ctx.engine.resolve_batch(&req.bpns).await?;
    Ok(Json(BatchResolveResponse { results }))
}

/// GET /bpn-directory
async fn get_directory(_caller: DirectoryCaller, State(ctx): State<AppContext>) -> BdrsResult<Response> {
    directory_dump(&ctx).await
}
