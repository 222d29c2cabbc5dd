/// Management API: privileged writes and record inspection
use crate::{
    api::{
        directory_dump,
        middleware::{parse_if_match, JsonBody, PathParam},
    },
    auth::ManagementCaller,
    context::AppContext,
    error::{BdrsError, BdrsResult},
    store::{MappingRecord, NewMapping, RecordPage},
};
use axum::{
    extract::{Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use tracing::info;

/// Build management routes
pub fn routes() -> Router<AppContext> {
    Router::new()
        .route("/bpn", post(create_mapping).get(list_mappings))
        .route(
            "/bpn/{bpn}",
            get(get_mapping).put(update_mapping).delete(delete_mapping),
        )
        .route("/bpn:batchRegister", post(batch_register))
        .route("/did/{did}", get(find_by_did))
        .route("/bpn-directory", get(get_directory))
}

#[derive(Debug, Deserialize)]
pub struct CreateMappingRequest {
    pub bpn: String,
    pub did: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateMappingRequest {
    pub did: String,
    #[serde(default)]
    pub expected_version: Option<i64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteParams {
    pub expected_version: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListParams {
    pub page_token: Option<String>,
    pub page_size: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct BatchRegisterRequest {
    pub entries: Vec<NewMapping>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RecordsResponse {
    pub records: Vec<MappingRecord>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DidMappingsResponse {
    pub did: String,
    pub records: Vec<MappingRecord>,
}

/// Record with its version as entity tag
fn record_response(status: StatusCode, record: MappingRecord) -> Response {
    let etag = format!("\"{}\"", record.version);
    (status, [(header::ETAG, etag)], Json(record)).into_response()
}

fn parse_number<T: std::str::FromStr>(name: &str, raw: &str) -> BdrsResult<T> {
    raw.trim()
        .parse()
        .map_err(|_| BdrsError::Validation(format!("{} must be a number, got {}", name, raw)))
}

/// Body or query value wins over If-Match
fn expected_version(explicit: Option<i64>, headers: &HeaderMap) -> BdrsResult<i64> {
    match explicit {
        Some(version) => Ok(version),
        None => parse_if_match(headers)?.ok_or_else(|| {
            BdrsError::Validation(
                "expectedVersion is required (body, query or If-Match)".to_string(),
            )
        }),
    }
}

/// POST /bpn
async fn create_mapping(
    ManagementCaller(caller): ManagementCaller,
    State(ctx): State<AppContext>,
    JsonBody(req): JsonBody<CreateMappingRequest>,
) -> BdrsResult<Response> {
    let record = ctx.engine.register(&req.bpn, &req.did).await?;
    info!(subject = %caller.identity.subject, bpn = %record.bpn, "Mapping created");
    Ok(record_response(StatusCode::CREATED, record))
}

/// GET /bpn/{bpn}
async fn get_mapping(
    _caller: ManagementCaller,
    State(ctx): State<AppContext>,
    PathParam(bpn): PathParam<String>,
) -> BdrsResult<Response> {
    let record = ctx.engine.record(&bpn).await?;
    Ok(record_response(StatusCode::OK, record))
}

/// PUT /bpn/{bpn}
async fn update_mapping(
    ManagementCaller(caller): ManagementCaller,
    State(ctx): State<AppContext>,
    PathParam(bpn): PathParam<String>,
    headers: HeaderMap,
    JsonBody(req): JsonBody<UpdateMappingRequest>,
) -> BdrsResult<Response> {
    let expected = expected_version(req.expected_version, &headers)?;
    let record = ctx.engine.rotate(&bpn, &req.did, expected).await?;
    info!(subject = %caller.identity.subject, bpn = %bpn, version = record.version, "Mapping updated");
    Ok(record_response(StatusCode::OK, record))
}

/// DELETE /bpn/{bpn}
async fn delete_mapping(
    ManagementCaller(caller): ManagementCaller,
    State(ctx): State<AppContext>,
    PathParam(bpn): PathParam<String>,
    Query(params): Query<DeleteParams>,
    headers: HeaderMap,
) -> BdrsResult<StatusCode> {
    let explicit = params
        .expected_version
        .as_deref()
        .map(|raw| parse_number("expectedVersion", raw))
        .transpose()?;
    let expected = expected_version(explicit, &headers)?;

    ctx.engine.remove(&bpn, expected).await?;
    info!(subject = %caller.identity.subject, bpn = %bpn, "Mapping deleted");
    Ok(StatusCode::NO_CONTENT)
}

/// GET /bpn
async fn list_mappings(
    _caller: ManagementCaller,
    State(ctx): State<AppContext>,
    Query(params): Query<ListParams>,
) -> BdrsResult<Json<RecordPage>> {
    let page_size = params
        .page_size
        .as_deref()
        .map(|raw| parse_number("pageSize", raw))
        .transpose()?;
    let page_token = params.page_token.as_deref().filter(|t| !t.is_empty());

    let page = ctx.engine.list(page_token, page_size).await?;
    Ok(Json(page))
}

/// POST /bpn:batchRegister
async fn batch_register(
    ManagementCaller(caller): ManagementCaller,
    State(ctx): State<AppContext>,
    JsonBody(req): JsonBody<BatchRegisterRequest>,
) -> BdrsResult<(StatusCode, Json<RecordsResponse>)> {
    let records = ctx.engine.register_batch(&req.entries).await?;
    info!(subject = %caller.identity.subject, count = records.len(), "Mappings created in batch");
    Ok((StatusCode::CREATED, Json(RecordsResponse { records })))
}

/// GET /did/{did}
async fn find_by_did(
    _caller: ManagementCaller,
    State(ctx): State<AppContext>,
    PathParam(did): PathParam<String>,
) -> BdrsResult<Json<DidMappingsResponse>> {
    let records = ctx.engine.find_by_did(&did).await?;
    Ok(Json(DidMappingsResponse { did, records }))
}

/// GET /bpn-directory
async fn get_directory(_caller: ManagementCaller, State(ctx): State<AppContext>) -> BdrsResult<Response> {
    directory_dump(&ctx).await
}
