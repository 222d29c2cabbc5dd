/// API routes and handlers
pub mod directory;
pub mod health;
pub mod management;
pub mod middleware;

use crate::{context::AppContext, error::BdrsResult};
use axum::{
    http::header,
    response::{IntoResponse, Response},
    Router,
};

/// Routes served on the directory listener
pub fn directory_routes() -> Router<AppContext> {
    Router::new()
        .merge(directory::routes())
        .merge(health::routes())
}

/// Routes served on the management listener
pub fn management_routes() -> Router<AppContext> {
    Router::new()
        .merge(management::routes())
        .merge(health::routes())
}

/// Pre-compressed directory dump, shared by both surfaces
pub(crate) async fn directory_dump(ctx: &AppContext) -> BdrsResult<Response> {
    let encoded = ctx.engine.directory_snapshot().await?;

    Ok((
        [
            (header::CONTENT_TYPE, "application/json"),
            (header::CONTENT_ENCODING, "gzip"),
        ],
        encoded.as_ref().clone(),
    )
        .into_response())
}
