/// HTTP server setup and routing
///
/// The directory API and the management API listen on separate ports so
/// that the management surface can be kept off the public network.
use crate::{
    api::{self, middleware::track_metrics},
    context::AppContext,
    error::{BdrsError, BdrsResult},
};
use axum::{
    http::{header, HeaderName, Method, StatusCode},
    middleware,
    response::Json,
    Router,
};
use serde_json::json;
use tokio::{net::TcpListener, sync::watch};
use tower::ServiceBuilder;
use tower_http::{
    compression::CompressionLayer,
    cors::{Any, CorsLayer},
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    trace::TraceLayer,
};
use tracing::{info, warn};

const REQUEST_ID_HEADER: &str = "x-request-id";

/// Router for the member-facing directory API
pub fn build_directory_router(ctx: AppContext) -> Router {
    finish_router(api::directory_routes(), ctx, &[Method::GET, Method::POST])
}

/// Router for the privileged management API
pub fn build_management_router(ctx: AppContext) -> Router {
    finish_router(
        api::management_routes(),
        ctx,
        &[Method::GET, Method::POST, Method::PUT, Method::DELETE],
    )
}

fn finish_router(routes: Router<AppContext>, ctx: AppContext, methods: &[Method]) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(methods.to_vec())
        .allow_headers([
            header::CONTENT_TYPE,
            header::AUTHORIZATION,
            header::IF_MATCH,
            HeaderName::from_static(api::middleware::API_KEY_HEADER),
        ]);

    routes
        .route_layer(middleware::from_fn(track_metrics))
        .fallback(not_found)
        .method_not_allowed_fallback(method_not_allowed)
        .with_state(ctx)
        .layer(
            ServiceBuilder::new()
                .layer(SetRequestIdLayer::new(
                    HeaderName::from_static(REQUEST_ID_HEADER),
                    MakeRequestUuid,
                ))
                .layer(TraceLayer::new_for_http())
                .layer(PropagateRequestIdLayer::new(HeaderName::from_static(
                    REQUEST_ID_HEADER,
                )))
                .layer(cors)
                .layer(CompressionLayer::new()),
        )
}

/// 404 handler
async fn not_found() -> (StatusCode, Json<serde_json::Value>) {
    (
        StatusCode::NOT_FOUND,
        Json(json!({
            "error": "NOT_FOUND",
            "message": "Endpoint not found"
        })),
    )
}

/// 405 handler for known paths hit with an unsupported method
async fn method_not_allowed() -> (StatusCode, Json<serde_json::Value>) {
    (
        StatusCode::METHOD_NOT_ALLOWED,
        Json(json!({
            "error": "METHOD_NOT_ALLOWED",
            "message": "Method not allowed for this endpoint"
        })),
    )
}

async fn bind(addr: &str) -> BdrsResult<TcpListener> {
    TcpListener::bind(addr)
        .await
        .map_err(|e| BdrsError::Internal(format!("Failed to bind to {}: {}", addr, e)))
}

/// Resolves once Ctrl-C or SIGTERM arrives
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

async fn wait_for_shutdown(mut rx: watch::Receiver<bool>) {
    // A dropped sender also ends the wait
    let _ = rx.wait_for(|stop| *stop).await;
}

/// Serve both APIs until a shutdown signal, draining in-flight requests
pub async fn serve(ctx: AppContext) -> BdrsResult<()> {
    let service = &ctx.config.service;
    let directory_addr = format!("{}:{}", service.hostname, service.directory_port);
    let management_addr = format!("{}:{}", service.hostname, service.management_port);

    let directory_listener = bind(&directory_addr).await?;
    let management_listener = bind(&management_addr).await?;

    info!("BPN directory API listening on {}", directory_addr);
    info!("BPN management API listening on {}", management_addr);
    info!("   Service DID: {}", ctx.service_did());

    let (stop_tx, stop_rx) = watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("Shutdown signal received, draining connections");
        let _ = stop_tx.send(true);
    });

    let directory = axum::serve(directory_listener, build_directory_router(ctx.clone()))
        .with_graceful_shutdown(wait_for_shutdown(stop_rx.clone()));
    let management = axum::serve(management_listener, build_management_router(ctx.clone()))
        .with_graceful_shutdown(wait_for_shutdown(stop_rx));

    let directory = async {
        directory
            .await
            .map_err(|e| BdrsError::Internal(format!("Directory server error: {}", e)))
    };
    let management = async {
        management
            .await
            .map_err(|e| BdrsError::Internal(format!("Management server error: {}", e)))
    };

    tokio::try_join!(directory, management)?;

    info!("HTTP listeners stopped");
    Ok(())
}
