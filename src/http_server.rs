//! HTTP server implementation using Axum.

use std::net::SocketAddr;

use axum::{
    extract::State,
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::gateway;
use crate::language::Target;
use crate::protocol::{AnalyzeRequest, ExecuteRequest, ExecuteResponse, WelcomeResponse};
use crate::review::ReviewResult;
use crate::runner;
use crate::state::AppState;

/// Build the router with every route and layer.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(welcome))
        .route("/health", get(health))
        // Interactive execution
        .route("/ws/execute", get(gateway::execute_ws))
        // One-shot execution and review
        .route("/api/execute", post(execute_once))
        .route("/api/analyze", post(analyze))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve until Ctrl-C.
pub async fn run_server(addr: SocketAddr, state: AppState) -> std::io::Result<()> {
    let app = router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Starting HTTP server on {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Ctrl-C handler failed");
        std::future::pending::<()>().await;
    }
    info!("Shutting down");
}

async fn welcome() -> Json<WelcomeResponse> {
    Json(WelcomeResponse {
        message: "Welcome to CodeRefine API. Use /api/analyze to review code and /ws/execute to run it.",
    })
}

async fn health() -> &'static str {
    "OK"
}

async fn execute_once(
    State(state): State<AppState>,
    Json(req): Json<ExecuteRequest>,
) -> Json<ExecuteResponse> {
    info!("POST /api/execute - language: {}", req.language);
    let response = match Target::resolve(&req.language) {
        Ok(Target::Local(language)) => {
            match runner::run_to_completion(&state.config, language, &req.source_code, &req.inputs)
                .await
            {
                Ok(result) => ExecuteResponse {
                    output: result.stdout,
                    error: result.stderr,
                },
                Err(e) => ExecuteResponse::failed(e.to_string()),
            }
        }
        Ok(Target::Remote(language)) => {
            match state
                .remote
                .execute(language, &req.source_code, &req.inputs)
                .await
            {
                Ok(output) => ExecuteResponse {
                    output: output.stdout,
                    error: output.stderr,
                },
                Err(e) => ExecuteResponse::failed(e.to_string()),
            }
        }
        Err(_) => ExecuteResponse::failed(format!(
            "Execution for {} is not supported yet.",
            req.language
        )),
    };
    Json(response)
}

async fn analyze(
    State(state): State<AppState>,
    Json(req): Json<AnalyzeRequest>,
) -> Result<Json<ReviewResult>, (StatusCode, String)> {
    if req.code.trim().is_empty() {
        return Err((
            StatusCode::BAD_REQUEST,
            "Source code cannot be empty".to_string(),
        ));
    }
    info!("POST /api/analyze - language: {}, mode: {:?}", req.language, req.mode);
    let result = state.review.review(&req.code, &req.language, req.mode).await;
    Ok(Json(result))
}
