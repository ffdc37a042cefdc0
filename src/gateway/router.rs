//! HTTP router and handlers

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Query, State, rejection::QueryRejection},
    http::{
        HeaderMap, HeaderValue, Method, StatusCode,
        header::{ACCESS_CONTROL_ALLOW_ORIGIN, AUTHORIZATION, CONTENT_TYPE, WWW_AUTHENTICATE},
    },
    middleware,
    response::{IntoResponse, Response},
    routing::get,
};
use serde::Deserialize;
use serde_json::json;
use tower_http::{
    catch_panic::CatchPanicLayer,
    cors::{Any, CorsLayer},
    timeout::TimeoutLayer,
    trace::TraceLayer,
};

use crate::config::ServerConfig;
use crate::upload::{UploadAuthorizationService, UploadOutcome, UploadRequestInput};

/// Shared application state
pub struct AppState {
    /// Upload authorization pipeline
    pub service: Arc<UploadAuthorizationService>,
}

/// Query string of `GET /upload-url`
#[derive(Debug, Deserialize)]
pub struct UploadQuery {
    /// Requested object filename
    pub filename: Option<String>,
}

/// Create the router
pub fn create_router(state: Arc<AppState>, server: &ServerConfig) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/upload-url", get(upload_url_handler))
        .layer(CatchPanicLayer::new())
        .layer(TimeoutLayer::new(server.request_timeout))
        // Outside the panic and timeout layers so their responses carry it too
        .layer(middleware::map_response(allow_any_origin))
        .layer(cors_layer())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Preflight handling for browser clients on any origin.
fn cors_layer() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::OPTIONS])
        .allow_headers([AUTHORIZATION, CONTENT_TYPE])
}

async fn allow_any_origin(mut response: Response) -> Response {
    response
        .headers_mut()
        .insert(ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_static("*"));
    response
}

/// GET /health
async fn health_handler() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

/// GET /upload-url?filename=<name>
async fn upload_url_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    query: Result<Query<UploadQuery>, QueryRejection>,
) -> Response {
    // Query problems are reported only once the caller is authorized
    let (filename, query_error) = match query {
        Ok(Query(query)) => (query.filename, None),
        Err(rejection) => (None, Some(rejection.body_text())),
    };
    let outcome = state
        .service
        .handle(UploadRequestInput {
            headers,
            filename,
            query_error,
        })
        .await;
    outcome_response(outcome)
}

/// Map a terminal outcome to its HTTP response.
pub fn outcome_response(outcome: UploadOutcome) -> Response {
    match outcome {
        UploadOutcome::Issued(grant) => (
            StatusCode::OK,
            Json(json!({
                "uploadUrl": grant.url,
                "key": grant.key,
                "expiresIn": grant.expires_in.as_secs(),
            })),
        )
            .into_response(),
        UploadOutcome::Unauthorized(result) => (
            StatusCode::UNAUTHORIZED,
            [(WWW_AUTHENTICATE, "Bearer")],
            Json(result),
        )
            .into_response(),
        UploadOutcome::MalformedQuery(details) => {
            error_response(StatusCode::BAD_REQUEST, "Invalid request", &details)
        }
        UploadOutcome::MissingFilename => error_response(
            StatusCode::BAD_REQUEST,
            "Invalid request",
            "missing filename query parameter",
        ),
        UploadOutcome::InvalidFilename(e) => {
            error_response(StatusCode::BAD_REQUEST, "Invalid filename", &e.to_string())
        }
        // Details stay generic; the full error is in the server log
        UploadOutcome::KeyFetchFailed => error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            "Authorization unavailable",
            "could not load token signing keys",
        ),
        UploadOutcome::IssueFailed(_) => error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            "Failed to issue upload URL",
            "storage signing failed",
        ),
    }
}

fn error_response(status: StatusCode, error: &str, details: &str) -> Response {
    (status, Json(json!({ "error": error, "details": details }))).into_response()
}
