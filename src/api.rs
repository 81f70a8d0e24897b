//! JSON front door for creating, inspecting and deleting previews

use crate::app::AppSource;
use crate::error::{creation_error_response, json_error_response, PreviewError, ProxyErrorCode};
use crate::manager::PreviewManager;
use crate::router::{collect_limited, declared_length, is_valid_app_id, BodyError};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::header::{HeaderMap, AUTHORIZATION};
use hyper::{Request, Response, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Version information for the preview host
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");

/// Prefix of the session status endpoint
pub const STATUS_PREFIX: &str = "/api/preview/status/";
/// Prefix of the delete endpoint
pub const DELETE_PREFIX: &str = "/api/preview/";

/// Body of `POST /api/preview/create`
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatePreviewRequest {
    pub user_id: String,
    #[serde(flatten)]
    pub source: AppSource,
}

#[derive(Debug, Serialize)]
struct VersionInfo {
    name: &'static str,
    version: &'static str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct DeletedPreview<'a> {
    app_id: &'a str,
    deleted: bool,
}

/// Helper to create a JSON response
fn json_response<T: Serialize>(status: StatusCode, value: &T) -> Response<BoxBody<Bytes, hyper::Error>> {
    let body = match serde_json::to_vec(value) {
        Ok(body) => body,
        Err(e) => {
            warn!(error = %e, "Failed to serialize response");
            return json_error_response(ProxyErrorCode::InternalError, "Failed to serialize response");
        }
    };

    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(Full::new(Bytes::from(body)).map_err(|never| match never {}).boxed())
        .expect("valid response with StatusCode enum and static header")
}

/// Check a bearer token against the admin token
pub fn check_auth(headers: &HeaderMap, token: &str) -> bool {
    headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|auth| auth.strip_prefix("Bearer "))
        .map(|provided| provided == token)
        .unwrap_or(false)
}

pub fn unauthorized() -> Response<BoxBody<Bytes, hyper::Error>> {
    json_error_response(ProxyErrorCode::Unauthorized, "Missing or invalid bearer token")
}

/// `POST /api/preview/create`
pub async fn create_preview(
    manager: &PreviewManager,
    req: Request<Incoming>,
    max_payload_bytes: usize,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    if let Some(len) = declared_length(req.headers()).filter(|len| *len > max_payload_bytes) {
        return creation_error_response(&PreviewError::PayloadTooLarge {
            size: len,
            limit: max_payload_bytes,
        });
    }

    let body = match collect_limited(req.into_body(), max_payload_bytes).await {
        Ok(body) => body,
        Err(BodyError::TooLarge { limit }) => {
            return creation_error_response(&PreviewError::PayloadTooLarge {
                size: limit + 1,
                limit,
            });
        }
        Err(BodyError::Read(e)) => {
            return creation_error_response(&PreviewError::InvalidRequest(format!("failed to read body: {}", e)));
        }
    };

    let request: CreatePreviewRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(e) => {
            debug!(error = %e, "Rejected malformed creation request");
            return creation_error_response(&PreviewError::InvalidRequest(format!("invalid JSON: {}", e)));
        }
    };

    match manager.create_preview(&request.user_id, request.source).await {
        Ok(created) => json_response(StatusCode::CREATED, &created),
        Err(e) => creation_error_response(&e),
    }
}

/// `GET /api/preview/status/{sessionId}`
pub fn preview_status(manager: &PreviewManager, session_id: &str) -> Response<BoxBody<Bytes, hyper::Error>> {
    match manager.session_status(session_id) {
        Some(view) => json_response(StatusCode::OK, &view),
        None => json_error_response(ProxyErrorCode::NotFound, "Session not found"),
    }
}

/// `GET /health`
pub fn health(manager: &PreviewManager) -> Response<BoxBody<Bytes, hyper::Error>> {
    json_response(StatusCode::OK, &manager.health())
}

/// `GET /version`
pub fn version() -> Response<BoxBody<Bytes, hyper::Error>> {
    json_response(
        StatusCode::OK,
        &VersionInfo {
            name: PKG_NAME,
            version: VERSION,
        },
    )
}

/// `GET /api/preview/instances`
pub fn list_instances(manager: &PreviewManager) -> Response<BoxBody<Bytes, hyper::Error>> {
    json_response(StatusCode::OK, &manager.instances())
}

/// `DELETE /api/preview/{appId}`
pub async fn delete_preview(manager: &PreviewManager, app_id: &str) -> Response<BoxBody<Bytes, hyper::Error>> {
    if !is_valid_app_id(app_id) {
        return json_error_response(ProxyErrorCode::NotFound, "Preview not found");
    }

    match manager.delete_preview(app_id).await {
        Ok(true) => {
            info!(app_id, "Preview deleted via API");
            json_response(StatusCode::OK, &DeletedPreview { app_id, deleted: true })
        }
        Ok(false) => json_error_response(ProxyErrorCode::NotFound, "Preview not found"),
        Err(e) => creation_error_response(&e),
    }
}
