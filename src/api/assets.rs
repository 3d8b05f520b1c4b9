//! UI shell, payload template and static assets served from the
//! installation root.

use super::cache::{self, CachePolicy};
use super::paths;
use super::state::ApiState;

use axum::http::header::{CACHE_CONTROL, CONTENT_TYPE};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};

const INDEX_FILE: &str = "index.html";
const PAYLOAD_FILE: &str = "payload.json";

/// Suffixes served by [`serve_asset`], with the MIME type each maps to.
const ASSET_TYPES: &[(&str, &str)] = &[
    (".css", "text/css"),
    (".js", "application/javascript"),
    (".json", "application/json"),
];

/// Whether `path` names a static asset by suffix alone.
pub(super) fn is_asset_path(path: &str) -> bool {
    ASSET_TYPES.iter().any(|(suffix, _)| path.ends_with(suffix))
}

fn asset_content_type(path: &str) -> &'static str {
    ASSET_TYPES
        .iter()
        .find(|(suffix, _)| path.ends_with(suffix))
        .map(|(_, mime)| *mime)
        .unwrap_or("text/plain")
}

/// GET / and /index.html
pub(super) async fn serve_index(state: &ApiState) -> Response {
    let path = state.config.asset_root.join(INDEX_FILE);
    match tokio::fs::read(&path).await {
        Ok(bytes) => (
            StatusCode::OK,
            [
                (CONTENT_TYPE, "text/html; charset=utf-8"),
                (CACHE_CONTROL, CachePolicy::Shell.directive()),
            ],
            bytes,
        )
            .into_response(),
        Err(error) => {
            tracing::debug!(%error, path = %path.display(), "index not readable");
            (StatusCode::NOT_FOUND, "index.html not found").into_response()
        }
    }
}

/// GET /payload
///
/// Serves the request template verbatim. Absence is a 404 with an empty
/// JSON object so the UI can fall back to its built-in defaults.
pub(super) async fn serve_payload_template(state: &ApiState) -> Response {
    let path = state.config.asset_root.join(PAYLOAD_FILE);
    match tokio::fs::read(&path).await {
        Ok(bytes) => (
            StatusCode::OK,
            [
                (CONTENT_TYPE, "application/json; charset=utf-8"),
                (CACHE_CONTROL, CachePolicy::Dynamic.directive()),
            ],
            bytes,
        )
            .into_response(),
        Err(_) => (
            StatusCode::NOT_FOUND,
            [
                (CONTENT_TYPE, "application/json"),
                (CACHE_CONTROL, CachePolicy::Dynamic.directive()),
            ],
            "{}",
        )
            .into_response(),
    }
}

/// GET /<path>.css, /<path>.js, /<path>.json
pub(super) async fn serve_asset(
    state: &ApiState,
    request_path: &str,
    headers: &HeaderMap,
) -> Response {
    let relative = request_path.strip_prefix('/').unwrap_or(request_path);
    let Some(file_path) = paths::resolve_nested(&state.config.asset_root, relative) else {
        tracing::debug!(path = %request_path, "rejected asset path");
        return cache::not_found();
    };

    cache::serve_file(
        &file_path,
        asset_content_type(request_path),
        CachePolicy::Asset,
        headers,
    )
    .await
}
