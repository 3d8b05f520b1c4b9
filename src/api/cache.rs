//! Conditional GET support: entity tags derived from file metadata and
//! `If-None-Match` negotiation.

use axum::body::Body;
use axum::http::header::{CACHE_CONTROL, CONTENT_TYPE, ETAG, IF_NONE_MATCH};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

/// Cache-control directive per content class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CachePolicy {
    /// The UI shell: always revalidate.
    Shell,
    /// CSS, JS and JSON assets of the UI.
    Asset,
    /// Responses that can change between any two requests.
    Dynamic,
    /// Generated images; their content never changes under a fixed tag.
    HistoryImage,
}

impl CachePolicy {
    pub(crate) fn directive(self) -> &'static str {
        match self {
            CachePolicy::Shell => "no-cache",
            CachePolicy::Asset => "public, max-age=300",
            CachePolicy::Dynamic => "no-store",
            CachePolicy::HistoryImage => "public, max-age=86400",
        }
    }
}

/// Entity tag for a file version, quoted as it appears on the wire.
pub(crate) fn file_etag(modified: SystemTime, size: u64) -> String {
    let nanos = modified
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_nanos())
        .unwrap_or_default();
    format!("\"{nanos:x}-{size:x}\"")
}

/// Whether the request's `If-None-Match` header names `etag`.
pub(crate) fn if_none_match_matches(headers: &HeaderMap, etag: &str) -> bool {
    let Some(header_value) = headers
        .get(IF_NONE_MATCH)
        .and_then(|value| value.to_str().ok())
    else {
        return false;
    };

    let expected = normalize_etag_token(etag);
    header_value.split(',').any(|candidate| {
        let normalized = normalize_etag_token(candidate);
        normalized == "*" || normalized == expected
    })
}

fn normalize_etag_token(value: &str) -> &str {
    let trimmed = value.trim();
    trimmed.strip_prefix("W/").unwrap_or(trimmed).trim()
}

/// Serve a file with an entity tag, answering 304 when the client already
/// holds the current version. A file that cannot be found becomes 404.
pub(crate) async fn serve_file(
    path: &Path,
    content_type: &str,
    policy: CachePolicy,
    request_headers: &HeaderMap,
) -> Response {
    let metadata = match tokio::fs::metadata(path).await {
        Ok(metadata) if metadata.is_file() => metadata,
        _ => return not_found(),
    };

    let modified = metadata.modified().unwrap_or(UNIX_EPOCH);
    let etag = file_etag(modified, metadata.len());
    let Ok(etag_value) = HeaderValue::from_str(&etag) else {
        return (StatusCode::INTERNAL_SERVER_ERROR, "Invalid ETag").into_response();
    };

    if if_none_match_matches(request_headers, &etag) {
        return (
            StatusCode::NOT_MODIFIED,
            [
                (CACHE_CONTROL, HeaderValue::from_static(policy.directive())),
                (ETAG, etag_value),
            ],
            Body::empty(),
        )
            .into_response();
    }

    let read = tokio::fs::read(path).await;
    full_response(path, read, content_type, policy, etag_value)
}

/// Turn the outcome of reading an already resolved file into a response.
/// A file that vanished in between is 404; any other read failure is 500.
fn full_response(
    path: &Path,
    read: std::io::Result<Vec<u8>>,
    content_type: &str,
    policy: CachePolicy,
    etag_value: HeaderValue,
) -> Response {
    match read {
        Ok(bytes) => (
            StatusCode::OK,
            [
                (CONTENT_TYPE, header_value_or_octet_stream(content_type)),
                (CACHE_CONTROL, HeaderValue::from_static(policy.directive())),
                (ETAG, etag_value),
            ],
            bytes,
        )
            .into_response(),
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => not_found(),
        Err(error) => {
            tracing::warn!(%error, path = %path.display(), "failed to read file");
            (StatusCode::INTERNAL_SERVER_ERROR, "Read Error").into_response()
        }
    }
}

fn header_value_or_octet_stream(content_type: &str) -> HeaderValue {
    HeaderValue::from_str(content_type)
        .unwrap_or_else(|_| HeaderValue::from_static("application/octet-stream"))
}

pub(crate) fn not_found() -> Response {
    (StatusCode::NOT_FOUND, "Not Found").into_response()
}
