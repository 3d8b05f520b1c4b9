//! Read-only browser for the directory of generated images.
//!
//! GET /history
//!   - Lists image files directly under the history directory, newest first.
//!   - Returns `{ enabled, error, items: [{ name, url }] }`. A missing or
//!     unreadable directory yields `enabled: false` with a reason, never an
//!     HTTP error.
//!
//! GET /history/image?name=<file>
//!   - Serves one image through the entity-tag cache path.

use super::cache::{self, CachePolicy};
use super::paths;
use super::state::ApiState;

use axum::Json;
use axum::http::header::CACHE_CONTROL;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "webp"];

const IMAGE_ROUTE: &str = "/history/image";

#[derive(Debug, Serialize)]
pub(super) struct HistoryItem {
    name: String,
    url: String,
}

#[derive(Debug, Serialize)]
pub(super) struct HistoryResponse {
    enabled: bool,
    error: String,
    items: Vec<HistoryItem>,
}

impl HistoryResponse {
    fn disabled(reason: impl Into<String>) -> Self {
        Self {
            enabled: false,
            error: reason.into(),
            items: Vec::new(),
        }
    }
}

/// GET /history
pub(super) async fn list_history(state: &ApiState) -> Response {
    let body = match state.config.history_dir.as_deref() {
        Some(dir) => scan_history(dir).await,
        None => HistoryResponse::disabled("HISTORY_DIR not configured"),
    };

    (
        StatusCode::OK,
        [(CACHE_CONTROL, CachePolicy::Dynamic.directive())],
        Json(body),
    )
        .into_response()
}

async fn scan_history(dir: &Path) -> HistoryResponse {
    let is_dir = tokio::fs::metadata(dir)
        .await
        .map(|metadata| metadata.is_dir())
        .unwrap_or(false);
    if !is_dir {
        return HistoryResponse::disabled("HISTORY_DIR not found");
    }

    let mut reader = match tokio::fs::read_dir(dir).await {
        Ok(reader) => reader,
        Err(error) => {
            tracing::warn!(%error, dir = %dir.display(), "failed to read history directory");
            return HistoryResponse::disabled(format!("failed to read HISTORY_DIR: {error}"));
        }
    };

    let mut entries: Vec<(SystemTime, String)> = Vec::new();
    loop {
        let entry = match reader.next_entry().await {
            Ok(Some(entry)) => entry,
            Ok(None) => break,
            Err(error) => {
                tracing::warn!(%error, dir = %dir.display(), "history scan stopped early");
                break;
            }
        };

        let Ok(name) = entry.file_name().into_string() else {
            continue;
        };
        if !has_image_extension(&name) {
            continue;
        }

        // Follows symlinks, so a link to an image counts as a file.
        let metadata = match tokio::fs::metadata(entry.path()).await {
            Ok(metadata) if metadata.is_file() => metadata,
            _ => continue,
        };
        let modified = metadata.modified().unwrap_or(UNIX_EPOCH);
        entries.push((modified, name));
    }

    sort_newest_first(&mut entries);

    let items = entries
        .into_iter()
        .map(|(_, name)| HistoryItem {
            url: format!("{IMAGE_ROUTE}?name={}", urlencoding::encode(&name)),
            name,
        })
        .collect();

    HistoryResponse {
        enabled: true,
        error: String::new(),
        items,
    }
}

/// Newest first; equal timestamps fall back to name order so repeated scans
/// agree.
fn sort_newest_first(entries: &mut [(SystemTime, String)]) {
    entries.sort_by(|(a_time, a_name), (b_time, b_name)| {
        b_time.cmp(a_time).then_with(|| a_name.cmp(b_name))
    });
}

fn has_image_extension(name: &str) -> bool {
    Path::new(name)
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| {
            IMAGE_EXTENSIONS
                .iter()
                .any(|allowed| ext.eq_ignore_ascii_case(allowed))
        })
}

/// GET /history/image?name=<file>
pub(super) async fn serve_history_image(
    state: &ApiState,
    query: Option<&str>,
    headers: &HeaderMap,
) -> Response {
    let name = requested_name(query);

    let Some(dir) = state.config.history_dir.as_deref() else {
        return cache::not_found();
    };
    let Some(path) = paths::resolve_child(dir, &name) else {
        tracing::debug!(name = %name, "rejected history image name");
        return cache::not_found();
    };

    let mime = mime_guess::from_path(&path).first_or_octet_stream();
    cache::serve_file(&path, mime.as_ref(), CachePolicy::HistoryImage, headers).await
}

/// First `name` value in the query string; repeats after it are ignored.
fn requested_name(query: Option<&str>) -> String {
    query
        .and_then(|raw| serde_urlencoded::from_str::<Vec<(String, String)>>(raw).ok())
        .and_then(|pairs| {
            pairs
                .into_iter()
                .find(|(key, _)| key == "name")
                .map(|(_, value)| value)
        })
        .unwrap_or_default()
}
