//! Generation proxy.
//!
//! POST /generate
//!   - Body is raw JSON, or form-encoded with the JSON in a `payload` field.
//!   - The payload is forwarded unchanged to the upstream endpoint chosen by
//!     [`crate::upstream::resolve`]. One attempt, no retries.
//!   - Upstream responses are relayed verbatim, error statuses included.

use super::state::ApiState;
use crate::upstream;

use axum::body::Bytes;
use axum::http::header::CONTENT_TYPE;
use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use serde::Deserialize;

/// Characters of an upstream error body included in the log line.
const ERROR_PREVIEW_CHARS: usize = 200;

#[derive(Debug, thiserror::Error)]
pub(super) enum GenerateError {
    #[error("Missing payload")]
    MissingPayload,
    #[error("Invalid JSON")]
    InvalidJson(#[source] serde_json::Error),
    #[error("upstream request to {url} failed: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("{0}")]
    Internal(String),
}

impl IntoResponse for GenerateError {
    fn into_response(self) -> Response {
        let status = match &self {
            GenerateError::MissingPayload | GenerateError::InvalidJson(_) => {
                StatusCode::BAD_REQUEST
            }
            GenerateError::Transport { .. } => StatusCode::BAD_GATEWAY,
            GenerateError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, self.to_string()).into_response()
    }
}

#[derive(Deserialize)]
struct PayloadForm {
    #[serde(default)]
    payload: String,
}

/// A decoded request: the exact JSON text to forward and its parsed form.
#[derive(Debug)]
pub(super) struct GenerationPayload {
    raw: String,
    value: serde_json::Value,
}

impl GenerationPayload {
    pub(super) fn decode(body: &[u8]) -> Result<Self, GenerateError> {
        let text = String::from_utf8_lossy(body);
        let raw = if text.trim_start().starts_with('{') {
            text.into_owned()
        } else {
            serde_urlencoded::from_str::<PayloadForm>(&text)
                .map(|form| form.payload)
                .unwrap_or_default()
        };

        if raw.is_empty() {
            return Err(GenerateError::MissingPayload);
        }

        let value = serde_json::from_str(&raw).map_err(GenerateError::InvalidJson)?;
        Ok(Self { raw, value })
    }
}

/// POST /generate
pub(super) async fn generate(state: &ApiState, body: Bytes) -> Response {
    match forward(state, &body).await {
        Ok(response) => response,
        Err(error) => {
            match &error {
                GenerateError::Transport { url, source } => {
                    tracing::error!(%url, error = %source, "upstream unreachable");
                }
                GenerateError::Internal(message) => {
                    tracing::error!(error = %message, "generation request failed");
                }
                GenerateError::MissingPayload | GenerateError::InvalidJson(_) => {
                    tracing::debug!(%error, "rejected generation request");
                }
            }
            error.into_response()
        }
    }
}

async fn forward(state: &ApiState, body: &[u8]) -> Result<Response, GenerateError> {
    let payload = GenerationPayload::decode(body)?;
    let url = upstream::resolve(&state.config.upstream_url, &payload.value);

    tracing::info!(%url, "forwarding generation request");

    let response = state
        .http
        .post(&url)
        .header(CONTENT_TYPE, "application/json")
        .body(payload.raw)
        .send()
        .await
        .map_err(|source| classify_send_error(&url, source))?;

    let status = response.status();
    let content_type = response
        .headers()
        .get(CONTENT_TYPE)
        .cloned()
        .unwrap_or_else(|| HeaderValue::from_static("application/json"));
    let bytes = response
        .bytes()
        .await
        .map_err(|source| GenerateError::Transport {
            url: url.clone(),
            source,
        })?;

    if !status.is_success() {
        tracing::warn!(
            %url,
            status = status.as_u16(),
            body = %preview(&bytes),
            "upstream returned an error"
        );
    }

    Ok((status, [(CONTENT_TYPE, content_type)], bytes).into_response())
}

/// Requests that never left the process (for example an unparseable URL)
/// are internal failures; everything else is a gateway failure.
fn classify_send_error(url: &str, source: reqwest::Error) -> GenerateError {
    if source.is_builder() {
        GenerateError::Internal(source.to_string())
    } else {
        GenerateError::Transport {
            url: url.to_string(),
            source,
        }
    }
}

fn preview(bytes: &[u8]) -> String {
    let text = String::from_utf8_lossy(bytes);
    let mut preview: String = text.chars().take(ERROR_PREVIEW_CHARS).collect();
    if text.chars().count() > ERROR_PREVIEW_CHARS {
        preview.push_str("...");
    }
    preview
}
