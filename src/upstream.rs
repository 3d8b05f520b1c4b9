//! Upstream endpoint resolution.
//!
//! Operators may configure the generation backend as a bare host, as the
//! `/sdapi/v1` prefix, or as one of the two concrete endpoints. Each request
//! is routed to the sibling endpoint matching its payload: `img2img` when the
//! payload carries init images, `txt2img` otherwise.

use reqwest::Url;
use serde_json::Value;

const API_PREFIX: &str = "/sdapi/v1";

/// The two generation sub-resources exposed by the upstream service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endpoint {
    Txt2Img,
    Img2Img,
}

impl Endpoint {
    pub fn as_str(self) -> &'static str {
        match self {
            Endpoint::Txt2Img => "txt2img",
            Endpoint::Img2Img => "img2img",
        }
    }

    /// Pick the endpoint for a decoded payload.
    pub fn for_payload(payload: &Value) -> Self {
        let has_init_images = payload
            .as_object()
            .and_then(|object| object.get("init_images"))
            .is_some_and(is_truthy);

        if has_init_images {
            Endpoint::Img2Img
        } else {
            Endpoint::Txt2Img
        }
    }
}

/// How a configured base URL's path relates to the upstream API layout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BaseShape {
    /// Not an absolute URL with a host; used verbatim.
    Opaque,
    /// Path is empty or `/`.
    BareHost,
    /// Path ends in the API prefix or one of its endpoints. Carries the
    /// prefix with any trailing endpoint segment removed.
    ApiPrefix(String),
    /// Path has some other shape; used verbatim.
    Unrecognized,
}

/// Classify a configured base URL.
pub fn classify(base_url: &str) -> BaseShape {
    match Url::parse(base_url) {
        Ok(url) if has_host(&url) => classify_path(url.path()),
        _ => BaseShape::Opaque,
    }
}

fn has_host(url: &Url) -> bool {
    url.host_str().is_some_and(|host| !host.is_empty())
}

fn classify_path(path: &str) -> BaseShape {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        return BaseShape::BareHost;
    }

    for endpoint in [Endpoint::Txt2Img, Endpoint::Img2Img] {
        let suffix = format!("{API_PREFIX}/{}", endpoint.as_str());
        if trimmed.ends_with(&suffix) {
            let prefix_len = trimmed.len() - endpoint.as_str().len() - 1;
            return BaseShape::ApiPrefix(trimmed[..prefix_len].to_string());
        }
    }

    if trimmed.ends_with(API_PREFIX) {
        return BaseShape::ApiPrefix(trimmed.to_string());
    }

    BaseShape::Unrecognized
}

/// Compute the upstream URL for one request.
///
/// Base URLs that cannot be rewritten are returned unchanged.
pub fn resolve(base_url: &str, payload: &Value) -> String {
    let Ok(mut url) = Url::parse(base_url) else {
        return base_url.to_string();
    };
    if !has_host(&url) {
        return base_url.to_string();
    }

    let endpoint = Endpoint::for_payload(payload).as_str();
    let path = match classify_path(url.path()) {
        BaseShape::BareHost => format!("{API_PREFIX}/{endpoint}"),
        BaseShape::ApiPrefix(prefix) => format!("{prefix}/{endpoint}"),
        BaseShape::Opaque | BaseShape::Unrecognized => return base_url.to_string(),
    };

    url.set_path(&path);
    url.to_string()
}

/// JSON truthiness: `null`, `false`, zero, and empty strings, arrays and
/// objects are falsy.
fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(flag) => *flag,
        Value::Number(number) => number.as_f64().is_some_and(|n| n != 0.0),
        Value::String(text) => !text.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(fields) => !fields.is_empty(),
    }
}
