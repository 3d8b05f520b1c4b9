//! HTTP server setup: listener binding, the dispatch table, and serving.

use super::state::ApiState;
use super::{assets, cache, generate, history};

use axum::Router;
use axum::extract::{Request, State};
use axum::http::{Method, StatusCode};
use axum::response::{IntoResponse, Response};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;

/// Ports tried after the configured one before giving up.
pub const MAX_PORT_ATTEMPTS: u16 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Route {
    Index,
    PayloadTemplate,
    HistoryList,
    HistoryImage,
    Generate,
    Asset,
    NotFound,
}

type Predicate = fn(&Method, &str) -> bool;

/// Evaluated top to bottom; the first matching predicate wins.
const ROUTES: &[(Predicate, Route)] = &[
    (is_index, Route::Index),
    (is_payload_template, Route::PayloadTemplate),
    (is_history_list, Route::HistoryList),
    (is_history_image, Route::HistoryImage),
    (is_generate, Route::Generate),
    (is_asset, Route::Asset),
];

fn is_index(method: &Method, path: &str) -> bool {
    *method == Method::GET && (path == "/" || path == "/index.html")
}

fn is_payload_template(method: &Method, path: &str) -> bool {
    *method == Method::GET && path == "/payload"
}

fn is_history_list(method: &Method, path: &str) -> bool {
    *method == Method::GET && path == "/history"
}

fn is_history_image(method: &Method, path: &str) -> bool {
    *method == Method::GET && path == "/history/image"
}

fn is_generate(method: &Method, path: &str) -> bool {
    *method == Method::POST && path == "/generate"
}

fn is_asset(method: &Method, path: &str) -> bool {
    *method == Method::GET && assets::is_asset_path(path)
}

fn route_for(method: &Method, path: &str) -> Route {
    ROUTES
        .iter()
        .find(|(matches, _)| matches(method, path))
        .map(|(_, route)| *route)
        .unwrap_or(Route::NotFound)
}

/// Build the application router. Every request goes through [`dispatch`].
pub fn router(state: Arc<ApiState>) -> Router {
    Router::new()
        .fallback(dispatch)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn dispatch(State(state): State<Arc<ApiState>>, request: Request) -> Response {
    let (parts, body) = request.into_parts();
    let path = parts.uri.path();

    match route_for(&parts.method, path) {
        Route::Index => assets::serve_index(&state).await,
        Route::PayloadTemplate => assets::serve_payload_template(&state).await,
        Route::HistoryList => history::list_history(&state).await,
        Route::HistoryImage => {
            history::serve_history_image(&state, parts.uri.query(), &parts.headers).await
        }
        Route::Generate => match axum::body::to_bytes(body, usize::MAX).await {
            Ok(bytes) => generate::generate(&state, bytes).await,
            Err(error) => {
                tracing::warn!(%error, "failed to read generation request body");
                (StatusCode::BAD_REQUEST, "Failed to read request body").into_response()
            }
        },
        Route::Asset => assets::serve_asset(&state, path, &parts.headers).await,
        Route::NotFound => cache::not_found(),
    }
}

/// Bind the first free port in `base_port .. base_port + MAX_PORT_ATTEMPTS`.
pub async fn bind_listener(host: IpAddr, base_port: u16) -> crate::error::Result<TcpListener> {
    let last = base_port.saturating_add(MAX_PORT_ATTEMPTS - 1);

    for port in base_port..=last {
        let addr = SocketAddr::new(host, port);
        match TcpListener::bind(addr).await {
            Ok(listener) => return Ok(listener),
            Err(error) => {
                tracing::warn!(%addr, %error, "port unavailable, trying next");
            }
        }
    }

    Err(crate::error::Error::NoAvailablePort {
        first: base_port,
        last,
    })
}

/// Serve the gateway on a listener already claimed by [`bind_listener`].
///
/// In-flight requests are drained once `true` is published on `stop`. The
/// returned task finishes after the last connection closes.
pub fn start_http_server(
    listener: TcpListener,
    state: Arc<ApiState>,
    mut stop: tokio::sync::watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    let app = router(state);
    let stop_requested = async move {
        if stop.wait_for(|stopping| *stopping).await.is_err() {
            tracing::debug!("shutdown sender dropped, stopping server");
        }
    };

    tokio::spawn(async move {
        let served = axum::serve(listener, app)
            .with_graceful_shutdown(stop_requested)
            .await;
        if let Err(error) = served {
            tracing::error!(%error, "HTTP server stopped with an error");
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GatewayConfig;

    use axum::body::{Body, Bytes};
    use axum::http::HeaderMap;
    use axum::http::header::{CONTENT_TYPE, ETAG, IF_NONE_MATCH};
    use axum::routing::post;
    use http_body_util::BodyExt;
    use serde_json::Value;
    use std::path::Path;
    use std::sync::Mutex;
    use tower::ServiceExt;

    #[derive(Debug, Clone)]
    struct Captured {
        path: String,
        content_type: String,
        body: String,
    }

    type Captures = Arc<Mutex<Vec<Captured>>>;

    async fn record(State(captures): State<Captures>, request: Request) -> Response {
        let (parts, body) = request.into_parts();
        let body = axum::body::to_bytes(body, usize::MAX).await.expect("body");
        captures.lock().expect("lock").push(Captured {
            path: parts.uri.path().to_string(),
            content_type: parts
                .headers
                .get(CONTENT_TYPE)
                .and_then(|value| value.to_str().ok())
                .unwrap_or_default()
                .to_string(),
            body: String::from_utf8_lossy(&body).into_owned(),
        });
        (
            StatusCode::OK,
            [(CONTENT_TYPE, "application/json")],
            r#"{"images":["ok"]}"#,
        )
            .into_response()
    }

    async fn reject() -> Response {
        (
            StatusCode::UNPROCESSABLE_ENTITY,
            [(CONTENT_TYPE, "application/problem+json")],
            r#"{"error":"bad size"}"#,
        )
            .into_response()
    }

    /// Spawn a fake generation backend and return its address.
    async fn spawn_upstream() -> (SocketAddr, Captures) {
        let captures: Captures = Arc::default();
        let app = Router::new()
            .route("/sdapi/v1/txt2img", post(record))
            .route("/sdapi/v1/img2img", post(record))
            .route("/strict/sdapi/v1/txt2img", post(reject))
            .with_state(captures.clone());

        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind upstream");
        let addr = listener.local_addr().expect("addr");
        tokio::spawn(async move {
            axum::serve(listener, app).await.ok();
        });
        (addr, captures)
    }

    fn app_with(root: &Path, configure: impl FnOnce(&mut GatewayConfig)) -> Router {
        let mut config = GatewayConfig::with_defaults(root);
        config.history_dir = Some(root.join("history"));
        configure(&mut config);
        let state = ApiState::new(Arc::new(config)).expect("state");
        router(Arc::new(state))
    }

    async fn send(
        app: &Router,
        request: axum::http::Request<Body>,
    ) -> (StatusCode, HeaderMap, Bytes) {
        let response = app.clone().oneshot(request).await.expect("response");
        let status = response.status();
        let headers = response.headers().clone();
        let body = response.into_body().collect().await.expect("collect").to_bytes();
        (status, headers, body)
    }

    fn get(uri: &str) -> axum::http::Request<Body> {
        axum::http::Request::builder()
            .uri(uri)
            .body(Body::empty())
            .expect("request")
    }

    fn post_generate(body: &str, content_type: &str) -> axum::http::Request<Body> {
        axum::http::Request::builder()
            .method("POST")
            .uri("/generate")
            .header(CONTENT_TYPE, content_type)
            .body(Body::from(body.to_string()))
            .expect("request")
    }

    #[test]
    fn dispatch_table_priority() {
        assert_eq!(route_for(&Method::GET, "/"), Route::Index);
        assert_eq!(route_for(&Method::GET, "/index.html"), Route::Index);
        assert_eq!(route_for(&Method::GET, "/payload"), Route::PayloadTemplate);
        assert_eq!(route_for(&Method::GET, "/payload.json"), Route::Asset);
        assert_eq!(route_for(&Method::GET, "/history"), Route::HistoryList);
        assert_eq!(route_for(&Method::GET, "/history/image"), Route::HistoryImage);
        assert_eq!(route_for(&Method::POST, "/generate"), Route::Generate);
        assert_eq!(route_for(&Method::GET, "/generate"), Route::NotFound);
        assert_eq!(route_for(&Method::POST, "/"), Route::NotFound);
        assert_eq!(route_for(&Method::POST, "/style.css"), Route::NotFound);
        assert_eq!(route_for(&Method::GET, "/favicon.ico"), Route::NotFound);
    }

    #[tokio::test]
    async fn serves_index_without_conditional_caching() {
        let temp = tempfile::tempdir().expect("tempdir");
        std::fs::write(temp.path().join("index.html"), "<html></html>").expect("write");
        let app = app_with(temp.path(), |_| {});

        for uri in ["/", "/index.html"] {
            let (status, headers, body) = send(&app, get(uri)).await;
            assert_eq!(status, StatusCode::OK);
            assert_eq!(headers[CONTENT_TYPE], "text/html; charset=utf-8");
            assert!(headers.get(ETAG).is_none());
            assert_eq!(&body[..], b"<html></html>");
        }
    }

    #[tokio::test]
    async fn asset_etag_round_trip() {
        let temp = tempfile::tempdir().expect("tempdir");
        let lang = temp.path().join("lang");
        std::fs::create_dir(&lang).expect("mkdir");
        std::fs::write(lang.join("en.json"), r#"{"hi":"hello"}"#).expect("write");
        let app = app_with(temp.path(), |_| {});

        let (status, headers, body) = send(&app, get("/lang/en.json")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(headers[CONTENT_TYPE], "application/json");
        assert_eq!(&body[..], br#"{"hi":"hello"}"#);
        let etag = headers[ETAG].clone();

        let (_, again, _) = send(&app, get("/lang/en.json")).await;
        assert_eq!(again[ETAG], etag);

        let conditional = axum::http::Request::builder()
            .uri("/lang/en.json")
            .header(IF_NONE_MATCH, etag)
            .body(Body::empty())
            .expect("request");
        let (status, _, body) = send(&app, conditional).await;
        assert_eq!(status, StatusCode::NOT_MODIFIED);
        assert!(body.is_empty());
    }

    #[tokio::test]
    async fn asset_traversal_is_not_found() {
        let temp = tempfile::tempdir().expect("tempdir");
        let app = app_with(temp.path(), |_| {});

        for uri in ["/../secret.js", "/..%2Fsecret.css", "/missing.css"] {
            let (status, _, _) = send(&app, get(uri)).await;
            assert_eq!(status, StatusCode::NOT_FOUND, "{uri}");
        }
    }

    #[tokio::test]
    async fn payload_template_is_no_store_and_404_when_absent() {
        let temp = tempfile::tempdir().expect("tempdir");
        let app = app_with(temp.path(), |_| {});

        let (status, _, body) = send(&app, get("/payload")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(&body[..], b"{}");

        std::fs::write(temp.path().join("payload.json"), r#"{"steps":8}"#).expect("write");
        let (status, headers, body) = send(&app, get("/payload")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(headers["cache-control"], "no-store");
        assert_eq!(&body[..], br#"{"steps":8}"#);
    }

    #[tokio::test]
    async fn history_listing_and_image() {
        let temp = tempfile::tempdir().expect("tempdir");
        let history_dir = temp.path().join("history");
        std::fs::create_dir(&history_dir).expect("mkdir");
        std::fs::write(history_dir.join("out 1.png"), b"\x89PNG").expect("write");
        let app = app_with(temp.path(), |_| {});

        let (status, headers, body) = send(&app, get("/history")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(headers["cache-control"], "no-store");
        let json: Value = serde_json::from_slice(&body).expect("json");
        assert_eq!(json["enabled"], true);
        assert_eq!(json["items"][0]["name"], "out 1.png");
        let url = json["items"][0]["url"].as_str().expect("url").to_string();
        assert!(url.starts_with("/history/image?name="));

        let (status, headers, body) = send(&app, get(&url)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(headers[CONTENT_TYPE], "image/png");
        assert_eq!(headers["cache-control"], "public, max-age=86400");
        assert_eq!(&body[..], b"\x89PNG");
    }

    #[tokio::test]
    async fn history_image_traversal_is_not_found() {
        let temp = tempfile::tempdir().expect("tempdir");
        std::fs::write(temp.path().join("secret.png"), b"secret").expect("write");
        let app = app_with(temp.path(), |_| {});

        for uri in [
            "/history/image?name=../../etc/passwd",
            "/history/image?name=..%2Fsecret.png",
            "/history/image?name=",
            "/history/image",
        ] {
            let (status, _, _) = send(&app, get(uri)).await;
            assert_eq!(status, StatusCode::NOT_FOUND, "{uri}");
        }
    }

    #[tokio::test]
    async fn missing_history_dir_reports_disabled() {
        let temp = tempfile::tempdir().expect("tempdir");
        let app = app_with(temp.path(), |config| {
            config.history_dir = Some(temp.path().join("nowhere"));
        });

        let (status, _, body) = send(&app, get("/history")).await;
        assert_eq!(status, StatusCode::OK);
        let json: Value = serde_json::from_slice(&body).expect("json");
        assert_eq!(json["enabled"], false);
        assert!(!json["error"].as_str().expect("error").is_empty());
        assert_eq!(json["items"], serde_json::json!([]));
    }

    #[tokio::test]
    async fn txt2img_payload_goes_to_txt2img() {
        let (upstream, captures) = spawn_upstream().await;
        let temp = tempfile::tempdir().expect("tempdir");
        let app = app_with(temp.path(), |config| {
            config.upstream_url = format!("http://{upstream}/sdapi/v1");
        });

        let (status, headers, body) =
            send(&app, post_generate(r#"{"prompt":"x"}"#, "application/json")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(headers[CONTENT_TYPE], "application/json");
        assert_eq!(&body[..], br#"{"images":["ok"]}"#);

        let captured = captures.lock().expect("lock").clone();
        assert_eq!(captured.len(), 1);
        assert_eq!(captured[0].path, "/sdapi/v1/txt2img");
        assert_eq!(captured[0].content_type, "application/json");
        assert_eq!(captured[0].body, r#"{"prompt":"x"}"#);
    }

    #[tokio::test]
    async fn init_images_payload_goes_to_img2img_from_bare_host() {
        let (upstream, captures) = spawn_upstream().await;
        let temp = tempfile::tempdir().expect("tempdir");
        let app = app_with(temp.path(), |config| {
            config.upstream_url = format!("http://{upstream}");
        });

        let form = "payload=%7B%22init_images%22%3A%5B%22abc%22%5D%7D";
        let (status, _, _) =
            send(&app, post_generate(form, "application/x-www-form-urlencoded")).await;
        assert_eq!(status, StatusCode::OK);

        let captured = captures.lock().expect("lock").clone();
        assert_eq!(captured[0].path, "/sdapi/v1/img2img");
        assert_eq!(captured[0].body, r#"{"init_images":["abc"]}"#);
    }

    #[tokio::test]
    async fn upstream_error_is_relayed_verbatim() {
        let (upstream, _) = spawn_upstream().await;
        let temp = tempfile::tempdir().expect("tempdir");
        let app = app_with(temp.path(), |config| {
            config.upstream_url = format!("http://{upstream}/strict/sdapi/v1/txt2img");
        });

        let (status, headers, body) =
            send(&app, post_generate(r#"{"width":3}"#, "application/json")).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(headers[CONTENT_TYPE], "application/problem+json");
        assert_eq!(&body[..], br#"{"error":"bad size"}"#);
    }

    #[tokio::test]
    async fn unreachable_upstream_is_bad_gateway() {
        let closed = {
            let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
            listener.local_addr().expect("addr")
        };
        let temp = tempfile::tempdir().expect("tempdir");
        let app = app_with(temp.path(), |config| {
            config.upstream_url = format!("http://{closed}/sdapi/v1");
        });

        let (status, _, body) =
            send(&app, post_generate(r#"{"prompt":"x"}"#, "application/json")).await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);
        assert!(!body.is_empty());
    }

    #[tokio::test]
    async fn unbuildable_upstream_url_is_server_error() {
        let (_upstream, captures) = spawn_upstream().await;
        let temp = tempfile::tempdir().expect("tempdir");

        for configured in ["localhost:3883", "not a url"] {
            let app = app_with(temp.path(), |config| {
                config.upstream_url = configured.to_string();
            });

            let (status, _, body) =
                send(&app, post_generate(r#"{"prompt":"x"}"#, "application/json")).await;
            assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR, "{configured}");
            assert!(!body.is_empty(), "{configured}");
        }

        assert!(captures.lock().expect("lock").is_empty());
    }

    #[tokio::test]
    async fn bad_payloads_never_reach_upstream() {
        let (upstream, captures) = spawn_upstream().await;
        let temp = tempfile::tempdir().expect("tempdir");
        let app = app_with(temp.path(), |config| {
            config.upstream_url = format!("http://{upstream}/sdapi/v1");
        });

        let (status, _, body) = send(&app, post_generate("", "text/plain")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(&body[..], b"Missing payload");

        let (status, _, body) = send(&app, post_generate("{oops", "application/json")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(&body[..], b"Invalid JSON");

        assert!(captures.lock().expect("lock").is_empty());
    }

    #[tokio::test]
    async fn unknown_routes_are_not_found() {
        let temp = tempfile::tempdir().expect("tempdir");
        let app = app_with(temp.path(), |_| {});

        let (status, _, body) = send(&app, get("/generate")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(&body[..], b"Not Found");
    }

    #[tokio::test]
    async fn port_probe_skips_occupied_port() {
        let occupied = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let taken = occupied.local_addr().expect("addr").port();

        let listener = bind_listener("127.0.0.1".parse().expect("ip"), taken)
            .await
            .expect("probe");
        let port = listener.local_addr().expect("addr").port();

        assert_ne!(port, taken);
        assert!(port > taken && port < taken.saturating_add(MAX_PORT_ATTEMPTS));
    }
}
