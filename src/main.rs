//! drawgate: serve the generation UI and proxy requests to the backend.

use anyhow::Context as _;
use clap::Parser;
use drawgate::api::{self, ApiState};
use drawgate::config::GatewayConfig;
use drawgate::upstream::{self, BaseShape};
use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "drawgate", version, about)]
struct Cli {
    /// Directory holding index.html, payload.json, static assets and config.json.
    #[arg(long, default_value = ".")]
    root: PathBuf,

    /// Config file to read instead of <root>/config.json.
    #[arg(long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "drawgate=info,tower_http=info".into());
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = GatewayConfig::load(&cli.root, cli.config.as_deref());
    warn_on_unrecognized_upstream(&config.upstream_url);

    tracing::info!(
        upstream = %config.upstream_url,
        history_dir = ?config.history_dir,
        root = %config.asset_root.display(),
        "configuration loaded"
    );

    let listener = api::bind_listener(IpAddr::V4(Ipv4Addr::UNSPECIFIED), config.port)
        .await
        .context("could not find an open port")?;
    let port = listener.local_addr()?.port();

    let state = Arc::new(ApiState::new(Arc::new(config))?);
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let handle = api::start_http_server(listener, state, shutdown_rx);

    tracing::info!("server running at http://127.0.0.1:{port}");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    tracing::info!("shutting down");
    shutdown_tx.send(true).ok();
    handle.await?;

    Ok(())
}

/// Requests to an upstream URL of unknown shape are sent to it unchanged,
/// whatever the payload. Tell the operator at startup.
fn warn_on_unrecognized_upstream(url: &str) {
    match upstream::classify(url) {
        BaseShape::Opaque => {
            tracing::warn!(%url, "upstream URL has no scheme or host; requests will use it as-is");
        }
        BaseShape::Unrecognized => {
            tracing::warn!(
                %url,
                "upstream URL path is not /, /sdapi/v1 or /sdapi/v1/{{txt2img,img2img}}; \
                 txt2img/img2img selection is disabled"
            );
        }
        BaseShape::BareHost | BaseShape::ApiPrefix(_) => {}
    }
}
