//! Shared state for the HTTP API.

use crate::config::GatewayConfig;

use std::sync::Arc;

/// State shared across all API handlers. Nothing in here is mutated after
/// startup.
pub struct ApiState {
    pub config: Arc<GatewayConfig>,
    /// Shared upstream client; carries the configured request timeout.
    pub http: reqwest::Client,
}

impl ApiState {
    pub fn new(config: Arc<GatewayConfig>) -> crate::error::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.upstream_timeout)
            .build()?;

        Ok(Self {
            config,
            http,
        })
    }
}
