//! Gateway configuration: built-in defaults, an optional `config.json`,
//! then environment overrides.
//!
//! The resulting [`GatewayConfig`] is immutable once loaded and is shared
//! with every handler through the API state.

use crate::error::{Error, Result};

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_UPSTREAM_URL: &str = "http://127.0.0.1:3883/sdapi/v1/txt2img";
pub const DEFAULT_HISTORY_DIR: &str = "/Volumes/AIGC/Output";
pub const DEFAULT_PORT: u16 = 8080;
pub const DEFAULT_UPSTREAM_TIMEOUT_SECS: u64 = 300;

/// File name looked up in the asset root when no explicit path is given.
pub const CONFIG_FILE_NAME: &str = "config.json";

/// Resolved process configuration.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Upstream generation endpoint as configured by the operator. The
    /// concrete sub-resource is derived per request.
    pub upstream_url: String,
    /// Directory of previously generated images. `None` disables browsing.
    pub history_dir: Option<PathBuf>,
    /// First port tried when binding the listener.
    pub port: u16,
    /// Timeout applied to each upstream call.
    pub upstream_timeout: Duration,
    /// Installation root holding `index.html`, `payload.json` and assets.
    pub asset_root: PathBuf,
}

/// Shape of `config.json`. Every key is optional and `null` means "keep
/// the default".
#[derive(Debug, Deserialize)]
struct FileConfig {
    #[serde(default)]
    draw_things_url: Option<String>,
    #[serde(default)]
    history_dir: Option<String>,
    #[serde(default)]
    port: Option<u16>,
    #[serde(default)]
    upstream_timeout_secs: Option<u64>,
}

impl FileConfig {
    fn load(path: &Path) -> Result<Self> {
        let file = config::Config::builder()
            .add_source(
                config::File::from(path)
                    .format(config::FileFormat::Json)
                    .required(false),
            )
            .build()
            .and_then(|settings| settings.try_deserialize::<FileConfig>())
            .map_err(|source| Error::Config {
                path: path.to_path_buf(),
                source,
            })?;
        Ok(file)
    }
}

impl GatewayConfig {
    /// Defaults only, rooted at `asset_root`.
    pub fn with_defaults(asset_root: impl Into<PathBuf>) -> Self {
        Self {
            upstream_url: DEFAULT_UPSTREAM_URL.to_string(),
            history_dir: Some(PathBuf::from(DEFAULT_HISTORY_DIR)),
            port: DEFAULT_PORT,
            upstream_timeout: Duration::from_secs(DEFAULT_UPSTREAM_TIMEOUT_SECS),
            asset_root: asset_root.into(),
        }
    }

    /// Load configuration from the process environment.
    ///
    /// `config_path` defaults to `<asset_root>/config.json`.
    pub fn load(asset_root: &Path, config_path: Option<&Path>) -> Self {
        Self::load_with_env(asset_root, config_path, |key| std::env::var(key).ok())
    }

    /// Same as [`GatewayConfig::load`] with an injectable environment lookup.
    pub fn load_with_env(
        asset_root: &Path,
        config_path: Option<&Path>,
        env: impl Fn(&str) -> Option<String>,
    ) -> Self {
        let mut config = Self::with_defaults(asset_root);

        let path = config_path
            .map(Path::to_path_buf)
            .unwrap_or_else(|| asset_root.join(CONFIG_FILE_NAME));

        match FileConfig::load(&path) {
            Ok(file) => config.apply_file(file),
            Err(error) => {
                tracing::warn!(%error, "failed to read config file, using defaults");
            }
        }

        config.apply_env(env);
        config
    }

    fn apply_file(&mut self, file: FileConfig) {
        if let Some(url) = file.draw_things_url {
            self.upstream_url = url;
        }
        if let Some(dir) = file.history_dir {
            self.history_dir = non_empty_path(&dir);
        }
        if let Some(port) = file.port {
            self.port = port;
        }
        if let Some(secs) = file.upstream_timeout_secs {
            self.set_upstream_timeout(secs, "upstream_timeout_secs");
        }
    }

    fn apply_env(&mut self, env: impl Fn(&str) -> Option<String>) {
        let lookup = |key: &str| env(key).filter(|value| !value.trim().is_empty());

        if let Some(url) = lookup("DRAW_THINGS_URL") {
            self.upstream_url = url;
        }
        if let Some(dir) = lookup("HISTORY_DIR") {
            self.history_dir = non_empty_path(&dir);
        }
        if let Some(raw) = lookup("PORT") {
            match raw.trim().parse::<u16>() {
                Ok(port) => self.port = port,
                Err(error) => tracing::warn!(value = %raw, %error, "ignoring invalid PORT"),
            }
        }
        if let Some(raw) = lookup("UPSTREAM_TIMEOUT_SECS") {
            match raw.trim().parse::<u64>() {
                Ok(secs) => self.set_upstream_timeout(secs, "UPSTREAM_TIMEOUT_SECS"),
                Err(error) => {
                    tracing::warn!(value = %raw, %error, "ignoring invalid UPSTREAM_TIMEOUT_SECS")
                }
            }
        }
    }

    /// A zero timeout would fail every upstream call before it is sent.
    fn set_upstream_timeout(&mut self, secs: u64, source: &str) {
        if secs == 0 {
            tracing::warn!(source, "ignoring zero upstream timeout");
        } else {
            self.upstream_timeout = Duration::from_secs(secs);
        }
    }
}

fn non_empty_path(raw: &str) -> Option<PathBuf> {
    if raw.trim().is_empty() {
        None
    } else {
        Some(PathBuf::from(raw))
    }
}
