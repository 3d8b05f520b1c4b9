//! Top-level error types for the gateway.

use std::path::PathBuf;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to load config from {path}: {source}")]
    Config {
        path: PathBuf,
        #[source]
        source: config::ConfigError,
    },

    #[error("failed to build upstream client: {0}")]
    HttpClient(#[from] reqwest::Error),

    #[error("no open port in {first}..={last}")]
    NoAvailablePort { first: u16, last: u16 },
}
