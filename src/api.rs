//! HTTP surface of the gateway.
//!
//! Serves the browser UI and its assets, the payload template, a read-only
//! browser over the history directory, and the generation proxy.

mod assets;
mod cache;
mod generate;
mod history;
mod paths;
mod server;
mod state;

pub use server::{MAX_PORT_ATTEMPTS, bind_listener, router, start_http_server};
pub use state::ApiState;
