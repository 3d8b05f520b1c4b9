//! Local HTTP gateway between a browser UI and a Stable Diffusion style
//! image-generation backend.

pub mod api;
pub mod config;
pub mod error;
pub mod upstream;

pub use error::{Error, Result};
