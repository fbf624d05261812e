pub mod config;
pub mod error;
pub mod executor;
pub mod host;
pub mod log_sanitize;
pub mod modules;
pub mod pipeline;
pub mod planner;
pub mod state;
pub mod workspace;

pub use error::{Error, Result};
