//! HTTP service for the potline coordinator.
//!
//! Binds every coordinator operation to a route and wires storage and the
//! hardware controller from [`ServerConfig`].

pub mod config;
pub mod error;
mod server;

pub use config::ServerConfig;
pub use error::{ApiError, ServerError};
pub use server::{router, run, AppState};
