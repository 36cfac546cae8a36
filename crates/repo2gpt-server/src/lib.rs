//! Axum HTTP surface over the job runner, store and subscription manager.

pub mod auth;
pub mod config;
pub mod error;
pub mod routes;
pub mod server;

pub use config::ServerConfig;
pub use error::ApiError;
pub use server::{build_router, start, AppState, ServerHandle};
