//! HTTP and WebSocket surface.

pub mod auth;
pub mod routes;
pub mod types;
pub mod ws;

pub use routes::{serve, AppState};
