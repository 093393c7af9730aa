//! # winterm
//!
//! A terminal-sharing gateway: browsers open authenticated WebSocket
//! connections that bridge to long-lived shell sessions kept alive by an
//! external tmux server. Sessions survive gateway restarts and client
//! disconnects; many clients can watch and drive the same terminal.
//!
//! ## Attach flow
//! 1. `POST /api/sessions/:id/attach` (bearer auth) issues a one-shot token
//! 2. The client opens `GET /ws?token=…&session=…`
//! 3. The handler consumes the token, ensures a PTY instance, subscribes
//! 4. Binary frames stream both ways until either side closes
//!
//! ## Modules
//! - `mux`: the minimal tmux dialect the gateway issues
//! - `session`: session metadata registry with ghost reconciliation
//! - `token`: one-shot attachment tokens
//! - `pty`: per-session PTY instances with fan-out and input serialization
//! - `api`: REST + WebSocket surface

pub mod api;
pub mod config;
pub mod mux;
pub mod pty;
pub mod session;
pub mod token;

pub use config::Config;
