//! PTY multiplexing layer.
//!
//! One [`PtyInstance`] exists per attached session. It owns the child
//! `tmux attach` process and its pseudo-terminal master, fans output out to
//! every subscribed connection, and serializes all input through a single
//! writer fiber. The [`PtyManager`] guarantees singleton-per-session
//! instances with reference counting and idle teardown.

mod instance;
mod manager;

pub use instance::{OutFrame, PtyInstance, PtyTuning};
pub use manager::{PtyManager, SharedPtyManager};

use thiserror::Error;

use crate::mux::MuxError;

#[derive(Debug, Error)]
pub enum PtyError {
    #[error("multiplexer session gone: {0}")]
    SessionGone(String),

    #[error("failed to spawn attach process: {0}")]
    Spawn(String),

    #[error(transparent)]
    Mux(#[from] MuxError),
}

pub type PtyResult<T> = Result<T, PtyError>;
