//! REST request and response types.

use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub dev_mode: bool,
    pub auth_required: bool,
}

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub pin: String,
}

#[derive(Debug, Serialize)]
pub struct LoginResponse {
    pub token: String,
    /// Expiration, unix seconds.
    pub exp: i64,
}

#[derive(Debug, Deserialize)]
pub struct CreateSessionRequest {
    #[serde(default)]
    pub title: String,
    pub working_dir: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct RenameSessionRequest {
    pub title: String,
}

#[derive(Debug, Deserialize)]
pub struct PersistentRequest {
    pub persistent: bool,
}

#[derive(Debug, Deserialize)]
pub struct BroadcastRequest {
    pub text: String,
}

#[derive(Debug, Deserialize)]
pub struct DeleteSessionQuery {
    #[serde(default)]
    pub force: bool,
}

#[derive(Debug, Serialize)]
pub struct AttachResponse {
    pub attachment_token: String,
    /// Token lifetime in seconds.
    pub expires_in: u64,
    /// Ready-to-open WebSocket URL (path and query).
    pub ws_url: String,
}
