//! One-shot attachment tokens.
//!
//! WebSocket upgrades cannot carry an Authorization header from a browser,
//! so the REST layer hands the client a short-lived token to put in the
//! upgrade URL instead. Tokens are single-use: `consume` is a
//! lookup-and-delete under one lock, so replaying a URL scraped from a log
//! or proxy fails even when two upgrades race.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::RngCore;
use tokio::sync::Mutex;

/// What a valid token resolves to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    pub session_id: String,
    /// Opaque identity of the bearer that requested the attach.
    pub user_token: String,
}

struct PendingAttachment {
    attachment: Attachment,
    expires_at: Instant,
}

/// Store of outstanding attachment tokens.
pub struct AttachmentTokenStore {
    ttl: Duration,
    pending: Mutex<HashMap<String, PendingAttachment>>,
}

pub type SharedTokenStore = Arc<AttachmentTokenStore>;

impl AttachmentTokenStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            pending: Mutex::new(HashMap::new()),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Issue a token binding `user_token` to `session_id` for one upgrade.
    pub async fn issue(&self, session_id: String, user_token: String) -> String {
        let token = generate_token();
        let pending = PendingAttachment {
            attachment: Attachment {
                session_id,
                user_token,
            },
            expires_at: Instant::now() + self.ttl,
        };
        self.pending.lock().await.insert(token.clone(), pending);
        token
    }

    /// Validate and consume a token. Returns None for unknown, expired, or
    /// already-consumed tokens. A token exactly at its expiry is rejected.
    pub async fn consume(&self, token: &str) -> Option<Attachment> {
        let mut pending = self.pending.lock().await;
        let entry = pending.remove(token)?;
        if Instant::now() >= entry.expires_at {
            return None;
        }
        Some(entry.attachment)
    }

    /// Drop expired tokens that were never consumed.
    pub async fn sweep(&self) {
        let now = Instant::now();
        let mut pending = self.pending.lock().await;
        let before = pending.len();
        pending.retain(|_, p| p.expires_at > now);
        let dropped = before - pending.len();
        if dropped > 0 {
            tracing::debug!(count = dropped, "swept expired attachment tokens");
        }
    }

    /// Start the periodic expiry sweep.
    pub fn start_sweep_task(self: Arc<Self>, period: Duration) {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                self.sweep().await;
            }
        });
    }
}

/// 128 bits of randomness, hex-encoded.
fn generate_token() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}
