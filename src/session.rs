//! Session model and registry.
//!
//! The registry is the authoritative map from session id to metadata. The
//! terminal content itself lives in the external multiplexer; the registry
//! only tracks which multiplexer sessions the gateway owns (those carrying
//! the `winterm-` prefix), discovers pre-existing ones at startup, and
//! reconciles against the multiplexer on a background sweep. Entries whose
//! multiplexer session has vanished become ghosts: still listed, read-only,
//! and skipped by the PTY layer.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::sync::RwLock;

use crate::config::OWNED_PREFIX;
use crate::mux::{MuxClient, MuxError};

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("session not found: {0}")]
    NotFound(String),

    #[error("session {0} is persistent; pass force to delete it")]
    Persistent(String),

    #[error("could not mint a unique session name")]
    NameCollision,

    #[error(transparent)]
    Mux(#[from] MuxError),
}

pub type RegistryResult<T> = Result<T, RegistryError>;

/// Attempts to mint a fresh multiplexer name before giving up.
const CREATE_NAME_RETRIES: usize = 4;

/// A terminal session owned by the gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    /// Opaque stable identifier.
    pub id: String,
    /// Name addressing the session in the multiplexer. Always prefixed.
    pub multiplexer_name: String,
    /// Human label.
    pub title: String,
    pub created_at: DateTime<Utc>,
    pub last_active_at: DateTime<Utc>,
    /// Survives gateway restart; Delete requires force.
    pub persistent: bool,
    /// The underlying multiplexer session no longer exists.
    pub is_ghost: bool,
}

/// Derive the stable id for a session discovered from the multiplexer.
/// Deterministic, so restarts and re-discovery agree on the id.
pub fn derived_session_id(multiplexer_name: &str) -> String {
    let digest = Sha256::digest(multiplexer_name.as_bytes());
    hex::encode(&digest[..8])
}

/// Registry of sessions keyed by id.
pub struct SessionRegistry {
    mux: MuxClient,
    sessions: RwLock<HashMap<String, Session>>,
}

pub type SharedSessionRegistry = Arc<SessionRegistry>;

impl SessionRegistry {
    pub fn new(mux: MuxClient) -> Self {
        Self {
            mux,
            sessions: RwLock::new(HashMap::new()),
        }
    }

    pub fn mux(&self) -> &MuxClient {
        &self.mux
    }

    /// Enumerate multiplexer sessions carrying the owned prefix and
    /// materialize registry entries for any not yet known. Pre-existing
    /// sessions outlived a previous gateway, so they default to persistent.
    pub async fn discover_existing(&self) -> RegistryResult<usize> {
        let names = self.mux.list_sessions().await?;
        let now = Utc::now();
        let mut added = 0;

        let mut sessions = self.sessions.write().await;
        for name in names {
            if !name.starts_with(OWNED_PREFIX) {
                continue;
            }
            let id = derived_session_id(&name);
            if let Some(existing) = sessions.get_mut(&id) {
                // The multiplexer session is back (or still here); clear
                // any stale ghost marking.
                existing.is_ghost = false;
                continue;
            }
            sessions.insert(
                id.clone(),
                Session {
                    id,
                    multiplexer_name: name.clone(),
                    title: name,
                    created_at: now,
                    last_active_at: now,
                    persistent: true,
                    is_ghost: false,
                },
            );
            added += 1;
        }
        drop(sessions);

        if added > 0 {
            tracing::info!(count = added, "discovered existing sessions");
        }
        Ok(added)
    }

    /// Snapshot of all sessions, most recently active first. Ghost flags
    /// are refreshed against the multiplexer before the snapshot is taken;
    /// if the multiplexer cannot be queried the current flags stand.
    pub async fn list(&self) -> Vec<Session> {
        match self.live_owned_names().await {
            Ok(live) => self.mark_ghosts(&live).await,
            Err(e) => tracing::warn!(error = %e, "ghost check skipped"),
        }

        let sessions = self.sessions.read().await;
        let mut list: Vec<_> = sessions.values().cloned().collect();
        list.sort_by(|a, b| b.last_active_at.cmp(&a.last_active_at));
        list
    }

    pub async fn get(&self, id: &str) -> Option<Session> {
        self.sessions.read().await.get(id).cloned()
    }

    /// Create a new detached multiplexer session and register it.
    pub async fn create(
        &self,
        title: String,
        working_dir: Option<PathBuf>,
    ) -> RegistryResult<Session> {
        let name = self.mint_name().await?;
        self.mux
            .create_session(&name, "main", working_dir.as_deref())
            .await?;

        let now = Utc::now();
        let session = Session {
            id: uuid::Uuid::new_v4().simple().to_string(),
            multiplexer_name: name,
            title: if title.trim().is_empty() {
                "untitled".to_string()
            } else {
                title.trim().to_string()
            },
            created_at: now,
            last_active_at: now,
            persistent: false,
            is_ghost: false,
        };

        self.sessions
            .write()
            .await
            .insert(session.id.clone(), session.clone());

        tracing::info!(
            session = %session.id,
            mux_name = %session.multiplexer_name,
            "session created"
        );
        Ok(session)
    }

    /// Delete a session: kill the multiplexer session (ghosts have nothing
    /// to kill) and drop the entry. Persistent sessions require force.
    /// Idempotent: an id that is already gone returns `false`.
    pub async fn delete(&self, id: &str, force: bool) -> RegistryResult<bool> {
        let session = {
            let sessions = self.sessions.read().await;
            match sessions.get(id) {
                Some(session) => session.clone(),
                None => return Ok(false),
            }
        };

        if session.persistent && !force {
            return Err(RegistryError::Persistent(id.to_string()));
        }

        if !session.is_ghost {
            self.mux.kill_session(&session.multiplexer_name).await?;
        }
        self.sessions.write().await.remove(id);

        tracing::info!(session = id, mux_name = %session.multiplexer_name, "session deleted");
        Ok(true)
    }

    /// Update the human label.
    pub async fn rename(&self, id: &str, title: String) -> RegistryResult<Session> {
        let mut sessions = self.sessions.write().await;
        let session = sessions
            .get_mut(id)
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))?;
        session.title = title;
        Ok(session.clone())
    }

    pub async fn set_persistent(&self, id: &str, persistent: bool) -> RegistryResult<Session> {
        let mut sessions = self.sessions.write().await;
        let session = sessions
            .get_mut(id)
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))?;
        session.persistent = persistent;
        Ok(session.clone())
    }

    /// Record activity on a session.
    pub async fn touch(&self, id: &str) {
        if let Some(session) = self.sessions.write().await.get_mut(id) {
            session.last_active_at = Utc::now();
        }
    }

    /// Reconcile the registry against the multiplexer: sessions whose
    /// multiplexer side vanished become ghosts, ghosts whose side came
    /// back are revived, and owned sessions created out-of-band are
    /// discovered.
    pub async fn reconcile(&self) -> RegistryResult<()> {
        let live = self.live_owned_names().await?;
        self.mark_ghosts(&live).await;
        self.discover_existing().await?;
        Ok(())
    }

    /// Owned session names currently alive in the multiplexer.
    async fn live_owned_names(&self) -> RegistryResult<std::collections::HashSet<String>> {
        Ok(self
            .mux
            .list_sessions()
            .await?
            .into_iter()
            .filter(|n| n.starts_with(OWNED_PREFIX))
            .collect())
    }

    /// Flip ghost flags to match the multiplexer's live session set.
    async fn mark_ghosts(&self, live: &std::collections::HashSet<String>) {
        let mut sessions = self.sessions.write().await;
        for session in sessions.values_mut() {
            let alive = live.contains(&session.multiplexer_name);
            if session.is_ghost && alive {
                tracing::info!(session = %session.id, "ghost session revived");
                session.is_ghost = false;
            } else if !session.is_ghost && !alive {
                tracing::info!(session = %session.id, "session vanished from multiplexer");
                session.is_ghost = true;
            }
        }
    }

    /// Start the periodic reconciliation sweep.
    pub fn start_cleanup_task(self: Arc<Self>, period: std::time::Duration) {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Err(e) = self.reconcile().await {
                    tracing::warn!(error = %e, "registry reconcile failed");
                }
            }
        });
    }

    async fn mint_name(&self) -> RegistryResult<String> {
        // Snapshot taken names; the existence probe must not run under the
        // registry lock.
        let taken: std::collections::HashSet<String> = {
            let sessions = self.sessions.read().await;
            sessions
                .values()
                .map(|s| s.multiplexer_name.clone())
                .collect()
        };

        for _ in 0..CREATE_NAME_RETRIES {
            let name = mint_session_name();
            if !taken.contains(&name) && !self.mux.session_exists(&name).await? {
                return Ok(name);
            }
        }
        Err(RegistryError::NameCollision)
    }

    #[cfg(test)]
    async fn insert_for_test(&self, session: Session) {
        self.sessions
            .write()
            .await
            .insert(session.id.clone(), session);
    }
}

fn mint_session_name() -> String {
    let mut rng = rand::thread_rng();
    let suffix: String = (0..8)
        .map(|_| {
            let n: u8 = rng.gen_range(0..36);
            char::from_digit(n as u32, 36).unwrap_or('0')
        })
        .collect();
    format!("{OWNED_PREFIX}{suffix}")
}
