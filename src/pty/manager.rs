//! Singleton-per-session instance map with reference counting.
//!
//! `ensure` hands out the existing instance or spawns one, resolving the
//! spawn race by letting the loser tear down its own child. `release`
//! decrements the reference count and arms the idle-stop timer at zero; a
//! later `ensure` cancels it. The lock order is manager map, then instance
//! state; nothing here holds the map lock across an await.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use super::instance::{PtyInstance, PtyTuning};
use super::{PtyError, PtyResult};
use crate::config::Config;
use crate::mux::MuxClient;

struct Entry {
    instance: Arc<PtyInstance>,
    ref_count: usize,
    idle_timer: Option<JoinHandle<()>>,
    last_active_at: Instant,
}

/// Map from session id to its live [`PtyInstance`].
pub struct PtyManager {
    mux: MuxClient,
    tuning: PtyTuning,
    idle_grace: Duration,
    kill_grace: Duration,
    entries: Mutex<HashMap<String, Entry>>,
}

pub type SharedPtyManager = Arc<PtyManager>;

impl PtyManager {
    pub fn new(mux: MuxClient, config: &Config) -> Self {
        Self {
            mux,
            tuning: PtyTuning {
                read_chunk: config.read_chunk,
                write_queue_capacity: config.write_queue_capacity,
                send_queue_capacity: config.send_queue_capacity,
            },
            idle_grace: config.idle_grace,
            kill_grace: config.kill_grace,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Get the running instance for a session, or spawn one. Each
    /// successful call holds one reference until the matching `release`.
    pub async fn ensure(
        self: &Arc<Self>,
        session_id: &str,
        multiplexer_name: &str,
    ) -> PtyResult<Arc<PtyInstance>> {
        // Fast path: reuse a live instance.
        {
            let mut entries = self.entries.lock().await;
            if let Some(entry) = entries.get_mut(session_id) {
                if !entry.instance.is_closed() {
                    entry.ref_count += 1;
                    entry.last_active_at = Instant::now();
                    if let Some(timer) = entry.idle_timer.take() {
                        timer.abort();
                    }
                    return Ok(Arc::clone(&entry.instance));
                }
            }
        }

        // Fail fast before paying for a spawn.
        if !self.mux.session_exists(multiplexer_name).await? {
            return Err(PtyError::SessionGone(multiplexer_name.to_string()));
        }

        let (instance, exit_rx) = PtyInstance::spawn(
            session_id.to_string(),
            multiplexer_name.to_string(),
            &self.mux,
            self.tuning,
        )?;

        // Re-check under the lock: another caller may have won the spawn
        // race while ours was starting. Adopt theirs, discard ours.
        let won = {
            let mut entries = self.entries.lock().await;
            let adopted = match entries.get_mut(session_id) {
                Some(entry) if !entry.instance.is_closed() => {
                    entry.ref_count += 1;
                    entry.last_active_at = Instant::now();
                    if let Some(timer) = entry.idle_timer.take() {
                        timer.abort();
                    }
                    Some(Arc::clone(&entry.instance))
                }
                _ => None,
            };
            if adopted.is_none() {
                entries.insert(
                    session_id.to_string(),
                    Entry {
                        instance: Arc::clone(&instance),
                        ref_count: 1,
                        idle_timer: None,
                        last_active_at: Instant::now(),
                    },
                );
            }
            adopted
        };

        if let Some(theirs) = won {
            if instance.mark_closed() {
                self.teardown(&instance).await;
            }
            return Ok(theirs);
        }

        tracing::info!(session = session_id, mux_name = multiplexer_name, "pty instance started");

        // Supervisor: when the PTY dies on its own, notify subscribers and
        // reclaim the entry.
        {
            let manager = Arc::clone(self);
            let instance = Arc::clone(&instance);
            tokio::spawn(async move {
                if exit_rx.await.is_ok() {
                    manager.on_instance_exit(instance).await;
                }
            });
        }

        Ok(instance)
    }

    /// Drop one reference. At zero, the idle-stop timer is armed; the
    /// instance survives a reconnect window before teardown.
    pub async fn release(self: &Arc<Self>, session_id: &str) {
        let mut entries = self.entries.lock().await;
        let Some(entry) = entries.get_mut(session_id) else {
            return;
        };
        entry.ref_count = entry.ref_count.saturating_sub(1);
        if entry.ref_count > 0 {
            return;
        }

        if let Some(previous) = entry.idle_timer.take() {
            previous.abort();
        }
        let manager = Arc::clone(self);
        let session_id = session_id.to_string();
        let grace = self.idle_grace;
        entry.idle_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            manager.idle_stop(&session_id).await;
        }));
    }

    pub async fn get(&self, session_id: &str) -> Option<Arc<PtyInstance>> {
        let entries = self.entries.lock().await;
        entries
            .get(session_id)
            .filter(|e| !e.instance.is_closed())
            .map(|e| Arc::clone(&e.instance))
    }

    /// Best-effort text delivery to all subscribers of a running instance.
    /// External collaborators (summary pipelines and the like) call this;
    /// an absent instance is a quiet no-op.
    pub async fn broadcast(&self, session_id: &str, payload: String) {
        if let Some(instance) = self.get(session_id).await {
            instance.broadcast_control(payload);
        }
    }

    async fn idle_stop(self: &Arc<Self>, session_id: &str) {
        let removed = {
            let mut entries = self.entries.lock().await;
            let idle = entries
                .get(session_id)
                .map(|e| e.ref_count == 0 && !e.instance.is_closed())
                .unwrap_or(false);
            if idle {
                entries.remove(session_id)
            } else {
                None
            }
        };

        let Some(entry) = removed else {
            return;
        };
        if entry.instance.mark_closed() {
            tracing::info!(
                session = session_id,
                idle_secs = entry.last_active_at.elapsed().as_secs(),
                "pty instance idle, stopping"
            );
            self.teardown(&entry.instance).await;
        }
    }

    /// The PTY died underneath us: tell every subscriber, then reclaim.
    async fn on_instance_exit(self: &Arc<Self>, instance: Arc<PtyInstance>) {
        if !instance.mark_closed() {
            // Teardown already ran (idle stop or adoption race).
            return;
        }

        {
            let mut entries = self.entries.lock().await;
            let same = entries
                .get(instance.session_id())
                .map(|e| Arc::ptr_eq(&e.instance, &instance))
                .unwrap_or(false);
            if same {
                if let Some(entry) = entries.remove(instance.session_id()) {
                    if let Some(timer) = entry.idle_timer {
                        timer.abort();
                    }
                }
            }
        }

        tracing::warn!(session = %instance.session_id(), "pty process exited");
        instance.broadcast_control(
            serde_json::json!({"type": "error", "message": "pty process exited"}).to_string(),
        );
        instance.broadcast_close(crate::api::ws::CLOSE_PTY_EXITED);
        self.teardown(&instance).await;
    }

    /// Release the instance's resources: stop the input queue, close the
    /// master, then terminate the child gracefully with a bounded grace
    /// before force-killing it.
    async fn teardown(&self, instance: &Arc<PtyInstance>) {
        instance.close_write_queue();
        instance.close_master();
        instance.clear_subscribers();

        let Some(mut child) = instance.take_child() else {
            return;
        };
        let kill_grace = self.kill_grace;
        let session = instance.session_id().to_string();

        let result = tokio::task::spawn_blocking(move || {
            if let Some(pid) = child.process_id() {
                unsafe {
                    libc::kill(pid as libc::pid_t, libc::SIGTERM);
                }
            }

            let deadline = std::time::Instant::now() + kill_grace;
            loop {
                match child.try_wait() {
                    Ok(Some(_)) => return Ok(()),
                    Ok(None) => {
                        if std::time::Instant::now() >= deadline {
                            break;
                        }
                        std::thread::sleep(Duration::from_millis(100));
                    }
                    Err(e) => return Err(e),
                }
            }

            child.kill()?;
            child.wait().map(|_| ())
        })
        .await;

        match result {
            Ok(Ok(())) => tracing::debug!(session = %session, "attach child reaped"),
            Ok(Err(e)) => tracing::warn!(session = %session, error = %e, "attach child reap failed"),
            Err(e) => tracing::warn!(session = %session, error = %e, "teardown task failed"),
        }
    }

    #[cfg(test)]
    async fn entry_state(&self, session_id: &str) -> Option<(usize, bool)> {
        let entries = self.entries.lock().await;
        entries
            .get(session_id)
            .map(|e| (e.ref_count, e.idle_timer.is_some()))
    }

    #[cfg(test)]
    async fn last_active(&self, session_id: &str) -> Option<Instant> {
        let entries = self.entries.lock().await;
        entries.get(session_id).map(|e| e.last_active_at)
    }

    #[cfg(test)]
    async fn install_for_test(&self, instance: Arc<PtyInstance>, ref_count: usize) {
        let mut entries = self.entries.lock().await;
        entries.insert(
            instance.session_id().to_string(),
            Entry {
                instance,
                ref_count,
                idle_timer: None,
                last_active_at: Instant::now(),
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn test_manager(idle_grace: Duration) -> Arc<PtyManager> {
        let mut config = test_config();
        config.idle_grace = idle_grace;
        Arc::new(PtyManager::new(
            MuxClient::new("/tmp/winterm-test-sock"),
            &config,
        ))
    }

    fn test_config() -> Config {
        // from_env with no overrides set gives the defaults.
        Config::from_env()
    }

    /// Instance with no PTY behind it, installed directly into the map.
    /// The returned receiver keeps the input queue open.
    fn detached_instance(
        session_id: &str,
    ) -> (Arc<PtyInstance>, tokio::sync::mpsc::Receiver<Bytes>) {
        let tuning = PtyTuning {
            read_chunk: 4096,
            write_queue_capacity: 4,
            send_queue_capacity: 16,
        };
        PtyInstance::detached(
            session_id.to_string(),
            format!("winterm-{session_id}"),
            tuning,
        )
    }

    #[tokio::test]
    async fn get_skips_closed_instances() {
        let manager = test_manager(Duration::from_secs(30));
        let (instance, _write_rx) = detached_instance("s1");
        manager.install_for_test(Arc::clone(&instance), 1).await;

        assert!(manager.get("s1").await.is_some());
        instance.mark_closed();
        assert!(manager.get("s1").await.is_none());
    }

    #[tokio::test]
    async fn release_at_zero_arms_timer_and_ensure_cancels() {
        let manager = test_manager(Duration::from_secs(60));
        let (instance, _write_rx) = detached_instance("s2");
        manager.install_for_test(Arc::clone(&instance), 1).await;

        manager.release("s2").await;
        assert_eq!(manager.entry_state("s2").await, Some((0, true)));

        // A fast-path ensure reuses the instance and cancels the timer.
        let reused = manager.ensure("s2", "winterm-s2").await.unwrap();
        assert!(Arc::ptr_eq(&reused, &instance));
        assert_eq!(manager.entry_state("s2").await, Some((1, false)));
    }

    #[tokio::test]
    async fn ensure_refreshes_last_active() {
        let manager = test_manager(Duration::from_secs(60));
        let (instance, _write_rx) = detached_instance("s10");
        manager.install_for_test(Arc::clone(&instance), 1).await;

        let installed_at = manager.last_active("s10").await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        manager.ensure("s10", "winterm-s10").await.unwrap();
        let refreshed_at = manager.last_active("s10").await.unwrap();
        assert!(refreshed_at > installed_at);
    }

    #[tokio::test]
    async fn release_below_zero_saturates() {
        let manager = test_manager(Duration::from_secs(60));
        let (instance, _write_rx) = detached_instance("s3");
        manager.install_for_test(Arc::clone(&instance), 1).await;

        manager.release("s3").await;
        manager.release("s3").await;
        let (refs, _) = manager.entry_state("s3").await.unwrap();
        assert_eq!(refs, 0);
    }

    #[tokio::test]
    async fn idle_stop_removes_after_grace() {
        let manager = test_manager(Duration::from_millis(20));
        let (instance, _write_rx) = detached_instance("s4");
        manager.install_for_test(Arc::clone(&instance), 1).await;

        manager.release("s4").await;
        tokio::time::sleep(Duration::from_millis(80)).await;

        assert!(manager.get("s4").await.is_none());
        assert!(instance.is_closed());
    }

    #[tokio::test]
    async fn ensure_within_grace_prevents_idle_stop() {
        let manager = test_manager(Duration::from_millis(50));
        let (instance, _write_rx) = detached_instance("s5");
        manager.install_for_test(Arc::clone(&instance), 1).await;

        manager.release("s5").await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        let reused = manager.ensure("s5", "winterm-s5").await.unwrap();
        assert!(Arc::ptr_eq(&reused, &instance));

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(manager.get("s5").await.is_some());
        assert!(!instance.is_closed());
    }

    #[tokio::test]
    async fn concurrent_ensure_release_keeps_refcount_consistent() {
        let manager = test_manager(Duration::from_secs(60));
        let (instance, _write_rx) = detached_instance("s8");
        manager.install_for_test(Arc::clone(&instance), 1).await;

        let mut handles = Vec::new();
        for _ in 0..32 {
            let manager = Arc::clone(&manager);
            let instance = Arc::clone(&instance);
            handles.push(tokio::spawn(async move {
                let reused = manager.ensure("s8", "winterm-s8").await.unwrap();
                assert!(Arc::ptr_eq(&reused, &instance));
                tokio::task::yield_now().await;
                manager.release("s8").await;
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        // Back to the single baseline reference; no timer armed.
        assert_eq!(manager.entry_state("s8").await, Some((1, false)));
        assert!(!instance.is_closed());
    }

    #[tokio::test]
    async fn broadcast_reaches_subscribers() {
        let manager = test_manager(Duration::from_secs(60));
        let (instance, _write_rx) = detached_instance("s6");
        manager.install_for_test(Arc::clone(&instance), 1).await;
        let (_id, mut rx) = instance.add_subscriber();

        manager
            .broadcast("s6", "{\"type\":\"summary\",\"text\":\"hi\"}".to_string())
            .await;

        match rx.recv().await {
            Some(crate::pty::OutFrame::Control(text)) => assert!(text.contains("summary")),
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[tokio::test]
    async fn ensure_fails_without_multiplexer_session() {
        // Socket path inside a fresh tempdir: no server can be listening,
        // so the existence probe fails whichever way tmux is installed.
        let dir = tempfile::tempdir().unwrap();
        let config = test_config();
        let manager = Arc::new(PtyManager::new(
            MuxClient::new(dir.path().join("sock")),
            &config,
        ));

        assert!(manager.ensure("s9", "winterm-s9").await.is_err());
        assert!(manager.get("s9").await.is_none());
    }

    #[tokio::test]
    async fn broadcast_to_absent_session_is_noop() {
        let manager = test_manager(Duration::from_secs(60));
        manager.broadcast("missing", "{}".to_string()).await;
    }

    #[tokio::test]
    async fn write_after_idle_stop_fails() {
        let manager = test_manager(Duration::from_millis(10));
        let (instance, _write_rx) = detached_instance("s7");
        manager.install_for_test(Arc::clone(&instance), 1).await;

        manager.release("s7").await;
        tokio::time::sleep(Duration::from_millis(60)).await;

        assert!(!instance.write_input(Bytes::from_static(b"x")));
    }
}
