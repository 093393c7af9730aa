//! Per-session PTY instance: attach child, fan-out, serialized input.
//!
//! Two blocking fibers run per instance. The output reader pulls chunks off
//! the PTY master and hands a copy to every subscriber queue with a
//! non-blocking send; a subscriber that cannot keep up loses frames, never
//! the reader. The input writer is the only code that writes to the master,
//! consuming the bounded write queue one buffer at a time so each inbound
//! binary frame lands as a single atomic write.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex as StdMutex, RwLock as StdRwLock};
use std::sync::Arc;

use bytes::Bytes;
use portable_pty::{native_pty_system, Child, MasterPty, PtySize};
use tokio::sync::{mpsc, oneshot};

use super::PtyError;
use crate::mux::MuxClient;

/// Frame queued for delivery to one subscriber's socket writer.
#[derive(Debug, Clone)]
pub enum OutFrame {
    /// Raw PTY bytes, delivered as a binary frame.
    Output(Bytes),
    /// Serialized JSON control message, delivered as a text frame.
    Control(String),
    /// Close the socket with this code and stop the writer.
    Close(u16),
}

/// Queue and chunk sizing for an instance.
#[derive(Debug, Clone, Copy)]
pub struct PtyTuning {
    pub read_chunk: usize,
    pub write_queue_capacity: usize,
    pub send_queue_capacity: usize,
}

static NEXT_SUBSCRIBER_ID: AtomicU64 = AtomicU64::new(1);

struct Subscriber {
    tx: mpsc::Sender<OutFrame>,
    paused: bool,
}

/// The gateway's in-process handle for one attached session.
pub struct PtyInstance {
    session_id: String,
    multiplexer_name: String,
    tuning: PtyTuning,
    /// Master side of the pseudo-terminal; `None` once closed.
    master: StdMutex<Option<Box<dyn MasterPty + Send>>>,
    /// The attach child; taken during teardown.
    child: StdMutex<Option<Box<dyn Child + Send + Sync>>>,
    /// Producer side of the input queue; `None` once closed.
    write_tx: StdMutex<Option<mpsc::Sender<Bytes>>>,
    /// Fired once by whichever fiber observes the PTY dying first.
    exit_tx: StdMutex<Option<oneshot::Sender<()>>>,
    subscribers: StdRwLock<HashMap<u64, Subscriber>>,
    closed: AtomicBool,
    dropped_frames: AtomicU64,
}

impl PtyInstance {
    /// Spawn the attach child inside a fresh pseudo-terminal and start the
    /// output-reader and input-writer fibers. The returned receiver fires
    /// when the PTY dies on its own (child exit, read/write error).
    pub fn spawn(
        session_id: String,
        multiplexer_name: String,
        mux: &MuxClient,
        tuning: PtyTuning,
    ) -> Result<(Arc<Self>, oneshot::Receiver<()>), PtyError> {
        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(PtySize {
                rows: 24,
                cols: 80,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| PtyError::Spawn(e.to_string()))?;

        let cmd = mux.attach_command(&multiplexer_name);
        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| PtyError::Spawn(e.to_string()))?;
        drop(pair.slave);

        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| PtyError::Spawn(e.to_string()))?;
        let writer = pair
            .master
            .take_writer()
            .map_err(|e| PtyError::Spawn(e.to_string()))?;

        let (write_tx, write_rx) = mpsc::channel::<Bytes>(tuning.write_queue_capacity);
        let (exit_tx, exit_rx) = oneshot::channel();

        let instance = Arc::new(Self {
            session_id,
            multiplexer_name,
            tuning,
            master: StdMutex::new(Some(pair.master)),
            child: StdMutex::new(Some(child)),
            write_tx: StdMutex::new(Some(write_tx)),
            exit_tx: StdMutex::new(Some(exit_tx)),
            subscribers: StdRwLock::new(HashMap::new()),
            closed: AtomicBool::new(false),
            dropped_frames: AtomicU64::new(0),
        });

        instance.clone().start_output_reader(reader);
        instance.clone().start_input_writer(writer, write_rx);

        Ok((instance, exit_rx))
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn multiplexer_name(&self) -> &str {
        &self.multiplexer_name
    }

    /// Frames lost to full subscriber or input queues.
    pub fn dropped_frames(&self) -> u64 {
        self.dropped_frames.load(Ordering::Relaxed)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Flip to closed. Returns true for the caller that won; teardown runs
    /// exactly once.
    pub(super) fn mark_closed(&self) -> bool {
        !self.closed.swap(true, Ordering::AcqRel)
    }

    // ── Subscribers ──────────────────────────────────────────────────────

    /// Register a connection. The returned receiver feeds its socket
    /// writer; the queue is bounded and overflow drops frames for this
    /// subscriber only.
    pub fn add_subscriber(&self) -> (u64, mpsc::Receiver<OutFrame>) {
        let id = NEXT_SUBSCRIBER_ID.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.tuning.send_queue_capacity);
        let mut subs = self.subscribers.write().unwrap_or_else(|e| e.into_inner());
        subs.insert(id, Subscriber { tx, paused: false });
        tracing::debug!(session = %self.session_id, subscriber = id, total = subs.len(), "subscriber added");
        (id, rx)
    }

    /// Drop a connection. Closing its queue stops the socket writer.
    pub fn remove_subscriber(&self, id: u64) {
        let mut subs = self.subscribers.write().unwrap_or_else(|e| e.into_inner());
        subs.remove(&id);
        tracing::debug!(session = %self.session_id, subscriber = id, total = subs.len(), "subscriber removed");
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    /// Gate output delivery for one subscriber. Other subscribers and the
    /// PTY itself are unaffected.
    pub fn set_paused(&self, id: u64, paused: bool) {
        let mut subs = self.subscribers.write().unwrap_or_else(|e| e.into_inner());
        if let Some(sub) = subs.get_mut(&id) {
            sub.paused = paused;
        }
    }

    // ── Input path ───────────────────────────────────────────────────────

    /// Queue bytes for the PTY. Non-blocking: a full queue drops the frame
    /// rather than stalling the connection reader. Returns false when the
    /// frame was dropped or the instance is closed.
    pub fn write_input(&self, data: Bytes) -> bool {
        let guard = self.write_tx.lock().unwrap_or_else(|e| e.into_inner());
        let Some(tx) = guard.as_ref() else {
            return false;
        };
        match tx.try_send(data) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.dropped_frames.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(session = %self.session_id, "input queue full, frame dropped");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// Update the terminal dimensions on the master, out-of-band with
    /// respect to queued input. Last writer wins.
    pub fn resize(&self, cols: u16, rows: u16) {
        let guard = self.master.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(master) = guard.as_ref() {
            if let Err(e) = master.resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            }) {
                tracing::warn!(session = %self.session_id, error = %e, "pty resize failed");
            }
        }
    }

    // ── Fan-out ──────────────────────────────────────────────────────────

    /// Deliver a text control frame to every subscriber, paused or not.
    pub fn broadcast_control(&self, text: String) {
        self.broadcast(OutFrame::Control(text), false);
    }

    /// Queue a control frame for a single subscriber (pong replies, title
    /// hints). Best-effort like every other delivery.
    pub fn send_control_to(&self, id: u64, text: String) {
        let subs = self.subscribers.read().unwrap_or_else(|e| e.into_inner());
        if let Some(sub) = subs.get(&id) {
            if sub.tx.try_send(OutFrame::Control(text)).is_err() {
                self.dropped_frames.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Ask every subscriber's writer to close with `code`.
    pub(super) fn broadcast_close(&self, code: u16) {
        self.broadcast(OutFrame::Close(code), false);
    }

    pub(crate) fn broadcast_output(&self, data: Bytes) {
        self.broadcast(OutFrame::Output(data), true);
    }

    fn broadcast(&self, frame: OutFrame, skip_paused: bool) {
        let subs = self.subscribers.read().unwrap_or_else(|e| e.into_inner());
        for sub in subs.values() {
            if skip_paused && sub.paused {
                continue;
            }
            match sub.tx.try_send(frame.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    self.dropped_frames.fetch_add(1, Ordering::Relaxed);
                }
                // Removal races are resolved by the handler's own exit.
                Err(mpsc::error::TrySendError::Closed(_)) => {}
            }
        }
    }

    // ── Teardown plumbing (driven by the manager) ────────────────────────

    /// Stop accepting input and let the writer fiber drain out.
    pub(super) fn close_write_queue(&self) {
        self.write_tx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
    }

    /// Close the master side. The reader fiber sees EOF shortly after.
    pub(super) fn close_master(&self) {
        self.master.lock().unwrap_or_else(|e| e.into_inner()).take();
    }

    /// Hand the child to the caller for the kill sequence.
    pub(super) fn take_child(&self) -> Option<Box<dyn Child + Send + Sync>> {
        self.child.lock().unwrap_or_else(|e| e.into_inner()).take()
    }

    /// Drop all subscriber queues. Writers drain buffered frames (an error
    /// frame and close code, when one was broadcast) and then exit.
    pub(super) fn clear_subscribers(&self) {
        self.subscribers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }

    fn signal_exit(&self) {
        if let Some(tx) = self.exit_tx.lock().unwrap_or_else(|e| e.into_inner()).take() {
            let _ = tx.send(());
        }
    }

    // ── Fibers ───────────────────────────────────────────────────────────

    fn start_output_reader(self: Arc<Self>, mut reader: Box<dyn Read + Send>) {
        let chunk = self.tuning.read_chunk;
        tokio::task::spawn_blocking(move || {
            let mut buf = vec![0u8; chunk];
            loop {
                match reader.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => {
                        // Copy out of the read buffer before fan-out.
                        self.broadcast_output(Bytes::copy_from_slice(&buf[..n]));
                    }
                    Err(e) => {
                        if !self.is_closed() {
                            tracing::debug!(session = %self.session_id, error = %e, "pty read error");
                        }
                        break;
                    }
                }
            }
            tracing::debug!(session = %self.session_id, "output reader finished");
            self.signal_exit();
        });
    }

    fn start_input_writer(
        self: Arc<Self>,
        mut writer: Box<dyn Write + Send>,
        mut write_rx: mpsc::Receiver<Bytes>,
    ) {
        tokio::task::spawn_blocking(move || {
            while let Some(data) = write_rx.blocking_recv() {
                if writer.write_all(&data).and_then(|_| writer.flush()).is_err() {
                    if !self.is_closed() {
                        tracing::debug!(session = %self.session_id, "pty write error");
                        self.signal_exit();
                    }
                    return;
                }
            }
            tracing::debug!(session = %self.session_id, "input writer finished");
        });
    }
}

#[cfg(test)]
impl PtyInstance {
    /// Instance with no real PTY behind it, for exercising the fan-out and
    /// queue logic in isolation.
    pub(crate) fn detached(
        session_id: String,
        multiplexer_name: String,
        tuning: PtyTuning,
    ) -> (Arc<Self>, mpsc::Receiver<Bytes>) {
        let (write_tx, write_rx) = mpsc::channel(tuning.write_queue_capacity);
        let (exit_tx, _exit_rx) = oneshot::channel();
        let instance = Arc::new(Self {
            session_id,
            multiplexer_name,
            tuning,
            master: StdMutex::new(None),
            child: StdMutex::new(None),
            write_tx: StdMutex::new(Some(write_tx)),
            exit_tx: StdMutex::new(Some(exit_tx)),
            subscribers: StdRwLock::new(HashMap::new()),
            closed: AtomicBool::new(false),
            dropped_frames: AtomicU64::new(0),
        });
        (instance, write_rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shell_instance(tuning: PtyTuning) -> (Arc<PtyInstance>, mpsc::Receiver<Bytes>) {
        PtyInstance::detached("test".to_string(), "winterm-test".to_string(), tuning)
    }

    fn tuning(send_queue: usize) -> PtyTuning {
        PtyTuning {
            read_chunk: 4096,
            write_queue_capacity: 4,
            send_queue_capacity: send_queue,
        }
    }

    #[tokio::test]
    async fn broadcast_preserves_order_per_subscriber() {
        let (instance, _write_rx) = shell_instance(tuning(16));
        let (_id, mut rx) = instance.add_subscriber();

        for i in 0..5u8 {
            instance.broadcast_output(Bytes::copy_from_slice(&[i]));
        }

        for i in 0..5u8 {
            match rx.recv().await.unwrap() {
                OutFrame::Output(data) => assert_eq!(data.as_ref(), &[i]),
                other => panic!("unexpected frame: {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn paused_subscriber_skipped_others_unaffected() {
        let (instance, _write_rx) = shell_instance(tuning(16));
        let (paused_id, mut paused_rx) = instance.add_subscriber();
        let (_live_id, mut live_rx) = instance.add_subscriber();

        instance.set_paused(paused_id, true);
        instance.broadcast_output(Bytes::from_static(b"x"));

        assert!(matches!(live_rx.recv().await, Some(OutFrame::Output(_))));
        assert!(paused_rx.try_recv().is_err());

        // Control frames still reach paused subscribers.
        instance.broadcast_control("{\"type\":\"title\",\"text\":\"t\"}".to_string());
        assert!(matches!(paused_rx.recv().await, Some(OutFrame::Control(_))));
    }

    #[tokio::test]
    async fn slow_subscriber_drops_frames_without_blocking() {
        let (instance, _write_rx) = shell_instance(tuning(2));
        let (_slow_id, mut slow_rx) = instance.add_subscriber();
        let (_fast_id, mut fast_rx) = instance.add_subscriber();

        // Drain the fast subscriber as we go; never read the slow one.
        for i in 0..10u8 {
            instance.broadcast_output(Bytes::copy_from_slice(&[i]));
            assert!(matches!(fast_rx.recv().await, Some(OutFrame::Output(_))));
        }

        assert!(instance.dropped_frames() >= 8);

        // The slow subscriber still sees an ordered prefix-with-gaps.
        let mut last = None;
        while let Ok(OutFrame::Output(data)) = slow_rx.try_recv() {
            let b = data[0];
            if let Some(prev) = last {
                assert!(b > prev, "frames reordered: {prev} then {b}");
            }
            last = Some(b);
        }
    }

    #[tokio::test]
    async fn fan_out_delivers_identical_bytes_to_all() {
        let (instance, _write_rx) = shell_instance(tuning(32));
        let (_a, mut rx_a) = instance.add_subscriber();
        let (_b, mut rx_b) = instance.add_subscriber();

        for chunk in [&b"total 0\r\n"[..], &b"drwxr-x a\r\n"[..], &b"$ "[..]] {
            instance.broadcast_output(Bytes::copy_from_slice(chunk));
        }

        let mut seen_a = Vec::new();
        let mut seen_b = Vec::new();
        for _ in 0..3 {
            match rx_a.recv().await.unwrap() {
                OutFrame::Output(data) => seen_a.extend_from_slice(&data),
                other => panic!("unexpected frame: {other:?}"),
            }
            match rx_b.recv().await.unwrap() {
                OutFrame::Output(data) => seen_b.extend_from_slice(&data),
                other => panic!("unexpected frame: {other:?}"),
            }
        }
        assert_eq!(seen_a, seen_b);
        assert_eq!(seen_a, b"total 0\r\ndrwxr-x a\r\n$ ");
    }

    #[tokio::test]
    async fn input_frames_preserve_arrival_order() {
        let (instance, mut write_rx) = shell_instance(tuning(16));

        assert!(instance.write_input(Bytes::from_static(b"echo ")));
        assert!(instance.write_input(Bytes::from_static(b"hi")));
        assert!(instance.write_input(Bytes::from_static(b"\r")));

        assert_eq!(write_rx.recv().await.unwrap().as_ref(), b"echo ");
        assert_eq!(write_rx.recv().await.unwrap().as_ref(), b"hi");
        assert_eq!(write_rx.recv().await.unwrap().as_ref(), b"\r");
    }

    #[tokio::test]
    async fn write_input_drops_on_full_queue() {
        let (instance, mut write_rx) = shell_instance(tuning(16));

        // Capacity is 4.
        for _ in 0..4 {
            assert!(instance.write_input(Bytes::from_static(b"k")));
        }
        assert!(!instance.write_input(Bytes::from_static(b"k")));
        assert_eq!(instance.dropped_frames(), 1);

        // Frames come out in order.
        for _ in 0..4 {
            assert_eq!(write_rx.recv().await.unwrap().as_ref(), b"k");
        }
    }

    #[tokio::test]
    async fn write_input_fails_after_close() {
        let (instance, _write_rx) = shell_instance(tuning(16));
        instance.close_write_queue();
        assert!(!instance.write_input(Bytes::from_static(b"k")));
    }

    #[tokio::test]
    async fn removed_subscriber_queue_closes() {
        let (instance, _write_rx) = shell_instance(tuning(16));
        let (id, mut rx) = instance.add_subscriber();
        instance.remove_subscriber(id);
        assert!(rx.recv().await.is_none());
    }

    #[test]
    fn mark_closed_wins_once() {
        let (instance, _write_rx) = shell_instance(tuning(16));
        assert!(instance.mark_closed());
        assert!(!instance.mark_closed());
        assert!(instance.is_closed());
    }

    #[tokio::test]
    async fn close_frame_delivered_before_queue_closes() {
        let (instance, _write_rx) = shell_instance(tuning(16));
        let (_id, mut rx) = instance.add_subscriber();

        instance.broadcast_control("{\"type\":\"error\",\"message\":\"pty process exited\"}".to_string());
        instance.broadcast_close(4100);
        instance.clear_subscribers();

        assert!(matches!(rx.recv().await, Some(OutFrame::Control(_))));
        match rx.recv().await {
            Some(OutFrame::Close(code)) => assert_eq!(code, 4100),
            other => panic!("unexpected frame: {other:?}"),
        }
        assert!(rx.recv().await.is_none());
    }
}
