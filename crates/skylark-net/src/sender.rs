//! Background send queue decoupling game code from socket writes.
//!
//! Callers enqueue pre-encoded frames from any task without blocking; a
//! single worker task drains the queue in FIFO order and writes each frame
//! through the [`Transport`]. Frames enqueued while the transport is down
//! are dropped silently, matching the fire-and-forget contract of the
//! unreliable message tier.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use skylark_config::NetConfig;
use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;

use crate::transport::Transport;

// ---------------------------------------------------------------------------
// Shared worker state
// ---------------------------------------------------------------------------

struct SenderShared {
    /// Pending frames, oldest first. Unbounded; the drain worker keeps up
    /// under normal load and disconnects clear the producer side.
    queue: Mutex<VecDeque<Vec<u8>>>,
    /// Wakes the worker when a frame is enqueued.
    notify: Notify,
    /// Cleared by [`BackgroundSender::stop`]; gates both enqueue and drain.
    running: AtomicBool,
    transport: Arc<Transport>,
}

// ---------------------------------------------------------------------------
// BackgroundSender
// ---------------------------------------------------------------------------

/// FIFO send queue with a dedicated drain worker.
///
/// Created per connection via [`BackgroundSender::start`] and stopped when
/// the connection goes away. Stopping is bounded: the worker is given a
/// grace period to finish its current write, then aborted.
pub struct BackgroundSender {
    shared: Arc<SenderShared>,
    shutdown_tx: watch::Sender<bool>,
    worker: Mutex<Option<JoinHandle<()>>>,
    stop_timeout: Duration,
}

impl BackgroundSender {
    /// Spawn the drain worker for `transport`.
    pub fn start(transport: Arc<Transport>, config: &NetConfig) -> Self {
        let shared = Arc::new(SenderShared {
            queue: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            running: AtomicBool::new(true),
            transport,
        });
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let worker_shared = Arc::clone(&shared);
        let handle = tokio::spawn(async move {
            Self::run(worker_shared, shutdown_rx).await;
        });

        Self {
            shared,
            shutdown_tx,
            worker: Mutex::new(Some(handle)),
            stop_timeout: Duration::from_millis(config.sender_stop_timeout_ms),
        }
    }

    /// Queue a frame for sending. Never blocks.
    ///
    /// Dropped silently (trace log only) when the sender is stopped or the
    /// transport is disconnected; callers that need delivery guarantees
    /// must watch the session state instead.
    pub fn enqueue(&self, frame: Vec<u8>) {
        if !self.shared.running.load(Ordering::Relaxed) || !self.shared.transport.is_connected() {
            tracing::trace!(len = frame.len(), "dropping frame while disconnected");
            return;
        }
        self.shared.queue.lock().unwrap().push_back(frame);
        self.shared.notify.notify_one();
    }

    /// Stop the worker within the configured grace period.
    ///
    /// Idempotent. Frames still queued when the worker stops are discarded.
    pub async fn stop(&self) {
        self.shared.running.store(false, Ordering::Relaxed);
        let _ = self.shutdown_tx.send(true);

        let handle = self.worker.lock().unwrap().take();
        if let Some(handle) = handle {
            let abort = handle.abort_handle();
            if tokio::time::timeout(self.stop_timeout, handle).await.is_err() {
                tracing::warn!(
                    timeout = ?self.stop_timeout,
                    "sender worker did not stop in time, aborting"
                );
                abort.abort();
            }
        }
    }

    /// Frames currently waiting to be sent.
    pub fn pending(&self) -> usize {
        self.shared.queue.lock().unwrap().len()
    }

    async fn run(shared: Arc<SenderShared>, mut shutdown_rx: watch::Receiver<bool>) {
        loop {
            // Frames enqueued before this waiter existed are covered by the
            // permit `Notify` stores, so nothing is missed.
            tokio::select! {
                _ = shared.notify.notified() => {
                    Self::drain(&shared).await;
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }
    }

    /// Send queued frames oldest-first until the queue is empty or a send
    /// fails. A failed frame is already popped and is not retried; the
    /// rest of the queue is left for the next wake.
    async fn drain(shared: &SenderShared) {
        loop {
            if !shared.running.load(Ordering::Relaxed) {
                return;
            }
            let frame = shared.queue.lock().unwrap().pop_front();
            let Some(frame) = frame else {
                return;
            };
            if let Err(err) = shared.transport.send(&frame).await {
                tracing::debug!(error = %err, len = frame.len(), "send failed, frame dropped");
                return;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
