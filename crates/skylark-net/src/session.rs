//! Session: connection lifecycle, inbound pump, heartbeat, reconnection.
//!
//! A [`Session`] ties the lower layers together. It owns the current
//! [`Transport`] and [`BackgroundSender`], feeds received chunks through
//! the shared [`FrameDecoder`], hands decoded envelopes to the
//! [`Dispatcher`], sends heartbeat pings on a fixed cadence, and drives the
//! single-flight reconnect loop when an established connection drops.
//! State changes are broadcast via a [`watch`] channel so any number of
//! consumers can react without polling.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use skylark_config::NetConfig;
use thiserror::Error;
use tokio::sync::{Mutex, mpsc, watch};

use crate::dispatch::Dispatcher;
use crate::framing::{FrameConfig, FrameDecoder, FrameError, encode_frame};
use crate::messages::{self, MessageError, Ping, kind};
use crate::sender::BackgroundSender;
use crate::transport::{CloseReason, Transport, TransportError, TransportEvent, TransportStats};

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

/// Session lifecycle state.
///
/// `Authenticated` and `InGame` are application-level refinements of
/// `Connected`; the session reaches them only when the host calls
/// [`Session::mark_authenticated`] and [`Session::mark_in_game`] after the
/// corresponding server exchanges succeed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No connection, none being attempted.
    Disconnected,
    /// TCP connect in progress.
    Connecting,
    /// Transport up, not yet authenticated.
    Connected,
    /// Server accepted our credentials.
    Authenticated,
    /// Player is spawned into the world.
    InGame,
}

impl SessionState {
    /// Whether a transport is up in this state.
    pub fn is_established(self) -> bool {
        matches!(self, Self::Connected | Self::Authenticated | Self::InGame)
    }
}

/// Observable session state backed by a [`watch`] channel.
pub struct SessionStateWatch {
    tx: watch::Sender<SessionState>,
    rx: watch::Receiver<SessionState>,
}

impl Default for SessionStateWatch {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionStateWatch {
    /// Create a new watch initialized to [`SessionState::Disconnected`].
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(SessionState::Disconnected);
        Self { tx, rx }
    }

    /// Set the current state, notifying all subscribers.
    pub fn set(&self, state: SessionState) {
        let _ = self.tx.send(state);
    }

    /// Atomically move from `from` to `to`. Returns `false` and leaves the
    /// state untouched if the current state is not `from`.
    pub fn transition(&self, from: SessionState, to: SessionState) -> bool {
        let mut changed = false;
        self.tx.send_if_modified(|state| {
            if *state == from {
                *state = to;
                changed = true;
                true
            } else {
                false
            }
        });
        changed
    }

    /// Return a new subscriber receiver.
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.rx.clone()
    }

    /// Return the current state without blocking.
    pub fn current(&self) -> SessionState {
        *self.rx.borrow()
    }
}

// ---------------------------------------------------------------------------
// Errors and events
// ---------------------------------------------------------------------------

/// Errors from session operations.
#[derive(Debug, Error)]
pub enum SessionError {
    /// `connect` is only valid while disconnected.
    #[error("cannot connect from state {0:?}")]
    NotDisconnected(SessionState),

    /// A reconnect loop already owns the connection attempt.
    #[error("reconnect already in progress")]
    ReconnectInProgress,

    /// The requested state change does not follow the lifecycle order.
    #[error("invalid state transition: {from:?} -> {to:?}")]
    InvalidTransition {
        from: SessionState,
        to: SessionState,
    },

    /// The underlying transport failed.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Frame encoding failed.
    #[error(transparent)]
    Frame(#[from] FrameError),

    /// Payload serialization failed.
    #[error(transparent)]
    Message(#[from] MessageError),
}

/// Why an established connection went away.
#[derive(Debug, Error)]
pub enum DisconnectReason {
    /// The host asked for the disconnect.
    #[error("disconnect requested")]
    Requested,

    /// The server closed the stream.
    #[error("server closed the connection")]
    PeerClosed,

    /// A socket read failed.
    #[error("read failed: {0}")]
    ReadError(std::io::Error),

    /// The byte stream no longer decodes into frames.
    #[error("frame decode failed: {0}")]
    DecodeFailure(FrameError),

    /// The server stopped answering heartbeats.
    #[error("no pong within {0:?}")]
    HeartbeatTimeout(Duration),
}

impl From<CloseReason> for DisconnectReason {
    fn from(reason: CloseReason) -> Self {
        match reason {
            CloseReason::PeerClosed => Self::PeerClosed,
            CloseReason::ReadError(err) => Self::ReadError(err),
        }
    }
}

/// Connection lifecycle notifications delivered to the host.
#[derive(Debug)]
pub enum SessionEvent {
    /// A transport was established, either by [`Session::connect`] or by
    /// the reconnect loop.
    Connected { addr: SocketAddr },
    /// The connection went away. When auto-reconnect applies, a reconnect
    /// loop is already scheduled by the time this is observed.
    Disconnected { reason: DisconnectReason },
    /// A background reconnect attempt failed; the loop keeps trying.
    ConnectFailed { error: TransportError },
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

/// Resources owned by one live connection. Replaced wholesale on
/// reconnect.
struct Active {
    transport: Arc<Transport>,
    sender: Arc<BackgroundSender>,
    /// Sending `true` stops the pump and heartbeat tasks for this
    /// connection without touching their successors.
    cancel_tx: watch::Sender<bool>,
}

/// Single-flight reconnect bookkeeping, guarded by one mutex so `connect`,
/// `disconnect` and the reconnect loop observe transitions atomically.
#[derive(Default)]
struct ReconnectControl {
    /// Reconnect policy switch; cleared by `disconnect` and `shutdown`.
    enabled: bool,
    /// Generation token of the reconnect loop holding the retry slot.
    owner: Option<u64>,
    /// Set while the loop runs `establish`; `disconnect` leaves the claim
    /// in place until the attempt resolves.
    attempt_in_flight: bool,
    /// Bumped on every claim so a loop that lost the slot can tell it was
    /// superseded rather than retry over the new owner.
    generation: u64,
}

impl ReconnectControl {
    /// Take the retry slot. Returns the owner token, or `None` when a
    /// reconnect loop already holds it.
    fn claim(&mut self) -> Option<u64> {
        if self.owner.is_some() {
            return None;
        }
        self.generation = self.generation.wrapping_add(1);
        self.owner = Some(self.generation);
        Some(self.generation)
    }

    /// Release the retry slot, whoever holds it.
    fn clear(&mut self) {
        self.owner = None;
    }
}

/// State shared between the session handle and its background tasks.
struct Shared {
    config: NetConfig,
    frame_config: FrameConfig,
    state: SessionStateWatch,
    dispatcher: Arc<Dispatcher>,
    events_tx: mpsc::UnboundedSender<SessionEvent>,
    /// Partial-frame state carried across read chunks. The one lock taken
    /// on the inbound hot path besides the dispatcher's registry read.
    decoder: Mutex<FrameDecoder>,
    active: StdMutex<Option<Active>>,
    /// Last endpoint passed to `connect`; the reconnect loop reuses it.
    endpoint: StdMutex<Option<SocketAddr>>,
    /// Single-flight reconnect state: the claim slot and policy switch.
    reconnect: StdMutex<ReconnectControl>,
    /// Pulsed by `disconnect` so a loop sleeping out its retry interval
    /// re-checks its claim instead of waiting for the timer.
    reconnect_wake_tx: watch::Sender<()>,
    reconnect_attempts: AtomicU32,
    /// Monotonic milliseconds (against `epoch`) of the newest pong.
    last_pong_ms: AtomicU64,
    epoch: Instant,
    shutdown_tx: watch::Sender<bool>,
}

/// Handle to the client's server session.
///
/// Cheap to clone; all clones drive the same session. Background tasks
/// keep running until [`Session::shutdown`] is called.
#[derive(Clone)]
pub struct Session {
    shared: Arc<Shared>,
}

impl Session {
    /// Create a session using `dispatcher` for incoming envelopes.
    ///
    /// Returns the handle and the receiver for lifecycle events. No
    /// connection is attempted until [`Session::connect`].
    pub fn new(
        config: NetConfig,
        dispatcher: Arc<Dispatcher>,
    ) -> (Self, mpsc::UnboundedReceiver<SessionEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, _) = watch::channel(false);
        let (reconnect_wake_tx, _) = watch::channel(());
        let frame_config = FrameConfig::new(&config);
        let shared = Arc::new(Shared {
            frame_config,
            state: SessionStateWatch::new(),
            dispatcher,
            events_tx,
            decoder: Mutex::new(FrameDecoder::new(&frame_config)),
            active: StdMutex::new(None),
            endpoint: StdMutex::new(None),
            reconnect: StdMutex::new(ReconnectControl::default()),
            reconnect_wake_tx,
            reconnect_attempts: AtomicU32::new(0),
            last_pong_ms: AtomicU64::new(0),
            epoch: Instant::now(),
            shutdown_tx,
            config,
        });
        (Self { shared }, events_rx)
    }

    /// Connect to the server at `addr`.
    ///
    /// Valid only from [`SessionState::Disconnected`]. On failure the
    /// session returns to `Disconnected` and, when auto-reconnect is
    /// configured, a background loop keeps retrying `addr`; a subsequent
    /// `connect` call is rejected with [`SessionError::ReconnectInProgress`]
    /// until that loop is stopped via [`Session::disconnect`].
    pub async fn connect(&self, addr: SocketAddr) -> Result<(), SessionError> {
        if self.shared.reconnect.lock().unwrap().owner.is_some() {
            return Err(SessionError::ReconnectInProgress);
        }
        if !self
            .shared
            .state
            .transition(SessionState::Disconnected, SessionState::Connecting)
        {
            return Err(SessionError::NotDisconnected(self.shared.state.current()));
        }

        *self.shared.endpoint.lock().unwrap() = Some(addr);
        self.shared.reconnect.lock().unwrap().enabled = true;

        match Shared::establish(&self.shared, addr).await {
            Ok(()) => Ok(()),
            Err(err) => {
                Shared::maybe_schedule_reconnect(&self.shared);
                Err(err.into())
            }
        }
    }

    /// Drop the connection, if any, and stop reconnecting.
    ///
    /// A reconnect loop sleeping out its retry interval loses its claim
    /// before this returns, so a follow-up [`Session::connect`] is
    /// accepted immediately. Idempotent from every state.
    pub async fn disconnect(&self) {
        self.shared.disable_reconnect();
        Shared::teardown(&self.shared, DisconnectReason::Requested).await;
    }

    /// Disconnect and stop all background work for good.
    pub async fn shutdown(&self) {
        self.shared.disable_reconnect();
        let _ = self.shared.shutdown_tx.send(true);
        Shared::teardown(&self.shared, DisconnectReason::Requested).await;
    }

    /// Encode a frame and queue it for sending.
    ///
    /// Never blocks. While disconnected the frame is dropped silently, in
    /// line with the fire-and-forget send contract; an error is returned
    /// only when the payload cannot be framed at all.
    pub fn send(&self, kind: u16, payload: &[u8]) -> Result<(), FrameError> {
        let frame = encode_frame(kind, payload, &self.shared.frame_config)?;
        let active = self.shared.active.lock().unwrap();
        match active.as_ref() {
            Some(active) => active.sender.enqueue(frame),
            None => tracing::trace!(kind, "dropping send while disconnected"),
        }
        Ok(())
    }

    /// Serialize a payload struct and send it under `kind`.
    pub fn send_message<T: serde::Serialize>(
        &self,
        kind: u16,
        message: &T,
    ) -> Result<(), SessionError> {
        let payload = messages::encode_payload(message)?;
        self.send(kind, &payload)?;
        Ok(())
    }

    /// Record that the server accepted authentication.
    pub fn mark_authenticated(&self) -> Result<(), SessionError> {
        self.require_transition(SessionState::Connected, SessionState::Authenticated)
    }

    /// Record that the player entered the world.
    pub fn mark_in_game(&self) -> Result<(), SessionError> {
        self.require_transition(SessionState::Authenticated, SessionState::InGame)
    }

    fn require_transition(
        &self,
        from: SessionState,
        to: SessionState,
    ) -> Result<(), SessionError> {
        if self.shared.state.transition(from, to) {
            Ok(())
        } else {
            Err(SessionError::InvalidTransition {
                from: self.shared.state.current(),
                to,
            })
        }
    }

    /// Current session state.
    pub fn state(&self) -> SessionState {
        self.shared.state.current()
    }

    /// Subscribe to session state changes.
    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.shared.state.subscribe()
    }

    /// Whether a reconnect loop currently holds the retry slot.
    pub fn is_reconnecting(&self) -> bool {
        self.shared.reconnect.lock().unwrap().owner.is_some()
    }

    /// Total reconnect attempts over the session's lifetime.
    pub fn reconnect_attempts(&self) -> u32 {
        self.shared.reconnect_attempts.load(Ordering::Relaxed)
    }

    /// Snapshot and reset traffic counters of the live connection.
    pub fn take_stats(&self) -> Option<TransportStats> {
        let active = self.shared.active.lock().unwrap();
        active
            .as_ref()
            .map(|a| a.transport.counters().snapshot_and_reset())
    }
}

// ---------------------------------------------------------------------------
// Connection internals
// ---------------------------------------------------------------------------

impl Shared {
    fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    /// Build a connection at `addr`: transport, sender, pump and heartbeat
    /// tasks. On success the session is `Connected` and the `Connected`
    /// event has been emitted.
    async fn establish(shared: &Arc<Shared>, addr: SocketAddr) -> Result<(), TransportError> {
        shared.state.set(SessionState::Connecting);

        let (transport_tx, transport_rx) = mpsc::unbounded_channel();
        let transport = match Transport::connect(addr, &shared.config, transport_tx).await {
            Ok(transport) => Arc::new(transport),
            Err(err) => {
                shared.state.set(SessionState::Disconnected);
                return Err(err);
            }
        };

        // Stale bytes from a previous connection must not leak into this
        // stream, and the liveness window restarts now.
        shared.decoder.lock().await.reset();
        shared
            .last_pong_ms
            .store(shared.now_ms(), Ordering::Relaxed);

        let sender = Arc::new(BackgroundSender::start(
            Arc::clone(&transport),
            &shared.config,
        ));
        let (cancel_tx, cancel_rx) = watch::channel(false);

        *shared.active.lock().unwrap() = Some(Active {
            transport: Arc::clone(&transport),
            sender: Arc::clone(&sender),
            cancel_tx,
        });

        if !shared
            .state
            .transition(SessionState::Connecting, SessionState::Connected)
        {
            // A concurrent disconnect raced the handshake; give it back.
            transport.disconnect();
            sender.stop().await;
            shared.active.lock().unwrap().take();
            return Err(TransportError::NotConnected);
        }

        // The connection is up; release the retry slot so the next drop
        // can claim a fresh loop.
        {
            let mut ctrl = shared.reconnect.lock().unwrap();
            ctrl.clear();
            ctrl.attempt_in_flight = false;
        }

        tracing::info!(%addr, "connected");
        let _ = shared.events_tx.send(SessionEvent::Connected { addr });

        let pump_shared = Arc::clone(shared);
        let pump_cancel = cancel_rx.clone();
        tokio::spawn(async move {
            Shared::pump_loop(pump_shared, transport_rx, pump_cancel).await;
        });

        let hb_shared = Arc::clone(shared);
        tokio::spawn(async move {
            Shared::heartbeat_loop(hb_shared, sender, cancel_rx).await;
        });

        Ok(())
    }

    /// Tear down the live connection, emit `Disconnected`, and land in
    /// [`SessionState::Disconnected`]. Returns `false` when another caller
    /// already tore the connection down.
    async fn teardown(shared: &Arc<Shared>, reason: DisconnectReason) -> bool {
        let taken = shared.active.lock().unwrap().take();
        let Some(active) = taken else {
            // Nothing live; still normalize a transient state.
            if shared.state.current() != SessionState::Disconnected {
                shared.state.set(SessionState::Disconnected);
            }
            return false;
        };

        let _ = active.cancel_tx.send(true);
        active.transport.disconnect();
        active.sender.stop().await;

        shared.state.set(SessionState::Disconnected);
        let _ = shared.events_tx.send(SessionEvent::Disconnected { reason });
        true
    }

    /// Handle an unexpected connection loss detected by the pump or the
    /// heartbeat task.
    async fn on_connection_lost(shared: &Arc<Shared>, reason: DisconnectReason) {
        tracing::warn!(%reason, "connection lost");
        if Shared::teardown(shared, reason).await {
            Shared::maybe_schedule_reconnect(shared);
        }
    }

    /// Turn reconnection off and take the retry slot from a loop that is
    /// sleeping out its interval; a loop mid-attempt keeps the slot until
    /// the attempt resolves. Wakes the loop so the delay is cut short.
    fn disable_reconnect(&self) {
        {
            let mut ctrl = self.reconnect.lock().unwrap();
            ctrl.enabled = false;
            if !ctrl.attempt_in_flight {
                ctrl.clear();
            }
        }
        let _ = self.reconnect_wake_tx.send(());
    }

    /// Spawn the reconnect loop unless one is already running or the
    /// policy forbids it. The claim slot makes this single-flight:
    /// however many failures pile up, at most one loop exists.
    fn maybe_schedule_reconnect(shared: &Arc<Shared>) {
        if !shared.config.auto_reconnect {
            return;
        }
        if shared.endpoint.lock().unwrap().is_none() {
            return;
        }
        let claimed = {
            let mut ctrl = shared.reconnect.lock().unwrap();
            if !ctrl.enabled {
                return;
            }
            ctrl.claim()
        };
        let Some(token) = claimed else {
            return;
        };

        let shared = Arc::clone(shared);
        tokio::spawn(async move {
            Shared::reconnect_loop(shared, token).await;
        });
    }

    /// Re-check the claim for one retry attempt and mark it in flight so
    /// `disconnect` leaves the slot alone while `establish` runs. Returns
    /// the endpoint to dial, or `None` when the loop should exit.
    fn begin_reconnect_attempt(&self, token: u64) -> Option<SocketAddr> {
        let endpoint = *self.endpoint.lock().unwrap();
        let mut ctrl = self.reconnect.lock().unwrap();
        if ctrl.owner != Some(token) {
            return None;
        }
        if !ctrl.enabled || self.state.current() != SessionState::Disconnected {
            ctrl.clear();
            return None;
        }
        let Some(addr) = endpoint else {
            ctrl.clear();
            return None;
        };
        ctrl.attempt_in_flight = true;
        Some(addr)
    }

    /// Retry the last endpoint at a fixed interval until a connection
    /// sticks, the slot is taken away, or reconnection is disabled.
    async fn reconnect_loop(shared: Arc<Shared>, token: u64) {
        let interval = Duration::from_millis(shared.config.reconnect_interval_ms);
        let mut shutdown_rx = shared.shutdown_tx.subscribe();
        let mut wake_rx = shared.reconnect_wake_tx.subscribe();
        let mut attempt: u32 = 0;

        loop {
            // Wait out the retry interval. A disconnect or shutdown wakes
            // the select early and the claim check below sees it.
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = wake_rx.changed() => {}
                _ = shutdown_rx.changed() => {}
            }

            let Some(addr) = shared.begin_reconnect_attempt(token) else {
                return;
            };

            attempt += 1;
            shared.reconnect_attempts.fetch_add(1, Ordering::Relaxed);
            tracing::info!(attempt, %addr, "attempting reconnect");

            let result = Shared::establish(&shared, addr).await;
            shared.reconnect.lock().unwrap().attempt_in_flight = false;
            match result {
                Ok(()) => {
                    // `establish` released the retry slot.
                    tracing::info!(attempt, "reconnected");
                    return;
                }
                Err(err) => {
                    tracing::warn!(attempt, error = %err, "reconnect attempt failed");
                    let _ = shared.events_tx.send(SessionEvent::ConnectFailed { error: err });
                }
            }
        }
    }

    /// Decode incoming chunks and dispatch envelopes until the connection
    /// ends. Pong arrivals refresh the heartbeat liveness window here so
    /// the heartbeat task never has to touch the byte stream.
    async fn pump_loop(
        shared: Arc<Shared>,
        mut transport_rx: mpsc::UnboundedReceiver<TransportEvent>,
        mut cancel_rx: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                event = transport_rx.recv() => {
                    match event {
                        Some(TransportEvent::Data(chunk)) => {
                            let decoded = { shared.decoder.lock().await.feed(&chunk) };
                            match decoded {
                                Ok(envelopes) => {
                                    for envelope in &envelopes {
                                        if envelope.kind == kind::PONG {
                                            shared
                                                .last_pong_ms
                                                .store(shared.now_ms(), Ordering::Relaxed);
                                        }
                                        shared.dispatcher.dispatch(envelope);
                                    }
                                    // Give other tasks air between chunks
                                    // when the server is bursting.
                                    tokio::task::yield_now().await;
                                }
                                Err(err) => {
                                    Shared::on_connection_lost(
                                        &shared,
                                        DisconnectReason::DecodeFailure(err),
                                    )
                                    .await;
                                    break;
                                }
                            }
                        }
                        Some(TransportEvent::Closed(reason)) => {
                            Shared::on_connection_lost(&shared, reason.into()).await;
                            break;
                        }
                        None => break,
                    }
                }
                _ = cancel_rx.changed() => {
                    if *cancel_rx.borrow() {
                        break;
                    }
                }
            }
        }
    }

    /// Send a ping every heartbeat interval and drop the connection when
    /// the server has not ponged within the timeout.
    async fn heartbeat_loop(
        shared: Arc<Shared>,
        sender: Arc<BackgroundSender>,
        mut cancel_rx: watch::Receiver<bool>,
    ) {
        let timeout = Duration::from_millis(shared.config.heartbeat_timeout_ms);
        let mut ticker =
            tokio::time::interval(Duration::from_millis(shared.config.heartbeat_interval_ms));
        let mut sequence: u32 = 0;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let now = shared.now_ms();
                    let last = shared.last_pong_ms.load(Ordering::Relaxed);
                    if now.saturating_sub(last) > timeout.as_millis() as u64 {
                        tracing::warn!(?timeout, "no pong from server, dropping connection");
                        Shared::on_connection_lost(
                            &shared,
                            DisconnectReason::HeartbeatTimeout(timeout),
                        )
                        .await;
                        break;
                    }

                    sequence = sequence.wrapping_add(1);
                    let ping = Ping {
                        client_time_ms: now,
                        sequence,
                    };
                    match messages::encode_payload(&ping) {
                        Ok(payload) => {
                            match encode_frame(kind::PING, &payload, &shared.frame_config) {
                                Ok(frame) => sender.enqueue(frame),
                                Err(err) => {
                                    tracing::warn!(error = %err, "failed to frame ping")
                                }
                            }
                        }
                        Err(err) => tracing::warn!(error = %err, "failed to encode ping"),
                    }
                }
                _ = cancel_rx.changed() => {
                    if *cancel_rx.borrow() {
                        break;
                    }
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
#[path = "session_tests.rs"]
mod tests;
