//! Envelope dispatch: fan incoming messages out to registered handlers.
//!
//! The [`Dispatcher`] maps message kinds to any number of
//! [`EnvelopeHandler`]s. Each registration picks an [`ExecutionContext`]:
//! `Inline` handlers run on the dispatch task the moment the envelope
//! arrives, `Main` handlers are queued and run when the game loop drains
//! the [`MainQueue`] once per frame. Handler failures are logged and never
//! propagate to sibling handlers or the dispatch loop.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tokio::sync::mpsc;

use crate::framing::Envelope;

// ---------------------------------------------------------------------------
// Handler
// ---------------------------------------------------------------------------

/// Result type returned by handlers. A failure is isolated to the handler
/// that produced it.
pub type HandlerResult = Result<(), Box<dyn std::error::Error + Send + Sync>>;

/// Trait for envelope handlers. Usually implemented as a closure.
pub trait EnvelopeHandler: Send + Sync {
    /// Process a single incoming envelope.
    fn handle(&self, envelope: &Envelope) -> HandlerResult;
}

/// Blanket implementation for closures.
impl<F> EnvelopeHandler for F
where
    F: Fn(&Envelope) -> HandlerResult + Send + Sync,
{
    fn handle(&self, envelope: &Envelope) -> HandlerResult {
        self(envelope)
    }
}

/// Where a handler runs relative to the dispatch task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionContext {
    /// Run immediately on the dispatch task. For cheap, thread-safe work
    /// such as feeding clock samples or liveness bookkeeping.
    Inline,
    /// Defer to the main-thread queue, drained once per frame by the game
    /// loop. For anything that touches world state.
    Main,
}

struct Registration {
    handler: Arc<dyn EnvelopeHandler>,
    context: ExecutionContext,
}

/// A deferred handler invocation waiting in the main queue.
struct QueuedCall {
    handler: Arc<dyn EnvelopeHandler>,
    envelope: Envelope,
}

fn invoke(handler: &dyn EnvelopeHandler, envelope: &Envelope) {
    if let Err(err) = handler.handle(envelope) {
        tracing::warn!(kind = envelope.kind, error = %err, "message handler failed");
    }
}

// ---------------------------------------------------------------------------
// Dispatcher
// ---------------------------------------------------------------------------

/// Routes incoming envelopes to every handler registered for their kind.
///
/// Registration is identity-based: the same [`Arc`]ed handler cannot be
/// registered twice for one kind, while two separate `Arc`s are two
/// independent registrations even if they wrap identical closures.
pub struct Dispatcher {
    handlers: RwLock<HashMap<u16, Vec<Registration>>>,
    main_tx: mpsc::UnboundedSender<QueuedCall>,
}

impl Dispatcher {
    /// Create a dispatcher and the main-thread queue it feeds.
    pub fn new() -> (Self, MainQueue) {
        let (main_tx, main_rx) = mpsc::unbounded_channel();
        (
            Self {
                handlers: RwLock::new(HashMap::new()),
                main_tx,
            },
            MainQueue { rx: main_rx },
        )
    }

    /// Register a handler for a message kind.
    ///
    /// Returns `false` without registering if this exact handler instance
    /// is already registered for the kind.
    pub fn register(
        &self,
        kind: u16,
        handler: Arc<dyn EnvelopeHandler>,
        context: ExecutionContext,
    ) -> bool {
        let mut handlers = self.handlers.write().unwrap();
        let list = handlers.entry(kind).or_default();
        if list.iter().any(|r| Arc::ptr_eq(&r.handler, &handler)) {
            tracing::warn!(kind, "handler already registered, ignoring duplicate");
            return false;
        }
        list.push(Registration { handler, context });
        true
    }

    /// Remove one specific handler registration for a kind.
    ///
    /// Returns `true` if the handler was found and removed.
    pub fn unregister(&self, kind: u16, handler: &Arc<dyn EnvelopeHandler>) -> bool {
        let mut handlers = self.handlers.write().unwrap();
        let Some(list) = handlers.get_mut(&kind) else {
            return false;
        };
        let before = list.len();
        list.retain(|r| !Arc::ptr_eq(&r.handler, handler));
        let removed = list.len() < before;
        if list.is_empty() {
            handlers.remove(&kind);
        }
        removed
    }

    /// Remove every handler registered for a kind. Returns how many were
    /// removed.
    pub fn unregister_all(&self, kind: u16) -> usize {
        let mut handlers = self.handlers.write().unwrap();
        handlers.remove(&kind).map_or(0, |list| list.len())
    }

    /// Dispatch an envelope to all handlers registered for its kind.
    ///
    /// Inline handlers run before this returns; main-context handlers are
    /// queued for the next [`MainQueue::drain`]. An envelope with no
    /// registered handler is dropped with a warning.
    pub fn dispatch(&self, envelope: &Envelope) {
        // Clone the target list out so handlers can register or unregister
        // from inside their own callback without deadlocking.
        let targets: Vec<(Arc<dyn EnvelopeHandler>, ExecutionContext)> = {
            let handlers = self.handlers.read().unwrap();
            match handlers.get(&envelope.kind) {
                Some(list) if !list.is_empty() => list
                    .iter()
                    .map(|r| (Arc::clone(&r.handler), r.context))
                    .collect(),
                _ => {
                    tracing::warn!(kind = envelope.kind, "no handler registered, dropping message");
                    return;
                }
            }
        };

        for (handler, context) in targets {
            match context {
                ExecutionContext::Inline => invoke(handler.as_ref(), envelope),
                ExecutionContext::Main => {
                    let call = QueuedCall {
                        handler,
                        envelope: envelope.clone(),
                    };
                    if self.main_tx.send(call).is_err() {
                        tracing::warn!(
                            kind = envelope.kind,
                            "main queue receiver dropped, discarding deferred call"
                        );
                    }
                }
            }
        }
    }

    /// Number of handlers currently registered for a kind.
    pub fn handler_count(&self, kind: u16) -> usize {
        self.handlers
            .read()
            .unwrap()
            .get(&kind)
            .map_or(0, |list| list.len())
    }

    /// Kinds with at least one registration (useful for startup logging).
    pub fn registered_kinds(&self) -> Vec<u16> {
        self.handlers.read().unwrap().keys().copied().collect()
    }
}

// ---------------------------------------------------------------------------
// Main queue
// ---------------------------------------------------------------------------

/// Receiving end of the deferred-handler queue.
///
/// The game loop calls [`MainQueue::drain`] once per frame; everything the
/// dispatch task queued since the last frame runs then, in arrival order.
pub struct MainQueue {
    rx: mpsc::UnboundedReceiver<QueuedCall>,
}

impl MainQueue {
    /// Run all queued handler calls. Returns how many ran.
    pub fn drain(&mut self) -> usize {
        let mut count = 0;
        while let Ok(call) = self.rx.try_recv() {
            invoke(call.handler.as_ref(), &call.envelope);
            count += 1;
        }
        count
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
