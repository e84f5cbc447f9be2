//! Tick-ordered world event replay.
//!
//! Server world events carry the tick they apply at but arrive whenever the
//! network delivers them. The scheduler parks them in a min-heap and releases
//! them once the render tick reaches their target tick, so jittered and
//! reordered arrivals still replay in server order. Same-tick events replay
//! in arrival order.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use skylark_config::SchedulerConfig;

// ---------------------------------------------------------------------------
// TimedEvent
// ---------------------------------------------------------------------------

/// A server world event waiting for its tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimedEvent {
    /// Tick the event applies at.
    pub tick: u64,
    /// Message kind discriminator, as carried on the wire.
    pub kind: u16,
    /// Opaque event payload.
    pub payload: Vec<u8>,
}

/// Heap entry ordered by (tick, sequence) ascending. `BinaryHeap` is a
/// max-heap, so the comparison is reversed; the sequence number makes the
/// ordering total and keeps same-tick events in arrival order.
struct Entry {
    seq: u64,
    event: TimedEvent,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.event.tick == other.event.tick && self.seq == other.seq
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .event
            .tick
            .cmp(&self.event.tick)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

// ---------------------------------------------------------------------------
// WorldEventScheduler
// ---------------------------------------------------------------------------

/// Min-heap of [`TimedEvent`]s keyed by tick.
pub struct WorldEventScheduler {
    heap: BinaryHeap<Entry>,
    next_seq: u64,
    max_per_frame: usize,
}

impl WorldEventScheduler {
    /// Create a scheduler from configuration.
    pub fn new(config: &SchedulerConfig) -> Self {
        Self {
            heap: BinaryHeap::new(),
            next_seq: 0,
            max_per_frame: config.max_events_per_frame.max(1),
        }
    }

    /// Queue an event for its tick. O(log n).
    pub fn push(&mut self, event: TimedEvent) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(Entry { seq, event });
    }

    /// Release every event due at `render_tick`, earliest tick first,
    /// stopping at the per-frame cap.
    ///
    /// Events past the cap stay queued for subsequent frames; nothing is
    /// ever dropped. A frame that hits the cap logs the remaining due
    /// backlog — a persistent backlog means the simulation is falling
    /// behind the server.
    pub fn drain(&mut self, render_tick: f64) -> Vec<TimedEvent> {
        let mut released = Vec::new();

        while released.len() < self.max_per_frame {
            let due = self
                .heap
                .peek()
                .is_some_and(|e| (e.event.tick as f64) <= render_tick);
            if !due {
                break;
            }
            if let Some(entry) = self.heap.pop() {
                released.push(entry.event);
            }
        }

        if released.len() == self.max_per_frame {
            let backlog = self
                .heap
                .iter()
                .filter(|e| (e.event.tick as f64) <= render_tick)
                .count();
            if backlog > 0 {
                tracing::warn!(
                    backlog,
                    cap = self.max_per_frame,
                    "due world events exceed per-frame cap, deferring"
                );
            }
        }

        released
    }

    /// Number of queued events, due or not.
    pub fn len(&self) -> usize {
        self.heap.len()
    }

    /// Returns `true` if no events are queued.
    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
