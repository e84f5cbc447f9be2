//! Local player prediction history and server reconciliation.
//!
//! The local player's moves apply immediately, without waiting for the
//! server, and every simulated step records the predicted pose. When the
//! server acknowledges a move the confirmed poses are discarded; when it
//! rejects one, the predicted poses up to the rejected tick are discarded
//! and the player is snapped back onto the oldest surviving prediction with
//! momentum cancelled.

use std::collections::VecDeque;

use glam::Vec3;
use skylark_config::MotionConfig;

// ---------------------------------------------------------------------------
// PredictedPose
// ---------------------------------------------------------------------------

/// Locally predicted pose at a specific tick.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PredictedPose {
    /// Tick the pose was simulated for.
    pub tick: u64,
    /// Predicted world position.
    pub position: Vec3,
    /// Predicted facing angle in radians.
    pub yaw: f32,
}

/// What the caller must do after a server move acknowledgment.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ReconcileOutcome {
    /// Prediction confirmed; nothing to correct.
    Confirmed,
    /// Move rejected: set the player to this pose and zero its velocity.
    Snap {
        /// Pose of the oldest surviving prediction.
        position: Vec3,
        /// Yaw of the oldest surviving prediction.
        yaw: f32,
    },
    /// Move rejected with no surviving prediction: keep the current pose
    /// but zero the velocity.
    Halt,
}

// ---------------------------------------------------------------------------
// LocalMotion
// ---------------------------------------------------------------------------

/// Bounded ring of [`PredictedPose`]s awaiting server acknowledgment.
pub struct LocalMotion {
    history: VecDeque<PredictedPose>,
    max_len: usize,
}

impl LocalMotion {
    /// Create the history from motion configuration.
    pub fn new(config: &MotionConfig) -> Self {
        let max_len = config.local_history_len.max(1);
        Self {
            history: VecDeque::with_capacity(max_len),
            max_len,
        }
    }

    /// Record the pose produced by one simulated step, evicting the oldest
    /// entry once the ring is full.
    pub fn record(&mut self, pose: PredictedPose) {
        if self.history.len() >= self.max_len {
            self.history.pop_front();
        }
        self.history.push_back(pose);
    }

    /// Process a server acknowledgment for every move up to `acked_tick`.
    ///
    /// A valid ack confirms the predictions: entries at or before the acked
    /// tick are dropped and play continues untouched. An invalid ack means
    /// the server refused the move: the same entries are dropped, and the
    /// player must be forced onto the oldest surviving prediction (or merely
    /// stopped, if none survive).
    pub fn reconcile(&mut self, acked_tick: u64, valid: bool) -> ReconcileOutcome {
        self.discard_up_to(acked_tick);

        if valid {
            return ReconcileOutcome::Confirmed;
        }

        match self.history.front() {
            Some(pose) => ReconcileOutcome::Snap {
                position: pose.position,
                yaw: pose.yaw,
            },
            None => ReconcileOutcome::Halt,
        }
    }

    /// Drop all entries with tick ≤ `tick`.
    fn discard_up_to(&mut self, tick: u64) {
        while self.history.front().is_some_and(|p| p.tick <= tick) {
            self.history.pop_front();
        }
    }

    /// Number of unacknowledged predictions.
    pub fn len(&self) -> usize {
        self.history.len()
    }

    /// Returns `true` if no predictions are pending.
    pub fn is_empty(&self) -> bool {
        self.history.is_empty()
    }

    /// Tick of the oldest pending prediction.
    pub fn oldest_tick(&self) -> Option<u64> {
        self.history.front().map(|p| p.tick)
    }

    /// Drop the entire history (used when a session is torn down).
    pub fn clear(&mut self) {
        self.history.clear();
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
