//! Remote entity motion smoothing.
//!
//! Remote players are rendered from server snapshots that arrive at tick
//! granularity with network jitter on top. Each entity keeps a small
//! tick-ordered snapshot buffer; rendering samples it at the (fractional)
//! render tick, interpolating between the bracketing snapshots when both
//! sides exist and dead-reckoning a short distance past the newest snapshot
//! when the feed stalls.

use std::collections::{HashMap, VecDeque};
use std::f32::consts::{PI, TAU};

use glam::Vec3;
use skylark_config::{ClockConfig, MotionConfig};

// ---------------------------------------------------------------------------
// Snapshot
// ---------------------------------------------------------------------------

/// One server-reported pose for a remote entity.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Snapshot {
    /// Server tick this pose belongs to.
    pub tick: u64,
    /// World position.
    pub position: Vec3,
    /// Facing angle in radians.
    pub yaw: f32,
    /// Unit movement direction.
    pub direction: Vec3,
    /// Movement speed in units per second.
    pub speed: f32,
}

/// Pose produced by sampling a snapshot buffer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SampledMotion {
    /// World position.
    pub position: Vec3,
    /// Facing angle in radians.
    pub yaw: f32,
    /// Unit movement direction.
    pub direction: Vec3,
    /// Movement speed in units per second.
    pub speed: f32,
}

impl From<&Snapshot> for SampledMotion {
    fn from(s: &Snapshot) -> Self {
        Self {
            position: s.position,
            yaw: s.yaw,
            direction: s.direction,
            speed: s.speed,
        }
    }
}

/// Interpolate an angle along the shortest arc.
fn lerp_angle(a: f32, b: f32, t: f32) -> f32 {
    let diff = (b - a).rem_euclid(TAU);
    let shortest = if diff > PI { diff - TAU } else { diff };
    a + shortest * t
}

// ---------------------------------------------------------------------------
// SnapshotBuffer
// ---------------------------------------------------------------------------

/// Bounded tick-ordered buffer of [`Snapshot`]s for one entity.
///
/// Snapshots usually arrive in order and append; out-of-order arrivals are
/// insertion-sorted and a duplicate tick replaces the earlier arrival. When
/// full, the oldest snapshot is discarded.
#[derive(Debug, Clone)]
pub struct SnapshotBuffer {
    snapshots: VecDeque<Snapshot>,
    max_len: usize,
}

impl SnapshotBuffer {
    /// Creates a buffer holding at most `max_len` snapshots.
    pub fn new(max_len: usize) -> Self {
        Self {
            snapshots: VecDeque::with_capacity(max_len),
            max_len: max_len.max(1),
        }
    }

    /// Insert a snapshot, keeping the buffer sorted by tick.
    pub fn insert(&mut self, snapshot: Snapshot) {
        match self.snapshots.back() {
            Some(last) if last.tick < snapshot.tick => self.snapshots.push_back(snapshot),
            _ => {
                let idx = self.snapshots.partition_point(|s| s.tick < snapshot.tick);
                if self.snapshots.get(idx).is_some_and(|s| s.tick == snapshot.tick) {
                    // Same tick delivered twice: the newer arrival wins.
                    self.snapshots[idx] = snapshot;
                } else {
                    self.snapshots.insert(idx, snapshot);
                }
            }
        }

        while self.snapshots.len() > self.max_len {
            self.snapshots.pop_front();
        }
    }

    /// Sample the buffer at a fractional render tick.
    ///
    /// - Between two snapshots: linear interpolation by tick fraction.
    /// - Past the newest snapshot: dead reckoning along the last reported
    ///   direction and speed, for at most `max_extrapolation_ticks`, after
    ///   which the pose freezes until fresh data arrives.
    /// - Before the oldest snapshot: the oldest pose as-is.
    ///
    /// Returns `None` when the buffer is empty.
    pub fn sample(
        &self,
        render_tick: f64,
        max_extrapolation_ticks: f64,
        tick_seconds: f32,
    ) -> Option<SampledMotion> {
        let first = self.snapshots.front()?;
        let last = self.snapshots.back()?;

        if render_tick <= first.tick as f64 {
            return Some(SampledMotion::from(first));
        }

        if render_tick >= last.tick as f64 {
            let overshoot = (render_tick - last.tick as f64).min(max_extrapolation_ticks) as f32;
            let travel = last.direction * last.speed * (overshoot * tick_seconds);
            return Some(SampledMotion {
                position: last.position + travel,
                yaw: last.yaw,
                direction: last.direction,
                speed: last.speed,
            });
        }

        // Strictly inside the buffer, so a bracketing pair exists.
        let idx = self
            .snapshots
            .partition_point(|s| (s.tick as f64) <= render_tick);
        let a = &self.snapshots[idx - 1];
        let b = &self.snapshots[idx];
        let span = (b.tick - a.tick) as f64;
        let t = ((render_tick - a.tick as f64) / span) as f32;

        Some(SampledMotion {
            position: a.position.lerp(b.position, t),
            yaw: lerp_angle(a.yaw, b.yaw, t),
            direction: a.direction.lerp(b.direction, t).normalize_or_zero(),
            speed: a.speed + (b.speed - a.speed) * t,
        })
    }

    /// Tick of the newest buffered snapshot.
    pub fn newest_tick(&self) -> Option<u64> {
        self.snapshots.back().map(|s| s.tick)
    }

    /// Number of buffered snapshots.
    pub fn len(&self) -> usize {
        self.snapshots.len()
    }

    /// Returns `true` if no snapshots are buffered.
    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }

    /// Drop all buffered snapshots.
    pub fn clear(&mut self) {
        self.snapshots.clear();
    }
}

// ---------------------------------------------------------------------------
// RemoteMotion
// ---------------------------------------------------------------------------

/// Snapshot buffers for every known remote entity.
pub struct RemoteMotion {
    entities: HashMap<u64, SnapshotBuffer>,
    snapshot_buffer_len: usize,
    extrapolation_max_ticks: f64,
    hard_snap_distance: f32,
    micro_snap_distance: f32,
    tick_seconds: f32,
}

impl RemoteMotion {
    /// Create the manager from motion and clock configuration.
    pub fn new(motion: &MotionConfig, clock: &ClockConfig) -> Self {
        Self {
            entities: HashMap::new(),
            snapshot_buffer_len: motion.snapshot_buffer_len,
            extrapolation_max_ticks: motion.extrapolation_max_ticks,
            hard_snap_distance: motion.hard_snap_distance,
            micro_snap_distance: motion.micro_snap_distance,
            tick_seconds: clock.tick_interval_ms.max(1) as f32 / 1000.0,
        }
    }

    /// Store a snapshot for an entity, creating its buffer on first sight.
    pub fn ingest(&mut self, entity_id: u64, snapshot: Snapshot) {
        self.entities
            .entry(entity_id)
            .or_insert_with(|| SnapshotBuffer::new(self.snapshot_buffer_len))
            .insert(snapshot);
    }

    /// Sample an entity's pose at the render tick.
    pub fn sample(&self, entity_id: u64, render_tick: f64) -> Option<SampledMotion> {
        self.entities.get(&entity_id)?.sample(
            render_tick,
            self.extrapolation_max_ticks,
            self.tick_seconds,
        )
    }

    /// Resolve a displayed position against a freshly sampled target.
    ///
    /// Every branch currently snaps: large errors must teleport, sub-visible
    /// errors can settle directly, and the smoothing path for the band in
    /// between was never built.
    pub fn correct_position(&self, current: Vec3, target: Vec3) -> Vec3 {
        let distance = current.distance(target);
        if distance >= self.hard_snap_distance {
            tracing::debug!(distance, "hard snapping remote entity");
            target
        } else if distance <= self.micro_snap_distance {
            target
        } else {
            // For now this band snaps too; smoothing it would need
            // per-entity blend state that nothing tracks yet.
            target
        }
    }

    /// Forget an entity entirely (despawn).
    pub fn remove_entity(&mut self, entity_id: u64) {
        self.entities.remove(&entity_id);
    }

    /// Drop all entity buffers (used when a session is torn down).
    pub fn clear(&mut self) {
        self.entities.clear();
    }

    /// Number of tracked entities.
    pub fn entity_count(&self) -> usize {
        self.entities.len()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
