//! Server clock reconciliation.
//!
//! The client runs its own fixed-rate tick counter and continuously estimates
//! the server's current tick from heartbeat pong samples, NTP-style: half the
//! measured round trip is assumed to be the one-way latency of the pong. The
//! estimate is smoothed so a single delayed pong cannot yank the simulation
//! clock around, but a genuine server clock jump snaps immediately.

use std::time::{Duration, Instant};

use skylark_config::ClockConfig;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// EMA smoothing factor for round-trip time samples.
const RTT_ALPHA: f64 = 0.1;

/// Blend factor applied to the offset error each pong.
const OFFSET_BLEND: f64 = 0.1;

/// Maximum offset adjustment per pong, in ticks.
const MAX_OFFSET_STEP: f64 = 0.05;

/// Offset jumps larger than this many ticks resynchronize immediately.
const HARD_RESYNC_TICKS: f64 = 100.0;

// ---------------------------------------------------------------------------
// TickClock
// ---------------------------------------------------------------------------

/// Free-running local tick counter derived from elapsed wall time.
///
/// The tick is fractional: at a 20 ms interval, 30 ms after start the clock
/// reads 1.5. It never runs backwards because `Instant` is monotonic.
#[derive(Debug, Clone)]
pub struct TickClock {
    start: Instant,
    tick_interval_ms: f64,
}

impl TickClock {
    /// Create a clock starting now.
    pub fn new(config: &ClockConfig) -> Self {
        Self::with_start(Instant::now(), config)
    }

    /// Create a clock with an explicit start instant.
    pub fn with_start(start: Instant, config: &ClockConfig) -> Self {
        Self {
            start,
            tick_interval_ms: config.tick_interval_ms.max(1) as f64,
        }
    }

    /// Current fractional local tick.
    pub fn current_tick(&self) -> f64 {
        self.tick_at(Instant::now())
    }

    /// Fractional local tick at the given instant.
    pub fn tick_at(&self, now: Instant) -> f64 {
        let elapsed = now.saturating_duration_since(self.start);
        elapsed.as_secs_f64() * 1000.0 / self.tick_interval_ms
    }

    /// Length of one tick.
    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs_f64(self.tick_interval_ms / 1000.0)
    }
}

// ---------------------------------------------------------------------------
// ClockSync
// ---------------------------------------------------------------------------

/// One measurement extracted from a heartbeat pong.
///
/// Timestamps are monotonic milliseconds from the client's own clock (not
/// `Instant`, which cannot cross the wire).
#[derive(Debug, Clone, Copy)]
pub struct PongSample {
    /// Tick the server reported when it answered the ping.
    pub server_tick: u64,
    /// Client clock when the ping was sent, in milliseconds.
    pub sent_ms: u64,
    /// Client clock when the pong arrived, in milliseconds.
    pub received_ms: u64,
}

/// Read-only view of the current synchronization state.
#[derive(Debug, Clone, Copy)]
pub struct ClockEstimate {
    /// Smoothed round-trip time in milliseconds.
    pub rtt_ms: f64,
    /// Offset added to the local tick to obtain the server tick.
    pub tick_offset: f64,
    /// Whether at least one pong has been processed.
    pub initialized: bool,
    /// Number of hard resyncs since construction.
    pub hard_resyncs: u64,
}

/// Client-side server clock estimator.
///
/// Pure state machine: callers feed it pong samples together with the local
/// tick at arrival and read estimates back. It performs no I/O of its own.
#[derive(Debug, Clone)]
pub struct ClockSync {
    /// Smoothed round-trip time in milliseconds.
    pub rtt_ms: f64,
    /// Offset added to the local tick to obtain the server tick.
    pub tick_offset: f64,
    /// Whether at least one pong has been processed.
    pub initialized: bool,
    /// Number of hard resyncs since construction.
    pub hard_resyncs: u64,
    /// Simulation tick length in milliseconds.
    pub tick_interval_ms: f64,
    /// How far behind the server estimate rendering runs, in ticks.
    pub interpolation_delay_ticks: f64,
}

impl ClockSync {
    /// Create an estimator from clock configuration.
    pub fn new(config: &ClockConfig) -> Self {
        Self {
            rtt_ms: 0.0,
            tick_offset: 0.0,
            initialized: false,
            hard_resyncs: 0,
            tick_interval_ms: config.tick_interval_ms.max(1) as f64,
            interpolation_delay_ticks: config.interpolation_delay_ticks,
        }
    }

    /// Process one pong sample taken at local tick `local_tick`.
    ///
    /// The first sample initializes the estimate directly. Later samples are
    /// blended in: the offset error is scaled by [`OFFSET_BLEND`] and the
    /// applied step clamped to [`MAX_OFFSET_STEP`] ticks, so jittery pongs
    /// nudge the clock rather than yank it. An error beyond
    /// [`HARD_RESYNC_TICKS`] means the server clock genuinely moved (map
    /// change, server restart) and snaps the offset outright.
    pub fn on_pong(&mut self, sample: &PongSample, local_tick: f64) {
        // A pong that appears to arrive before its ping was sent can only be
        // clock weirdness; treat it as zero RTT rather than negative.
        let rtt = sample.received_ms.saturating_sub(sample.sent_ms) as f64;

        if self.initialized {
            self.rtt_ms = RTT_ALPHA * rtt + (1.0 - RTT_ALPHA) * self.rtt_ms;
        } else {
            self.rtt_ms = rtt;
        }

        // The server stamped its tick when the pong left; by the time it
        // arrived, roughly half the round trip has passed.
        let half_rtt_ticks = (rtt / 2.0) / self.tick_interval_ms;
        let expected_server_tick = sample.server_tick as f64 + half_rtt_ticks;
        let new_offset = expected_server_tick - local_tick;

        if !self.initialized {
            self.tick_offset = new_offset;
            self.initialized = true;
            return;
        }

        let delta = new_offset - self.tick_offset;
        if delta.abs() > HARD_RESYNC_TICKS {
            tracing::warn!(
                delta_ticks = delta,
                rtt_ms = rtt,
                "server clock jumped, hard resync"
            );
            self.tick_offset = new_offset;
            self.hard_resyncs += 1;
        } else {
            let step = (delta * OFFSET_BLEND).clamp(-MAX_OFFSET_STEP, MAX_OFFSET_STEP);
            self.tick_offset += step;
        }
    }

    /// Best estimate of the server's current tick at local tick `local_tick`.
    pub fn server_tick_estimate(&self, local_tick: f64) -> f64 {
        local_tick + self.tick_offset
    }

    /// The tick remote state should be rendered at: the server estimate held
    /// back by the interpolation delay so snapshot data is usually available
    /// on both sides of it. The delay is applied here and nowhere else.
    pub fn render_tick(&self, local_tick: f64) -> f64 {
        self.server_tick_estimate(local_tick) - self.interpolation_delay_ticks
    }

    /// Snapshot of the current synchronization state.
    pub fn estimate(&self) -> ClockEstimate {
        ClockEstimate {
            rtt_ms: self.rtt_ms,
            tick_offset: self.tick_offset,
            initialized: self.initialized,
            hard_resyncs: self.hard_resyncs,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> ClockConfig {
        ClockConfig {
            tick_interval_ms: 20,
            interpolation_delay_ticks: 2.0,
        }
    }

    /// Sample with a 40 ms RTT: half-RTT is exactly one tick, so the
    /// expected server tick is `server_tick + 1`.
    fn sample(server_tick: u64) -> PongSample {
        PongSample {
            server_tick,
            sent_ms: 0,
            received_ms: 40,
        }
    }

    #[test]
    fn test_tick_clock_is_fractional() {
        let start = Instant::now();
        let clock = TickClock::with_start(start, &test_config());

        let tick = clock.tick_at(start + Duration::from_millis(30));
        assert!((tick - 1.5).abs() < 1e-9, "expected 1.5 ticks, got {tick}");
    }

    #[test]
    fn test_tick_clock_never_negative() {
        let start = Instant::now();
        let clock = TickClock::with_start(start + Duration::from_secs(10), &test_config());
        assert_eq!(clock.tick_at(start), 0.0);
    }

    #[test]
    fn test_first_pong_initializes_directly() {
        let mut sync = ClockSync::new(&test_config());
        let sample = PongSample {
            server_tick: 1000,
            sent_ms: 0,
            received_ms: 40,
        };

        sync.on_pong(&sample, 900.0);

        assert!(sync.initialized);
        assert!((sync.rtt_ms - 40.0).abs() < 1e-9);
        // expected server tick = 1000 + 1 (half RTT) → offset = 101.
        assert!((sync.tick_offset - 101.0).abs() < 1e-9);
    }

    #[test]
    fn test_offset_converges_under_steady_drift() {
        let mut sync = ClockSync::new(&test_config());
        sync.on_pong(&sample(999), 1000.0);
        assert!((sync.tick_offset - 0.0).abs() < 1e-9);

        // The true offset drifts to 0.5 ticks (local clock now reads 999.5
        // when the server is at 1000); twenty 40 ms samples must pull the
        // estimate to within 0.1 ticks of it.
        for _ in 0..20 {
            sync.on_pong(&sample(999), 999.5);
        }

        assert!(
            (sync.tick_offset - 0.5).abs() < 0.1,
            "offset should approach 0.5, got {}",
            sync.tick_offset
        );
        assert_eq!(sync.hard_resyncs, 0);
    }

    #[test]
    fn test_step_per_pong_is_clamped() {
        let mut sync = ClockSync::new(&test_config());
        sync.on_pong(&sample(999), 1000.0);

        // A 10-tick error is below the resync threshold, so it is blended,
        // and the blend step caps at 0.05 ticks.
        sync.on_pong(&sample(1009), 1000.0);

        assert!((sync.tick_offset - 0.05).abs() < 1e-9);
        assert_eq!(sync.hard_resyncs, 0);
    }

    #[test]
    fn test_large_jump_hard_resyncs() {
        let mut sync = ClockSync::new(&test_config());
        sync.on_pong(&sample(999), 1000.0);

        sync.on_pong(&sample(1149), 1000.0);

        assert!((sync.tick_offset - 150.0).abs() < 1e-9, "should snap");
        assert_eq!(sync.hard_resyncs, 1);
    }

    #[test]
    fn test_rtt_is_smoothed() {
        let mut sync = ClockSync::new(&test_config());
        sync.on_pong(
            &PongSample {
                server_tick: 0,
                sent_ms: 0,
                received_ms: 40,
            },
            0.0,
        );
        sync.on_pong(
            &PongSample {
                server_tick: 0,
                sent_ms: 100,
                received_ms: 160,
            },
            0.0,
        );

        // 0.1 * 60 + 0.9 * 40 = 42.
        assert!((sync.rtt_ms - 42.0).abs() < 1e-9);
    }

    #[test]
    fn test_pong_before_ping_counts_as_zero_rtt() {
        let mut sync = ClockSync::new(&test_config());
        sync.on_pong(
            &PongSample {
                server_tick: 500,
                sent_ms: 1000,
                received_ms: 900,
            },
            0.0,
        );

        assert_eq!(sync.rtt_ms, 0.0);
        assert!((sync.tick_offset - 500.0).abs() < 1e-9);
    }

    #[test]
    fn test_render_tick_applies_interpolation_delay() {
        let mut sync = ClockSync::new(&test_config());
        sync.on_pong(&sample(999), 990.0);

        assert!((sync.server_tick_estimate(990.0) - 1000.0).abs() < 1e-9);
        assert!((sync.render_tick(990.0) - 998.0).abs() < 1e-9);
    }
}
