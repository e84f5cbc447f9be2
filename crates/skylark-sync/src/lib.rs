//! Time and motion synchronization: server clock estimation, tick-ordered
//! world event replay, remote entity interpolation, and local prediction
//! reconciliation.

pub mod clock;
pub mod interpolation;
pub mod prediction;
pub mod scheduler;

pub use clock::{ClockEstimate, ClockSync, PongSample, TickClock};
pub use interpolation::{RemoteMotion, SampledMotion, Snapshot, SnapshotBuffer};
pub use prediction::{LocalMotion, PredictedPose, ReconcileOutcome};
pub use scheduler::{TimedEvent, WorldEventScheduler};
