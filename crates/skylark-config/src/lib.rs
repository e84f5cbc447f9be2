//! Configuration system for the Skylark client.
//!
//! Provides runtime-configurable settings that persist to disk as RON files.
//! Supports hot-reload detection and forward/backward compatible
//! serialization.

mod config;
mod error;

pub use config::{
    ClockConfig, Config, DebugConfig, MotionConfig, NetConfig, SchedulerConfig,
};
pub use error::ConfigError;
