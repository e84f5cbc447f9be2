//! Configuration structs with sensible defaults and RON persistence.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Top-level client configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Connection and session settings.
    pub net: NetConfig,
    /// Server clock reconciliation settings.
    pub clock: ClockConfig,
    /// World event scheduling settings.
    pub scheduler: SchedulerConfig,
    /// Entity motion smoothing settings.
    pub motion: MotionConfig,
    /// Debug/development settings.
    pub debug: DebugConfig,
}

/// Connection and session configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct NetConfig {
    /// Server address for multiplayer.
    pub server_address: String,
    /// Server port.
    pub server_port: u16,
    /// Connection attempt timeout in milliseconds.
    pub connect_timeout_ms: u64,
    /// Reconnect automatically after an unexpected disconnect.
    pub auto_reconnect: bool,
    /// Delay between reconnect attempts in milliseconds.
    pub reconnect_interval_ms: u64,
    /// Interval between heartbeat pings in milliseconds.
    pub heartbeat_interval_ms: u64,
    /// Consider the connection dead if no pong arrives within this window.
    pub heartbeat_timeout_ms: u64,
    /// Maximum accepted frame payload size in bytes.
    pub max_payload_size: usize,
    /// How long `Session::shutdown` waits for the send worker to finish.
    pub sender_stop_timeout_ms: u64,
}

/// Server clock reconciliation configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ClockConfig {
    /// Simulation tick length in milliseconds.
    pub tick_interval_ms: u64,
    /// How far behind the estimated server tick rendering runs, in ticks.
    pub interpolation_delay_ticks: f64,
}

/// World event scheduling configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Maximum scheduled events dispatched per frame.
    pub max_events_per_frame: usize,
}

/// Entity motion smoothing configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MotionConfig {
    /// Snapshots retained per remote entity.
    pub snapshot_buffer_len: usize,
    /// How far past the newest snapshot dead reckoning may run, in ticks.
    pub extrapolation_max_ticks: f64,
    /// Corrections larger than this distance snap the entity outright.
    pub hard_snap_distance: f32,
    /// Corrections smaller than this distance snap without smoothing.
    pub micro_snap_distance: f32,
    /// Predicted local snapshots retained for reconciliation.
    pub local_history_len: usize,
}

/// Debug/development configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DebugConfig {
    /// Log level override (e.g., "debug", "info", "warn").
    pub log_level: String,
}

// --- Default implementations ---

impl Default for NetConfig {
    fn default() -> Self {
        Self {
            server_address: "127.0.0.1".to_string(),
            server_port: 7777,
            connect_timeout_ms: 5000,
            auto_reconnect: true,
            reconnect_interval_ms: 3000,
            heartbeat_interval_ms: 200,
            heartbeat_timeout_ms: 10_000,
            max_payload_size: 1_048_576,
            sender_stop_timeout_ms: 1000,
        }
    }
}

impl Default for ClockConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: 20,
            interpolation_delay_ticks: 2.0,
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_events_per_frame: 200,
        }
    }
}

impl Default for MotionConfig {
    fn default() -> Self {
        Self {
            snapshot_buffer_len: 64,
            extrapolation_max_ticks: 3.0,
            hard_snap_distance: 2.0,
            micro_snap_distance: 0.03,
            local_history_len: 4096,
        }
    }
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

// --- Load / Save / Reload ---

impl Config {
    /// Load config from the given directory, or create a default config file.
    pub fn load_or_create(config_dir: &Path) -> Result<Self, ConfigError> {
        let config_path = config_dir.join("config.ron");

        if config_path.exists() {
            let contents =
                std::fs::read_to_string(&config_path).map_err(|source| ConfigError::Read {
                    path: config_path.clone(),
                    source,
                })?;
            let config: Config =
                ron::from_str(&contents).map_err(|source| ConfigError::Parse {
                    path: config_path.clone(),
                    source,
                })?;
            log::info!("Loaded config from {}", config_path.display());
            Ok(config)
        } else {
            let config = Config::default();
            config.save(config_dir)?;
            log::info!("Created default config at {}", config_path.display());
            Ok(config)
        }
    }

    /// Save config to the given directory as `config.ron`.
    pub fn save(&self, config_dir: &Path) -> Result<(), ConfigError> {
        let config_path = config_dir.join("config.ron");
        std::fs::create_dir_all(config_dir).map_err(|source| ConfigError::Write {
            path: config_path.clone(),
            source,
        })?;

        let pretty = ron::ser::PrettyConfig::new()
            .depth_limit(3)
            .separate_tuple_members(true)
            .enumerate_arrays(false);

        let serialized =
            ron::ser::to_string_pretty(self, pretty).map_err(ConfigError::Serialize)?;

        std::fs::write(&config_path, serialized).map_err(|source| ConfigError::Write {
            path: config_path,
            source,
        })?;
        Ok(())
    }

    /// Hot-reload: returns `Some(new_config)` if the file changed, `None` otherwise.
    pub fn reload(&self, config_dir: &Path) -> Result<Option<Self>, ConfigError> {
        let config_path = config_dir.join("config.ron");
        let contents =
            std::fs::read_to_string(&config_path).map_err(|source| ConfigError::Read {
                path: config_path.clone(),
                source,
            })?;
        let new_config: Config =
            ron::from_str(&contents).map_err(|source| ConfigError::Parse {
                path: config_path,
                source,
            })?;

        if &new_config != self {
            log::info!("Config reloaded with changes");
            Ok(Some(new_config))
        } else {
            Ok(None)
        }
    }
}
