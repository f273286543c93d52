//! Configuration system.
//!
//! Loads client configuration from JSON strings/files. The value is handed to
//! the client at construction and re-injected explicitly; nothing reads it
//! through a global.

use std::{path::Path, time::Duration};

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::net::ClientSlot;

/// Bounds for one snapshot building buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotLimits {
    /// Maximum number of items in one snapshot.
    pub max_items: usize,
    /// Maximum payload bytes in one snapshot arena.
    pub max_bytes: usize,
}

impl Default for SnapshotLimits {
    fn default() -> Self {
        Self {
            max_items: 1024,
            max_bytes: 64 * 1024,
        }
    }
}

/// Root client configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Default server address, e.g. `127.0.0.1:8303`.
    #[serde(default = "default_server_addr")]
    pub server_addr: String,
    /// Server simulation tick rate.
    #[serde(default = "default_tick_hz")]
    pub tick_hz: u32,
    /// Path to maps directory.
    #[serde(default = "default_maps_dir")]
    pub maps_dir: String,
    /// Path to demos directory.
    #[serde(default = "default_demos_dir")]
    pub demos_dir: String,
    /// Player name.
    #[serde(default = "default_player_name")]
    pub player_name: String,
    /// Server password sent with the connect info.
    #[serde(default)]
    pub password: Option<String>,
    /// Slot that is active for input and rendering at startup.
    #[serde(default)]
    pub dummy_slot: ClientSlot,
    /// Ticks the prediction runs ahead of the last confirmed server tick.
    #[serde(default = "default_prediction_margin")]
    pub prediction_margin_ticks: u32,
    /// A gap between received ticks larger than this resynchronizes the clock.
    #[serde(default = "default_jitter_threshold")]
    pub jitter_threshold_ticks: u32,
    /// Maximum time spent in Connecting/Loading.
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    /// Maximum silence while Online.
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
    /// Silence after which `connection_problems` reports true.
    #[serde(default = "default_connection_problem_ms")]
    pub connection_problem_ms: u64,
    /// Consecutive malformed snapshots tolerated before dropping the session.
    #[serde(default = "default_protocol_tolerance")]
    pub protocol_error_tolerance: u32,
    /// Input is re-sent at least this often even if unchanged.
    #[serde(default = "default_input_keepalive")]
    pub input_keepalive_ticks: u32,
    /// Largest map the client agrees to download, in bytes.
    #[serde(default = "default_max_map_size")]
    pub max_map_size: u64,
    #[serde(default)]
    pub snapshot_limits: SnapshotLimits,
}

fn default_server_addr() -> String {
    "127.0.0.1:8303".to_string()
}

fn default_tick_hz() -> u32 {
    50
}

fn default_maps_dir() -> String {
    "maps".to_string()
}

fn default_demos_dir() -> String {
    "demos".to_string()
}

fn default_player_name() -> String {
    "nameless tee".to_string()
}

fn default_prediction_margin() -> u32 {
    2
}

fn default_jitter_threshold() -> u32 {
    25
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_timeout() -> u64 {
    10
}

fn default_connection_problem_ms() -> u64 {
    1000
}

fn default_protocol_tolerance() -> u32 {
    8
}

fn default_input_keepalive() -> u32 {
    10
}

fn default_max_map_size() -> u64 {
    64 * 1024 * 1024
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            server_addr: default_server_addr(),
            tick_hz: default_tick_hz(),
            maps_dir: default_maps_dir(),
            demos_dir: default_demos_dir(),
            player_name: default_player_name(),
            password: None,
            dummy_slot: ClientSlot::Main,
            prediction_margin_ticks: default_prediction_margin(),
            jitter_threshold_ticks: default_jitter_threshold(),
            connect_timeout_secs: default_connect_timeout(),
            timeout_secs: default_timeout(),
            connection_problem_ms: default_connection_problem_ms(),
            protocol_error_tolerance: default_protocol_tolerance(),
            input_keepalive_ticks: default_input_keepalive(),
            max_map_size: default_max_map_size(),
            snapshot_limits: SnapshotLimits::default(),
        }
    }
}

impl EngineConfig {
    /// Parses config from JSON.
    pub fn from_json_str(s: &str) -> serde_json::Result<Self> {
        serde_json::from_str(s)
    }

    /// Reads and parses a JSON config file.
    pub fn from_json_file(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("read config {}", path.display()))?;
        Self::from_json_str(&text).with_context(|| format!("parse config {}", path.display()))
    }

    /// Duration of one server tick.
    pub fn tick_duration(&self) -> Duration {
        Duration::from_secs_f64(1.0 / f64::from(self.tick_hz.max(1)))
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn connection_problem_after(&self) -> Duration {
        Duration::from_millis(self.connection_problem_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_fills_defaults() {
        let cfg = EngineConfig::from_json_str(r#"{ "server_addr": "10.0.0.1:8303", "tick_hz": 25 }"#)
            .unwrap();
        assert_eq!(cfg.server_addr, "10.0.0.1:8303");
        assert_eq!(cfg.tick_hz, 25);
        assert_eq!(cfg.jitter_threshold_ticks, 25);
        assert_eq!(cfg.prediction_margin_ticks, 2);
        assert_eq!(cfg.dummy_slot, ClientSlot::Main);
        assert_eq!(cfg.snapshot_limits, SnapshotLimits::default());
        assert_eq!(cfg.max_map_size, 64 * 1024 * 1024);
    }

    #[test]
    fn dummy_slot_parses_lowercase() {
        let cfg = EngineConfig::from_json_str(r#"{ "dummy_slot": "dummy" }"#).unwrap();
        assert_eq!(cfg.dummy_slot, ClientSlot::Dummy);
    }

    #[test]
    fn tick_duration_follows_rate() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.tick_duration(), Duration::from_millis(20));
    }
}
