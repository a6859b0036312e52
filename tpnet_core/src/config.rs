//! Configuration for the node network.
//!
//! Every struct carries working defaults; a JSON file only needs the fields
//! it wants to override.

use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

/// Errors while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Registry behaviour.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Number of neighbour slots per node
    pub neighbour_slots: usize,

    /// Recompute neighbour links on membership changes.
    /// Enabled on the authority, disabled on observer mirrors.
    pub link_neighbours: bool,
}

impl RegistryConfig {
    /// Configuration for an observer's local mirror.
    pub fn mirror() -> Self {
        Self::default().into_mirror()
    }

    /// Same slot count, linking disabled.
    pub fn into_mirror(self) -> Self {
        Self {
            link_neighbours: false,
            ..self
        }
    }
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            neighbour_slots: 4,
            link_neighbours: true,
        }
    }
}

/// Timings of the per-node activation sequence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ActivationConfig {
    /// Maximum gap between contact events before a record is dropped
    pub grace_period_ms: u64,

    /// Cap applied to each tick's elapsed time
    pub max_tick_increment_secs: f32,

    /// Contact time after which the destination choice is presented
    pub reveal_after_secs: f32,
}

impl Default for ActivationConfig {
    fn default() -> Self {
        Self {
            grace_period_ms: 300,
            max_tick_increment_secs: 0.5,
            reveal_after_secs: 3.0,
        }
    }
}

/// How unstable jumps are chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StabilityMode {
    /// Never displace
    Off,
    /// Displace when stability runs out or a storm is active
    Auto,
    /// Displace on every player jump
    Always,
}

/// Relocation side effects.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TeleportConfig {
    /// Radius around a pad's contact center that is carried along
    pub seal_radius: f64,

    /// Movement cooldown applied to a player after a jump
    pub teleport_cooldown_ms: u64,

    /// World rule: whether the stability resource exists at all
    pub temporal_stability: bool,

    /// Stability deducted per jump
    pub stability_cost: f64,

    pub stability_mode: StabilityMode,

    /// Distance of an unstable landing from the intended destination
    pub unstable_range: f64,
}

impl Default for TeleportConfig {
    fn default() -> Self {
        Self {
            seal_radius: 1.5,
            teleport_cooldown_ms: 5000,
            temporal_stability: true,
            stability_cost: 0.2,
            stability_mode: StabilityMode::Auto,
            unstable_range: 500.0,
        }
    }
}

/// Authority process settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Logical name (for logging)
    pub name: String,

    /// Node tick interval
    pub tick_interval_ms: u64,

    /// Key of the network blob in the world save
    pub save_key: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            name: "tpnet-server".to_string(),
            tick_interval_ms: 50,
            save_key: "TPNetData".to_string(),
        }
    }
}

/// Complete configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TpNetConfig {
    pub server: ServerConfig,
    pub registry: RegistryConfig,
    pub activation: ActivationConfig,
    pub teleport: TeleportConfig,
}

impl TpNetConfig {
    /// Parses a JSON document; missing fields take their defaults.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    /// Reads and parses a JSON config file.
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }
}
