//! Configuration system for Splitlink.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $SPLITLINK_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/splitlink/config.toml
//!   3. ~/.config/splitlink/config.toml
//!
//! The [network] section is deployment wiring (who listens where); the
//! [run] section provides the defaults the controller snapshots into the
//! per-run [`Settings`] it pushes to the other roles.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::settings::{LinkShaping, QuantScheme, Settings, SplitMode, Transport};

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct SplitlinkConfig {
    pub network: NetworkConfig,
    pub run: RunConfig,
    pub paths: PathsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Source control-plane listener.
    pub source_host: String,
    pub source_port: u16,
    /// Relay control-plane listener.
    pub relay_host: String,
    pub relay_port: u16,
    /// Relay data-plane (UDP) listener.
    pub relay_udp_port: u16,
    /// Controller listener.
    pub controller_host: String,
    pub controller_port: u16,
    /// Egress device names handed to the `tc` wrapper. Empty = no shaping.
    pub source_device: String,
    pub relay_device: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    pub model: String,
    pub split_layer: u32,
    pub split_mode: SplitMode,
    pub max_packet_bytes: usize,
    pub pca_rate: f64,
    pub quant: QuantScheme,
    pub reload_model: bool,
    pub transport: Transport,
    pub reach_rate: f64,
    pub wait_time_ms: u64,
    pub random_seed: u64,
    pub input_path: String,
    /// Retry budget for every network-issuing operation.
    pub max_retries: u32,
    // Sub-tables last so the TOML rendering stays value-before-table.
    pub source_link: LinkShaping,
    pub relay_link: LinkShaping,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// Root of the precomputed reduction bases (`<root>/<model>/<layer>.json`).
    pub basis_dir: PathBuf,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            source_host: "127.0.0.1".into(),
            source_port: 9301,
            relay_host: "127.0.0.1".into(),
            relay_port: 9302,
            relay_udp_port: 9303,
            controller_host: "127.0.0.1".into(),
            controller_port: 9304,
            source_device: String::new(),
            relay_device: String::new(),
        }
    }
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            model: "mnist-cnn".into(),
            split_layer: 3,
            split_mode: SplitMode::Sequential,
            max_packet_bytes: 4096,
            pca_rate: 0.0,
            quant: QuantScheme::None,
            reload_model: false,
            transport: Transport::Tcp,
            reach_rate: 1.0,
            wait_time_ms: 5000,
            random_seed: 1234,
            input_path: "data/input".into(),
            max_retries: 5,
            source_link: LinkShaping::default(),
            relay_link: LinkShaping::default(),
        }
    }
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            basis_dir: data_dir().join("basis"),
        }
    }
}

impl RunConfig {
    /// Snapshot these defaults into the immutable per-run settings.
    pub fn to_settings(&self, run_id: String) -> Settings {
        Settings {
            model: self.model.clone(),
            split_layer: self.split_layer,
            split_mode: self.split_mode,
            max_packet_bytes: self.max_packet_bytes,
            pca_rate: self.pca_rate,
            quant: self.quant,
            reload_model: self.reload_model,
            transport: self.transport,
            source_link: self.source_link,
            relay_link: self.relay_link,
            reach_rate: self.reach_rate,
            wait_time_ms: self.wait_time_ms,
            random_seed: self.random_seed,
            input_path: self.input_path.clone(),
            run_id,
        }
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".config"))
        .join("splitlink")
}

pub fn data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".local").join("share"))
        .join("splitlink")
}

fn dirs_or_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("failed to write {0}: {1}")]
    WriteFailed(PathBuf, std::io::Error),
    #[error("failed to serialize: {0}")]
    SerializeFailed(toml::ser::Error),
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl SplitlinkConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::file_path();
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(&path)
                .map_err(|e| ConfigError::ReadFailed(path.clone(), e))?;
            toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.clone(), e))?
        } else {
            SplitlinkConfig::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("SPLITLINK_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Write default config if none exists. Returns the path.
    pub fn write_default_if_missing() -> Result<PathBuf, ConfigError> {
        let path = Self::file_path();
        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
            }
            let text = toml::to_string_pretty(&SplitlinkConfig::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(&path, text).map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }

    /// Apply SPLITLINK_* env var overrides.
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("SPLITLINK_NETWORK__SOURCE_HOST") {
            self.network.source_host = v;
        }
        if let Ok(v) = std::env::var("SPLITLINK_NETWORK__RELAY_HOST") {
            self.network.relay_host = v;
        }
        if let Ok(v) = std::env::var("SPLITLINK_NETWORK__CONTROLLER_HOST") {
            self.network.controller_host = v;
        }
        if let Ok(v) = std::env::var("SPLITLINK_RUN__INPUT_PATH") {
            self.run.input_path = v;
        }
        if let Ok(v) = std::env::var("SPLITLINK_RUN__TRANSPORT") {
            match v.as_str() {
                "tcp" => self.run.transport = Transport::Tcp,
                "udp" => self.run.transport = Transport::Udp,
                _ => {}
            }
        }
        if let Ok(v) = std::env::var("SPLITLINK_PATHS__BASIS_DIR") {
            self.paths.basis_dir = PathBuf::from(v);
        }
    }
}
