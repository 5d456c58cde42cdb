//! Run settings — the immutable per-run snapshot the controller pushes to
//! the source and the relay before a transfer begins.
//!
//! Settings are created once per run, travel inside the settings-push
//! envelope, and are superseded wholesale by the next run. There are no
//! partial updates.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// How elements are assigned to packets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SplitMode {
    /// Identity ordering — element i goes to block i / L.
    Sequential,
    /// Seeded pseudo-random permutation of the element index range.
    Random,
}

impl FromStr for SplitMode {
    type Err = InvalidSplitMode;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sequential" => Ok(SplitMode::Sequential),
            "random" => Ok(SplitMode::Random),
            other => Err(InvalidSplitMode(other.to_string())),
        }
    }
}

/// Invalid split mode text is a fatal configuration error — it aborts the
/// run immediately and is never retried.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid split mode: {0:?} (expected \"sequential\" or \"random\")")]
pub struct InvalidSplitMode(pub String);

/// Data-plane transport for result packets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    Tcp,
    Udp,
}

/// Named fixed-point quantization scheme. See [`crate::codec`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QuantScheme {
    #[serde(rename = "none")]
    None,
    #[serde(rename = "16bit")]
    Q16,
    #[serde(rename = "8bit")]
    Q8,
    #[serde(rename = "normalize-16bit")]
    Norm16,
    #[serde(rename = "normalize-2sigma-16bit")]
    Norm2Sigma16,
}

impl fmt::Display for QuantScheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            QuantScheme::None => "none",
            QuantScheme::Q16 => "16bit",
            QuantScheme::Q8 => "8bit",
            QuantScheme::Norm16 => "normalize-16bit",
            QuantScheme::Norm2Sigma16 => "normalize-2sigma-16bit",
        };
        f.write_str(name)
    }
}

/// Per-link network-degradation parameters, handed to the `tc` wrapper.
/// All-zero means the link is left unshaped.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct LinkShaping {
    /// Added one-way delay in milliseconds.
    pub delay_ms: f64,
    /// Delay jitter in milliseconds. Only meaningful with a non-zero delay.
    pub jitter_ms: f64,
    /// Packet loss rate in [0, 1].
    pub loss_rate: f64,
    /// Bandwidth cap in mbit/s. 0 = uncapped.
    pub bandwidth_mbit: f64,
}

impl LinkShaping {
    pub fn is_unshaped(&self) -> bool {
        self.delay_ms == 0.0 && self.loss_rate == 0.0 && self.bandwidth_mbit == 0.0
    }
}

/// The per-run settings snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    /// Model identifier, resolved by the inference engine.
    pub model: String,
    /// Layer index where the network is split. 0 = the source sends the
    /// raw input bytes and the relay runs the whole model.
    pub split_layer: u32,
    pub split_mode: SplitMode,
    /// Maximum packet payload size in bytes (byte-string mode chunking).
    pub max_packet_bytes: usize,
    /// PCA retention rate in [0, 1]. 0 and 1 both mean "skip reduction".
    pub pca_rate: f64,
    pub quant: QuantScheme,
    /// When true, the model is reloaded for every run instead of reusing
    /// the handle loaded on first use.
    pub reload_model: bool,
    pub transport: Transport,
    /// Shaping applied on the source's egress device.
    pub source_link: LinkShaping,
    /// Shaping applied on the relay's egress device.
    pub relay_link: LinkShaping,
    /// Fraction of expected elements whose arrival completes a transfer.
    pub reach_rate: f64,
    /// Inactivity budget in milliseconds before an incomplete transfer is
    /// force-finalized.
    pub wait_time_ms: u64,
    /// Seed for the split permutation; echoed in every ResultSummary.
    pub random_seed: u64,
    /// Inference target: a single file, or a directory iterated in sorted
    /// order.
    pub input_path: String,
    /// Timestamp string namespacing all artifacts of one run.
    pub run_id: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_mode_parses_known_values() {
        assert_eq!("sequential".parse::<SplitMode>().unwrap(), SplitMode::Sequential);
        assert_eq!("random".parse::<SplitMode>().unwrap(), SplitMode::Random);
        assert!("shuffled".parse::<SplitMode>().is_err());
    }

    #[test]
    fn quant_scheme_wire_names_are_stable() {
        // These names are part of the settings wire format.
        let json = serde_json::to_string(&QuantScheme::Norm2Sigma16).unwrap();
        assert_eq!(json, "\"normalize-2sigma-16bit\"");
        let back: QuantScheme = serde_json::from_str("\"16bit\"").unwrap();
        assert_eq!(back, QuantScheme::Q16);
    }

    #[test]
    fn unshaped_link_detection() {
        assert!(LinkShaping::default().is_unshaped());
        let shaped = LinkShaping {
            loss_rate: 0.05,
            ..Default::default()
        };
        assert!(!shaped.is_unshaped());
    }
}
