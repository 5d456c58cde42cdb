//! splitlink-services — role endpoints and the receiver-side machinery
//! they share: the reception window, the retry wrapper, the envelope
//! transport helpers, the inference-engine seam, and the `tc` shaping
//! wrapper.

pub mod controller;
pub mod engine;
pub mod net;
pub mod netem;
pub mod relay;
pub mod retry;
pub mod source;
pub mod window;

pub use engine::{InferenceEngine, MockEngine, ModelHandle};
pub use retry::RetryPolicy;
pub use window::{CompletedTransfer, CompletionKind, ReceptionWindow, WindowPayload};

/// Seconds since the Unix epoch, as reported in process-time telemetry.
pub fn unix_time_secs() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}
