//! splitlink-core — shared types, wire envelopes, and numeric codecs.
//! All other Splitlink crates depend on this one.

pub mod codec;
pub mod config;
pub mod envelope;
pub mod packet;
pub mod permute;
pub mod reduce;
pub mod settings;
pub mod tensor;

pub use envelope::{Command, Request, Response, ResponseCode, ResponsePayload};
pub use settings::{LinkShaping, QuantScheme, Settings, SplitMode, Transport};
pub use tensor::Tensor;
