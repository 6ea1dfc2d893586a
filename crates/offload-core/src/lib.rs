//! offload-core: wire protocol and configuration shared by the broker and
//! the edge-device driver. All other offload crates depend on this one.

pub mod config;
pub mod wire;

pub use config::{ConfigError, OffloadConfig};
pub use wire::{CompletionLine, JobLine, Message, WireError};
