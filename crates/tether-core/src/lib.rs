//! Supervised subprocess IPC for stream-processing pipelines.
//!
//! This crate provides:
//! - Stream framings (`lines`, length-prefixed, netstring) for subprocess stdio
//! - A supervisor that keeps one subprocess alive and restarts it on exit
//! - A pipeline step that sends batch parts through the subprocess
//! - Step configuration loadable from TOML or JSON

pub mod config;
pub mod error;
pub mod ipc;
pub mod message;
pub mod metrics;
pub mod step;

pub use config::SubprocessConfig;
pub use error::{Error, Result};
pub use ipc::{Codec, CodecError, ProcessKillHandle, ProcessSupervisor, SupervisorState};
pub use message::{Batch, Part};
pub use metrics::{MetricsSnapshot, StepMetrics};
pub use step::SubprocessStep;
