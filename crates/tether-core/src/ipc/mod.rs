//! Inter-process communication with a supervised subprocess.
//!
//! This module provides the stream framings and the supervisor that keeps
//! a long-running subprocess alive and exchanges framed messages with it.

pub mod protocol;
mod reader;
mod supervisor;

pub use protocol::{
    Codec, CodecError, DEFAULT_MAX_BUFFER, Frame, LENGTH_PREFIX_BYTES, write_frame,
};
pub use reader::FrameReader;
pub use supervisor::{ProcessKillHandle, ProcessSupervisor, SupervisorState};
