//! Domain model for swap
//!
//! Core identity types and the structured error taxonomy shared by every
//! subsystem:
//! - Compile-time safety via newtype pattern
//! - File identity (`Dentry`) independent of the path used to reach a file
//! - Structured error handling

pub mod errors;
pub mod types;

pub use types::{Dentry, Pid, Tid};

pub use errors::{
    DeviceError, Fault, FaultKind, FatalProbeError, LoaderError, ProbeError, RecordError,
    WspError,
};
