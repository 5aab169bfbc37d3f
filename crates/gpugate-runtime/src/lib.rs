//! gpugate-runtime: Worker host abstraction
//!
//! This crate defines how workers are started, stopped and probed:
//! - The `WorkerHost` trait consumed by the lifecycle manager
//! - A process-based host that launches workers as local OS processes

pub mod process;
pub mod traits;

pub use process::{ProcessHost, ProcessHostConfig};
pub use traits::WorkerHost;
