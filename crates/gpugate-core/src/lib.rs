//! gpugate-core: Core types for the gpugate control plane
//!
//! This crate provides the fundamental types used throughout gpugate:
//! - Model configuration and runtime state types
//! - The immutable model registry
//! - Availability windows
//! - Daemon configuration
//! - Error handling

pub mod config;
pub mod error;
pub mod model;
pub mod registry;
pub mod window;

pub use config::*;
pub use error::*;
pub use model::*;
pub use registry::ModelRegistry;
pub use window::AvailabilityWindow;
