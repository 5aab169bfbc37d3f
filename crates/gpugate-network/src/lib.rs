//! gpugate-network: Worker-facing networking
//!
//! This crate provides networking functionality:
//! - Periodic health probing of running workers
//! - The HTTP client that forwards requests to workers

pub mod health;
pub mod proxy;

pub use health::HealthMonitor;
pub use proxy::WorkerProxy;
