//! gpugate-scheduler: Scheduling decisions for gpugate
//!
//! This crate decides where and when requests run:
//! - Variant selection for aliased models
//! - Per-model admission control
//! - GPU reservation and the worker lifecycle state machine
//! - Availability windows

pub mod admission;
pub mod availability;
pub mod lifecycle;
pub mod placement;
pub mod reservation;

pub use admission::{AdmissionGate, AdmissionToken};
pub use availability::{is_allowed, AvailabilityScheduler, Clock, SystemClock};
pub use lifecycle::{ActivityGuard, FailureCause, LifecycleManager};
pub use placement::{DefaultVariantPolicy, VariantPolicy};
pub use reservation::{GpuReservation, GpuReservationTable};
