//! Worker host trait definitions

use async_trait::async_trait;
use gpugate_core::{GateResult, ModelConfig, ProbeOutcome, WorkerHandle};

/// Starts, stops and probes model workers.
///
/// How a worker is packaged (process, container) is up to the
/// implementation; callers only see the opaque `WorkerHandle`.
#[async_trait]
pub trait WorkerHost: Send + Sync {
    /// Launch a worker for the model. Returns once the worker has been
    /// spawned, not once it is ready.
    async fn start(&self, model: &ModelConfig) -> GateResult<WorkerHandle>;

    /// Stop a worker and wait for it to exit
    async fn stop(&self, handle: &WorkerHandle) -> GateResult<()>;

    /// Lightweight liveness check
    async fn probe(&self, handle: &WorkerHandle) -> ProbeOutcome;

    /// Get the host name
    fn name(&self) -> &'static str;
}
