//! Health monitoring for running workers

use futures::future::join_all;
use gpugate_core::{HealthConfig, ProbeOutcome};
use gpugate_scheduler::{FailureCause, LifecycleManager};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

/// Probes every running worker on a fixed interval and feeds the outcomes
/// to the lifecycle manager. Stopped models are never probed.
pub struct HealthMonitor {
    lifecycle: Arc<LifecycleManager>,
    interval: Duration,
    probe_timeout: Duration,
}

impl HealthMonitor {
    /// Create a new health monitor
    pub fn new(lifecycle: Arc<LifecycleManager>, config: &HealthConfig) -> Self {
        Self {
            lifecycle,
            interval: config.probe_interval(),
            probe_timeout: config.probe_timeout(),
        }
    }

    /// Get the probe interval
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Probe all running workers concurrently and report the results.
    ///
    /// A probe that outlives the timeout counts as unreachable.
    pub async fn probe_all(&self) -> Vec<(String, ProbeOutcome)> {
        let running = self.lifecycle.running_workers().await;
        if running.is_empty() {
            return Vec::new();
        }

        let host = self.lifecycle.host().clone();
        let probes = running.iter().map(|(model, handle)| {
            let host = host.clone();
            async move {
                let outcome = tokio::time::timeout(self.probe_timeout, host.probe(handle))
                    .await
                    .unwrap_or(ProbeOutcome::Unreachable);
                (model.id.clone(), outcome)
            }
        });
        let results = join_all(probes).await;

        for (model_id, outcome) in &results {
            match outcome {
                ProbeOutcome::Healthy => {
                    debug!(model = %model_id, "Health check passed");
                    self.lifecycle.record_healthy(model_id).await;
                }
                ProbeOutcome::Exited => {
                    warn!(model = %model_id, "Worker process is gone");
                    self.lifecycle
                        .report_failure(model_id, FailureCause::Exited)
                        .await;
                }
                outcome => {
                    warn!(model = %model_id, outcome = ?outcome, "Health check failed");
                    self.lifecycle
                        .report_failure(model_id, FailureCause::ProbeFailed(*outcome))
                        .await;
                }
            }
        }

        results
    }

    /// Run `probe_all` forever on the configured interval
    pub fn spawn(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;

            loop {
                ticker.tick().await;
                self.probe_all().await;
            }
        })
    }
}
