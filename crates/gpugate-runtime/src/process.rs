//! Process-based worker host
//!
//! This host runs inference workers as direct OS processes, pinned to their
//! GPUs with `CUDA_VISIBLE_DEVICES`, and probes them over HTTP.

use async_trait::async_trait;
use gpugate_core::{GateError, GateResult, LaunchSpec, ModelConfig, ProbeOutcome, WorkerHandle};
use std::collections::HashMap;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::traits::WorkerHost;

/// Process host configuration
#[derive(Debug, Clone)]
pub struct ProcessHostConfig {
    /// Time between SIGTERM and a forced kill
    pub stop_grace: Duration,
    /// Timeout of a single HTTP liveness probe
    pub probe_timeout: Duration,
}

impl Default for ProcessHostConfig {
    fn default() -> Self {
        Self {
            stop_grace: Duration::from_secs(45),
            probe_timeout: Duration::from_secs(5),
        }
    }
}

struct ManagedWorker {
    child: Child,
    health_url: String,
}

/// Process-based host for model workers
pub struct ProcessHost {
    config: ProcessHostConfig,
    client: reqwest::Client,
    workers: Mutex<HashMap<Uuid, ManagedWorker>>,
}

impl ProcessHost {
    /// Create a new process host
    pub fn new(config: ProcessHostConfig) -> GateResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.probe_timeout)
            .build()
            .map_err(|e| GateError::Runtime(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            config,
            client,
            workers: Mutex::new(HashMap::new()),
        })
    }

    /// Build the command to start a worker
    fn build_command(&self, model: &ModelConfig, launch: &LaunchSpec) -> Command {
        let gpus = model
            .gpus
            .iter()
            .map(|id| id.to_string())
            .collect::<Vec<_>>()
            .join(",");

        let mut cmd = Command::new(&launch.command);
        for arg in &launch.args {
            cmd.arg(arg.replace("{id}", &model.id).replace("{gpus}", &gpus));
        }

        if !model.gpus.is_empty() {
            cmd.env("CUDA_VISIBLE_DEVICES", &gpus);
        }
        for (key, value) in &launch.env {
            cmd.env(key, value);
        }

        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::inherit());
        cmd.stderr(Stdio::inherit());
        cmd.kill_on_drop(true);

        cmd
    }

    /// Number of workers currently owned by this host
    pub async fn worker_count(&self) -> usize {
        self.workers.lock().await.len()
    }
}

/// Probe a worker's HTTP liveness endpoint
pub async fn http_probe(client: &reqwest::Client, url: &str) -> ProbeOutcome {
    match client.get(url).send().await {
        Ok(response) if response.status().is_success() => {
            debug!(endpoint = %url, "Probe passed");
            ProbeOutcome::Healthy
        }
        Ok(response) => {
            warn!(endpoint = %url, status = %response.status(), "Probe failed");
            ProbeOutcome::Unhealthy
        }
        Err(e) => {
            debug!(endpoint = %url, error = %e, "Probe error");
            ProbeOutcome::Unreachable
        }
    }
}

#[async_trait]
impl WorkerHost for ProcessHost {
    async fn start(&self, model: &ModelConfig) -> GateResult<WorkerHandle> {
        let launch = model.launch.as_ref().ok_or_else(|| {
            GateError::Runtime(format!("model '{}' has no launch command", model.id))
        })?;

        info!(
            model = %model.id,
            command = %launch.command,
            gpus = ?model.gpus,
            "Starting worker process"
        );

        let mut cmd = self.build_command(model, launch);
        let child = cmd.spawn().map_err(|e| {
            error!(model = %model.id, error = %e, "Failed to spawn worker process");
            GateError::Runtime(format!("Failed to spawn worker: {}", e))
        })?;

        let mut handle = WorkerHandle::new(&model.id, model.endpoint_url());
        handle.pid = child.id();

        debug!(model = %model.id, pid = ?handle.pid, "Worker process spawned");

        let health_url = format!("{}{}", handle.endpoint, model.health_path);
        self.workers
            .lock()
            .await
            .insert(handle.id, ManagedWorker { child, health_url });

        Ok(handle)
    }

    async fn stop(&self, handle: &WorkerHandle) -> GateResult<()> {
        let worker = self.workers.lock().await.remove(&handle.id);
        let Some(mut worker) = worker else {
            return Err(GateError::Runtime(format!("unknown worker {}", handle)));
        };

        info!(worker = %handle, "Stopping worker process");

        // Send SIGTERM and give the worker a chance to free GPU memory
        #[cfg(unix)]
        {
            if let Some(pid) = worker.child.id() {
                let _ = Command::new("kill")
                    .arg("-TERM")
                    .arg(pid.to_string())
                    .output()
                    .await;
            }
        }

        match tokio::time::timeout(self.config.stop_grace, worker.child.wait()).await {
            Ok(Ok(status)) => {
                debug!(worker = %handle, status = %status, "Worker exited");
                Ok(())
            }
            Ok(Err(e)) => Err(GateError::Runtime(format!("Failed to wait for worker: {}", e))),
            Err(_) => {
                warn!(worker = %handle, "Graceful stop timed out, killing worker");
                worker
                    .child
                    .kill()
                    .await
                    .map_err(|e| GateError::Runtime(format!("Failed to kill worker: {}", e)))
            }
        }
    }

    async fn probe(&self, handle: &WorkerHandle) -> ProbeOutcome {
        let health_url = {
            let mut workers = self.workers.lock().await;
            let Some(worker) = workers.get_mut(&handle.id) else {
                return ProbeOutcome::Exited;
            };
            match worker.child.try_wait() {
                Ok(Some(status)) => {
                    warn!(worker = %handle, status = %status, "Worker process exited");
                    return ProbeOutcome::Exited;
                }
                Ok(None) => worker.health_url.clone(),
                Err(_) => return ProbeOutcome::Unreachable,
            }
        };

        http_probe(&self.client, &health_url).await
    }

    fn name(&self) -> &'static str {
        "process"
    }
}
