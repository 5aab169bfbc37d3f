//! Worker lifecycle management
//!
//! One state machine per model id:
//!
//! ```text
//! Stopped -> Starting -> Running -> Draining -> Stopped
//!               |           |
//!               +--> Failed <+        Failed -> Starting (retry)
//! ```
//!
//! Every transition of a model happens under that model's own lock, so
//! unrelated models never wait on each other. Cold starts run in a spawned
//! task: the first caller launches it, later callers subscribe to the
//! model's status channel and wait for the same outcome. A caller giving up
//! (deadline, client disconnect) never cancels the start itself.

use gpugate_core::{
    GateError, GateResult, LifecycleConfig, ModelConfig, ModelRegistry, ModelSnapshot, ModelStatus,
    ProbeOutcome, WorkerHandle,
};
use gpugate_runtime::WorkerHost;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, timeout_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::reservation::{GpuReservation, GpuReservationTable};

/// Why a running worker is considered broken
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureCause {
    /// A liveness probe did not return healthy
    ProbeFailed(ProbeOutcome),
    /// The worker process is gone
    Exited,
    /// A forwarded request failed at the worker
    Backend(String),
}

impl FailureCause {
    /// Fatal causes skip the consecutive-failure threshold
    fn is_fatal(&self) -> bool {
        matches!(self, FailureCause::Exited)
    }
}

impl std::fmt::Display for FailureCause {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureCause::ProbeFailed(outcome) => write!(f, "probe {:?}", outcome),
            FailureCause::Exited => write!(f, "worker exited"),
            FailureCause::Backend(reason) => write!(f, "backend error: {}", reason),
        }
    }
}

#[derive(Debug, Clone)]
enum StartFailure {
    Timeout,
    Host(String),
}

impl StartFailure {
    fn to_error(&self, model_id: &str) -> GateError {
        match self {
            StartFailure::Timeout => GateError::StartupTimeout(format!(
                "worker for '{}' did not become ready in time",
                model_id
            )),
            StartFailure::Host(reason) => GateError::WorkerStart {
                model: model_id.to_string(),
                reason: reason.clone(),
            },
        }
    }
}

/// Mutable per-model state, only touched under the model's lock
#[derive(Debug)]
struct Lifecycle {
    status: ModelStatus,
    handle: Option<WorkerHandle>,
    consecutive_failures: u32,
    last_failure: Option<StartFailure>,
    restart_attempts: u32,
}

/// Request counters readable without the model lock
#[derive(Debug, Default)]
struct Activity {
    active: AtomicU32,
    /// Milliseconds since the manager epoch, plus one; zero means never
    last_ms: AtomicU64,
    drained: Notify,
}

impl Activity {
    fn active(&self) -> u32 {
        self.active.load(Ordering::Acquire)
    }

    fn touch(&self, epoch: Instant) {
        let ms = Instant::now().saturating_duration_since(epoch).as_millis() as u64 + 1;
        self.last_ms.fetch_max(ms, Ordering::AcqRel);
    }

    fn idle_for(&self, epoch: Instant, now: Instant) -> Option<Duration> {
        match self.last_ms.load(Ordering::Acquire) {
            0 => None,
            ms => Some(now.saturating_duration_since(epoch + Duration::from_millis(ms - 1))),
        }
    }
}

#[derive(Debug)]
struct ModelEntry {
    config: Arc<ModelConfig>,
    lifecycle: Mutex<Lifecycle>,
    status_tx: watch::Sender<ModelStatus>,
    activity: Activity,
}

impl ModelEntry {
    fn new(config: Arc<ModelConfig>) -> Self {
        let (status_tx, _) = watch::channel(ModelStatus::Stopped);
        Self {
            config,
            lifecycle: Mutex::new(Lifecycle {
                status: ModelStatus::Stopped,
                handle: None,
                consecutive_failures: 0,
                last_failure: None,
                restart_attempts: 0,
            }),
            status_tx,
            activity: Activity::default(),
        }
    }

    fn status(&self) -> ModelStatus {
        *self.status_tx.borrow()
    }

    fn transition(&self, lc: &mut Lifecycle, to: ModelStatus) {
        let from = lc.status;
        lc.status = to;
        self.status_tx.send_replace(to);
        info!(model = %self.config.id, from = %from, to = %to, "Lifecycle transition");
    }
}

/// Owns every model's lifecycle state and the GPU reservation table
pub struct LifecycleManager {
    registry: Arc<ModelRegistry>,
    entries: HashMap<String, Arc<ModelEntry>>,
    host: Arc<dyn WorkerHost>,
    reservations: Mutex<GpuReservationTable>,
    config: LifecycleConfig,
    probe_timeout: Duration,
    epoch: Instant,
    /// Set by `shutdown`; no new starts, and starts in flight tear down
    shutting_down: AtomicBool,
}

impl LifecycleManager {
    /// Create a manager with one `Stopped` state per registered model
    pub fn new(
        registry: Arc<ModelRegistry>,
        host: Arc<dyn WorkerHost>,
        config: LifecycleConfig,
        probe_timeout: Duration,
    ) -> Self {
        let entries = registry
            .all()
            .iter()
            .map(|m| (m.id.clone(), Arc::new(ModelEntry::new(m.clone()))))
            .collect();

        info!(
            models = registry.len(),
            host = host.name(),
            "Lifecycle manager initialized"
        );

        Self {
            registry,
            entries,
            host,
            reservations: Mutex::new(GpuReservationTable::new()),
            config,
            probe_timeout,
            epoch: Instant::now(),
            shutting_down: AtomicBool::new(false),
        }
    }

    fn entry(&self, model_id: &str) -> GateResult<&Arc<ModelEntry>> {
        self.entries
            .get(model_id)
            .ok_or_else(|| GateError::ModelNotFound(model_id.to_string()))
    }

    /// The worker host driving this manager
    pub fn host(&self) -> &Arc<dyn WorkerHost> {
        &self.host
    }

    /// Current status of a model
    pub fn status(&self, model_id: &str) -> Option<ModelStatus> {
        self.entries.get(model_id).map(|e| e.status())
    }

    /// Watch a model's status transitions
    pub fn subscribe(&self, model_id: &str) -> Option<watch::Receiver<ModelStatus>> {
        self.entries.get(model_id).map(|e| e.status_tx.subscribe())
    }

    /// Requests currently in flight on a model
    pub fn active_requests(&self, model_id: &str) -> u32 {
        self.entries
            .get(model_id)
            .map(|e| e.activity.active())
            .unwrap_or(0)
    }

    /// Make sure the model has a ready worker, starting one if needed.
    ///
    /// Concurrent callers share one start. A caller whose `deadline` passes
    /// first gets `StartupTimeout` while the start carries on, bounded by
    /// the model's own startup timeout.
    pub async fn ensure_running(
        self: &Arc<Self>,
        model_id: &str,
        deadline: Instant,
    ) -> GateResult<WorkerHandle> {
        let entry = self.entry(model_id)?.clone();
        let mut joined = false;

        loop {
            let mut status_rx = {
                let mut lc = entry.lifecycle.lock().await;
                match lc.status {
                    ModelStatus::Running => {
                        if let Some(handle) = &lc.handle {
                            return Ok(handle.clone());
                        }
                        return Err(GateError::Internal(format!(
                            "model '{}' running without a worker handle",
                            model_id
                        )));
                    }
                    ModelStatus::Failed if joined => {
                        let failure = lc.last_failure.clone().unwrap_or(StartFailure::Timeout);
                        return Err(failure.to_error(model_id));
                    }
                    ModelStatus::Stopped | ModelStatus::Failed => {
                        self.begin_start(&entry, &mut lc).await?;
                        joined = true;
                    }
                    ModelStatus::Starting => {
                        joined = true;
                    }
                    ModelStatus::Draining => {
                        debug!(model = %model_id, "Waiting for drain before restarting");
                    }
                }

                let mut rx = entry.status_tx.subscribe();
                rx.borrow_and_update();
                rx
            };

            match timeout_at(deadline, status_rx.changed()).await {
                Ok(Ok(())) => continue,
                Ok(Err(_)) => {
                    return Err(GateError::Internal(format!(
                        "status channel of '{}' closed",
                        model_id
                    )))
                }
                Err(_) => {
                    return Err(GateError::StartupTimeout(format!(
                        "'{}' not ready before request deadline",
                        model_id
                    )))
                }
            }
        }
    }

    /// Reserve GPUs and launch the start task. Caller holds the model lock.
    async fn begin_start(
        self: &Arc<Self>,
        entry: &Arc<ModelEntry>,
        lc: &mut Lifecycle,
    ) -> GateResult<()> {
        if self.shutting_down.load(Ordering::Acquire) {
            return Err(GateError::WorkerStart {
                model: entry.config.id.clone(),
                reason: "gateway is shutting down".to_string(),
            });
        }

        {
            let mut table = self.reservations.lock().await;
            if let Err(e) = table.try_reserve(&entry.config.id, &entry.config.gpus) {
                warn!(model = %entry.config.id, error = %e, "Cannot start worker");
                return Err(e);
            }
        }

        lc.handle = None;
        lc.last_failure = None;
        entry.transition(lc, ModelStatus::Starting);

        let manager = self.clone();
        let entry = entry.clone();
        tokio::spawn(async move { manager.run_start(entry).await });

        Ok(())
    }

    async fn run_start(self: Arc<Self>, entry: Arc<ModelEntry>) {
        let model = entry.config.clone();
        let deadline = Instant::now() + model.startup_timeout();

        let outcome = match timeout_at(deadline, self.host.start(&model)).await {
            Ok(Ok(handle)) => {
                entry.lifecycle.lock().await.handle = Some(handle.clone());
                match self.wait_ready(&handle, deadline).await {
                    Ok(()) => Ok(handle),
                    Err(failure) => Err((Some(handle), failure)),
                }
            }
            Ok(Err(e)) => Err((None, StartFailure::Host(e.to_string()))),
            Err(_) => Err((None, StartFailure::Timeout)),
        };

        match outcome {
            Ok(handle) if self.shutting_down.load(Ordering::Acquire) => {
                info!(model = %model.id, worker = %handle, "Worker ready during shutdown, stopping it");
                if let Err(e) = self.host.stop(&handle).await {
                    warn!(model = %model.id, error = %e, "Failed to stop worker during shutdown");
                }

                let mut lc = entry.lifecycle.lock().await;
                lc.handle = None;
                self.reservations.lock().await.release(&model.id);
                entry.transition(&mut lc, ModelStatus::Stopped);
            }
            Ok(handle) => {
                let mut lc = entry.lifecycle.lock().await;
                info!(model = %model.id, worker = %handle, "Worker ready");
                lc.handle = Some(handle);
                lc.consecutive_failures = 0;
                lc.restart_attempts = 0;
                entry.activity.touch(self.epoch);
                entry.transition(&mut lc, ModelStatus::Running);
            }
            Err((handle, failure)) => {
                warn!(model = %model.id, failure = ?failure, "Worker failed to start");
                if let Some(handle) = &handle {
                    if let Err(e) = self.host.stop(handle).await {
                        warn!(model = %model.id, error = %e, "Failed to tear down worker");
                    }
                }

                let mut lc = entry.lifecycle.lock().await;
                lc.handle = None;
                lc.last_failure = Some(failure);
                self.reservations.lock().await.release(&model.id);
                entry.transition(&mut lc, ModelStatus::Failed);
            }
        }
    }

    /// Poll the worker until healthy, exited, or `deadline`
    async fn wait_ready(&self, handle: &WorkerHandle, deadline: Instant) -> Result<(), StartFailure> {
        loop {
            let probe_deadline = deadline.min(Instant::now() + self.probe_timeout);
            let outcome = timeout_at(probe_deadline, self.host.probe(handle))
                .await
                .unwrap_or(ProbeOutcome::Unreachable);

            match outcome {
                ProbeOutcome::Healthy => return Ok(()),
                ProbeOutcome::Exited => {
                    return Err(StartFailure::Host("worker exited during startup".to_string()))
                }
                ProbeOutcome::Unhealthy | ProbeOutcome::Unreachable => {
                    debug!(worker = %handle, outcome = ?outcome, "Worker not ready yet");
                }
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(StartFailure::Timeout);
            }
            sleep_until(deadline.min(now + self.config.startup_poll_interval())).await;
        }
    }

    /// Mark a request as running on the model.
    ///
    /// Returns `None` when the model is no longer `Running` (e.g. a drain
    /// began after `ensure_running` returned); the caller should retry.
    pub async fn begin_request(&self, model_id: &str) -> GateResult<Option<ActivityGuard>> {
        let entry = self.entry(model_id)?;
        let lc = entry.lifecycle.lock().await;
        if lc.status != ModelStatus::Running {
            return Ok(None);
        }

        entry.activity.active.fetch_add(1, Ordering::AcqRel);
        entry.activity.touch(self.epoch);

        Ok(Some(ActivityGuard {
            entry: entry.clone(),
            epoch: self.epoch,
        }))
    }

    /// Stop every running model that has been idle longer than its TTL and
    /// has nothing in flight. Returns the ids that were stopped.
    pub async fn idle_sweep(&self) -> Vec<String> {
        let now = Instant::now();
        let mut stopped = Vec::new();

        for model in self.registry.all() {
            let entry = &self.entries[&model.id];
            let handle = {
                let mut lc = entry.lifecycle.lock().await;
                if lc.status != ModelStatus::Running || entry.activity.active() > 0 {
                    continue;
                }
                let idle = entry
                    .activity
                    .idle_for(self.epoch, now)
                    .unwrap_or(Duration::MAX);
                if idle <= model.idle_ttl() {
                    continue;
                }

                info!(
                    model = %model.id,
                    idle_secs = idle.as_secs(),
                    ttl_secs = model.idle_ttl_secs,
                    "Idle TTL expired"
                );
                entry.transition(&mut lc, ModelStatus::Draining);
                lc.handle.clone()
            };

            self.finish_stop(entry, handle).await;
            stopped.push(model.id.clone());
        }

        stopped
    }

    /// Drain a running model regardless of idleness.
    ///
    /// New requests are refused at once; the worker stops when in-flight
    /// requests finish or the drain timeout passes. Returns whether a drain
    /// was started.
    pub async fn force_drain(self: &Arc<Self>, model_id: &str, reason: &str) -> GateResult<bool> {
        let entry = self.entry(model_id)?.clone();
        let handle = {
            let mut lc = entry.lifecycle.lock().await;
            if lc.status != ModelStatus::Running {
                return Ok(false);
            }
            info!(
                model = %model_id,
                reason = reason,
                active = entry.activity.active(),
                "Draining worker"
            );
            entry.transition(&mut lc, ModelStatus::Draining);
            lc.handle.clone()
        };

        if entry.activity.active() == 0 {
            self.finish_stop(&entry, handle).await;
        } else {
            let manager = self.clone();
            tokio::spawn(async move {
                manager.await_drained(&entry).await;
                manager.finish_stop(&entry, handle).await;
            });
        }

        Ok(true)
    }

    async fn await_drained(&self, entry: &ModelEntry) {
        let deadline = Instant::now() + self.config.drain_timeout();
        loop {
            let notified = entry.activity.drained.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if entry.activity.active() == 0 {
                return;
            }
            if timeout_at(deadline, notified).await.is_err() {
                warn!(
                    model = %entry.config.id,
                    active = entry.activity.active(),
                    "Drain timeout, stopping worker with requests in flight"
                );
                return;
            }
        }
    }

    /// Stop a draining worker and release its GPUs
    async fn finish_stop(&self, entry: &ModelEntry, handle: Option<WorkerHandle>) {
        let result = match &handle {
            Some(handle) => self.host.stop(handle).await,
            None => Ok(()),
        };

        let mut lc = entry.lifecycle.lock().await;
        if lc.status != ModelStatus::Draining {
            return;
        }

        lc.handle = None;
        self.reservations.lock().await.release(&entry.config.id);

        match result {
            Ok(()) => entry.transition(&mut lc, ModelStatus::Stopped),
            Err(e) => {
                error!(model = %entry.config.id, error = %e, "Failed to stop worker");
                lc.last_failure = Some(StartFailure::Host(e.to_string()));
                entry.transition(&mut lc, ModelStatus::Failed);
            }
        }
    }

    /// Account a worker failure.
    ///
    /// A running model moves to `Failed` once `failure_threshold`
    /// consecutive failures are reported, or immediately if the worker
    /// exited. Its GPUs are released and the worker is torn down.
    pub async fn report_failure(self: &Arc<Self>, model_id: &str, cause: FailureCause) {
        let Ok(entry) = self.entry(model_id) else {
            warn!(model = %model_id, "Failure reported for unknown model");
            return;
        };
        let entry = entry.clone();

        let handle = {
            let mut lc = entry.lifecycle.lock().await;
            match lc.status {
                ModelStatus::Running => {
                    lc.consecutive_failures += 1;
                    warn!(
                        model = %model_id,
                        failures = lc.consecutive_failures,
                        threshold = self.config.failure_threshold,
                        cause = %cause,
                        "Worker failure reported"
                    );
                    if !cause.is_fatal() && lc.consecutive_failures < self.config.failure_threshold {
                        return;
                    }

                    lc.last_failure = Some(StartFailure::Host(cause.to_string()));
                    self.reservations.lock().await.release(model_id);
                    entry.transition(&mut lc, ModelStatus::Failed);
                    lc.handle.take()
                }
                // The start task owns the outcome of `Starting`: its readiness
                // poll fails the start on an exited or unresponsive worker and
                // releases the GPUs itself.
                ModelStatus::Starting => {
                    lc.consecutive_failures += 1;
                    debug!(model = %model_id, cause = %cause, "Failure during startup");
                    return;
                }
                status => {
                    debug!(model = %model_id, status = %status, cause = %cause, "Ignoring failure");
                    return;
                }
            }
        };

        if let Some(handle) = handle {
            if let Err(e) = self.host.stop(&handle).await {
                warn!(model = %model_id, error = %e, "Failed to stop broken worker");
            }
        }

        if self.config.auto_restart {
            self.spawn_restart(entry);
        }
    }

    /// Reset the failure count after a healthy probe
    pub async fn record_healthy(&self, model_id: &str) {
        if let Ok(entry) = self.entry(model_id) {
            let mut lc = entry.lifecycle.lock().await;
            if lc.status == ModelStatus::Running && lc.consecutive_failures > 0 {
                debug!(model = %model_id, "Worker healthy again");
                lc.consecutive_failures = 0;
            }
        }
    }

    fn spawn_restart(self: &Arc<Self>, entry: Arc<ModelEntry>) {
        let manager = self.clone();
        tokio::spawn(async move {
            loop {
                let attempt = {
                    let mut lc = entry.lifecycle.lock().await;
                    if lc.status != ModelStatus::Failed {
                        return;
                    }
                    if lc.restart_attempts >= manager.config.max_restart_attempts {
                        warn!(model = %entry.config.id, "Giving up on background restart");
                        return;
                    }
                    lc.restart_attempts += 1;
                    lc.restart_attempts - 1
                };

                let delay = manager.config.restart_backoff(attempt);
                debug!(model = %entry.config.id, attempt, delay_ms = delay.as_millis() as u64, "Restart scheduled");
                tokio::time::sleep(delay).await;

                if entry.status() != ModelStatus::Failed
                    || manager.shutting_down.load(Ordering::Acquire)
                {
                    return;
                }

                let deadline = Instant::now() + entry.config.startup_timeout() + manager.probe_timeout;
                match manager.ensure_running(&entry.config.id, deadline).await {
                    Ok(handle) => {
                        info!(model = %entry.config.id, worker = %handle, "Background restart succeeded");
                        return;
                    }
                    Err(e) => {
                        warn!(model = %entry.config.id, attempt, error = %e, "Background restart failed");
                    }
                }
            }
        });
    }

    /// Running models and their worker handles
    pub async fn running_workers(&self) -> Vec<(Arc<ModelConfig>, WorkerHandle)> {
        let mut running = Vec::new();
        for model in self.registry.all() {
            let entry = &self.entries[&model.id];
            if entry.status() != ModelStatus::Running {
                continue;
            }
            let lc = entry.lifecycle.lock().await;
            if let (ModelStatus::Running, Some(handle)) = (lc.status, &lc.handle) {
                running.push((model.clone(), handle.clone()));
            }
        }
        running
    }

    /// Ids of models currently `Running`
    pub fn running_models(&self) -> Vec<String> {
        self.registry
            .all()
            .iter()
            .filter(|m| self.entries[&m.id].status() == ModelStatus::Running)
            .map(|m| m.id.clone())
            .collect()
    }

    /// Per-model state for the status surface
    pub async fn snapshot(&self) -> Vec<ModelSnapshot> {
        let now = Instant::now();
        let mut snapshots = Vec::with_capacity(self.entries.len());

        for model in self.registry.all() {
            let entry = &self.entries[&model.id];
            let lc = entry.lifecycle.lock().await;
            snapshots.push(ModelSnapshot {
                id: model.id.clone(),
                alias: model.alias.clone(),
                status: lc.status,
                active_requests: entry.activity.active(),
                max_concurrent: model.max_concurrent,
                idle_secs: entry
                    .activity
                    .idle_for(self.epoch, now)
                    .map(|d| d.as_secs_f64()),
                consecutive_failures: lc.consecutive_failures,
                gpus: model.gpus.clone(),
                window: model.window,
                worker: lc.handle.clone(),
            });
        }

        snapshots
    }

    /// Current GPU reservations
    pub async fn reservations(&self) -> Vec<GpuReservation> {
        self.reservations.lock().await.snapshot()
    }

    /// Run `idle_sweep` on a fixed interval
    pub fn spawn_idle_sweeper(self: Arc<Self>, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;

            loop {
                ticker.tick().await;
                let stopped = self.idle_sweep().await;
                if !stopped.is_empty() {
                    info!(models = ?stopped, "Idle sweep stopped workers");
                }
            }
        })
    }

    /// Stop every worker and release all reservations.
    ///
    /// Starts already in flight are waited for, bounded by the model's
    /// startup timeout; a start that completes after this point stops its
    /// own worker.
    pub async fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::Release);

        for model in self.registry.all() {
            let entry = &self.entries[&model.id];

            if entry.status() == ModelStatus::Starting {
                let mut rx = entry.status_tx.subscribe();
                let settle = model.startup_timeout() + self.probe_timeout;
                let settled = tokio::time::timeout(
                    settle,
                    rx.wait_for(|s| *s != ModelStatus::Starting),
                )
                .await
                    .map(|changed| changed.is_ok())
                    .unwrap_or(false);
                if !settled {
                    warn!(model = %model.id, "Start still in flight at shutdown");
                }
            }

            let handle = {
                let mut lc = entry.lifecycle.lock().await;
                if matches!(lc.status, ModelStatus::Stopped | ModelStatus::Starting) {
                    continue;
                }
                self.reservations.lock().await.release(&model.id);
                let handle = lc.handle.take();
                entry.transition(&mut lc, ModelStatus::Stopped);
                handle
            };

            if let Some(handle) = handle {
                if let Err(e) = self.host.stop(&handle).await {
                    warn!(model = %model.id, error = %e, "Failed to stop worker during shutdown");
                }
            }
        }
    }
}

/// Marks one in-flight request on a model.
///
/// Dropping the guard ends the request: the active count goes down and the
/// last-activity timestamp moves forward.
#[derive(Debug)]
pub struct ActivityGuard {
    entry: Arc<ModelEntry>,
    epoch: Instant,
}

impl ActivityGuard {
    pub fn model_id(&self) -> &str {
        &self.entry.config.id
    }
}

impl Drop for ActivityGuard {
    fn drop(&mut self) {
        self.entry.activity.touch(self.epoch);
        if self.entry.activity.active.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.entry.activity.drained.notify_waiters();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicBool;

    struct MockHost {
        starts: AtomicU32,
        stops: AtomicU32,
        start_delay: Duration,
        fail_start: AtomicBool,
        probe: std::sync::Mutex<ProbeOutcome>,
    }

    impl MockHost {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                starts: AtomicU32::new(0),
                stops: AtomicU32::new(0),
                start_delay: Duration::from_millis(100),
                fail_start: AtomicBool::new(false),
                probe: std::sync::Mutex::new(ProbeOutcome::Healthy),
            })
        }

        fn set_probe(&self, outcome: ProbeOutcome) {
            *self.probe.lock().unwrap() = outcome;
        }

        fn starts(&self) -> u32 {
            self.starts.load(Ordering::SeqCst)
        }

        fn stops(&self) -> u32 {
            self.stops.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl WorkerHost for MockHost {
        async fn start(&self, model: &ModelConfig) -> GateResult<WorkerHandle> {
            self.starts.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.start_delay).await;
            if self.fail_start.load(Ordering::SeqCst) {
                return Err(GateError::Runtime("no such binary".to_string()));
            }
            Ok(WorkerHandle::new(&model.id, model.endpoint_url()))
        }

        async fn stop(&self, _handle: &WorkerHandle) -> GateResult<()> {
            self.stops.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn probe(&self, _handle: &WorkerHandle) -> ProbeOutcome {
            *self.probe.lock().unwrap()
        }

        fn name(&self) -> &'static str {
            "mock"
        }
    }

    fn model(id: &str, gpus: &[u32]) -> ModelConfig {
        let mut cfg = ModelConfig::new(id, "http://{id}:8000");
        cfg.gpus = gpus.to_vec();
        cfg.idle_ttl_secs = 60;
        cfg.startup_timeout_secs = 10;
        cfg
    }

    fn tp_model(id: &str, gpus: &[u32], group: &str) -> ModelConfig {
        let mut cfg = model(id, gpus);
        cfg.tensor_parallel_group = Some(group.to_string());
        cfg
    }

    fn manager_with(
        models: Vec<ModelConfig>,
        host: Arc<MockHost>,
        config: LifecycleConfig,
    ) -> Arc<LifecycleManager> {
        let registry = Arc::new(ModelRegistry::new(models).unwrap());
        Arc::new(LifecycleManager::new(
            registry,
            host,
            config,
            Duration::from_secs(1),
        ))
    }

    fn fast_config() -> LifecycleConfig {
        LifecycleConfig {
            startup_poll_interval_ms: 500,
            drain_timeout_secs: 30,
            ..LifecycleConfig::default()
        }
    }

    fn far_deadline() -> Instant {
        Instant::now() + Duration::from_secs(60)
    }

    async fn wait_for_status(manager: &LifecycleManager, model_id: &str, status: ModelStatus) {
        let mut rx = manager.subscribe(model_id).unwrap();
        tokio::time::timeout(Duration::from_secs(120), rx.wait_for(|s| *s == status))
            .await
            .expect("status not reached")
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_ensure_running_starts_worker() {
        let host = MockHost::new();
        let manager = manager_with(vec![model("llama@0", &[0])], host.clone(), fast_config());

        assert_eq!(manager.status("llama@0"), Some(ModelStatus::Stopped));
        let handle = manager.ensure_running("llama@0", far_deadline()).await.unwrap();

        assert_eq!(handle.model_id, "llama@0");
        assert_eq!(manager.status("llama@0"), Some(ModelStatus::Running));
        assert_eq!(
            manager.reservations().await,
            vec![GpuReservation {
                gpu: 0,
                model: "llama@0".to_string()
            }]
        );

        // Already running: no second start
        manager.ensure_running("llama@0", far_deadline()).await.unwrap();
        assert_eq!(host.starts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_ensure_running_starts_once() {
        let host = MockHost::new();
        let manager = manager_with(vec![model("llama@0", &[0])], host.clone(), fast_config());

        let calls: Vec<_> = (0..16)
            .map(|_| {
                let manager = manager.clone();
                tokio::spawn(async move { manager.ensure_running("llama@0", far_deadline()).await })
            })
            .collect();

        let mut ids = Vec::new();
        for call in calls {
            ids.push(call.await.unwrap().unwrap().id);
        }

        assert_eq!(host.starts(), 1);
        ids.dedup();
        assert_eq!(ids.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_tensor_parallel_race_is_all_or_nothing() {
        let host = MockHost::new();
        let manager = manager_with(
            vec![tp_model("tp-a", &[0, 1], "a"), tp_model("tp-b", &[1, 2], "b")],
            host.clone(),
            fast_config(),
        );

        let (a, b) = tokio::join!(
            manager.ensure_running("tp-a", far_deadline()),
            manager.ensure_running("tp-b", far_deadline()),
        );

        let (winner, loser, loser_result) = match (&a, &b) {
            (Ok(_), Err(_)) => ("tp-a", "tp-b", b),
            (Err(_), Ok(_)) => ("tp-b", "tp-a", a),
            other => panic!("expected exactly one success, got {:?}", other),
        };
        assert!(matches!(
            loser_result,
            Err(GateError::ResourceConflict { gpu: 1, .. })
        ));

        let reservations = manager.reservations().await;
        assert_eq!(reservations.len(), 2);
        assert!(reservations.iter().all(|r| r.model == winner));
        assert_eq!(manager.status(loser), Some(ModelStatus::Stopped));
        assert_eq!(host.starts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_sweep_respects_active_requests() {
        let host = MockHost::new();
        let manager = manager_with(vec![model("llama@0", &[0])], host.clone(), fast_config());
        manager.ensure_running("llama@0", far_deadline()).await.unwrap();

        let guard = manager.begin_request("llama@0").await.unwrap().unwrap();
        assert_eq!(manager.active_requests("llama@0"), 1);

        tokio::time::advance(Duration::from_secs(120)).await;
        assert!(manager.idle_sweep().await.is_empty());
        assert_eq!(manager.status("llama@0"), Some(ModelStatus::Running));

        // Finishing the request refreshes last activity
        drop(guard);
        assert_eq!(manager.active_requests("llama@0"), 0);
        assert!(manager.idle_sweep().await.is_empty());

        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(manager.idle_sweep().await, vec!["llama@0".to_string()]);
        assert_eq!(manager.status("llama@0"), Some(ModelStatus::Stopped));
        assert_eq!(host.stops(), 1);
        assert!(manager.reservations().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_sweeper_stops_within_one_interval() {
        let host = MockHost::new();
        let manager = manager_with(vec![model("llama@0", &[0])], host.clone(), fast_config());
        manager.ensure_running("llama@0", far_deadline()).await.unwrap();

        let sweeper = manager.clone().spawn_idle_sweeper(Duration::from_secs(10));

        tokio::time::sleep(Duration::from_secs(55)).await;
        assert_eq!(manager.status("llama@0"), Some(ModelStatus::Running));

        // TTL of 60s plus one sweep interval
        tokio::time::sleep(Duration::from_secs(16)).await;
        assert_eq!(manager.status("llama@0"), Some(ModelStatus::Stopped));
        assert_eq!(host.stops(), 1);
        assert!(manager.reservations().await.is_empty());

        sweeper.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn test_startup_timeout_releases_gpus() {
        let host = MockHost::new();
        host.set_probe(ProbeOutcome::Unhealthy);
        let manager = manager_with(vec![model("llama@0", &[0])], host.clone(), fast_config());

        let result = manager.ensure_running("llama@0", far_deadline()).await;
        assert!(matches!(result, Err(GateError::StartupTimeout(_))));
        assert_eq!(manager.status("llama@0"), Some(ModelStatus::Failed));
        assert_eq!(host.stops(), 1);
        assert!(manager.reservations().await.is_empty());

        // A later request starts clean
        host.set_probe(ProbeOutcome::Healthy);
        manager.ensure_running("llama@0", far_deadline()).await.unwrap();
        assert_eq!(host.starts(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_caller_deadline_shorter_than_startup() {
        let host = MockHost::new();
        host.set_probe(ProbeOutcome::Unreachable);
        let manager = manager_with(vec![model("llama@0", &[0])], host.clone(), fast_config());

        let deadline = Instant::now() + Duration::from_secs(1);
        let result = manager.ensure_running("llama@0", deadline).await;
        assert!(matches!(result, Err(GateError::StartupTimeout(_))));
        assert_eq!(manager.status("llama@0"), Some(ModelStatus::Starting));

        host.set_probe(ProbeOutcome::Healthy);
        wait_for_status(&manager, "llama@0", ModelStatus::Running).await;
        assert_eq!(host.starts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_host_start_error() {
        let host = MockHost::new();
        host.fail_start.store(true, Ordering::SeqCst);
        let manager = manager_with(vec![model("llama@0", &[0])], host.clone(), fast_config());

        let result = manager.ensure_running("llama@0", far_deadline()).await;
        assert!(matches!(result, Err(GateError::WorkerStart { .. })));
        assert_eq!(manager.status("llama@0"), Some(ModelStatus::Failed));
        assert!(manager.reservations().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_exit_during_startup() {
        let host = MockHost::new();
        host.set_probe(ProbeOutcome::Exited);
        let manager = manager_with(vec![model("llama@0", &[0])], host.clone(), fast_config());

        let result = manager.ensure_running("llama@0", far_deadline()).await;
        assert!(matches!(result, Err(GateError::WorkerStart { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failures_past_threshold_fail_model() {
        let host = MockHost::new();
        let manager = manager_with(vec![model("llama@0", &[0])], host.clone(), fast_config());
        manager.ensure_running("llama@0", far_deadline()).await.unwrap();

        let probe_failure = FailureCause::ProbeFailed(ProbeOutcome::Unreachable);
        manager.report_failure("llama@0", probe_failure.clone()).await;
        manager.report_failure("llama@0", probe_failure.clone()).await;
        assert_eq!(manager.status("llama@0"), Some(ModelStatus::Running));

        manager.report_failure("llama@0", probe_failure).await;
        assert_eq!(manager.status("llama@0"), Some(ModelStatus::Failed));
        assert!(manager.reservations().await.is_empty());
        assert_eq!(host.stops(), 1);

        manager.ensure_running("llama@0", far_deadline()).await.unwrap();
        assert_eq!(host.starts(), 2);
        assert_eq!(manager.status("llama@0"), Some(ModelStatus::Running));
    }

    #[tokio::test(start_paused = true)]
    async fn test_healthy_probe_resets_failures() {
        let host = MockHost::new();
        let manager = manager_with(vec![model("llama@0", &[0])], host.clone(), fast_config());
        manager.ensure_running("llama@0", far_deadline()).await.unwrap();

        let cause = FailureCause::ProbeFailed(ProbeOutcome::Unhealthy);
        manager.report_failure("llama@0", cause.clone()).await;
        manager.report_failure("llama@0", cause.clone()).await;
        manager.record_healthy("llama@0").await;
        manager.report_failure("llama@0", cause).await;

        assert_eq!(manager.status("llama@0"), Some(ModelStatus::Running));
    }

    #[tokio::test(start_paused = true)]
    async fn test_exit_fails_immediately() {
        let host = MockHost::new();
        let manager = manager_with(vec![model("llama@0", &[0])], host.clone(), fast_config());
        manager.ensure_running("llama@0", far_deadline()).await.unwrap();

        manager.report_failure("llama@0", FailureCause::Exited).await;
        assert_eq!(manager.status("llama@0"), Some(ModelStatus::Failed));
    }

    #[tokio::test(start_paused = true)]
    async fn test_auto_restart_after_failure() {
        let host = MockHost::new();
        let config = LifecycleConfig {
            auto_restart: true,
            ..fast_config()
        };
        let manager = manager_with(vec![model("llama@0", &[0])], host.clone(), config);
        manager.ensure_running("llama@0", far_deadline()).await.unwrap();

        manager.report_failure("llama@0", FailureCause::Exited).await;
        assert_eq!(manager.status("llama@0"), Some(ModelStatus::Failed));

        wait_for_status(&manager, "llama@0", ModelStatus::Running).await;
        assert_eq!(host.starts(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_force_drain_waits_for_in_flight() {
        let host = MockHost::new();
        let manager = manager_with(vec![model("llama@0", &[0])], host.clone(), fast_config());
        manager.ensure_running("llama@0", far_deadline()).await.unwrap();

        let guard = manager.begin_request("llama@0").await.unwrap().unwrap();
        assert!(manager.force_drain("llama@0", "window closed").await.unwrap());
        assert_eq!(manager.status("llama@0"), Some(ModelStatus::Draining));

        // No new work while draining
        assert!(manager.begin_request("llama@0").await.unwrap().is_none());

        drop(guard);
        wait_for_status(&manager, "llama@0", ModelStatus::Stopped).await;
        assert_eq!(host.stops(), 1);
        assert!(manager.reservations().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_force_drain_hard_timeout() {
        let host = MockHost::new();
        let manager = manager_with(vec![model("llama@0", &[0])], host.clone(), fast_config());
        manager.ensure_running("llama@0", far_deadline()).await.unwrap();

        let _stuck = manager.begin_request("llama@0").await.unwrap().unwrap();
        manager.force_drain("llama@0", "window closed").await.unwrap();

        wait_for_status(&manager, "llama@0", ModelStatus::Stopped).await;
        assert_eq!(manager.active_requests("llama@0"), 1);
        assert_eq!(host.stops(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_during_drain_restarts_after_stop() {
        let host = MockHost::new();
        let manager = manager_with(vec![model("llama@0", &[0])], host.clone(), fast_config());
        manager.ensure_running("llama@0", far_deadline()).await.unwrap();

        let guard = manager.begin_request("llama@0").await.unwrap().unwrap();
        manager.force_drain("llama@0", "test").await.unwrap();

        let waiter = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.ensure_running("llama@0", far_deadline()).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        drop(guard);

        waiter.await.unwrap().unwrap();
        assert_eq!(host.starts(), 2);
        assert_eq!(manager.status("llama@0"), Some(ModelStatus::Running));
    }

    #[tokio::test(start_paused = true)]
    async fn test_begin_request_requires_running() {
        let host = MockHost::new();
        let manager = manager_with(vec![model("llama@0", &[0])], host, fast_config());
        assert!(manager.begin_request("llama@0").await.unwrap().is_none());
        assert!(matches!(
            manager.begin_request("nope").await,
            Err(GateError::ModelNotFound(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_snapshot_and_shutdown() {
        let host = MockHost::new();
        let manager = manager_with(
            vec![model("llama@0", &[0]), model("bge-m3", &[1])],
            host.clone(),
            fast_config(),
        );
        manager.ensure_running("llama@0", far_deadline()).await.unwrap();

        let snapshot = manager.snapshot().await;
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[0].status, ModelStatus::Running);
        assert!(snapshot[0].worker.is_some());
        assert!(snapshot[0].idle_secs.is_some());
        assert_eq!(snapshot[1].status, ModelStatus::Stopped);
        assert!(snapshot[1].idle_secs.is_none());
        assert_eq!(manager.running_models(), vec!["llama@0".to_string()]);

        manager.shutdown().await;
        assert_eq!(manager.status("llama@0"), Some(ModelStatus::Stopped));
        assert!(manager.reservations().await.is_empty());
        assert_eq!(host.stops(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_stops_start_in_flight() {
        let host = MockHost::new();
        host.set_probe(ProbeOutcome::Unreachable);
        let manager = manager_with(vec![model("llama@0", &[0])], host.clone(), fast_config());

        let starter = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.ensure_running("llama@0", far_deadline()).await })
        };
        wait_for_status(&manager, "llama@0", ModelStatus::Starting).await;

        let shutdown = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.shutdown().await })
        };
        tokio::time::sleep(Duration::from_secs(2)).await;
        host.set_probe(ProbeOutcome::Healthy);

        shutdown.await.unwrap();
        assert_eq!(manager.status("llama@0"), Some(ModelStatus::Stopped));
        assert!(manager.reservations().await.is_empty());
        assert_eq!(host.stops(), 1);

        // No new starts once shut down
        let _ = starter.await.unwrap();
        assert!(matches!(
            manager.ensure_running("llama@0", far_deadline()).await,
            Err(GateError::WorkerStart { .. })
        ));
        assert_eq!(host.starts(), 1);
    }
}
