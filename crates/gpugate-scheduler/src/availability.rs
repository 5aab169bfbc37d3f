//! Availability window scheduling
//!
//! Decides which models may serve at a given time of day and drains
//! running models when their window closes.

use chrono::{NaiveTime, Timelike};
use gpugate_core::{ClockKind, GateError, GateResult, ModelConfig, ModelRegistry};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

use crate::lifecycle::LifecycleManager;

/// Source of the wall-clock time of day
pub trait Clock: Send + Sync {
    fn time_of_day(&self) -> NaiveTime;
}

/// Clock backed by the system time
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock {
    kind: ClockKind,
}

impl SystemClock {
    pub fn new(kind: ClockKind) -> Self {
        Self { kind }
    }
}

impl Clock for SystemClock {
    fn time_of_day(&self) -> NaiveTime {
        match self.kind {
            ClockKind::Local => chrono::Local::now().time(),
            ClockKind::Utc => chrono::Utc::now().time(),
        }
    }
}

/// Whether `model` may serve at `now`
pub fn is_allowed(model: &ModelConfig, now: NaiveTime) -> bool {
    model.window.is_open_at(now)
}

/// Window state remembered between ticks
#[derive(Debug, Default)]
struct WindowTracker {
    /// Window state seen at the previous tick, per model id
    open: HashMap<String, bool>,
    /// Models already drained during their current closed period
    drained: HashSet<String>,
}

/// Time-window policy over the registered models
pub struct AvailabilityScheduler {
    registry: Arc<ModelRegistry>,
    clock: Arc<dyn Clock>,
    tracker: Mutex<WindowTracker>,
}

impl AvailabilityScheduler {
    pub fn new(registry: Arc<ModelRegistry>, clock: Arc<dyn Clock>) -> Self {
        Self {
            registry,
            clock,
            tracker: Mutex::new(WindowTracker::default()),
        }
    }

    /// Whether `model` may serve right now
    pub fn is_allowed_now(&self, model: &ModelConfig) -> bool {
        is_allowed(model, self.clock.time_of_day())
    }

    /// Fail with `ModelUnavailable` when the model's window is closed
    pub fn check(&self, model: &ModelConfig) -> GateResult<()> {
        let now = self.clock.time_of_day();
        if is_allowed(model, now) {
            return Ok(());
        }

        info!(
            model = %model.id,
            window = %model.window,
            now = %format!("{:02}:{:02}", now.hour(), now.minute()),
            "Request outside availability window"
        );
        Err(GateError::ModelUnavailable {
            model: model.id.clone(),
            window: model.window.to_string(),
        })
    }

    /// Running models that must be drained because their window is closed.
    ///
    /// Each model is returned at most once per closed period, on the first
    /// tick it is seen running outside its window. That covers the closing
    /// edge as well as a model that only reaches `Running` later in the
    /// period. Stopping while closed, or the window reopening, clears the
    /// marker.
    pub fn models_to_force_stop(&self, now: NaiveTime, running: &[String]) -> Vec<String> {
        let mut tracker = self.tracker.lock().unwrap_or_else(|e| e.into_inner());
        let WindowTracker { open: last_open, drained } = &mut *tracker;
        let mut closing = Vec::new();

        for model in self.registry.all() {
            if model.window.is_always() {
                continue;
            }

            let open = is_allowed(model, now);
            let was_open = last_open.insert(model.id.clone(), open).unwrap_or(true);

            if was_open != open {
                info!(model = %model.id, window = %model.window, open, "Availability window changed");
            }

            if open {
                drained.remove(&model.id);
                continue;
            }

            if !running.iter().any(|id| id == &model.id) {
                drained.remove(&model.id);
            } else if drained.insert(model.id.clone()) {
                closing.push(model.id.clone());
            }
        }

        closing
    }

    /// Drain every running model outside its window
    pub async fn tick(&self, lifecycle: &Arc<LifecycleManager>) -> Vec<String> {
        let running = lifecycle.running_models();
        let closing = self.models_to_force_stop(self.clock.time_of_day(), &running);

        for model_id in &closing {
            if let Err(e) = lifecycle.force_drain(model_id, "availability window closed").await {
                warn!(model = %model_id, error = %e, "Failed to drain model");
            }
        }

        closing
    }

    /// Run `tick` on a fixed interval
    pub fn spawn_ticker(
        self: Arc<Self>,
        lifecycle: Arc<LifecycleManager>,
        interval: Duration,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;
                self.tick(&lifecycle).await;
            }
        })
    }
}
