//! Per-model admission control
//!
//! A bounded counter per model id. Acquisition never waits: when a model is
//! at capacity the caller gets `Overloaded` immediately and decides itself
//! whether to retry.

use gpugate_core::{GateError, GateResult, ModelRegistry};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use tracing::debug;

#[derive(Debug)]
struct SlotCounter {
    active: AtomicU32,
    capacity: u32,
}

impl SlotCounter {
    fn try_increment(&self) -> bool {
        self.active
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < self.capacity).then_some(n + 1)
            })
            .is_ok()
    }
}

/// Concurrency limiter keyed by model id
#[derive(Debug)]
pub struct AdmissionGate {
    slots: HashMap<String, Arc<SlotCounter>>,
}

impl AdmissionGate {
    /// Create a gate with one counter per registered model
    pub fn new(registry: &ModelRegistry) -> Self {
        let slots = registry
            .all()
            .iter()
            .map(|m| {
                (
                    m.id.clone(),
                    Arc::new(SlotCounter {
                        active: AtomicU32::new(0),
                        capacity: m.max_concurrent,
                    }),
                )
            })
            .collect();

        Self { slots }
    }

    /// Take an admission slot for `model_id` without waiting.
    pub fn try_acquire(&self, model_id: &str) -> GateResult<AdmissionToken> {
        let counter = self
            .slots
            .get(model_id)
            .ok_or_else(|| GateError::ModelNotFound(model_id.to_string()))?;

        if !counter.try_increment() {
            debug!(model = %model_id, capacity = counter.capacity, "Admission rejected");
            return Err(GateError::Overloaded {
                model: model_id.to_string(),
                limit: counter.capacity,
            });
        }

        Ok(AdmissionToken {
            model_id: model_id.to_string(),
            counter: counter.clone(),
            released: AtomicBool::new(false),
        })
    }

    /// Return a slot. Safe to call on an already released token.
    pub fn release(&self, token: &AdmissionToken) {
        token.release();
    }

    /// Requests currently admitted to `model_id`
    pub fn in_flight(&self, model_id: &str) -> u32 {
        self.slots
            .get(model_id)
            .map(|c| c.active.load(Ordering::Acquire))
            .unwrap_or(0)
    }

    /// Configured capacity of `model_id`
    pub fn capacity(&self, model_id: &str) -> Option<u32> {
        self.slots.get(model_id).map(|c| c.capacity)
    }
}

/// One admission slot. Released exactly once, explicitly or on drop.
#[derive(Debug)]
pub struct AdmissionToken {
    model_id: String,
    counter: Arc<SlotCounter>,
    released: AtomicBool,
}

impl AdmissionToken {
    pub fn model_id(&self) -> &str {
        &self.model_id
    }

    /// Give the slot back; later calls are no-ops
    pub fn release(&self) {
        if !self.released.swap(true, Ordering::AcqRel) {
            self.counter.active.fetch_sub(1, Ordering::AcqRel);
        }
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }
}

impl Drop for AdmissionToken {
    fn drop(&mut self) {
        self.release();
    }
}
