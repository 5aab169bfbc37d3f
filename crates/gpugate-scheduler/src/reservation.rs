//! GPU reservation table
//!
//! Tracks which model occupies each GPU. A model's GPU set, including a full
//! tensor-parallel group, is reserved or released as a unit.

use gpugate_core::{GateError, GateResult};
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::{debug, info};

/// Mapping from GPU index to the model currently holding it
#[derive(Debug, Default)]
pub struct GpuReservationTable {
    holders: BTreeMap<u32, String>,
}

impl GpuReservationTable {
    /// Create an empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve every GPU in `gpus` for `model_id`, or none of them.
    ///
    /// GPUs already held by the same model count as acquired, so retrying a
    /// reservation is harmless. The first GPU held by another model is
    /// reported in the `ResourceConflict` error.
    pub fn try_reserve(&mut self, model_id: &str, gpus: &[u32]) -> GateResult<()> {
        if let Some((gpu, holder)) = gpus.iter().find_map(|gpu| {
            self.holders
                .get(gpu)
                .filter(|holder| holder.as_str() != model_id)
                .map(|holder| (*gpu, holder.clone()))
        }) {
            return Err(GateError::ResourceConflict {
                model: model_id.to_string(),
                gpu,
                holder,
            });
        }

        for gpu in gpus {
            self.holders.insert(*gpu, model_id.to_string());
        }

        if !gpus.is_empty() {
            info!(model = %model_id, gpus = ?gpus, "Reserved GPUs");
        }

        Ok(())
    }

    /// Release every GPU held by `model_id`, returning the freed indices
    pub fn release(&mut self, model_id: &str) -> Vec<u32> {
        let freed: Vec<u32> = self
            .holders
            .iter()
            .filter(|(_, holder)| holder.as_str() == model_id)
            .map(|(gpu, _)| *gpu)
            .collect();

        for gpu in &freed {
            self.holders.remove(gpu);
            debug!(gpu = gpu, model = %model_id, "Released GPU");
        }

        freed
    }

    /// Model holding `gpu`, if any
    pub fn holder(&self, gpu: u32) -> Option<&str> {
        self.holders.get(&gpu).map(String::as_str)
    }

    /// GPUs held by `model_id`
    pub fn held_by(&self, model_id: &str) -> Vec<u32> {
        self.holders
            .iter()
            .filter(|(_, holder)| holder.as_str() == model_id)
            .map(|(gpu, _)| *gpu)
            .collect()
    }

    /// Current reservations ordered by GPU index
    pub fn snapshot(&self) -> Vec<GpuReservation> {
        self.holders
            .iter()
            .map(|(gpu, model)| GpuReservation {
                gpu: *gpu,
                model: model.clone(),
            })
            .collect()
    }
}

/// One entry of the reservation table
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GpuReservation {
    pub gpu: u32,
    pub model: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reserve_and_release() {
        let mut table = GpuReservationTable::new();
        table.try_reserve("llama@0", &[0]).unwrap();
        assert_eq!(table.holder(0), Some("llama@0"));

        assert_eq!(table.release("llama@0"), vec![0]);
        assert_eq!(table.holder(0), None);
    }

    #[test]
    fn test_reserve_is_idempotent_for_holder() {
        let mut table = GpuReservationTable::new();
        table.try_reserve("llama@0", &[0]).unwrap();
        table.try_reserve("llama@0", &[0]).unwrap();
        assert_eq!(table.held_by("llama@0"), vec![0]);
    }

    #[test]
    fn test_tensor_parallel_all_or_nothing() {
        let mut table = GpuReservationTable::new();
        table.try_reserve("llama@1", &[1]).unwrap();

        let err = table.try_reserve("big-tp", &[0, 1]).unwrap_err();
        match err {
            GateError::ResourceConflict { gpu, holder, .. } => {
                assert_eq!(gpu, 1);
                assert_eq!(holder, "llama@1");
            }
            other => panic!("unexpected error: {other}"),
        }

        // GPU 0 must not be left half-reserved
        assert_eq!(table.holder(0), None);
        assert!(table.held_by("big-tp").is_empty());

        table.release("llama@1");
        table.try_reserve("big-tp", &[0, 1]).unwrap();
        assert_eq!(table.held_by("big-tp"), vec![0, 1]);
    }

    #[test]
    fn test_release_unknown_model() {
        let mut table = GpuReservationTable::new();
        table.try_reserve("a", &[0]).unwrap();
        assert!(table.release("b").is_empty());
        assert_eq!(
            table.snapshot(),
            vec![GpuReservation {
                gpu: 0,
                model: "a".to_string()
            }]
        );
    }

    #[test]
    fn test_cpu_only_model() {
        let mut table = GpuReservationTable::new();
        table.try_reserve("cpu-model", &[]).unwrap();
        assert!(table.snapshot().is_empty());
    }
}
