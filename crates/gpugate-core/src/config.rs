//! Configuration types for gpugate

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

use crate::error::{GateError, GateResult};
use crate::model::{CallerSource, ModelConfig};
use crate::registry::ModelRegistry;
use crate::window::AvailabilityWindow;

/// Main daemon configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// API server configuration
    pub api: ApiConfig,
    /// Worker lifecycle configuration
    pub lifecycle: LifecycleConfig,
    /// Worker host configuration
    pub runtime: RuntimeConfig,
    /// Health monitoring configuration
    pub health: HealthConfig,
    /// Request routing configuration
    pub routing: RoutingConfig,
    /// Availability window scheduling
    pub availability: AvailabilityConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
    /// Optional GPU inventory used for validation
    pub gpus: Vec<GpuSpec>,
    /// Servable models
    pub models: Vec<ModelConfig>,
}

impl DaemonConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &std::path::Path) -> GateResult<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| GateError::Config(format!("Failed to read config file: {}", e)))?;
        Self::from_toml(&content)
    }

    /// Parse and validate configuration from TOML text
    pub fn from_toml(content: &str) -> GateResult<Self> {
        let config: Self = toml::from_str(content)
            .map_err(|e| GateError::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Build the immutable model registry from the configured models
    pub fn registry(&self) -> GateResult<ModelRegistry> {
        ModelRegistry::new(self.models.clone())
    }

    /// Check cross-field invariants that serde cannot express
    pub fn validate(&self) -> GateResult<()> {
        if self.models.is_empty() {
            return Err(GateError::Config("no models configured".to_string()));
        }

        for (name, secs) in [
            ("lifecycle.idle_sweep_interval_secs", self.lifecycle.idle_sweep_interval_secs),
            ("health.probe_interval_secs", self.health.probe_interval_secs),
            ("availability.tick_interval_secs", self.availability.tick_interval_secs),
        ] {
            if secs == 0 {
                return Err(GateError::Config(format!("{} must be positive", name)));
            }
        }

        // Duplicate ids and alias clashes
        self.registry()?;

        let inventory: HashMap<u32, u64> =
            self.gpus.iter().map(|g| (g.index, g.memory_mb)).collect();
        let mut groups: HashMap<&str, (&str, BTreeSet<u32>)> = HashMap::new();

        for model in &self.models {
            if model.max_concurrent == 0 {
                return Err(GateError::Config(format!(
                    "model '{}': max_concurrent must be at least 1",
                    model.id
                )));
            }

            if let AvailabilityWindow::Hours { start, end } = model.window {
                if start >= 24 || end >= 24 {
                    return Err(GateError::Config(format!(
                        "model '{}': window hours must be in 0..24",
                        model.id
                    )));
                }
                if start == end {
                    return Err(GateError::Config(format!(
                        "model '{}': zero-length window (use \"always\")",
                        model.id
                    )));
                }
            }

            let gpu_set: BTreeSet<u32> = model.gpus.iter().copied().collect();
            if gpu_set.len() != model.gpus.len() {
                return Err(GateError::Config(format!(
                    "model '{}': GPU listed twice",
                    model.id
                )));
            }

            if let Some(group) = &model.tensor_parallel_group {
                if gpu_set.len() < 2 {
                    return Err(GateError::Config(format!(
                        "model '{}': tensor-parallel group '{}' needs at least two GPUs",
                        model.id, group
                    )));
                }
                match groups.get(group.as_str()) {
                    Some((first, set)) if *set != gpu_set => {
                        return Err(GateError::Config(format!(
                            "tensor-parallel group '{}': '{}' and '{}' declare different GPUs",
                            group, first, model.id
                        )));
                    }
                    Some(_) => {}
                    None => {
                        groups.insert(group, (&model.id, gpu_set.clone()));
                    }
                }
            }

            if !inventory.is_empty() {
                let mut memory = 0u64;
                for gpu in &gpu_set {
                    match inventory.get(gpu) {
                        Some(mb) => memory += mb,
                        None => {
                            return Err(GateError::Config(format!(
                                "model '{}': GPU {} is not in the inventory",
                                model.id, gpu
                            )))
                        }
                    }
                }
                if model.vram_mb > memory {
                    return Err(GateError::Config(format!(
                        "model '{}': needs {} MiB VRAM but its GPUs have {} MiB",
                        model.id, model.vram_mb, memory
                    )));
                }
            }
        }

        Ok(())
    }
}

/// API server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    /// Address to bind the HTTP server
    pub address: String,
    /// Port for the HTTP server
    pub port: u16,
    /// Enable CORS
    pub cors_enabled: bool,
    /// Allowed CORS origins
    pub cors_origins: Vec<String>,
    /// Accepted bearer tokens; empty disables authentication
    pub keys: Vec<ApiKey>,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            address: "0.0.0.0".to_string(),
            port: 8080,
            cors_enabled: false,
            cors_origins: vec!["*".to_string()],
            keys: Vec::new(),
        }
    }
}

/// One accepted bearer token
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiKey {
    /// Caller identity reported in logs
    pub name: String,
    /// Expected bearer token
    pub token: String,
    /// Default request source for this caller
    #[serde(default)]
    pub source: CallerSource,
}

/// Worker lifecycle configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LifecycleConfig {
    /// Interval between idle sweeps in seconds
    pub idle_sweep_interval_secs: u64,
    /// Consecutive failures that force a running worker into Failed
    pub failure_threshold: u32,
    /// Hard bound on waiting for in-flight requests while draining
    pub drain_timeout_secs: u64,
    /// Readiness poll interval during startup in milliseconds
    pub startup_poll_interval_ms: u64,
    /// Restart failed workers in the background
    pub auto_restart: bool,
    /// First restart delay in milliseconds
    pub restart_backoff_base_ms: u64,
    /// Upper bound on the restart delay in seconds
    pub restart_backoff_max_secs: u64,
    /// Background restart attempts before giving up
    pub max_restart_attempts: u32,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            idle_sweep_interval_secs: 60,
            failure_threshold: 3,
            drain_timeout_secs: 120,
            startup_poll_interval_ms: 2000,
            auto_restart: false,
            restart_backoff_base_ms: 1000,
            restart_backoff_max_secs: 60,
            max_restart_attempts: 5,
        }
    }
}

impl LifecycleConfig {
    pub fn idle_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.idle_sweep_interval_secs)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }

    pub fn startup_poll_interval(&self) -> Duration {
        Duration::from_millis(self.startup_poll_interval_ms)
    }

    /// Delay before background restart attempt `attempt` (0-based),
    /// doubling from the base and capped at the maximum.
    pub fn restart_backoff(&self, attempt: u32) -> Duration {
        let base = Duration::from_millis(self.restart_backoff_base_ms);
        let max = Duration::from_secs(self.restart_backoff_max_secs);
        base.saturating_mul(2u32.saturating_pow(attempt.min(16)))
            .min(max)
    }
}

/// Worker host configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Grace period between SIGTERM and kill when stopping a worker
    pub stop_grace_secs: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self { stop_grace_secs: 45 }
    }
}

/// Health monitoring configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    /// Probe interval in seconds
    pub probe_interval_secs: u64,
    /// Probe timeout in seconds
    pub probe_timeout_secs: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            probe_interval_secs: 10,
            probe_timeout_secs: 5,
        }
    }
}

impl HealthConfig {
    pub fn probe_interval(&self) -> Duration {
        Duration::from_secs(self.probe_interval_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }
}

/// Request routing configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutingConfig {
    /// Estimated tokens above which long-context variants are preferred
    pub long_context_threshold: u32,
    /// Completion budget assumed when a request omits `max_tokens`
    pub default_max_tokens: u32,
    /// Characters per token used by the estimator
    pub chars_per_token: u32,
    /// Cold start wait for interactive callers
    pub interactive_deadline_secs: u64,
    /// Cold start wait for batch callers
    pub batch_deadline_secs: u64,
    /// Upper bound on a forwarded request, including streaming
    pub request_timeout_secs: u64,
    /// Try the next variant of the same alias on GPU contention
    pub fallback_on_conflict: bool,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            long_context_threshold: 4096,
            default_max_tokens: 512,
            chars_per_token: 4,
            interactive_deadline_secs: 45,
            batch_deadline_secs: 180,
            request_timeout_secs: 600,
            fallback_on_conflict: false,
        }
    }
}

impl RoutingConfig {
    /// Cold start deadline for a request source
    pub fn startup_deadline(&self, source: CallerSource) -> Duration {
        match source {
            CallerSource::Interactive => Duration::from_secs(self.interactive_deadline_secs),
            CallerSource::Batch => Duration::from_secs(self.batch_deadline_secs),
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Availability window scheduling
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AvailabilityConfig {
    /// Interval between window checks in seconds
    pub tick_interval_secs: u64,
    /// Clock windows are evaluated against
    pub clock: ClockKind,
}

impl Default for AvailabilityConfig {
    fn default() -> Self {
        Self {
            tick_interval_secs: 30,
            clock: ClockKind::Local,
        }
    }
}

/// Wall clock used for availability windows
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClockKind {
    #[default]
    Local,
    Utc,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level or filter directive
    pub level: String,
    /// Log format (json or text)
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "text".to_string(),
        }
    }
}

/// One GPU of the inventory
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GpuSpec {
    /// Device index
    pub index: u32,
    /// Device memory in MiB
    pub memory_mb: u64,
}
