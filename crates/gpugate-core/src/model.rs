//! Model configuration, worker handles and per-request types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::{Duration, Instant};
use uuid::Uuid;

use crate::window::AvailabilityWindow;

/// Static description of one servable model variant
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Unique model id (e.g. "llama31-8b@0")
    pub id: String,
    /// Declared name shared by the variants of one model family (e.g. "llama")
    #[serde(default)]
    pub alias: Option<String>,
    /// Worker base URL; `{id}` is replaced with the model id
    pub endpoint: String,
    /// GPU indices the worker occupies
    #[serde(default)]
    pub gpus: Vec<u32>,
    /// Estimated VRAM footprint in MiB
    #[serde(default)]
    pub vram_mb: u64,
    /// Maximum context length in tokens
    #[serde(default = "default_max_context_tokens")]
    pub max_context_tokens: u32,
    /// Maximum concurrent requests admitted to the worker
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: u32,
    /// Tensor-parallel group id; all GPUs of the group are reserved together
    #[serde(default)]
    pub tensor_parallel_group: Option<String>,
    /// Time-of-day availability
    #[serde(default)]
    pub window: AvailabilityWindow,
    /// Inactivity after which the worker is stopped
    #[serde(default = "default_idle_ttl_secs")]
    pub idle_ttl_secs: u64,
    /// Upper bound on cold start duration
    #[serde(default = "default_startup_timeout_secs")]
    pub startup_timeout_secs: u64,
    /// Routing profile of this variant
    #[serde(default)]
    pub profile: VariantProfile,
    /// What kind of requests the worker serves
    #[serde(default)]
    pub kind: WorkerKind,
    /// Liveness path probed on the worker
    #[serde(default = "default_health_path")]
    pub health_path: String,
    /// How to launch the worker (process host only)
    #[serde(default)]
    pub launch: Option<LaunchSpec>,
}

fn default_max_context_tokens() -> u32 {
    8192
}

fn default_max_concurrent() -> u32 {
    4
}

fn default_idle_ttl_secs() -> u64 {
    20 * 60
}

fn default_startup_timeout_secs() -> u64 {
    180
}

fn default_health_path() -> String {
    "/health".to_string()
}

impl ModelConfig {
    /// Create a model config with default limits
    pub fn new(id: impl Into<String>, endpoint: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            alias: None,
            endpoint: endpoint.into(),
            gpus: Vec::new(),
            vram_mb: 0,
            max_context_tokens: default_max_context_tokens(),
            max_concurrent: default_max_concurrent(),
            tensor_parallel_group: None,
            window: AvailabilityWindow::Always,
            idle_ttl_secs: default_idle_ttl_secs(),
            startup_timeout_secs: default_startup_timeout_secs(),
            profile: VariantProfile::default(),
            kind: WorkerKind::default(),
            health_path: default_health_path(),
            launch: None,
        }
    }

    /// Name clients use to address this model
    pub fn declared_name(&self) -> &str {
        self.alias.as_deref().unwrap_or(&self.id)
    }

    /// Resolved worker base URL, without a trailing slash
    pub fn endpoint_url(&self) -> String {
        self.endpoint
            .replace("{id}", &self.id)
            .trim_end_matches('/')
            .to_string()
    }

    pub fn idle_ttl(&self) -> Duration {
        Duration::from_secs(self.idle_ttl_secs)
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_secs(self.startup_timeout_secs)
    }

    pub fn is_tensor_parallel(&self) -> bool {
        self.tensor_parallel_group.is_some()
    }
}

/// Routing profile of a variant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum VariantProfile {
    /// Larger context, lower latency per interactive session
    LongContext,
    /// Higher aggregate throughput for batch traffic
    #[default]
    Throughput,
}

impl std::fmt::Display for VariantProfile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VariantProfile::LongContext => write!(f, "long-context"),
            VariantProfile::Throughput => write!(f, "throughput"),
        }
    }
}

/// Kind of traffic a worker serves
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerKind {
    #[default]
    Chat,
    Embeddings,
    Rerank,
}

impl std::fmt::Display for WorkerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkerKind::Chat => write!(f, "chat"),
            WorkerKind::Embeddings => write!(f, "embeddings"),
            WorkerKind::Rerank => write!(f, "rerank"),
        }
    }
}

/// Command used by the process host to launch a worker
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LaunchSpec {
    /// Executable path
    pub command: String,
    /// Arguments; `{id}` and `{gpus}` are substituted
    #[serde(default)]
    pub args: Vec<String>,
    /// Extra environment variables
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

/// Lifecycle status of a model's worker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelStatus {
    /// No worker
    Stopped,
    /// Worker launched, waiting for readiness
    Starting,
    /// Worker ready and admitting requests
    Running,
    /// No new work admitted; stopping once in-flight requests finish
    Draining,
    /// Start failed or the worker crashed
    Failed,
}

impl std::fmt::Display for ModelStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ModelStatus::Stopped => write!(f, "Stopped"),
            ModelStatus::Starting => write!(f, "Starting"),
            ModelStatus::Running => write!(f, "Running"),
            ModelStatus::Draining => write!(f, "Draining"),
            ModelStatus::Failed => write!(f, "Failed"),
        }
    }
}

/// Handle to a started worker, returned by the worker host
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerHandle {
    /// Unique handle id
    pub id: Uuid,
    /// Model the worker serves
    pub model_id: String,
    /// Base URL requests are forwarded to
    pub endpoint: String,
    /// Process ID (process host only)
    pub pid: Option<u32>,
    /// Start timestamp
    pub started_at: DateTime<Utc>,
}

impl WorkerHandle {
    /// Create a new handle
    pub fn new(model_id: impl Into<String>, endpoint: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            model_id: model_id.into(),
            endpoint: endpoint.into(),
            pid: None,
            started_at: Utc::now(),
        }
    }
}

impl std::fmt::Display for WorkerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.pid {
            Some(pid) => write!(f, "{}@{} (pid {})", self.model_id, self.endpoint, pid),
            None => write!(f, "{}@{}", self.model_id, self.endpoint),
        }
    }
}

/// Result of a liveness probe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProbeOutcome {
    /// Worker answered successfully
    Healthy,
    /// Worker answered with an error
    Unhealthy,
    /// Worker did not answer
    Unreachable,
    /// Worker process is gone
    Exited,
}

/// Where a request comes from; drives variant preference
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallerSource {
    /// A person waiting on the answer
    #[default]
    Interactive,
    /// Automation and bulk jobs
    Batch,
}

impl std::str::FromStr for CallerSource {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "interactive" => Ok(CallerSource::Interactive),
            "batch" => Ok(CallerSource::Batch),
            other => Err(format!("unknown request source '{}'", other)),
        }
    }
}

impl std::fmt::Display for CallerSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CallerSource::Interactive => write!(f, "interactive"),
            CallerSource::Batch => write!(f, "batch"),
        }
    }
}

/// Per-request routing context
#[derive(Debug, Clone)]
pub struct RequestContext {
    /// Request id, propagated to the worker as `X-Request-ID`
    pub request_id: Uuid,
    /// Caller identity (API key name)
    pub caller: String,
    /// Declared traffic source
    pub source: CallerSource,
    /// Model name from the request body
    pub declared_model: String,
    /// Estimated prompt + completion tokens
    pub estimated_tokens: Option<u32>,
    /// Latest instant the request may wait for a cold start
    pub deadline: Instant,
    /// Model id the request resolved to
    pub target: Option<String>,
}

impl RequestContext {
    pub fn new(
        caller: impl Into<String>,
        source: CallerSource,
        declared_model: impl Into<String>,
        estimated_tokens: Option<u32>,
        deadline: Instant,
    ) -> Self {
        Self {
            request_id: Uuid::new_v4(),
            caller: caller.into(),
            source,
            declared_model: declared_model.into(),
            estimated_tokens,
            deadline,
            target: None,
        }
    }
}

/// Point-in-time view of one model, exposed on the status surface
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelSnapshot {
    pub id: String,
    pub alias: Option<String>,
    pub status: ModelStatus,
    pub active_requests: u32,
    pub max_concurrent: u32,
    /// Seconds since the last admitted or completed request, if any
    pub idle_secs: Option<f64>,
    pub consecutive_failures: u32,
    pub gpus: Vec<u32>,
    pub window: AvailabilityWindow,
    pub worker: Option<WorkerHandle>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_model_config_new() {
        let cfg = ModelConfig::new("llama@0", "http://llama_0:8000");
        assert_eq!(cfg.max_concurrent, 4);
        assert_eq!(cfg.declared_name(), "llama@0");
        assert_eq!(cfg.idle_ttl(), Duration::from_secs(1200));
        assert!(!cfg.is_tensor_parallel());
    }

    #[test]
    fn test_endpoint_template() {
        let mut cfg = ModelConfig::new("bge-m3", "http://{id}:8000/");
        assert_eq!(cfg.endpoint_url(), "http://bge-m3:8000");

        cfg.alias = Some("embed".to_string());
        assert_eq!(cfg.declared_name(), "embed");
    }

    #[test]
    fn test_model_config_parse() {
        let toml_str = r#"
id = "llama@0"
alias = "llama"
endpoint = "http://llama_0:8000"
gpus = [0]
max_context_tokens = 32768
max_concurrent = 3
profile = "long-context"
window = { start = 2, end = 6 }
"#;
        let cfg: ModelConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(cfg.profile, VariantProfile::LongContext);
        assert_eq!(cfg.kind, WorkerKind::Chat);
        assert_eq!(cfg.window, AvailabilityWindow::Hours { start: 2, end: 6 });
        assert_eq!(cfg.health_path, "/health");
        assert!(cfg.launch.is_none());
    }

    #[test]
    fn test_caller_source_parse() {
        assert_eq!("Batch".parse::<CallerSource>(), Ok(CallerSource::Batch));
        assert_eq!(
            " interactive ".parse::<CallerSource>(),
            Ok(CallerSource::Interactive)
        );
        assert!("cron".parse::<CallerSource>().is_err());
    }

    #[test]
    fn test_worker_handle_display() {
        let mut handle = WorkerHandle::new("llama@0", "http://127.0.0.1:30000");
        assert_eq!(handle.to_string(), "llama@0@http://127.0.0.1:30000");
        handle.pid = Some(42);
        assert_eq!(handle.to_string(), "llama@0@http://127.0.0.1:30000 (pid 42)");
    }
}
