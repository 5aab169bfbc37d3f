//! Error types for gpugate

use thiserror::Error;

/// Main error type for gpugate
#[derive(Error, Debug)]
pub enum GateError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// The declared model name matches neither a model id nor an alias
    #[error("Model not found: {0}")]
    ModelNotFound(String),

    /// The model exists but its availability window is closed
    #[error("Model '{model}' is not available now (window {window})")]
    ModelUnavailable { model: String, window: String },

    /// No variant has a context window large enough for the request
    #[error("Request needs ~{tokens} tokens, more than any variant of '{model}' accepts")]
    ContextExceeded { model: String, tokens: u32 },

    /// A GPU needed by the model is held by another model
    #[error("GPU {gpu} required by '{model}' is held by '{holder}'")]
    ResourceConflict {
        model: String,
        gpu: u32,
        holder: String,
    },

    /// The worker did not become ready before the deadline
    #[error("Startup timeout: {0}")]
    StartupTimeout(String),

    /// The worker host could not launch the worker, or it exited while starting
    #[error("Worker for '{model}' failed to start: {reason}")]
    WorkerStart { model: String, reason: String },

    /// Every admission slot of the model is taken
    #[error("Model '{model}' is at capacity ({limit} concurrent requests)")]
    Overloaded { model: String, limit: u32 },

    /// The worker returned an error or went away mid-request
    #[error("Backend failure: {0}")]
    BackendFailure(String),

    /// Bearer token missing or not recognised
    #[error("Unauthorized: valid API key required")]
    Unauthorized,

    /// Malformed request body
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Runtime (worker host) error
    #[error("Runtime error: {0}")]
    Runtime(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type for gpugate operations
pub type GateResult<T> = Result<T, GateError>;

impl GateError {
    /// Whether a client may sensibly retry the same request later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            GateError::ResourceConflict { .. }
                | GateError::StartupTimeout(_)
                | GateError::WorkerStart { .. }
                | GateError::Overloaded { .. }
        )
    }

    /// Stable machine-readable error type, used in API error bodies.
    pub fn kind(&self) -> &'static str {
        match self {
            GateError::Config(_) => "config_error",
            GateError::ModelNotFound(_) => "model_not_found",
            GateError::ModelUnavailable { .. } => "model_unavailable",
            GateError::ContextExceeded { .. } => "context_length_exceeded",
            GateError::ResourceConflict { .. } => "gpu_busy",
            GateError::StartupTimeout(_) => "startup_timeout",
            GateError::WorkerStart { .. } => "start_failed",
            GateError::Overloaded { .. } => "overloaded",
            GateError::BackendFailure(_) => "backend_failure",
            GateError::Unauthorized => "unauthorized",
            GateError::InvalidRequest(_) => "invalid_request_error",
            GateError::Runtime(_) => "runtime_error",
            GateError::Io(_) => "io_error",
            GateError::Serialization(_) => "serialization_error",
            GateError::Internal(_) => "internal_error",
        }
    }
}

impl From<serde_json::Error> for GateError {
    fn from(err: serde_json::Error) -> Self {
        GateError::Serialization(err.to_string())
    }
}

impl From<toml::de::Error> for GateError {
    fn from(err: toml::de::Error) -> Self {
        GateError::Config(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = GateError::Config("invalid config".to_string());
        assert_eq!(err.to_string(), "Configuration error: invalid config");

        let err = GateError::ResourceConflict {
            model: "big-tp".to_string(),
            gpu: 1,
            holder: "llama@1".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "GPU 1 required by 'big-tp' is held by 'llama@1'"
        );
    }

    #[test]
    fn test_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: GateError = io_err.into();
        assert!(matches!(err, GateError::Io(_)));
    }

    #[test]
    fn test_retryable() {
        assert!(GateError::StartupTimeout("m".into()).is_retryable());
        assert!(GateError::Overloaded {
            model: "m".into(),
            limit: 3
        }
        .is_retryable());
        assert!(!GateError::ModelNotFound("m".into()).is_retryable());
        assert!(!GateError::ModelUnavailable {
            model: "m".into(),
            window: "02:00-06:00".into()
        }
        .is_retryable());
        assert!(!GateError::BackendFailure("boom".into()).is_retryable());
    }
}
