//! REST API handlers

use axum::{
    extract::State,
    http::{header::RETRY_AFTER, HeaderMap, HeaderValue, StatusCode},
    middleware,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Extension, Router,
};
use bytes::Bytes;
use gpugate_core::{
    ApiConfig, GateError, GateResult, ModelRegistry, ModelSnapshot, RequestContext,
};
use gpugate_scheduler::{GpuReservation, LifecycleManager};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::auth::{self, ApiKeys, Caller};
use crate::estimate::TokenEstimator;
use crate::routing::{RequestRouter, RouteKind};

/// Seconds suggested to clients in `Retry-After` on retryable failures
const RETRY_AFTER_SECS: &str = "5";

/// Application state shared across handlers
pub struct AppState {
    pub router: RequestRouter,
    pub lifecycle: Arc<LifecycleManager>,
    pub estimator: TokenEstimator,
}

impl AppState {
    pub fn new(router: RequestRouter, lifecycle: Arc<LifecycleManager>) -> Self {
        let estimator = TokenEstimator::new(router.config());
        Self {
            router,
            lifecycle,
            estimator,
        }
    }

    fn registry(&self) -> &Arc<ModelRegistry> {
        self.router.registry()
    }

    /// Parse, estimate and route one inference request
    async fn dispatch(
        &self,
        kind: RouteKind,
        caller: Caller,
        headers: HeaderMap,
        body: Bytes,
    ) -> GateResult<Response> {
        let payload: Value = serde_json::from_slice(&body)
            .map_err(|e| GateError::InvalidRequest(format!("body is not valid JSON: {}", e)))?;
        let declared = payload
            .get("model")
            .and_then(Value::as_str)
            .ok_or_else(|| GateError::InvalidRequest("missing 'model' field".to_string()))?
            .to_string();

        let tokens = match kind {
            RouteKind::ChatCompletions => self.estimator.chat(&payload),
            RouteKind::Embeddings => self.estimator.embeddings(&payload),
            RouteKind::Rerank => self.estimator.rerank(&payload),
        };

        let config = self.router.config();
        let deadline = std::time::Instant::now() + config.startup_deadline(caller.source);
        let ctx = RequestContext::new(caller.name, caller.source, declared, Some(tokens), deadline);

        info!(
            request_id = %ctx.request_id,
            caller = %ctx.caller,
            model = %ctx.declared_model,
            tokens,
            source = %ctx.source,
            "Routing request"
        );

        self.router.route(ctx, kind, headers, body).await
    }
}

/// Create the API router
pub fn create_router(state: Arc<AppState>, keys: ApiKeys, api: &ApiConfig) -> Router {
    if !keys.is_enabled() {
        warn!("No API keys configured, authentication disabled");
    }

    let protected = Router::new()
        .route("/v1/chat/completions", post(chat_completions))
        .route("/v1/embeddings", post(embeddings))
        .route("/v1/rerank", post(rerank))
        .route("/v1/models", get(list_models))
        .route("/api/v1/status", get(get_status))
        .route_layer(middleware::from_fn_with_state(
            Arc::new(keys),
            auth::authenticate,
        ));

    let mut router = Router::new()
        .route("/health", get(health))
        .merge(protected)
        .with_state(state)
        .layer(TraceLayer::new_for_http());

    if api.cors_enabled {
        router = router.layer(cors_layer(&api.cors_origins));
    }

    router
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    let allow_origin = if origins.iter().any(|o| o == "*") {
        AllowOrigin::from(Any)
    } else {
        AllowOrigin::list(origins.iter().filter_map(|o| HeaderValue::from_str(o).ok()))
    };

    CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods(Any)
        .allow_headers(Any)
}

/// Error returned by handlers, rendered in the OpenAI error envelope
#[derive(Debug)]
pub struct ApiError(pub GateError);

impl From<GateError> for ApiError {
    fn from(err: GateError) -> Self {
        Self(err)
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: ErrorDetail,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorDetail {
    pub message: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub code: u16,
}

/// HTTP status for a gateway error
pub fn status_for(err: &GateError) -> StatusCode {
    match err {
        GateError::ModelNotFound(_) => StatusCode::NOT_FOUND,
        GateError::ModelUnavailable { .. } => StatusCode::CONFLICT,
        GateError::ContextExceeded { .. } | GateError::InvalidRequest(_) => {
            StatusCode::BAD_REQUEST
        }
        GateError::Unauthorized => StatusCode::FORBIDDEN,
        GateError::ResourceConflict { .. }
        | GateError::StartupTimeout(_)
        | GateError::WorkerStart { .. }
        | GateError::Overloaded { .. } => StatusCode::SERVICE_UNAVAILABLE,
        GateError::BackendFailure(_) => StatusCode::BAD_GATEWAY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = status_for(&self.0);
        if status.is_server_error() {
            warn!(status = %status, kind = self.0.kind(), error = %self.0, "Request failed");
        }

        let body = ErrorBody {
            error: ErrorDetail {
                message: self.0.to_string(),
                kind: self.0.kind().to_string(),
                code: status.as_u16(),
            },
        };

        let mut response = (status, Json(body)).into_response();
        if self.0.is_retryable() {
            response
                .headers_mut()
                .insert(RETRY_AFTER, HeaderValue::from_static(RETRY_AFTER_SECS));
        }
        response
    }
}

/// Forward a chat completion
async fn chat_completions(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Caller>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    Ok(state
        .dispatch(RouteKind::ChatCompletions, caller, headers, body)
        .await?)
}

/// Forward an embeddings request
async fn embeddings(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Caller>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    Ok(state
        .dispatch(RouteKind::Embeddings, caller, headers, body)
        .await?)
}

/// Forward a rerank request
async fn rerank(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Caller>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    Ok(state
        .dispatch(RouteKind::Rerank, caller, headers, body)
        .await?)
}

/// One entry of the OpenAI model list
#[derive(Debug, Serialize, Deserialize)]
pub struct ModelEntry {
    pub id: String,
    pub object: String,
    pub owned_by: String,
}

/// OpenAI model list response
#[derive(Debug, Serialize, Deserialize)]
pub struct ModelList {
    pub object: String,
    pub data: Vec<ModelEntry>,
}

/// List declared model names
async fn list_models(State(state): State<Arc<AppState>>) -> Json<ModelList> {
    let data = state
        .registry()
        .public_names()
        .into_iter()
        .map(|id| ModelEntry {
            id,
            object: "model".to_string(),
            owned_by: "gpugate".to_string(),
        })
        .collect();

    Json(ModelList {
        object: "list".to_string(),
        data,
    })
}

/// Liveness of the gateway itself
async fn health() -> Json<Value> {
    Json(serde_json::json!({
        "ok": true,
        "ts": chrono::Utc::now().timestamp_millis() as f64 / 1000.0,
    }))
}

/// System status response
#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub version: String,
    pub models: Vec<ModelSnapshot>,
    pub reservations: Vec<GpuReservation>,
}

/// Get per-model state and GPU reservations
async fn get_status(State(state): State<Arc<AppState>>) -> Json<StatusResponse> {
    let models = state.lifecycle.snapshot().await;
    let reservations = state.lifecycle.reservations().await;

    Json(StatusResponse {
        version: env!("CARGO_PKG_VERSION").to_string(),
        models,
        reservations,
    })
}
