//! Request routing
//!
//! Turns an inbound inference request into a forwarded call on a ready
//! worker: variant selection, availability check, cold start, admission,
//! then a streamed proxy. The admission slot and the activity guard travel
//! with the response body and are released when the stream ends, fails or
//! is dropped by a disconnecting client.

use axum::{
    body::Body,
    http::{HeaderMap, HeaderName, HeaderValue, StatusCode},
    response::Response,
};
use bytes::Bytes;
use futures::Stream;
use gpugate_core::{
    GateError, GateResult, ModelConfig, ModelRegistry, RequestContext, RoutingConfig,
    WorkerHandle,
};
use gpugate_network::{proxy::REQUEST_ID_HEADER, WorkerProxy};
use gpugate_scheduler::{
    ActivityGuard, AdmissionGate, AdmissionToken, AvailabilityScheduler, FailureCause,
    LifecycleManager, VariantPolicy,
};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Response headers that describe the upstream connection, not the payload
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "transfer-encoding",
    "content-length",
    "upgrade",
    "proxy-connection",
];

/// How often a request retries when its model leaves `Running` between
/// the readiness check and admission
const MAX_ROUTE_ATTEMPTS: u32 = 3;

/// Inference surface a request arrived on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteKind {
    ChatCompletions,
    Embeddings,
    Rerank,
}

impl RouteKind {
    /// Path on the worker the request is forwarded to
    pub fn upstream_path(&self) -> &'static str {
        match self {
            RouteKind::ChatCompletions => "/v1/chat/completions",
            RouteKind::Embeddings => "/v1/embeddings",
            RouteKind::Rerank => "/rerank",
        }
    }
}

/// Orchestrates registry, availability, lifecycle and admission per request
pub struct RequestRouter {
    registry: Arc<ModelRegistry>,
    availability: Arc<AvailabilityScheduler>,
    lifecycle: Arc<LifecycleManager>,
    admission: Arc<AdmissionGate>,
    policy: Arc<dyn VariantPolicy>,
    proxy: WorkerProxy,
    config: RoutingConfig,
}

impl RequestRouter {
    pub fn new(
        registry: Arc<ModelRegistry>,
        availability: Arc<AvailabilityScheduler>,
        lifecycle: Arc<LifecycleManager>,
        admission: Arc<AdmissionGate>,
        policy: Arc<dyn VariantPolicy>,
        proxy: WorkerProxy,
        config: RoutingConfig,
    ) -> Self {
        Self {
            registry,
            availability,
            lifecycle,
            admission,
            policy,
            proxy,
            config,
        }
    }

    pub fn registry(&self) -> &Arc<ModelRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &RoutingConfig {
        &self.config
    }

    /// Eligible variants for the request, most preferred first
    pub fn classify(&self, ctx: &RequestContext) -> GateResult<Vec<Arc<ModelConfig>>> {
        let variants = self.registry.variants_of(&ctx.declared_model)?;
        let ranked = self
            .policy
            .rank(&variants, ctx.estimated_tokens, ctx.source);

        if ranked.is_empty() {
            return Err(GateError::ContextExceeded {
                model: ctx.declared_model.clone(),
                tokens: ctx.estimated_tokens.unwrap_or(0),
            });
        }

        Ok(ranked)
    }

    /// Pick a variant and make sure its worker is ready.
    ///
    /// A closed window on the chosen variant fails the request outright.
    /// On GPU contention the next open variant of the same alias is tried
    /// only when `fallback_on_conflict` is set.
    async fn acquire_worker(
        &self,
        ctx: &mut RequestContext,
        deadline: Instant,
    ) -> GateResult<(Arc<ModelConfig>, WorkerHandle)> {
        let mut candidates = self.classify(ctx)?.into_iter();
        let Some(mut model) = candidates.next() else {
            return Err(GateError::ModelNotFound(ctx.declared_model.clone()));
        };
        self.availability.check(&model)?;

        loop {
            ctx.target = Some(model.id.clone());
            match self.lifecycle.ensure_running(&model.id, deadline).await {
                Ok(handle) => return Ok((model, handle)),
                Err(e @ GateError::ResourceConflict { .. }) if self.config.fallback_on_conflict => {
                    match candidates.find(|m| self.availability.is_allowed_now(m)) {
                        Some(next) => {
                            info!(
                                request_id = %ctx.request_id,
                                from = %model.id,
                                to = %next.id,
                                "GPU busy, falling back to next variant"
                            );
                            model = next;
                        }
                        None => return Err(e),
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Route and forward one request, returning the streamed worker response
    pub async fn route(
        &self,
        mut ctx: RequestContext,
        kind: RouteKind,
        headers: HeaderMap,
        body: Bytes,
    ) -> GateResult<Response> {
        let deadline = Instant::from_std(ctx.deadline);

        for attempt in 1..=MAX_ROUTE_ATTEMPTS {
            let (model, handle) = self.acquire_worker(&mut ctx, deadline).await?;
            let token = self.admission.try_acquire(&model.id)?;

            let Some(guard) = self.lifecycle.begin_request(&model.id).await? else {
                debug!(
                    request_id = %ctx.request_id,
                    model = %model.id,
                    attempt,
                    "Model left Running before admission, retrying"
                );
                continue;
            };

            info!(
                request_id = %ctx.request_id,
                caller = %ctx.caller,
                model = %model.id,
                tokens = ?ctx.estimated_tokens,
                source = %ctx.source,
                in_flight = self.admission.in_flight(&model.id),
                "Forwarding request"
            );

            let lease = Lease {
                _token: token,
                _guard: guard,
            };
            return self.forward(&ctx, &model, &handle, kind, headers, body, lease).await;
        }

        Err(GateError::StartupTimeout(format!(
            "'{}' kept stopping while the request was routed",
            ctx.declared_model
        )))
    }

    #[allow(clippy::too_many_arguments)]
    async fn forward(
        &self,
        ctx: &RequestContext,
        model: &Arc<ModelConfig>,
        handle: &WorkerHandle,
        kind: RouteKind,
        headers: HeaderMap,
        body: Bytes,
        lease: Lease,
    ) -> GateResult<Response> {
        let upstream = match self
            .proxy
            .forward(
                &handle.endpoint,
                kind.upstream_path(),
                to_upstream_headers(&headers),
                body,
                ctx.request_id,
            )
            .await
        {
            Ok(response) => response,
            Err(e) => {
                self.lifecycle
                    .report_failure(&model.id, FailureCause::Backend(e.to_string()))
                    .await;
                return Err(e);
            }
        };

        let status = upstream.status();
        if status.is_server_error() {
            let detail = upstream.text().await.unwrap_or_default();
            warn!(
                request_id = %ctx.request_id,
                model = %model.id,
                status = %status,
                "Worker returned an error"
            );
            self.lifecycle
                .report_failure(&model.id, FailureCause::Backend(format!("HTTP {}", status)))
                .await;
            return Err(GateError::BackendFailure(format!(
                "worker '{}' returned {}: {}",
                model.id,
                status,
                truncate(&detail, 512)
            )));
        }

        let mut builder = Response::builder()
            .status(StatusCode::from_u16(status.as_u16()).unwrap_or(StatusCode::BAD_GATEWAY));
        for (name, value) in upstream.headers() {
            if HOP_BY_HOP.contains(&name.as_str()) {
                continue;
            }
            if let (Ok(name), Ok(value)) = (
                HeaderName::from_bytes(name.as_str().as_bytes()),
                HeaderValue::from_bytes(value.as_bytes()),
            ) {
                builder = builder.header(name, value);
            }
        }
        if let Ok(value) = HeaderValue::from_str(&ctx.request_id.to_string()) {
            builder = builder.header(REQUEST_ID_HEADER, value);
        }

        let stream = LeasedStream {
            inner: Box::pin(upstream.bytes_stream()),
            lease: Some(lease),
            lifecycle: self.lifecycle.clone(),
            model_id: model.id.clone(),
        };

        builder
            .body(Body::from_stream(stream))
            .map_err(|e| GateError::Internal(format!("Failed to build response: {}", e)))
    }
}

/// Resources a request holds until its response body is finished
struct Lease {
    _token: AdmissionToken,
    _guard: ActivityGuard,
}

/// Worker body stream that gives back its lease at end of stream, on error,
/// or when dropped
struct LeasedStream {
    inner: Pin<Box<dyn Stream<Item = Result<Bytes, reqwest::Error>> + Send>>,
    lease: Option<Lease>,
    lifecycle: Arc<LifecycleManager>,
    model_id: String,
}

impl Stream for LeasedStream {
    type Item = Result<Bytes, reqwest::Error>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = &mut *self;
        match this.inner.as_mut().poll_next(cx) {
            Poll::Ready(None) => {
                this.lease.take();
                Poll::Ready(None)
            }
            Poll::Ready(Some(Err(e))) => {
                if this.lease.take().is_some() {
                    warn!(model = %this.model_id, error = %e, "Worker stream failed");
                    let lifecycle = this.lifecycle.clone();
                    let model_id = this.model_id.clone();
                    let cause = FailureCause::Backend(e.to_string());
                    tokio::spawn(async move {
                        lifecycle.report_failure(&model_id, cause).await;
                    });
                }
                Poll::Ready(Some(Err(e)))
            }
            other => other,
        }
    }
}

/// Copy inbound headers into the upstream client's header type
fn to_upstream_headers(headers: &HeaderMap) -> reqwest::header::HeaderMap {
    let mut upstream = reqwest::header::HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        if let (Ok(name), Ok(value)) = (
            reqwest::header::HeaderName::from_bytes(name.as_str().as_bytes()),
            reqwest::header::HeaderValue::from_bytes(value.as_bytes()),
        ) {
            upstream.append(name, value);
        }
    }
    upstream
}

fn truncate(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}
