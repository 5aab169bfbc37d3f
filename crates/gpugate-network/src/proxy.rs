//! Upstream client for forwarding requests to workers

use bytes::Bytes;
use gpugate_core::{GateError, GateResult};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

/// Request headers that never travel to the worker; `authorization` carries
/// the gateway API key
const SKIPPED_REQUEST_HEADERS: &[&str] = &["host", "content-length", "connection", "authorization"];

/// Header carrying the gateway request id
pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Forwards request bodies to worker endpoints
#[derive(Clone)]
pub struct WorkerProxy {
    client: reqwest::Client,
}

impl WorkerProxy {
    /// Create a proxy whose requests, including streamed bodies, are bounded
    /// by `request_timeout`
    pub fn new(request_timeout: Duration) -> GateResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| GateError::Internal(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self { client })
    }

    /// POST `body` to `endpoint` + `path`.
    ///
    /// Returns as soon as the worker sends response headers; the body is
    /// left for the caller to stream. Dropping the returned response aborts
    /// the upstream request. Connection failures map to `BackendFailure`,
    /// HTTP error statuses are returned as-is.
    pub async fn forward(
        &self,
        endpoint: &str,
        path: &str,
        headers: HeaderMap,
        body: Bytes,
        request_id: Uuid,
    ) -> GateResult<reqwest::Response> {
        let url = format!("{}{}", endpoint.trim_end_matches('/'), path);
        let headers = forwardable_headers(headers, request_id);

        debug!(url = %url, request_id = %request_id, bytes = body.len(), "Forwarding request");

        self.client
            .post(&url)
            .headers(headers)
            .body(body)
            .send()
            .await
            .map_err(|e| {
                warn!(url = %url, request_id = %request_id, error = %e, "Worker request failed");
                GateError::BackendFailure(format!("{}: {}", url, e))
            })
    }
}

/// Drop hop-by-hop request headers and stamp the request id
fn forwardable_headers(mut headers: HeaderMap, request_id: Uuid) -> HeaderMap {
    for name in SKIPPED_REQUEST_HEADERS {
        headers.remove(*name);
    }
    if let Ok(value) = HeaderValue::from_str(&request_id.to_string()) {
        headers.insert(HeaderName::from_static(REQUEST_ID_HEADER), value);
    }
    headers
}
