//! Bearer token authentication
//!
//! Resolves the `Authorization` header against the configured API keys and
//! attaches the resulting [`Caller`] to the request extensions. With no keys
//! configured every request is an anonymous interactive caller.

use axum::{
    extract::{Request, State},
    http::header::AUTHORIZATION,
    middleware::Next,
    response::{IntoResponse, Response},
};
use gpugate_core::{ApiKey, CallerSource, GateError, GateResult};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::rest::ApiError;

/// Header that lets a caller override its key's default source
pub const SOURCE_HEADER: &str = "x-request-source";

/// Authenticated request origin
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Caller {
    pub name: String,
    pub source: CallerSource,
}

impl Caller {
    pub fn anonymous() -> Self {
        Self {
            name: "anonymous".to_string(),
            source: CallerSource::Interactive,
        }
    }
}

/// Configured API keys
#[derive(Debug, Clone, Default)]
pub struct ApiKeys {
    keys: Vec<ApiKey>,
}

impl ApiKeys {
    pub fn new(keys: Vec<ApiKey>) -> Self {
        Self { keys }
    }

    /// Whether requests must present a token
    pub fn is_enabled(&self) -> bool {
        !self.keys.is_empty()
    }

    /// Resolve an `Authorization` header value to a caller
    pub fn authenticate(&self, authorization: Option<&str>) -> GateResult<Caller> {
        if !self.is_enabled() {
            return Ok(Caller::anonymous());
        }

        let token = authorization
            .and_then(|value| value.trim().split_once(' '))
            .filter(|(scheme, _)| scheme.eq_ignore_ascii_case("bearer"))
            .map(|(_, token)| token.trim())
            .ok_or(GateError::Unauthorized)?;

        self.keys
            .iter()
            .find(|key| key.token == token)
            .map(|key| Caller {
                name: key.name.clone(),
                source: key.source,
            })
            .ok_or(GateError::Unauthorized)
    }
}

/// Middleware that rejects unknown tokens with 403 before any routing work
pub async fn authenticate(
    State(keys): State<Arc<ApiKeys>>,
    mut request: Request,
    next: Next,
) -> Response {
    let headers = request.headers();
    let authorization = headers.get(AUTHORIZATION).and_then(|v| v.to_str().ok());

    let mut caller = match keys.authenticate(authorization) {
        Ok(caller) => caller,
        Err(e) => {
            warn!(path = %request.uri().path(), "Rejected request with invalid API key");
            return ApiError(e).into_response();
        }
    };

    if let Some(source) = headers
        .get(SOURCE_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<CallerSource>().ok())
    {
        caller.source = source;
    }

    debug!(caller = %caller.name, source = %caller.source, "Authenticated request");
    request.extensions_mut().insert(caller);
    next.run(request).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{body::Body, http::StatusCode, middleware, routing::get, Extension, Router};
    use tower::ServiceExt;

    fn keys() -> ApiKeys {
        ApiKeys::new(vec![
            ApiKey {
                name: "webui".to_string(),
                token: "sk-webui".to_string(),
                source: CallerSource::Interactive,
            },
            ApiKey {
                name: "n8n".to_string(),
                token: "sk-n8n".to_string(),
                source: CallerSource::Batch,
            },
        ])
    }

    async fn whoami(Extension(caller): Extension<Caller>) -> String {
        format!("{}:{}", caller.name, caller.source)
    }

    fn app(keys: ApiKeys) -> Router {
        Router::new()
            .route("/whoami", get(whoami))
            .layer(middleware::from_fn_with_state(Arc::new(keys), authenticate))
    }

    async fn call(app: Router, headers: &[(&str, &str)]) -> (StatusCode, String) {
        let mut request = axum::http::Request::builder().uri("/whoami");
        for (name, value) in headers {
            request = request.header(*name, *value);
        }
        let response = app
            .oneshot(request.body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, String::from_utf8(body.to_vec()).unwrap())
    }

    #[test]
    fn test_authenticate_tokens() {
        let keys = keys();
        assert_eq!(keys.authenticate(Some("Bearer sk-n8n")).unwrap().name, "n8n");
        assert!(matches!(
            keys.authenticate(Some("Bearer nope")),
            Err(GateError::Unauthorized)
        ));
        assert!(matches!(
            keys.authenticate(Some("sk-n8n")),
            Err(GateError::Unauthorized)
        ));
        assert!(matches!(keys.authenticate(None), Err(GateError::Unauthorized)));
    }

    #[test]
    fn test_bearer_scheme_is_case_insensitive() {
        let keys = keys();
        assert_eq!(keys.authenticate(Some("bearer sk-webui")).unwrap().name, "webui");
        assert_eq!(keys.authenticate(Some("BEARER  sk-n8n")).unwrap().name, "n8n");
        assert!(matches!(
            keys.authenticate(Some("Basic sk-n8n")),
            Err(GateError::Unauthorized)
        ));
        assert!(matches!(
            keys.authenticate(Some("bearer")),
            Err(GateError::Unauthorized)
        ));
    }

    #[tokio::test]
    async fn test_middleware_accepts_lowercase_scheme() {
        let (status, body) = call(app(keys()), &[("authorization", "bearer sk-webui")]).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "webui:interactive");
    }

    #[test]
    fn test_no_keys_is_anonymous() {
        let keys = ApiKeys::default();
        assert!(!keys.is_enabled());
        assert_eq!(keys.authenticate(None).unwrap(), Caller::anonymous());
    }

    #[tokio::test]
    async fn test_middleware_sets_caller() {
        let (status, body) = call(app(keys()), &[("authorization", "Bearer sk-n8n")]).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "n8n:batch");
    }

    #[tokio::test]
    async fn test_source_header_override() {
        let (status, body) = call(
            app(keys()),
            &[
                ("authorization", "Bearer sk-n8n"),
                (SOURCE_HEADER, "interactive"),
            ],
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "n8n:interactive");
    }

    #[tokio::test]
    async fn test_wrong_token_is_forbidden() {
        let (status, body) = call(app(keys()), &[("authorization", "Bearer wrong")]).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert!(body.contains("\"type\":\"unauthorized\""));
    }
}
