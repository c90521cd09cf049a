//! Axum-based HTTP surface: the client call endpoint plus read-only
//! dashboard views and an admin reload hook.

use axum::{
    extract::{Json, Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use gov_bridge_core::config::{AppConfig, ServerConfig};
use gov_bridge_core::{AuditFilter, CallError, Error, ErrorKind, Result};

use crate::bridge::Bridge;
use crate::interceptor::CallFailure;

/// Listener and middleware settings for the HTTP surface.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub host: String,
    pub port: u16,
    /// Allow cross-origin dashboard reads.
    pub enable_cors: bool,
    pub enable_tracing: bool,
}

impl From<&ServerConfig> for GatewayConfig {
    fn from(server: &ServerConfig) -> Self {
        Self {
            host: server.host.clone(),
            port: server.port,
            enable_cors: true,
            enable_tracing: true,
        }
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self::from(&ServerConfig::default())
    }
}

/// Source of configuration for `/v1/admin/reload`.
pub type ConfigLoader = Arc<dyn Fn() -> Result<AppConfig> + Send + Sync>;

/// Shared application state.
pub struct AppState {
    pub bridge: Arc<Bridge>,
    pub loader: ConfigLoader,
}

/// Gateway server.
pub struct GatewayServer {
    config: GatewayConfig,
    state: Arc<AppState>,
    metrics_handle: Option<PrometheusHandle>,
}

impl GatewayServer {
    /// Create a server whose reload endpoint re-reads the layered configuration.
    pub fn new(config: GatewayConfig, bridge: Arc<Bridge>) -> Self {
        Self::with_loader(config, bridge, Arc::new(AppConfig::load))
    }

    /// Create a server with a custom configuration source for reloads.
    pub fn with_loader(config: GatewayConfig, bridge: Arc<Bridge>, loader: ConfigLoader) -> Self {
        Self {
            config,
            state: Arc::new(AppState { bridge, loader }),
            metrics_handle: None,
        }
    }

    /// Set metrics handle.
    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.metrics_handle = Some(handle);
        self
    }

    /// Build the Axum router.
    pub fn build_router(&self) -> Router {
        let mut router = Router::new()
            .route("/health", get(health_handler))
            .route("/v1/call", post(call_handler))
            .route("/v1/usage", get(usage_handler))
            .route("/v1/usage/active", get(active_handler))
            .route("/v1/usage/sessions/:session_id", get(session_handler))
            .route("/v1/audit", get(audit_handler))
            .route("/v1/governance/status", get(status_handler))
            .route("/v1/backends", get(backends_handler))
            .route("/v1/admin/reload", post(reload_handler))
            .with_state(self.state.clone());

        if let Some(handle) = &self.metrics_handle {
            let handle = handle.clone();
            router = router.route("/metrics", get(move || async move { handle.render() }));
        }

        if self.config.enable_cors {
            router = router.layer(CorsLayer::new().allow_origin(Any).allow_methods(Any));
        }

        if self.config.enable_tracing {
            router = router.layer(TraceLayer::new_for_http());
        }

        router
    }

    /// Run the server until `shutdown` resolves.
    pub async fn run(self, shutdown: impl Future<Output = ()> + Send + 'static) -> Result<()> {
        let addr = format!("{}:{}", self.config.host, self.config.port);
        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .map_err(|e| Error::internal(format!("Failed to bind {}: {}", addr, e)))?;

        tracing::info!(addr = %addr, "Gateway server starting");

        axum::serve(listener, self.build_router())
            .with_graceful_shutdown(shutdown)
            .await
            .map_err(|e| Error::internal(format!("Server error: {}", e)))?;

        Ok(())
    }
}

// =============================================================================
// Request/Response Types
// =============================================================================

/// Tool call request.
#[derive(Debug, Deserialize)]
pub struct CallRequest {
    /// Optional session ID; a fresh one is assigned when absent.
    pub session_id: Option<String>,
    pub backend: String,
    pub tool: String,
    #[serde(default)]
    pub arguments: Value,
}

/// Health response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    /// Status.
    pub status: String,
    /// Version.
    pub version: String,
}

/// Error response.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub kind: ErrorKind,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub invocation_id: Option<String>,
}

/// HTTP status for a client-facing error kind.
pub fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::UnknownTarget => StatusCode::NOT_FOUND,
        ErrorKind::RateLimited => StatusCode::TOO_MANY_REQUESTS,
        ErrorKind::TimeRestricted | ErrorKind::BlockedPattern | ErrorKind::HighSecurity => {
            StatusCode::FORBIDDEN
        }
        ErrorKind::BackendUnavailable => StatusCode::SERVICE_UNAVAILABLE,
        ErrorKind::Timeout => StatusCode::GATEWAY_TIMEOUT,
        ErrorKind::BackendError => StatusCode::BAD_GATEWAY,
        ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for CallFailure {
    fn into_response(self) -> Response {
        let body = ErrorResponse {
            kind: self.error.kind,
            message: self.error.message,
            session_id: Some(self.session_id),
            invocation_id: Some(self.invocation_id),
        };
        (status_for(body.kind), Json(body)).into_response()
    }
}

/// Errors from non-call endpoints.
struct ApiError(StatusCode, CallError);

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        let status = match err {
            Error::Config(_) | Error::InvalidPolicy(_) => StatusCode::UNPROCESSABLE_ENTITY,
            _ => status_for(err.kind()),
        };
        Self(status, CallError::from(&err))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ErrorResponse {
            kind: self.1.kind,
            message: self.1.message,
            session_id: None,
            invocation_id: None,
        };
        (self.0, Json(body)).into_response()
    }
}

// =============================================================================
// Handlers
// =============================================================================

/// Health check handler.
async fn health_handler() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

async fn call_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<CallRequest>,
) -> Response {
    let result = state
        .bridge
        .interceptor()
        .handle(
            request.session_id.as_deref(),
            &request.backend,
            &request.tool,
            request.arguments,
        )
        .await;

    match result {
        Ok(result) => (StatusCode::OK, Json(result)).into_response(),
        Err(failure) => failure.into_response(),
    }
}

async fn usage_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.bridge.tracker().summary())
}

async fn active_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.bridge.tracker().active_invocations())
}

async fn session_handler(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
) -> Response {
    match state.bridge.tracker().session_usage(&session_id) {
        Some(usage) => Json(usage).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn audit_handler(
    State(state): State<Arc<AppState>>,
    Query(filter): Query<AuditFilter>,
) -> std::result::Result<impl IntoResponse, ApiError> {
    let records = state.bridge.tracker().store().query(filter).await?;
    Ok(Json(records))
}

async fn status_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.bridge.engine().status())
}

async fn backends_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.bridge.router().backends())
}

async fn reload_handler(
    State(state): State<Arc<AppState>>,
) -> std::result::Result<impl IntoResponse, ApiError> {
    let config = (state.loader)()?;
    let report = state.bridge.reload(&config).await?;
    Ok(Json(report))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_health_handler() {
        let response = health_handler().await.into_response();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[test]
    fn test_config_from_server_section() {
        let server = ServerConfig {
            host: "127.0.0.1".into(),
            port: 9000,
        };
        let config = GatewayConfig::from(&server);
        assert_eq!(config.port, 9000);
        assert_eq!(GatewayConfig::default().port, 8173);
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(status_for(ErrorKind::UnknownTarget), StatusCode::NOT_FOUND);
        assert_eq!(status_for(ErrorKind::RateLimited), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(status_for(ErrorKind::BlockedPattern), StatusCode::FORBIDDEN);
        assert_eq!(status_for(ErrorKind::Timeout), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(status_for(ErrorKind::BackendError), StatusCode::BAD_GATEWAY);
    }

    #[test]
    fn test_invalid_config_is_unprocessable() {
        let ApiError(status, body) = ApiError::from(Error::invalid_policy("bad pattern"));
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body.kind, ErrorKind::Internal);
    }
}
