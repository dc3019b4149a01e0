use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, Request, State};
use axum::http::header::AUTHORIZATION;
use axum::http::{HeaderMap, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use caption_adapter::{CaptionClient, CaptionConfig};
use thiserror::Error;
use tokio::net::TcpListener;
use tracing::{Instrument, debug, info, info_span, warn};
use uuid::Uuid;
use vision_payload::{ChatPayload, PayloadError, inspect, rewrite};

use crate::relay::{RelayError, UpstreamRelay};
use crate::route::{RouteClass, RouteError, UpstreamTarget};
use crate::types::{HealthStatus, OpenAiError, OpenAiErrorResponse};

#[derive(Debug, Clone)]
pub struct ProxyConfig {
    pub bind_addr: SocketAddr,
    pub caption: CaptionConfig,
    pub upstream_timeout: Duration,
}

#[derive(Clone)]
struct AppState {
    captioner: CaptionClient,
    relay: UpstreamRelay,
}

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error(transparent)]
    BadRoute(#[from] RouteError),
    #[error("malformed chat payload: {0}")]
    MalformedPayload(#[from] PayloadError),
    #[error("failed to read request body: {0}")]
    RequestBody(String),
    #[error(transparent)]
    UpstreamUnavailable(#[from] RelayError),
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    code: String,
    message: String,
}

impl ApiError {
    fn bad_request(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            code: code.into(),
            message: message.into(),
        }
    }

    fn bad_gateway(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_GATEWAY,
            code: code.into(),
            message: message.into(),
        }
    }

    fn gateway_timeout(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::GATEWAY_TIMEOUT,
            code: code.into(),
            message: message.into(),
        }
    }
}

impl From<ProxyError> for ApiError {
    fn from(err: ProxyError) -> Self {
        let message = err.to_string();
        match err {
            ProxyError::BadRoute(_) => Self::bad_request("bad_route", message),
            ProxyError::MalformedPayload(_) => Self::bad_request("malformed_payload", message),
            ProxyError::RequestBody(_) => Self::bad_request("invalid_body", message),
            ProxyError::UpstreamUnavailable(RelayError::Timeout(_)) => {
                Self::gateway_timeout("upstream_timeout", message)
            }
            ProxyError::UpstreamUnavailable(RelayError::Unreachable(_)) => {
                Self::bad_gateway("upstream_unavailable", message)
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let error_type = if self.status.is_client_error() {
            "invalid_request_error"
        } else {
            "upstream_error"
        };
        let mut response = Json(OpenAiErrorResponse {
            error: OpenAiError {
                message: self.message,
                error_type: error_type.to_string(),
                code: self.code,
            },
        })
        .into_response();
        *response.status_mut() = self.status;
        response
    }
}

pub fn parse_addr(value: &str) -> Result<SocketAddr> {
    value
        .parse::<SocketAddr>()
        .with_context(|| format!("invalid socket address '{value}'"))
}

pub async fn serve(config: ProxyConfig) -> Result<()> {
    let listener = TcpListener::bind(config.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.bind_addr))?;
    serve_on_listener(listener, config, async {
        let _ = tokio::signal::ctrl_c().await;
    })
    .await
}

async fn serve_on_listener(
    listener: TcpListener,
    config: ProxyConfig,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let addr = listener.local_addr()?;
    let state = build_state(config)?;
    let caption = state.captioner.config();
    info!(
        "vision proxy listening on http://{} (ocr endpoint={}, model={}, policy={}, ocr timeout={:?}, api key={})",
        addr,
        caption.endpoint,
        caption.model,
        caption.policy.as_str(),
        caption.timeout,
        if caption.api_key.is_some() { "set" } else { "unset" }
    );

    let app = Router::new()
        .route("/health", get(health))
        .fallback(proxy_request)
        .layer(DefaultBodyLimit::disable())
        .with_state(Arc::new(state));

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
        .context("proxy server failed")?;
    info!("vision proxy shut down");
    Ok(())
}

fn build_state(config: ProxyConfig) -> Result<AppState> {
    let relay = UpstreamRelay::new(config.upstream_timeout)?;
    let captioner = CaptionClient::new(config.caption)?;
    Ok(AppState { captioner, relay })
}

async fn health(State(state): State<Arc<AppState>>) -> Json<HealthStatus> {
    let caption = state.captioner.config();
    Json(HealthStatus {
        status: "healthy",
        ocr_endpoint: caption.endpoint.clone(),
        ocr_model: caption.model.clone(),
        ocr_policy: caption.policy.as_str(),
    })
}

async fn proxy_request(State(state): State<Arc<AppState>>, request: Request) -> Response {
    let request_id = format!("req-{}", Uuid::new_v4().simple());
    let span = info_span!("proxy", %request_id);
    match handle_proxy(state, request).instrument(span).await {
        Ok(response) => response,
        Err(err) => {
            warn!("{request_id} failed: {err}");
            ApiError::from(err).into_response()
        }
    }
}

async fn handle_proxy(state: Arc<AppState>, request: Request) -> Result<Response, ProxyError> {
    let (parts, body) = request.into_parts();
    let target = UpstreamTarget::from_uri(&parts.uri)?;
    let class = RouteClass::classify(&parts.method, &target);
    info!("{} {} -> {}", parts.method, target, class.as_str());

    let body = axum::body::to_bytes(body, usize::MAX)
        .await
        .map_err(|e| ProxyError::RequestBody(e.to_string()))?;

    match class {
        RouteClass::Passthrough => Ok(state
            .relay
            .passthrough(&target, parts.method, &parts.headers, body)
            .await?),
        RouteClass::Transform => {
            handle_transform(&state, &target, parts.method, &parts.headers, body).await
        }
    }
}

async fn handle_transform(
    state: &AppState,
    target: &UpstreamTarget,
    method: Method,
    headers: &HeaderMap,
    body: Bytes,
) -> Result<Response, ProxyError> {
    let payload = ChatPayload::from_slice(&body)?;
    let authorization = headers.get(AUTHORIZATION).cloned();

    let payload = if payload.has_images() {
        let tasks = inspect(&payload);
        info!(
            "found {} image(s), captioning {}",
            tasks.len(),
            state.captioner.config().policy.as_str()
        );
        let captions = state.captioner.resolve(&tasks, authorization.clone()).await;
        let failed = captions.values().filter(|c| c.is_failure()).count();
        if failed > 0 {
            warn!("{failed} of {} image(s) could not be captioned", tasks.len());
        }
        rewrite(&payload, &tasks, &captions)
    } else {
        debug!("no images, forwarding as-is");
        payload
    };

    Ok(state
        .relay
        .forward_chat(target, method, authorization.as_ref(), &payload)
        .await?)
}
