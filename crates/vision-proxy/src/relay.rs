use std::io;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::body::{Body, Bytes};
use axum::http::header::{
    AUTHORIZATION, CACHE_CONTROL, CONTENT_LENGTH, CONTENT_TYPE, HOST, HeaderName,
};
use axum::http::{HeaderMap, HeaderValue, Method};
use axum::response::Response;
use reqwest::Client;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{Instrument, debug, info, warn};
use vision_payload::ChatPayload;

use crate::route::UpstreamTarget;

/// Chunks buffered between the upstream reader and the caller; a full
/// channel stops the reader until the caller catches up.
const RELAY_CHANNEL_DEPTH: usize = 16;
const X_ACCEL_BUFFERING: HeaderName = HeaderName::from_static("x-accel-buffering");

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("upstream timed out after {0:?}")]
    Timeout(Duration),
    #[error("upstream unreachable: {0}")]
    Unreachable(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayMode {
    Buffered,
    Streamed,
}

impl RelayMode {
    fn as_str(self) -> &'static str {
        match self {
            Self::Buffered => "buffered",
            Self::Streamed => "streamed",
        }
    }
}

#[derive(Debug, Clone)]
pub struct UpstreamRelay {
    http: Client,
    timeout: Duration,
}

impl UpstreamRelay {
    pub fn new(timeout: Duration) -> Result<Self> {
        let http = Client::builder()
            .connect_timeout(timeout)
            .read_timeout(timeout)
            .build()
            .context("failed to build upstream HTTP client")?;
        Ok(Self { http, timeout })
    }

    /// Send a (possibly rewritten) chat payload upstream. Only the caller's
    /// `Authorization` travels with it.
    pub async fn forward_chat(
        &self,
        target: &UpstreamTarget,
        method: Method,
        authorization: Option<&HeaderValue>,
        payload: &ChatPayload,
    ) -> Result<Response, RelayError> {
        let mut req = self
            .http
            .request(method, target.url().clone())
            .header(CONTENT_TYPE, "application/json")
            .body(payload.to_vec());
        if let Some(value) = authorization {
            req = req.header(AUTHORIZATION, value.clone());
        }

        let upstream = req.send().await.map_err(|e| self.unavailable(e))?;
        let mode = if payload.is_streaming() {
            RelayMode::Streamed
        } else {
            RelayMode::Buffered
        };
        self.relay_response(upstream, mode).await
    }

    /// Forward the request exactly as received, minus connection-level
    /// headers.
    pub async fn passthrough(
        &self,
        target: &UpstreamTarget,
        method: Method,
        headers: &HeaderMap,
        body: Bytes,
    ) -> Result<Response, RelayError> {
        let mut forwarded = HeaderMap::new();
        for (name, value) in headers {
            if *name == HOST || *name == CONTENT_LENGTH || is_hop_by_hop(name.as_str()) {
                continue;
            }
            forwarded.append(name.clone(), value.clone());
        }

        let upstream = self
            .http
            .request(method, target.url().clone())
            .headers(forwarded)
            .body(body)
            .send()
            .await
            .map_err(|e| self.unavailable(e))?;
        let mode = if is_event_stream(upstream.headers()) {
            RelayMode::Streamed
        } else {
            RelayMode::Buffered
        };
        self.relay_response(upstream, mode).await
    }

    async fn relay_response(
        &self,
        upstream: reqwest::Response,
        mode: RelayMode,
    ) -> Result<Response, RelayError> {
        let status = upstream.status();
        let mut headers = response_headers(upstream.headers());
        info!("upstream answered {} ({})", status.as_u16(), mode.as_str());

        let body = match mode {
            RelayMode::Buffered => {
                let bytes = upstream.bytes().await.map_err(|e| self.unavailable(e))?;
                Body::from(bytes)
            }
            RelayMode::Streamed => {
                if !headers.contains_key(CONTENT_TYPE) {
                    headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/event-stream"));
                }
                headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-cache"));
                headers.insert(X_ACCEL_BUFFERING, HeaderValue::from_static("no"));
                stream_body(upstream)
            }
        };

        let mut response = Response::new(body);
        *response.status_mut() = status;
        *response.headers_mut() = headers;
        Ok(response)
    }

    fn unavailable(&self, err: reqwest::Error) -> RelayError {
        warn!("upstream call failed: {err}");
        if err.is_timeout() {
            RelayError::Timeout(self.timeout)
        } else {
            RelayError::Unreachable(err.to_string())
        }
    }
}

/// Copy upstream chunks to the caller as they arrive. The reader stops as
/// soon as the caller's side of the channel is gone.
fn stream_body(mut upstream: reqwest::Response) -> Body {
    let (tx, rx) = mpsc::channel::<Result<Bytes, io::Error>>(RELAY_CHANNEL_DEPTH);
    tokio::spawn(
        async move {
            let mut relayed = 0usize;
            loop {
                let next = tokio::select! {
                    _ = tx.closed() => {
                        debug!("caller went away after {relayed} bytes; dropping upstream stream");
                        return;
                    }
                    next = upstream.chunk() => next,
                };
                match next {
                    Ok(Some(chunk)) => {
                        relayed += chunk.len();
                        if tx.send(Ok(chunk)).await.is_err() {
                            debug!("caller went away after {relayed} bytes; dropping upstream stream");
                            return;
                        }
                    }
                    Ok(None) => {
                        debug!("upstream stream finished after {relayed} bytes");
                        return;
                    }
                    Err(err) => {
                        warn!("upstream stream failed after {relayed} bytes: {err}");
                        let _ = tx.send(Err(io::Error::other(err))).await;
                        return;
                    }
                }
            }
        }
        .in_current_span(),
    );
    Body::from_stream(ReceiverStream::new(rx))
}

fn response_headers(upstream: &HeaderMap) -> HeaderMap {
    let mut out = HeaderMap::new();
    for (name, value) in upstream {
        if *name == CONTENT_LENGTH || is_hop_by_hop(name.as_str()) {
            continue;
        }
        out.append(name.clone(), value.clone());
    }
    out
}

fn is_event_stream(headers: &HeaderMap) -> bool {
    headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.to_ascii_lowercase().starts_with("text/event-stream"))
}

fn is_hop_by_hop(name_lower: &str) -> bool {
    matches!(
        name_lower,
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailer"
            | "trailers"
            | "transfer-encoding"
            | "upgrade"
    )
}
