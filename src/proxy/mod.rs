//! Streaming interception proxy in front of a chat-completion provider.
//!
//! Three surfaces:
//! - `GET /ping` — liveness probe, no side effects. The supervisor's own
//!   health check targets this route.
//! - `POST /v1/chat/completions` — the one route that understands payload
//!   framing. The transformer sees the prompt before forwarding and every
//!   response payload (full body or SSE frame) on the way back.
//! - catch-all — a generic pass-through reverse proxy for every other
//!   endpoint; it never needs to understand the payload.

pub mod exchange_log;
pub mod sse;
pub mod transformer;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_stream::try_stream;
use axum::{
    body::Body,
    extract::{ConnectInfo, Request, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use bytes::Bytes;
use futures_util::StreamExt;
use serde_json::{json, Value};
use tower_http::trace::TraceLayer;

use crate::config::ProxyConfig;
use transformer::{ExchangeMeta, RequestTransformer};

/// Request bodies larger than this are rejected by the catch-all collect.
const MAX_BODY_BYTES: usize = 32 * 1024 * 1024;

#[derive(Clone)]
pub struct ProxyState {
    client: reqwest::Client,
    upstream_url: String,
    request_timeout: Duration,
    transformer: Arc<dyn RequestTransformer>,
}

impl ProxyState {
    pub fn new(config: &ProxyConfig, transformer: Arc<dyn RequestTransformer>) -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default();
        Self {
            client,
            upstream_url: config.upstream_url.trim_end_matches('/').to_string(),
            request_timeout: Duration::from_secs(config.request_timeout_secs),
            transformer,
        }
    }
}

pub fn router(state: ProxyState) -> Router {
    Router::new()
        .route("/ping", get(ping))
        .route("/v1/chat/completions", post(chat_completions))
        .fallback(passthrough)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Bind 127.0.0.1:`port` and serve until the process is terminated.
pub async fn serve(port: u16, state: ProxyState) -> anyhow::Result<()> {
    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;
    tracing::info!("Interception proxy listening on http://{}", addr);
    axum::serve(
        listener,
        router(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
    .context("proxy server error")?;
    Ok(())
}

/// GET /ping — liveness, no side effects.
async fn ping() -> impl IntoResponse {
    Json(json!({"status": "ok"}))
}

/// POST /v1/chat/completions — the one route with payload interception.
async fn chat_completions(
    State(state): State<ProxyState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(mut body): Json<Value>,
) -> Response {
    let model = body
        .get("model")
        .and_then(|v| v.as_str())
        .unwrap_or("unknown")
        .to_string();
    let streaming = body
        .get("stream")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);
    let meta = ExchangeMeta::new(&model, "/v1/chat/completions", "POST", addr, &headers);

    // Prompt interception. Fail-open: a transformer error forwards the
    // original messages unchanged.
    if let Some(messages) = body.get("messages").and_then(|v| v.as_array()).cloned() {
        match state.transformer.process_prompt(messages, &meta).await {
            Ok(replaced) => {
                body["messages"] = Value::Array(replaced);
            }
            Err(e) => {
                tracing::warn!(
                    request_id = %meta.request_id,
                    "Prompt transformer failed, forwarding original: {}",
                    e
                );
            }
        }
    }

    let url = format!("{}/v1/chat/completions", state.upstream_url);
    let mut req = state.client.post(&url).json(&body);
    if !streaming {
        req = req.timeout(state.request_timeout);
    }
    // The caller's credentials pass through untouched.
    if let Some(auth) = headers.get("authorization").and_then(|v| v.to_str().ok()) {
        req = req.header("authorization", auth);
    }

    let upstream = match req.send().await {
        Ok(r) => r,
        Err(e) => {
            tracing::error!(request_id = %meta.request_id, "Upstream request failed: {}", e);
            return (StatusCode::BAD_GATEWAY, e.to_string()).into_response();
        }
    };

    let status = upstream.status();
    if !status.is_success() {
        // Mirror the upstream failure verbatim; never retried here.
        let content_type = upstream
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("application/json")
            .to_string();
        let bytes = upstream.bytes().await.unwrap_or_default();
        tracing::warn!(
            request_id = %meta.request_id,
            "Upstream returned {}, mirroring to caller",
            status
        );
        return Response::builder()
            .status(status.as_u16())
            .header("content-type", content_type)
            .body(Body::from(bytes))
            .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response());
    }

    if streaming {
        relay_stream(state, upstream, meta)
    } else {
        let payload: Value = match upstream.json().await {
            Ok(v) => v,
            Err(e) => {
                tracing::error!(
                    request_id = %meta.request_id,
                    "Failed to decode upstream response: {}",
                    e
                );
                return (StatusCode::BAD_GATEWAY, e.to_string()).into_response();
            }
        };
        let out = match state
            .transformer
            .process_response(payload.clone(), &meta)
            .await
        {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(
                    request_id = %meta.request_id,
                    "Response transformer failed, returning original: {}",
                    e
                );
                payload
            }
        };
        Json(out).into_response()
    }
}

/// Relay the upstream SSE body frame by frame, passing each payload through
/// the transformer. The `[DONE]` sentinel is forwarded once and closes the
/// caller-facing stream. Dropping the caller connection drops this stream
/// and with it the upstream response — no orphaned upstream connection.
fn relay_stream(state: ProxyState, upstream: reqwest::Response, meta: ExchangeMeta) -> Response {
    let transformer = state.transformer.clone();

    let frames = try_stream! {
        let mut buffer = String::new();
        let mut byte_stream = upstream.bytes_stream();

        'relay: while let Some(chunk) = byte_stream.next().await {
            let chunk = chunk.context("failed to read upstream stream chunk")?;
            buffer.push_str(&String::from_utf8_lossy(&chunk));

            while let Some((frame, rest)) = sse::split_frame(&buffer) {
                buffer = rest;
                let Some(payload) = sse::data_payload(&frame) else {
                    continue;
                };

                if payload == sse::DONE_SENTINEL {
                    yield sse::format_frame(sse::DONE_SENTINEL);
                    break 'relay;
                }

                let out = match serde_json::from_str::<Value>(payload) {
                    Ok(v) => match transformer.process_response(v.clone(), &meta).await {
                        Ok(t) => t.to_string(),
                        Err(e) => {
                            tracing::warn!(
                                request_id = %meta.request_id,
                                "Response transformer failed on frame, relaying original: {}",
                                e
                            );
                            v.to_string()
                        }
                    },
                    // Non-JSON payloads relay untouched.
                    Err(_) => payload.to_string(),
                };
                yield sse::format_frame(&out);
            }
        }
    };

    let body = Body::from_stream(frames.map(|r: Result<String, anyhow::Error>| {
        r.map(Bytes::from)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))
    }));

    Response::builder()
        .status(StatusCode::OK)
        .header("content-type", "text/event-stream")
        .header("cache-control", "no-cache")
        .header("x-accel-buffering", "no")
        .body(body)
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

/// Catch-all: verbatim reverse proxy for every endpoint the chat route does
/// not special-case. Method, body, and headers pass through (minus `host`,
/// `connection`, and `content-length`, which is recomputed); the upstream
/// status, headers, and raw bytes are mirrored back unchanged.
async fn passthrough(State(state): State<ProxyState>, req: Request) -> Response {
    let (parts, body) = req.into_parts();
    let bytes = match axum::body::to_bytes(body, MAX_BODY_BYTES).await {
        Ok(b) => b,
        Err(e) => return (StatusCode::BAD_REQUEST, e.to_string()).into_response(),
    };

    let path_and_query = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let url = format!("{}{}", state.upstream_url, path_and_query);

    let method = match reqwest::Method::from_bytes(parts.method.as_str().as_bytes()) {
        Ok(m) => m,
        Err(_) => return (StatusCode::BAD_REQUEST, "unsupported method").into_response(),
    };

    tracing::debug!("Pass-through {} {}", parts.method, url);

    let mut builder = state
        .client
        .request(method, &url)
        .timeout(state.request_timeout);
    for (name, value) in parts.headers.iter() {
        let lower = name.as_str().to_ascii_lowercase();
        if matches!(lower.as_str(), "host" | "connection" | "content-length") {
            continue;
        }
        if let Ok(value) = value.to_str() {
            builder = builder.header(name.as_str(), value);
        }
    }

    let upstream = match builder.body(bytes).send().await {
        Ok(r) => r,
        Err(e) => {
            tracing::error!("Pass-through upstream request failed: {}", e);
            return (StatusCode::BAD_GATEWAY, e.to_string()).into_response();
        }
    };

    let status = upstream.status();
    let mut response = Response::builder().status(status.as_u16());
    for (name, value) in upstream.headers() {
        let lower = name.as_str().to_ascii_lowercase();
        if matches!(
            lower.as_str(),
            "connection" | "transfer-encoding" | "content-length"
        ) {
            continue;
        }
        response = response.header(name.as_str(), value.as_bytes());
    }

    let bytes = upstream.bytes().await.unwrap_or_default();
    response
        .body(Body::from(bytes))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}
