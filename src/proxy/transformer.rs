//! Pluggable prompt/response interception.
//!
//! The proxy only depends on the `RequestTransformer` trait; hosts register
//! a concrete implementation by declared interface conformance, never by
//! structural probing of module exports. Transformer failures are always
//! fail-open at the call site: the unmodified input continues through the
//! pipeline and the error is logged, never surfaced to the HTTP caller.

use std::collections::BTreeMap;
use std::net::SocketAddr;

use anyhow::Result;
use async_trait::async_trait;
use axum::http::HeaderMap;
use serde::Serialize;
use serde_json::{json, Value};

use super::exchange_log::{ExchangeLogger, Phase};

/// Caller headers worth keeping in exchange metadata. Authorization is
/// deliberately excluded — it is forwarded upstream, never logged.
const META_HEADERS: &[&str] = &["content-type", "user-agent", "accept", "x-request-source"];

/// Correlation metadata for one proxied request.
#[derive(Debug, Clone, Serialize)]
pub struct ExchangeMeta {
    pub request_id: String,
    pub model: String,
    pub path: String,
    pub method: String,
    pub client_addr: String,
    pub headers: BTreeMap<String, String>,
}

impl ExchangeMeta {
    pub fn new(
        model: &str,
        path: &str,
        method: &str,
        client_addr: SocketAddr,
        headers: &HeaderMap,
    ) -> Self {
        let mut subset = BTreeMap::new();
        for name in META_HEADERS {
            if let Some(value) = headers.get(*name).and_then(|v| v.to_str().ok()) {
                subset.insert(name.to_string(), value.to_string());
            }
        }
        Self {
            request_id: uuid::Uuid::new_v4().to_string(),
            model: model.to_string(),
            path: path.to_string(),
            method: method.to_string(),
            client_addr: client_addr.to_string(),
            headers: subset,
        }
    }
}

/// Intercepts inbound prompts and outbound response payloads.
///
/// Both hooks may rewrite their input or return it unchanged. Errors are
/// handled fail-open by the proxy.
#[async_trait]
pub trait RequestTransformer: Send + Sync {
    async fn process_prompt(&self, messages: Vec<Value>, meta: &ExchangeMeta)
        -> Result<Vec<Value>>;

    async fn process_response(&self, payload: Value, meta: &ExchangeMeta) -> Result<Value>;
}

/// Default transformer: records every exchange, changes nothing.
pub struct LoggingTransformer {
    logger: ExchangeLogger,
}

impl LoggingTransformer {
    pub fn new(logger: ExchangeLogger) -> Self {
        Self { logger }
    }
}

#[async_trait]
impl RequestTransformer for LoggingTransformer {
    async fn process_prompt(
        &self,
        messages: Vec<Value>,
        meta: &ExchangeMeta,
    ) -> Result<Vec<Value>> {
        self.logger.record(
            Phase::Inbound,
            json!({
                "meta": meta,
                "messages": messages,
            }),
        );
        Ok(messages)
    }

    async fn process_response(&self, payload: Value, meta: &ExchangeMeta) -> Result<Value> {
        self.logger.record(
            Phase::Outbound,
            json!({
                "meta": meta,
                "payload": payload,
            }),
        );
        Ok(payload)
    }
}
