//! Adapter for any OpenAI-compatible `/chat/completions` endpoint.
//!
//! The entry's `base_url` option selects the endpoint. Streaming responses
//! are decoded from SSE with [`SseDecoder`], which reassembles lines split
//! across network chunk boundaries.

use std::collections::VecDeque;
use std::pin::Pin;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use reqwest::header;
use reqwest::Client;
use serde_json::json;

use super::{Capabilities, ChunkStream, InvokeContext, ProviderAdapter};
use crate::canonical::{
    CanonicalRequest, CanonicalResponse, CanonicalResponseChunk, ResponseFormatKind,
};
use crate::error::{ProviderError, ProviderErrorKind};

/// OpenAI-compatible HTTP adapter.
#[derive(Debug, Clone)]
pub struct OpenAiCompatAdapter {
    provider_id: String,
    client: Client,
    default_base_url: Option<String>,
    capabilities: Capabilities,
}

impl OpenAiCompatAdapter {
    pub fn new(provider_id: impl Into<String>, client: Client) -> Self {
        Self {
            provider_id: provider_id.into(),
            client,
            default_base_url: None,
            // Provider-side filters and search grounding have no OpenAI wire form
            capabilities: Capabilities::all()
                .without(crate::adapter::Feature::SafetySettings)
                .without(crate::adapter::Feature::Grounding),
        }
    }

    /// Base URL used when an entry does not set `options.base_url`.
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.default_base_url = Some(base_url.into());
        self
    }

    pub fn with_capabilities(mut self, capabilities: Capabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    fn endpoint(&self, ctx: &InvokeContext<'_>) -> Result<String, ProviderError> {
        let base = ctx
            .option_str("base_url")
            .or(self.default_base_url.as_deref())
            .ok_or_else(|| {
                ProviderError::malformed_request(format!(
                    "no base_url configured for provider '{}'",
                    self.provider_id
                ))
            })?;
        Ok(format!("{}/chat/completions", base.trim_end_matches('/')))
    }

    async fn send(
        &self,
        body: &serde_json::Value,
        ctx: &InvokeContext<'_>,
    ) -> Result<reqwest::Response, ProviderError> {
        let url = self.endpoint(ctx)?;

        let mut upstream = self
            .client
            .post(&url)
            .header(header::CONTENT_TYPE, "application/json")
            .json(body);
        if let Some(key) = ctx.auth.api_key().filter(|k| !k.is_empty()) {
            upstream = upstream.header(header::AUTHORIZATION, format!("Bearer {}", key));
        }

        let response = upstream.send().await.map_err(|e| {
            tracing::warn!(error = %e, provider = %self.provider_id, "Failed to reach provider");
            map_transport_error(e)
        })?;

        let status = response.status();
        if !status.is_success() {
            let error_body = response.text().await.unwrap_or_default();
            tracing::warn!(
                status = %status,
                provider = %self.provider_id,
                body = %error_body,
                "Provider returned error"
            );
            return Err(ProviderError::from_status(status.as_u16(), error_body));
        }
        Ok(response)
    }
}

fn map_transport_error(e: reqwest::Error) -> ProviderError {
    if e.is_timeout() {
        ProviderError::new(ProviderErrorKind::Timeout, e.to_string())
    } else if e.is_decode() {
        ProviderError::malformed_output(e.to_string())
    } else {
        ProviderError::transient(e.to_string())
    }
}

/// Build the upstream body: canonical fields, concrete model, OpenAI-shaped
/// `response_format`, gateway-only fields removed.
fn upstream_body(request: &CanonicalRequest, target_model: &str, stream: bool) -> serde_json::Value {
    let mut body = serde_json::to_value(request).unwrap_or_else(|_| json!({}));
    let Some(obj) = body.as_object_mut() else {
        return body;
    };

    obj.insert("model".to_string(), target_model.into());
    obj.remove("safety_settings");

    if let Some(format) = &request.response_format {
        let translated = match format.kind {
            ResponseFormatKind::Text => json!({ "type": "text" }),
            ResponseFormatKind::JsonObject => json!({ "type": "json_object" }),
            ResponseFormatKind::JsonSchema => json!({
                "type": "json_schema",
                "json_schema": {
                    "name": "response",
                    "schema": format.schema.clone().unwrap_or_else(|| json!({})),
                }
            }),
        };
        obj.insert("response_format".to_string(), translated);
    }

    if stream {
        obj.insert("stream".to_string(), true.into());
        // Ask for a final usage chunk so streamed calls can be accounted
        obj.insert("stream_options".to_string(), json!({ "include_usage": true }));
    } else {
        obj.remove("stream");
    }
    body
}

#[async_trait]
impl ProviderAdapter for OpenAiCompatAdapter {
    fn provider_id(&self) -> &str {
        &self.provider_id
    }

    fn capabilities(&self) -> Capabilities {
        self.capabilities.clone()
    }

    async fn invoke(
        &self,
        request: &CanonicalRequest,
        ctx: InvokeContext<'_>,
    ) -> Result<CanonicalResponse, ProviderError> {
        let body = upstream_body(request, ctx.target_model, false);
        let response = self.send(&body, &ctx).await?;

        let text = response.text().await.map_err(map_transport_error)?;
        let raw: serde_json::Value = serde_json::from_str(&text).map_err(|e| {
            ProviderError::malformed_output(format!("response is not JSON: {}", e))
        })?;

        let mut parsed: CanonicalResponse = serde_json::from_value(raw.clone()).map_err(|e| {
            ProviderError::malformed_output(format!("unexpected response shape: {}", e))
        })?;

        if let Some(fingerprint) = raw.get("system_fingerprint").filter(|v| !v.is_null()) {
            parsed
                .hidden_params
                .insert("system_fingerprint".to_string(), fingerprint.clone());
        }
        Ok(parsed)
    }

    async fn invoke_stream(
        &self,
        request: &CanonicalRequest,
        ctx: InvokeContext<'_>,
    ) -> Result<ChunkStream, ProviderError> {
        let body = upstream_body(request, ctx.target_model, true);
        let response = self.send(&body, &ctx).await?;

        let state = DecodeState {
            body: Box::pin(response.bytes_stream()),
            decoder: SseDecoder::new(),
            pending: VecDeque::new(),
            finished: false,
        };

        let stream = futures::stream::unfold(state, |mut state| async move {
            loop {
                if let Some(item) = state.pending.pop_front() {
                    return Some((item, state));
                }
                if state.finished {
                    return None;
                }
                match state.body.next().await {
                    Some(Ok(bytes)) => {
                        state.pending.extend(state.decoder.push(&bytes));
                        if state.decoder.is_done() {
                            state.finished = true;
                        }
                    }
                    Some(Err(e)) => {
                        state.finished = true;
                        state.pending.push_back(Err(map_transport_error(e)));
                    }
                    None => {
                        state.finished = true;
                        state.pending.extend(state.decoder.finish());
                    }
                }
            }
        });

        Ok(Box::pin(stream))
    }
}

type ByteStream = Pin<Box<dyn Stream<Item = reqwest::Result<Bytes>> + Send>>;

struct DecodeState {
    body: ByteStream,
    decoder: SseDecoder,
    pending: VecDeque<Result<CanonicalResponseChunk, ProviderError>>,
    finished: bool,
}

/// Line-buffered SSE decoder for OpenAI-style chunk streams.
///
/// Buffers raw bytes across chunk boundaries, reassembles complete lines and
/// turns each `data:` payload into a [`CanonicalResponseChunk`].
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
    done: bool,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `data: [DONE]` has been seen.
    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Feed a network chunk; returns every complete event it finished.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<Result<CanonicalResponseChunk, ProviderError>> {
        self.buffer.extend_from_slice(bytes);

        let mut out = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            if let Some(item) = self.decode_line(&line) {
                out.push(item);
            }
        }
        out
    }

    /// Flush a trailing line that had no newline.
    pub fn finish(&mut self) -> Vec<Result<CanonicalResponseChunk, ProviderError>> {
        if self.buffer.is_empty() {
            return Vec::new();
        }
        let line = std::mem::take(&mut self.buffer);
        self.decode_line(&line).into_iter().collect()
    }

    fn decode_line(&mut self, raw: &[u8]) -> Option<Result<CanonicalResponseChunk, ProviderError>> {
        if self.done {
            return None;
        }
        let line = match std::str::from_utf8(raw) {
            Ok(line) => line.trim_end_matches(['\r', '\n']),
            Err(_) => {
                return Some(Err(ProviderError::malformed_output(
                    "stream contained invalid UTF-8",
                )))
            }
        };

        // Comments, event names and blank separators carry no payload
        let data = line.strip_prefix("data:")?.trim_start();
        if data == "[DONE]" {
            self.done = true;
            return None;
        }

        let value: serde_json::Value = match serde_json::from_str(data) {
            Ok(value) => value,
            Err(e) => {
                return Some(Err(ProviderError::malformed_output(format!(
                    "invalid stream event: {}",
                    e
                ))))
            }
        };

        if let Some(error) = value.get("error") {
            return Some(Err(stream_error(error)));
        }

        Some(
            serde_json::from_value(value).map_err(|e| {
                ProviderError::malformed_output(format!("unexpected chunk shape: {}", e))
            }),
        )
    }
}

/// Map an in-stream `{"error": {...}}` event onto the shared taxonomy.
///
/// A numeric `code` is treated as an HTTP status; otherwise the string
/// `code` or `type` is matched against the usual OpenAI-style names.
fn stream_error(error: &serde_json::Value) -> ProviderError {
    let message = error
        .get("message")
        .and_then(|m| m.as_str())
        .map(str::to_string)
        .unwrap_or_else(|| error.to_string());

    if let Some(status) = error
        .get("code")
        .and_then(|c| c.as_u64())
        .and_then(|c| u16::try_from(c).ok())
    {
        return ProviderError::from_status(status, message);
    }

    let label = ["code", "type"]
        .iter()
        .filter_map(|field| error.get(*field).and_then(|v| v.as_str()))
        .next()
        .unwrap_or_default();
    let kind = match label {
        "rate_limit_exceeded" | "rate_limit_error" | "insufficient_quota" => {
            ProviderErrorKind::RateLimited
        }
        "invalid_api_key" | "authentication_error" | "permission_error" => {
            ProviderErrorKind::AuthFailed
        }
        "invalid_request_error" | "context_length_exceeded" | "model_not_found" => {
            ProviderErrorKind::MalformedRequest
        }
        "server_error" | "overloaded_error" | "api_error" | "service_unavailable" => {
            ProviderErrorKind::Transient
        }
        "timeout" | "request_timeout" => ProviderErrorKind::Timeout,
        _ => ProviderErrorKind::Other,
    };
    ProviderError::new(kind, message)
}
