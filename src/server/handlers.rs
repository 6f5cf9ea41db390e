//! HTTP request handlers.

use axum::{
    extract::{rejection::JsonRejection, State},
    http::{header, HeaderName, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use tokio_util::sync::CancellationToken;

use super::sse::sse_body;
use super::AppState;
use crate::canonical::CanonicalRequest;
use crate::dispatch::{Attempt, DispatchedStream};
use crate::error::{CandidateFailure, DispatchError, Error};

/// Response header: provider that served the request.
pub const MODELGATE_PROVIDER_HEADER: &str = "x-modelgate-provider";
/// Response header: concrete provider model that served the request.
pub const MODELGATE_MODEL_HEADER: &str = "x-modelgate-model";
/// Response header: wall-clock dispatch latency in milliseconds (non-streaming only).
pub const MODELGATE_LATENCY_MS_HEADER: &str = "x-modelgate-latency-ms";
/// Response header: every candidate tried, in order.
pub const MODELGATE_ATTEMPTS_HEADER: &str = "x-modelgate-attempts";
/// Response header: present with value "true" on streaming responses.
pub const MODELGATE_STREAMING_HEADER: &str = "x-modelgate-streaming";

/// Format the attempts header value.
///
/// Abandoned candidates are listed as `provider/model (kind)` followed by the
/// serving candidate as plain `provider/model`. Returns `None` if nothing was tried.
pub fn format_attempts_header(
    skipped: &[CandidateFailure],
    served_by: Option<&Attempt>,
) -> Option<String> {
    let attempts: Vec<String> = skipped
        .iter()
        .map(|f| format!("{}/{} ({})", f.provider_id, f.target_model, f.cause.kind()))
        .chain(served_by.map(Attempt::to_string))
        .collect();

    (!attempts.is_empty()).then(|| attempts.join(", "))
}

fn insert_header(response: &mut Response, name: &'static str, value: &str) {
    match HeaderValue::from_str(value) {
        Ok(value) => {
            response
                .headers_mut()
                .insert(HeaderName::from_static(name), value);
        }
        Err(_) => tracing::debug!(header = name, "Skipping header with non-visible characters"),
    }
}

/// Attach provenance headers to a successful response.
///
/// Latency is omitted on streaming responses (not known at header-send time).
fn attach_modelgate_headers(
    response: &mut Response,
    served_by: &Attempt,
    skipped: &[CandidateFailure],
    latency_ms: Option<u64>,
) {
    insert_header(response, MODELGATE_PROVIDER_HEADER, &served_by.provider_id);
    insert_header(response, MODELGATE_MODEL_HEADER, &served_by.target_model);
    if let Some(attempts) = format_attempts_header(skipped, Some(served_by)) {
        insert_header(response, MODELGATE_ATTEMPTS_HEADER, &attempts);
    }
    match latency_ms {
        Some(latency_ms) => {
            response.headers_mut().insert(
                HeaderName::from_static(MODELGATE_LATENCY_MS_HEADER),
                HeaderValue::from(latency_ms),
            );
        }
        None => {
            response.headers_mut().insert(
                HeaderName::from_static(MODELGATE_STREAMING_HEADER),
                HeaderValue::from_static("true"),
            );
        }
    }
}

fn dispatch_error_response(error: DispatchError) -> Response {
    let attempts = match &error {
        DispatchError::AllCandidatesFailed { failures, .. } => {
            format_attempts_header(failures, None)
        }
        _ => None,
    };
    let mut response = Error::Dispatch(error).into_response();
    if let Some(attempts) = attempts {
        insert_header(&mut response, MODELGATE_ATTEMPTS_HEADER, &attempts);
    }
    response
}

/// Handle POST /v1/chat/completions
pub async fn chat_completions(
    State(state): State<AppState>,
    payload: Result<Json<CanonicalRequest>, JsonRejection>,
) -> Response {
    let request = match payload {
        Ok(Json(request)) => request,
        Err(rejection) => return Error::BadRequest(rejection.body_text()).into_response(),
    };

    tracing::info!(
        model = %request.model_alias,
        stream = request.stream,
        messages = request.messages.len(),
        "Received chat completion request"
    );

    // Fires when the client disconnects and this future is dropped
    let cancel = CancellationToken::new();
    let _cancel_on_drop = cancel.clone().drop_guard();

    if request.stream {
        return match state.dispatcher.dispatch_stream(request, cancel).await {
            Ok(DispatchedStream {
                stream,
                served_by,
                skipped,
            }) => {
                let mut response = Response::new(sse_body(stream));
                let headers = response.headers_mut();
                headers.insert(
                    header::CONTENT_TYPE,
                    HeaderValue::from_static("text/event-stream"),
                );
                headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
                attach_modelgate_headers(&mut response, &served_by, &skipped, None);
                response
            }
            Err(error) => dispatch_error_response(error),
        };
    }

    match state.dispatcher.dispatch_detailed(request, cancel).await {
        Ok(dispatched) => {
            let latency_ms = dispatched.latency.as_millis() as u64;
            let mut response = Json(dispatched.response).into_response();
            attach_modelgate_headers(
                &mut response,
                &dispatched.served_by,
                &dispatched.skipped,
                Some(latency_ms),
            );
            response
        }
        Err(error) => dispatch_error_response(error),
    }
}

/// Handle GET /v1/models - list exact aliases in registration order
pub async fn list_models(State(state): State<AppState>) -> impl IntoResponse {
    let registry = state.dispatcher.router().registry();

    let models: Vec<serde_json::Value> = registry
        .aliases()
        .into_iter()
        .map(|alias| {
            let owned_by = registry
                .entries()
                .find(|e| e.alias == alias)
                .map(|e| e.provider_id.as_str())
                .unwrap_or_default();
            serde_json::json!({
                "id": alias,
                "object": "model",
                "owned_by": owned_by,
            })
        })
        .collect();

    Json(serde_json::json!({
        "object": "list",
        "data": models
    }))
}

/// Handle GET /health
pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let registry = state.dispatcher.router().registry();
    let mut providers: Vec<&str> = state.dispatcher.adapters().provider_ids().collect();
    providers.sort_unstable();

    (
        StatusCode::OK,
        Json(serde_json::json!({
            "status": "ok",
            "models": registry.len(),
            "providers": providers,
        })),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{CandidateError, ProviderError};
    use axum::body::Body;
    use std::time::Duration;

    fn failure(provider: &str, model: &str, cause: CandidateError) -> CandidateFailure {
        CandidateFailure {
            provider_id: provider.to_string(),
            target_model: model.to_string(),
            credential: "inline".to_string(),
            cause,
            elapsed: Duration::from_millis(5),
        }
    }

    fn attempt(provider: &str, model: &str) -> Attempt {
        Attempt {
            provider_id: provider.to_string(),
            target_model: model.to_string(),
            credential: "inline".to_string(),
        }
    }

    #[test]
    fn test_format_attempts_header_empty() {
        assert_eq!(format_attempts_header(&[], None), None);
    }

    #[test]
    fn test_format_attempts_header_served_first_try() {
        let served = attempt("openai", "gpt-4o");
        assert_eq!(
            format_attempts_header(&[], Some(&served)).as_deref(),
            Some("openai/gpt-4o")
        );
    }

    #[test]
    fn test_format_attempts_header_preserves_try_order() {
        let skipped = vec![
            failure(
                "azure",
                "gpt-4o",
                ProviderError::rate_limited("slow down").into(),
            ),
            failure(
                "bedrock",
                "claude",
                CandidateError::NoAdapter {
                    provider_id: "bedrock".to_string(),
                },
            ),
        ];
        let served = attempt("openai", "gpt-4o");
        assert_eq!(
            format_attempts_header(&skipped, Some(&served)).as_deref(),
            Some(
                "azure/gpt-4o (provider_error_retryable), bedrock/claude (no_adapter), openai/gpt-4o"
            )
        );
    }

    #[test]
    fn test_attach_headers_non_streaming() {
        let mut response = Response::new(Body::empty());
        attach_modelgate_headers(&mut response, &attempt("openai", "gpt-4o"), &[], Some(1523));
        let headers = response.headers();
        assert_eq!(headers.get(MODELGATE_PROVIDER_HEADER).unwrap(), "openai");
        assert_eq!(headers.get(MODELGATE_MODEL_HEADER).unwrap(), "gpt-4o");
        assert_eq!(headers.get(MODELGATE_LATENCY_MS_HEADER).unwrap(), "1523");
        assert_eq!(headers.get(MODELGATE_ATTEMPTS_HEADER).unwrap(), "openai/gpt-4o");
        assert!(headers.get(MODELGATE_STREAMING_HEADER).is_none());
    }

    #[test]
    fn test_attach_headers_streaming() {
        let mut response = Response::new(Body::empty());
        attach_modelgate_headers(&mut response, &attempt("echo", "echo-1"), &[], None);
        let headers = response.headers();
        assert_eq!(headers.get(MODELGATE_STREAMING_HEADER).unwrap(), "true");
        assert!(headers.get(MODELGATE_LATENCY_MS_HEADER).is_none());
    }

    #[test]
    fn test_error_response_lists_attempts() {
        let error = DispatchError::AllCandidatesFailed {
            alias: "gpt-4".to_string(),
            failures: vec![failure(
                "azure",
                "gpt-4o",
                ProviderError::from_status(503, "busy").into(),
            )],
        };
        let response = dispatch_error_response(error);
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(
            response.headers().get(MODELGATE_ATTEMPTS_HEADER).unwrap(),
            "azure/gpt-4o (provider_error_retryable)"
        );
    }
}
