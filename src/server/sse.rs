//! SSE encoding of dispatched streams.
//!
//! Each chunk becomes one `data:` event. A provider error inside the stream
//! is written as an `{"error":{...}}` event and ends the body without
//! `[DONE]`, so clients can tell a broken stream from a finished one.

use std::convert::Infallible;

use axum::body::Body;
use bytes::Bytes;
use futures::StreamExt;

use crate::canonical::CanonicalResponseChunk;
use crate::dispatch::ObservedStream;
use crate::error::ProviderError;

const DONE_EVENT: &[u8] = b"data: [DONE]\n\n";

fn event(payload: &str) -> Bytes {
    Bytes::from(format!("data: {}\n\n", payload))
}

fn encode_chunk(chunk: &CanonicalResponseChunk) -> Bytes {
    match serde_json::to_string(chunk) {
        Ok(json) => event(&json),
        Err(e) => {
            tracing::error!(error = %e, "Failed to encode stream chunk");
            encode_error(&ProviderError::malformed_output(e.to_string()))
        }
    }
}

fn encode_error(error: &ProviderError) -> Bytes {
    let mut body = serde_json::json!({
        "message": error.message,
        "type": error.kind.as_str(),
    });
    if let Some(status) = error.status {
        body["code"] = status.into();
    }
    event(&serde_json::json!({ "error": body }).to_string())
}

/// Turn an observed stream into an SSE response body.
///
/// The stream is dropped as soon as the body ends or the client goes away,
/// which reports the outcome to callbacks.
pub fn sse_body(stream: ObservedStream) -> Body {
    let events = futures::stream::unfold(Some(stream), |state| async move {
        let mut stream = state?;
        match stream.next().await {
            Some(Ok(chunk)) => Some((encode_chunk(&chunk), Some(stream))),
            Some(Err(error)) => {
                tracing::warn!(error = %error, "Provider stream failed mid-response");
                Some((encode_error(&error), None))
            }
            None => Some((Bytes::from_static(DONE_EVENT), None)),
        }
    })
    .map(Ok::<_, Infallible>);

    Body::from_stream(events)
}
