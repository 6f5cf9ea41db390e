//! Success and failure callbacks.
//!
//! Every terminal dispatch outcome produces exactly one [`CallbackEvent`].
//! Events go through a bounded queue to a worker task, so a slow sink can
//! never hold up a response.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use uuid::Uuid;

use super::Attempt;
use crate::canonical::{CanonicalRequest, CanonicalResponse};
use crate::error::{CandidateFailure, DispatchError};

/// Terminal outcome of one dispatch.
///
/// All fields are owned so the event can cross into the worker task.
#[derive(Debug, Clone)]
pub struct CallbackEvent {
    pub request_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub request: Arc<CanonicalRequest>,
    pub outcome: Result<CanonicalResponse, DispatchError>,
    /// The candidate that produced the response, on success.
    pub served_by: Option<Attempt>,
    /// Candidates abandoned before the terminal outcome, in try order.
    pub skipped: Vec<CandidateFailure>,
    pub latency: Duration,
    pub streamed: bool,
}

impl CallbackEvent {
    pub fn is_success(&self) -> bool {
        self.outcome.is_ok()
    }
}

/// A named, pluggable callback sink.
#[async_trait]
pub trait DispatchCallback: Send + Sync {
    fn name(&self) -> &str;

    async fn call(&self, event: &CallbackEvent);
}

/// Structured usage record per dispatch, written through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct UsageLogCallback;

#[async_trait]
impl DispatchCallback for UsageLogCallback {
    fn name(&self) -> &str {
        "usage_log"
    }

    async fn call(&self, event: &CallbackEvent) {
        let provider = event.served_by.as_ref().map(|a| a.provider_id.as_str());
        let model = event.served_by.as_ref().map(|a| a.target_model.as_str());
        let latency_ms = event.latency.as_millis() as u64;

        match &event.outcome {
            Ok(response) => tracing::info!(
                request_id = %event.request_id,
                alias = %event.request.model_alias,
                provider = provider.unwrap_or_default(),
                model = model.unwrap_or_default(),
                prompt_tokens = response.usage.prompt_tokens,
                completion_tokens = response.usage.completion_tokens,
                skipped = event.skipped.len(),
                streaming = event.streamed,
                latency_ms,
                outcome = "success",
                "LLM usage"
            ),
            Err(error) => tracing::info!(
                request_id = %event.request_id,
                alias = %event.request.model_alias,
                error_kind = error.kind(),
                error = %error,
                streaming = event.streamed,
                latency_ms,
                outcome = "failure",
                "LLM usage"
            ),
        }
    }
}

/// Look up a built-in callback by its configured name.
pub fn builtin_callback(name: &str) -> Option<Arc<dyn DispatchCallback>> {
    match name {
        "usage_log" => Some(Arc::new(UsageLogCallback)),
        _ => None,
    }
}

/// Handle for firing callbacks. Cheap to clone.
#[derive(Clone, Default)]
pub struct Callbacks {
    tx: Option<mpsc::Sender<CallbackEvent>>,
}

impl fmt::Debug for Callbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Callbacks")
            .field("active", &self.tx.is_some())
            .finish()
    }
}

impl Callbacks {
    /// Callbacks that discard every event.
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    /// Start the delivery worker. Must be called inside a tokio runtime.
    pub fn spawn(
        on_success: Vec<Arc<dyn DispatchCallback>>,
        on_failure: Vec<Arc<dyn DispatchCallback>>,
        capacity: usize,
    ) -> Self {
        if on_success.is_empty() && on_failure.is_empty() {
            return Self::disabled();
        }
        let (tx, mut rx) = mpsc::channel::<CallbackEvent>(capacity.max(1));

        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let sinks = if event.is_success() {
                    &on_success
                } else {
                    &on_failure
                };
                for sink in sinks {
                    sink.call(&event).await;
                }
            }
            tracing::debug!("Callback worker stopped");
        });

        Self { tx: Some(tx) }
    }

    /// Queue an event without waiting.
    pub fn fire(&self, event: CallbackEvent) {
        let Some(tx) = &self.tx else { return };
        match tx.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => {
                tracing::warn!(
                    request_id = %event.request_id,
                    "Callback queue full, dropping event"
                );
            }
            Err(TrySendError::Closed(event)) => {
                tracing::debug!(request_id = %event.request_id, "Callback worker gone");
            }
        }
    }
}
