//! Caller-facing stream wrapper.
//!
//! [`ObservedStream`] forwards chunks from the serving adapter while folding
//! them into a response. When the stream ends, fails, or is dropped early it
//! fires the terminal callback exactly once. A gap between chunks longer than
//! the idle timeout ends the stream with a timeout error.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::Stream;
use tokio::time::{Instant, Sleep};
use uuid::Uuid;

use super::callbacks::{CallbackEvent, Callbacks};
use super::Attempt;
use crate::adapter::ChunkStream;
use crate::canonical::{CanonicalRequest, CanonicalResponseChunk, ChunkAggregator};
use crate::error::{CandidateFailure, DispatchError, ProviderError};

/// Context needed to report the outcome once the stream is done.
pub(crate) struct StreamReport {
    pub request_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub started: Instant,
    pub request: Arc<CanonicalRequest>,
    pub served_by: Attempt,
    pub skipped: Vec<CandidateFailure>,
    pub callbacks: Callbacks,
}

pub struct ObservedStream {
    inner: ChunkStream,
    aggregator: ChunkAggregator,
    report: Option<StreamReport>,
    idle_timeout: Duration,
    idle: Pin<Box<Sleep>>,
    terminated: bool,
}

impl ObservedStream {
    pub(crate) fn new(inner: ChunkStream, report: StreamReport, idle_timeout: Duration) -> Self {
        Self {
            inner,
            aggregator: ChunkAggregator::new(),
            report: Some(report),
            idle_timeout,
            idle: Box::pin(tokio::time::sleep(idle_timeout)),
            terminated: false,
        }
    }

    fn finish(&mut self, error: Option<&ProviderError>, complete: bool) {
        let Some(report) = self.report.take() else {
            return;
        };

        let outcome = match error {
            None => {
                let mut response = std::mem::take(&mut self.aggregator).finish();
                if !complete {
                    response
                        .hidden_params
                        .insert("stream_incomplete".to_string(), true.into());
                }
                Ok(response)
            }
            Some(error) => {
                let mut failures = report.skipped.clone();
                failures.push(CandidateFailure {
                    provider_id: report.served_by.provider_id.clone(),
                    target_model: report.served_by.target_model.clone(),
                    credential: report.served_by.credential.clone(),
                    cause: error.clone().into(),
                    elapsed: report.started.elapsed(),
                });
                Err(DispatchError::AllCandidatesFailed {
                    alias: report.request.model_alias.clone(),
                    failures,
                })
            }
        };

        tracing::debug!(
            alias = %report.request.model_alias,
            provider = %report.served_by.provider_id,
            complete,
            "Stream finished"
        );

        report.callbacks.fire(CallbackEvent {
            request_id: report.request_id,
            started_at: report.started_at,
            request: report.request,
            outcome,
            served_by: Some(report.served_by),
            skipped: report.skipped,
            latency: report.started.elapsed(),
            streamed: true,
        });
    }
}

impl Stream for ObservedStream {
    type Item = Result<CanonicalResponseChunk, ProviderError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.terminated {
            return Poll::Ready(None);
        }
        match this.inner.as_mut().poll_next(cx) {
            Poll::Ready(Some(Ok(chunk))) => {
                this.aggregator.push(&chunk);
                let deadline = Instant::now() + this.idle_timeout;
                this.idle.as_mut().reset(deadline);
                Poll::Ready(Some(Ok(chunk)))
            }
            Poll::Ready(Some(Err(error))) => {
                this.finish(Some(&error), false);
                Poll::Ready(Some(Err(error)))
            }
            Poll::Ready(None) => {
                this.terminated = true;
                this.finish(None, true);
                Poll::Ready(None)
            }
            Poll::Pending => match this.idle.as_mut().poll(cx) {
                Poll::Ready(()) => {
                    tracing::warn!(
                        idle_ms = this.idle_timeout.as_millis() as u64,
                        "Stream stalled, closing upstream"
                    );
                    let error = ProviderError::timeout(this.idle_timeout);
                    this.terminated = true;
                    this.finish(Some(&error), false);
                    Poll::Ready(Some(Err(error)))
                }
                Poll::Pending => Poll::Pending,
            },
        }
    }
}

impl Drop for ObservedStream {
    fn drop(&mut self) {
        // Consumer went away before the end
        self.finish(None, false);
    }
}
