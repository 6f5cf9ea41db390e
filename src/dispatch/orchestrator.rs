//! Per-request dispatch: route, then try candidates strictly in order.
//!
//! For each candidate the credential is resolved, the adapter looked up and
//! its capabilities checked before anything is sent. Invocations run under
//! an independent timeout and the caller's cancellation token. Failures are
//! recorded in try order and only surface as an aggregate.

use std::collections::BTreeSet;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::alerting::{AlertEvent, AlertKind, Alerter};
use super::callbacks::{CallbackEvent, Callbacks};
use super::stream::{ObservedStream, StreamReport};
use crate::adapter::{AdapterRegistry, ChunkStream, Feature, InvokeContext, ProviderAdapter};
use crate::canonical::{CanonicalRequest, CanonicalResponse};
use crate::credentials::{AuthContext, CredentialResolver};
use crate::error::{CandidateError, CandidateFailure, DispatchError, ProviderError, ProviderErrorKind};
use crate::registry::{ModelRegistry, ResolvedEntry};
use crate::router::Router;
use crate::schema::CompiledSchema;

/// Default per-candidate invocation timeout.
pub const DEFAULT_CANDIDATE_TIMEOUT: Duration = Duration::from_secs(60);

/// Default elapsed time after which a candidate counts as slow.
pub const DEFAULT_SLOW_THRESHOLD: Duration = Duration::from_secs(30);

/// Default longest gap between chunks of an opened stream.
pub const DEFAULT_STREAM_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchSettings {
    pub candidate_timeout: Duration,
    pub slow_request_threshold: Duration,
    pub stream_idle_timeout: Duration,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            candidate_timeout: DEFAULT_CANDIDATE_TIMEOUT,
            slow_request_threshold: DEFAULT_SLOW_THRESHOLD,
            stream_idle_timeout: DEFAULT_STREAM_IDLE_TIMEOUT,
        }
    }
}

/// One candidate as it was tried.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attempt {
    pub provider_id: String,
    pub target_model: String,
    /// Redacted credential description.
    pub credential: String,
}

impl From<&ResolvedEntry> for Attempt {
    fn from(candidate: &ResolvedEntry) -> Self {
        Self {
            provider_id: candidate.entry.provider_id.clone(),
            target_model: candidate.target_model.clone(),
            credential: candidate.entry.credential.describe(),
        }
    }
}

impl fmt::Display for Attempt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.provider_id, self.target_model)
    }
}

/// A successful dispatch with its provenance.
#[derive(Debug, Clone)]
pub struct Dispatched {
    pub response: CanonicalResponse,
    pub served_by: Attempt,
    /// Candidates abandoned before `served_by`, in try order.
    pub skipped: Vec<CandidateFailure>,
    pub latency: Duration,
}

/// A stream opened on some candidate.
pub struct DispatchedStream {
    pub stream: ObservedStream,
    pub served_by: Attempt,
    pub skipped: Vec<CandidateFailure>,
}

impl fmt::Debug for DispatchedStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DispatchedStream")
            .field("served_by", &self.served_by)
            .field("skipped", &self.skipped.len())
            .finish()
    }
}

/// The caller's token fired mid-dispatch.
struct Cancelled;

/// Top-level entry point tying router, credentials, adapters and validation together.
pub struct Dispatcher {
    router: Arc<Router>,
    adapters: AdapterRegistry,
    credentials: Arc<CredentialResolver>,
    settings: DispatchSettings,
    alerter: Alerter,
    callbacks: Callbacks,
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("router", &self.router)
            .field("adapters", &self.adapters)
            .field("settings", &self.settings)
            .finish()
    }
}

impl Dispatcher {
    pub fn new(router: Arc<Router>, adapters: AdapterRegistry) -> Self {
        Self {
            router,
            adapters,
            credentials: Arc::new(CredentialResolver::new()),
            settings: DispatchSettings::default(),
            alerter: Alerter::disabled(),
            callbacks: Callbacks::disabled(),
        }
    }

    pub fn with_credentials(mut self, credentials: Arc<CredentialResolver>) -> Self {
        self.credentials = credentials;
        self
    }

    pub fn with_settings(mut self, settings: DispatchSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_alerter(mut self, alerter: Alerter) -> Self {
        self.alerter = alerter;
        self
    }

    pub fn with_callbacks(mut self, callbacks: Callbacks) -> Self {
        self.callbacks = callbacks;
        self
    }

    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    pub fn adapters(&self) -> &AdapterRegistry {
        &self.adapters
    }

    pub fn credentials(&self) -> &Arc<CredentialResolver> {
        &self.credentials
    }

    pub fn settings(&self) -> DispatchSettings {
        self.settings
    }

    /// Swap in a new registry and forget cached credentials.
    pub fn reload(&self, registry: ModelRegistry) {
        self.router.reload(registry);
        self.credentials.clear();
    }

    pub async fn dispatch(&self, request: CanonicalRequest) -> Result<CanonicalResponse, DispatchError> {
        self.dispatch_with_cancel(request, CancellationToken::new())
            .await
    }

    pub async fn dispatch_with_cancel(
        &self,
        request: CanonicalRequest,
        cancel: CancellationToken,
    ) -> Result<CanonicalResponse, DispatchError> {
        self.dispatch_detailed(request, cancel)
            .await
            .map(|d| d.response)
    }

    /// Non-streaming dispatch returning which candidate served the request.
    pub async fn dispatch_detailed(
        &self,
        request: CanonicalRequest,
        cancel: CancellationToken,
    ) -> Result<Dispatched, DispatchError> {
        let request_id = Uuid::new_v4();
        let started_at = Utc::now();
        let started = Instant::now();
        let request = Arc::new(request);

        let mut skipped = Vec::new();
        let outcome = self.run_candidates(&request, &cancel, &mut skipped).await;
        let result = outcome.map(|(response, served_by)| Dispatched {
            response,
            served_by,
            skipped: skipped.clone(),
            latency: started.elapsed(),
        });

        match &result {
            Ok(dispatched) => tracing::info!(
                alias = %request.model_alias,
                provider = %dispatched.served_by.provider_id,
                model = %dispatched.served_by.target_model,
                skipped = dispatched.skipped.len(),
                latency_ms = dispatched.latency.as_millis() as u64,
                "Dispatch succeeded"
            ),
            Err(error) => tracing::warn!(
                alias = %request.model_alias,
                kind = error.kind(),
                error = %error,
                "Dispatch failed"
            ),
        }

        self.callbacks.fire(CallbackEvent {
            request_id,
            started_at,
            request,
            outcome: result
                .as_ref()
                .map(|d| d.response.clone())
                .map_err(Clone::clone),
            served_by: result.as_ref().ok().map(|d| d.served_by.clone()),
            skipped,
            latency: started.elapsed(),
            streamed: false,
        });

        result
    }

    /// Streaming dispatch.
    ///
    /// Falls back across candidates only until a stream has been opened;
    /// errors inside an open stream are delivered to the caller.
    pub async fn dispatch_stream(
        &self,
        request: CanonicalRequest,
        cancel: CancellationToken,
    ) -> Result<DispatchedStream, DispatchError> {
        let request_id = Uuid::new_v4();
        let started_at = Utc::now();
        let started = Instant::now();
        let request = Arc::new(request);

        let mut skipped = Vec::new();
        let opened = self
            .open_stream(&request, &cancel, &mut skipped)
            .await;

        match opened {
            Ok((inner, served_by)) => {
                tracing::info!(
                    alias = %request.model_alias,
                    provider = %served_by.provider_id,
                    model = %served_by.target_model,
                    skipped = skipped.len(),
                    "Stream opened"
                );
                let report = StreamReport {
                    request_id,
                    started_at,
                    started,
                    request,
                    served_by: served_by.clone(),
                    skipped: skipped.clone(),
                    callbacks: self.callbacks.clone(),
                };
                Ok(DispatchedStream {
                    stream: ObservedStream::new(inner, report, self.settings.stream_idle_timeout),
                    served_by,
                    skipped,
                })
            }
            Err(error) => {
                tracing::warn!(
                    alias = %request.model_alias,
                    kind = error.kind(),
                    error = %error,
                    "Stream dispatch failed"
                );
                self.callbacks.fire(CallbackEvent {
                    request_id,
                    started_at,
                    request,
                    outcome: Err(error.clone()),
                    served_by: None,
                    skipped,
                    latency: started.elapsed(),
                    streamed: true,
                });
                Err(error)
            }
        }
    }

    async fn run_candidates(
        &self,
        request: &CanonicalRequest,
        cancel: &CancellationToken,
        failures: &mut Vec<CandidateFailure>,
    ) -> Result<(CanonicalResponse, Attempt), DispatchError> {
        let schema = compile_enforced_schema(request)?;
        let mut required = request.required_features();
        required.remove(&Feature::Streaming);

        let decision = self.router.route(&request.model_alias)?;
        let alias = decision.alias.clone();

        for candidate in decision {
            if cancel.is_cancelled() {
                return Err(DispatchError::Cancelled { alias });
            }
            let started = Instant::now();
            let (adapter, auth) = match self.prepare(&candidate, &required) {
                Ok(prepared) => prepared,
                Err(cause) => {
                    failures.push(self.record(&alias, &candidate, cause, started.elapsed()));
                    continue;
                }
            };

            let ctx = InvokeContext {
                entry: &candidate.entry,
                target_model: &candidate.target_model,
                auth: &auth,
            };
            let call = adapter.invoke(request, ctx);
            let response = match self
                .guarded(&alias, &candidate, started, call, cancel, failures)
                .await
            {
                Ok(Some(response)) => response,
                Ok(None) => continue,
                Err(Cancelled) => return Err(DispatchError::Cancelled { alias }),
            };

            let served_by = Attempt::from(&candidate);
            let Some(schema) = &schema else {
                return Ok((response, served_by));
            };

            // The model answered; a non-conforming answer is terminal
            let outcome = schema.check(response);
            if !outcome.valid {
                return Err(DispatchError::SchemaValidation {
                    provider_id: served_by.provider_id,
                    errors: outcome.errors,
                    raw_response: Box::new(outcome.raw_response),
                });
            }
            return Ok((outcome.raw_response, served_by));
        }

        Err(DispatchError::AllCandidatesFailed {
            alias,
            failures: failures.clone(),
        })
    }

    async fn open_stream(
        &self,
        request: &CanonicalRequest,
        cancel: &CancellationToken,
        failures: &mut Vec<CandidateFailure>,
    ) -> Result<(ChunkStream, Attempt), DispatchError> {
        if request
            .response_format
            .as_ref()
            .is_some_and(|f| f.enforce_validation)
        {
            return Err(DispatchError::InvalidRequest {
                message: "schema enforcement is not supported for streaming requests".to_string(),
            });
        }
        let mut required = request.required_features();
        required.insert(Feature::Streaming);

        let decision = self.router.route(&request.model_alias)?;
        let alias = decision.alias.clone();

        for candidate in decision {
            if cancel.is_cancelled() {
                return Err(DispatchError::Cancelled { alias });
            }
            let started = Instant::now();
            let (adapter, auth) = match self.prepare(&candidate, &required) {
                Ok(prepared) => prepared,
                Err(cause) => {
                    failures.push(self.record(&alias, &candidate, cause, started.elapsed()));
                    continue;
                }
            };

            let ctx = InvokeContext {
                entry: &candidate.entry,
                target_model: &candidate.target_model,
                auth: &auth,
            };
            let call = adapter.invoke_stream(request, ctx);
            match self
                .guarded(&alias, &candidate, started, call, cancel, failures)
                .await
            {
                Ok(Some(stream)) => return Ok((stream, Attempt::from(&candidate))),
                Ok(None) => continue,
                Err(Cancelled) => return Err(DispatchError::Cancelled { alias }),
            }
        }

        Err(DispatchError::AllCandidatesFailed {
            alias,
            failures: failures.clone(),
        })
    }

    /// Run one adapter call under the candidate timeout and the caller's token.
    ///
    /// `Ok(None)` means the call failed and was recorded in `failures`.
    async fn guarded<T>(
        &self,
        alias: &str,
        candidate: &ResolvedEntry,
        started: Instant,
        call: impl Future<Output = Result<T, ProviderError>>,
        cancel: &CancellationToken,
        failures: &mut Vec<CandidateFailure>,
    ) -> Result<Option<T>, Cancelled> {
        let timeout = self.settings.candidate_timeout;

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Cancelled),
            result = tokio::time::timeout(timeout, call) => match result {
                Ok(result) => result,
                Err(_) => Err(ProviderError::timeout(timeout)),
            },
        };
        let elapsed = started.elapsed();

        match result {
            Ok(value) => {
                if elapsed > self.settings.slow_request_threshold {
                    self.alert(AlertKind::LlmTooSlow, alias, candidate, elapsed);
                }
                Ok(Some(value))
            }
            Err(error) => {
                failures.push(self.record(alias, candidate, error.into(), elapsed));
                Ok(None)
            }
        }
    }

    /// Checks that need no I/O to the provider.
    fn prepare(
        &self,
        candidate: &ResolvedEntry,
        required: &BTreeSet<Feature>,
    ) -> Result<(Arc<dyn ProviderAdapter>, AuthContext), CandidateError> {
        if let Some(message) = &candidate.entry.config_error {
            return Err(CandidateError::Misconfigured {
                message: message.clone(),
            });
        }
        let auth = self.credentials.resolve(&candidate.entry.credential)?;

        let adapter = self
            .adapters
            .get(&candidate.entry.provider_id)
            .ok_or_else(|| CandidateError::NoAdapter {
                provider_id: candidate.entry.provider_id.clone(),
            })?;

        let missing = adapter.capabilities().missing(required);
        if !missing.is_empty() {
            return Err(CandidateError::UnsupportedFeature { missing });
        }
        Ok((adapter, auth))
    }

    fn record(
        &self,
        alias: &str,
        candidate: &ResolvedEntry,
        cause: CandidateError,
        elapsed: Duration,
    ) -> CandidateFailure {
        if let Some(error) = cause.provider_error() {
            if error.kind == ProviderErrorKind::Timeout {
                self.alert(AlertKind::LlmRequestsHanging, alias, candidate, elapsed);
            } else if error.is_retryable() && elapsed > self.settings.slow_request_threshold {
                self.alert(AlertKind::LlmTooSlow, alias, candidate, elapsed);
            }
        }

        tracing::warn!(
            alias = %alias,
            provider = %candidate.entry.provider_id,
            model = %candidate.target_model,
            kind = cause.kind(),
            error = %cause,
            elapsed_ms = elapsed.as_millis() as u64,
            "Candidate failed, trying next"
        );

        CandidateFailure {
            provider_id: candidate.entry.provider_id.clone(),
            target_model: candidate.target_model.clone(),
            credential: candidate.entry.credential.describe(),
            cause,
            elapsed,
        }
    }

    fn alert(&self, kind: AlertKind, alias: &str, candidate: &ResolvedEntry, elapsed: Duration) {
        let threshold = match kind {
            AlertKind::LlmTooSlow => self.settings.slow_request_threshold,
            AlertKind::LlmRequestsHanging => self.settings.candidate_timeout,
        };
        self.alerter.emit(AlertEvent::new(
            kind,
            alias,
            &candidate.entry.provider_id,
            &candidate.target_model,
            elapsed,
            threshold,
        ));
    }
}

/// Compile the caller's schema up front so a bad schema never costs a provider call.
fn compile_enforced_schema(request: &CanonicalRequest) -> Result<Option<CompiledSchema>, DispatchError> {
    let Some(format) = request.response_format.as_ref().filter(|f| f.enforce_validation) else {
        return Ok(None);
    };
    let schema = format.schema.as_ref().ok_or_else(|| DispatchError::InvalidRequest {
        message: "enforce_validation requires response_format.schema".to_string(),
    })?;
    CompiledSchema::new(schema)
        .map(Some)
        .map_err(|e| DispatchError::InvalidRequest {
            message: e.to_string(),
        })
}
