//! Dispatch orchestration.
//!
//! - [`Dispatcher`]: sequential candidate fallback with per-candidate timeouts
//! - [`Alerter`]: fire-and-forget slow/hanging request alerts
//! - [`Callbacks`]: one success/failure event per terminal outcome
//! - [`ObservedStream`]: streaming responses that report when they end

pub mod alerting;
pub mod callbacks;
mod orchestrator;
mod stream;

pub use alerting::{AlertEvent, AlertKind, AlertSink, Alerter, LogAlertSink};
pub use callbacks::{builtin_callback, CallbackEvent, Callbacks, DispatchCallback, UsageLogCallback};
pub use orchestrator::{
    Attempt, DispatchSettings, Dispatched, DispatchedStream, Dispatcher,
    DEFAULT_CANDIDATE_TIMEOUT, DEFAULT_SLOW_THRESHOLD,
};
pub use stream::ObservedStream;
