//! HTTP boundary.
//!
//! A thin OpenAI-compatible surface over the [`Dispatcher`](crate::dispatch::Dispatcher):
//! requests are decoded into canonical form, dispatched, and the outcome is
//! encoded back as JSON or SSE.

mod app;
mod auth;
mod handlers;
mod sse;

pub use app::{build_adapters, build_dispatcher, create_router, run_server, AppState};
pub use auth::require_master_key;
pub use handlers::{
    format_attempts_header, MODELGATE_ATTEMPTS_HEADER, MODELGATE_LATENCY_MS_HEADER,
    MODELGATE_MODEL_HEADER, MODELGATE_PROVIDER_HEADER, MODELGATE_STREAMING_HEADER,
};
pub use sse::sse_body;
