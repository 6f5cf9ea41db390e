//! modelgate - alias-based routing and fallback dispatch across LLM providers
//!
//! This library provides the gateway core: the model registry, credential
//! resolution, provider adapters, routing, structured-output validation and
//! the dispatch orchestrator, plus a thin HTTP boundary.

pub mod adapter;
pub mod canonical;
pub mod config;
pub mod credentials;
pub mod dispatch;
pub mod error;
pub mod registry;
pub mod router;
pub mod schema;
pub mod server;

pub use canonical::{CanonicalRequest, CanonicalResponse};
pub use config::Config;
pub use dispatch::Dispatcher;
pub use error::{DispatchError, Error, Result};
pub use registry::{ModelEntry, ModelRegistry};
pub use router::Router;
