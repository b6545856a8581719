//! # Quill Core
//!
//! Core abstractions and orchestration runtime for Quill.
//!
//! This crate accepts abstract "produce text / analyze text" requests,
//! decides which execution mode and backend provider fulfil them, and
//! dispatches them with bounded concurrency, circuit breaking, retry and
//! failover, response caching and streaming delivery. Concrete adapters live
//! in `quill-provider`; cross-cutting layers in `quill-layer`.

pub mod cache;
pub mod config;
pub mod error;
pub mod events;
pub mod health;
pub mod layer;
pub mod limiter;
pub mod mode;
pub mod provider;
pub mod registry;
pub mod retry;
pub mod runtime;
pub mod types;

#[cfg(test)]
mod testing;

// Re-exports
pub use cache::{CacheKey, CacheStats, ResponseCache};
pub use config::OrchestratorConfig;
pub use error::AiError;
pub use events::{Observer, ObserverHub, OrchestrationEvent};
pub use health::{CircuitPolicy, CircuitState, CircuitStatus, HealthMonitor};
pub use layer::{Layer, LayeredProvider};
pub use limiter::ConcurrencyLimiter;
pub use mode::{can_auto_execute, resolve_input, ResolvedInput};
pub use provider::{Provider, TextStream};
pub use registry::{register_builtin_functions, FunctionRegistry};
pub use retry::RetryPolicy;
pub use runtime::{Orchestrator, OrchestratorBuilder, ResponseStream, StreamItem};
pub use tokio_util::sync::CancellationToken;
pub use types::*;

/// Result type alias for AI operations
pub type Result<T> = std::result::Result<T, AiError>;
