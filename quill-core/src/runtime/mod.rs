//! Orchestration runtime.
//!
//! Sits between callers submitting [`AiRequest`](crate::types::AiRequest)s and
//! the provider adapters. It owns the request lifecycle: cache lookup, mode
//! resolution, provider selection, concurrency slots, retry and failover,
//! streaming delivery and cancellation.

pub mod orchestrator;
mod stream;

pub use orchestrator::{Orchestrator, OrchestratorBuilder};
pub use stream::{ResponseStream, StreamItem};
