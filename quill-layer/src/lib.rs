//! # Quill Layers
//!
//! Built-in layers and observers for the orchestration core.
//!
//! - `LoggingLayer`: wraps an adapter and logs every backend call with timing
//! - `TracingObserver`: forwards orchestration events to `tracing`
//!
//! ## Usage
//!
//! ```ignore
//! use quill_core::{Layer, Orchestrator};
//! use quill_layer::{LoggingLayer, TracingObserver};
//!
//! let orchestrator = Orchestrator::builder(config)
//!     .provider("openai", LoggingLayer::new().layer(openai))
//!     .observer(Arc::new(TracingObserver::new()))
//!     .finish()?;
//! ```

pub mod logging;
pub mod observer;

// Re-exports
pub use logging::{LoggingLayer, LoggingProvider};
pub use observer::TracingObserver;
