//! # Quill
//!
//! Resilient orchestration of AI text requests across interchangeable
//! backend providers.
//!
//! Quill accepts abstract "produce text / analyze text" requests for a
//! registered function, decides how the input is assembled, picks a healthy
//! provider, and dispatches with bounded concurrency, circuit breaking,
//! retry with failover, response caching and streaming delivery.
//!
//! ## Quick Start
//!
//! ```toml
//! [dependencies]
//! quill = { version = "0.1", features = ["providers", "layers"] }
//! ```
//!
//! ```ignore
//! use quill::prelude::*;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = OrchestratorConfig::default()
//!     .with_provider(ProviderDescriptor::new("deepseek", "deepseek-chat").with_credential("sk-..."));
//!
//! let orchestrator = quill::connect(config)?;
//!
//! let request = AiRequest::new("intelligent_continuation")
//!     .with_context("The lighthouse keeper had not seen a ship in forty days, until ...");
//! let response = orchestrator.submit(request).await?;
//! println!("{}", response.text);
//! # Ok(())
//! # }
//! ```
//!
//! ## Feature Flags
//!
//! - `default`: `providers` and `layers`
//! - `providers`: OpenAI-compatible and Anthropic adapters
//! - `layers`: logging layer and tracing observer
//! - `full`: All features enabled

// Re-export core types and traits
pub use quill_core::*;

// Re-export providers under `provider` module
#[cfg(feature = "quill-provider")]
pub mod provider {
    //! Backend adapters.
    pub use quill_provider::*;
}

// Re-export layers under `layer` module
#[cfg(feature = "quill-layer")]
pub mod layer {
    //! Built-in layers and observers.
    pub use quill_layer::*;
}

/// Build an orchestrator whose adapters come from the backend factory.
///
/// With the `layers` feature every adapter is wrapped in a
/// [`LoggingLayer`](quill_layer::LoggingLayer) and events are forwarded to
/// `tracing`.
#[cfg(feature = "quill-provider")]
pub fn connect(config: OrchestratorConfig) -> Result<Orchestrator> {
    let adapters = quill_provider::build_providers(&config)?;
    let builder = Orchestrator::builder(config);

    #[cfg(feature = "quill-layer")]
    let builder = {
        use quill_layer::{LoggingLayer, TracingObserver};
        use std::sync::Arc;

        let logging = LoggingLayer::new();
        adapters
            .into_iter()
            .fold(builder, |builder, (name, adapter)| {
                builder.provider(name, logging.layer(adapter))
            })
            .observer(Arc::new(TracingObserver::new()))
    };

    #[cfg(not(feature = "quill-layer"))]
    let builder = builder.providers(adapters);

    builder.finish()
}

/// Prelude module for convenient imports
pub mod prelude {
    //! Prelude module containing the most commonly used types and traits.
    //!
    //! ```
    //! use quill::prelude::*;
    //! ```

    pub use crate::{
        AiError, AiRequest, AiResponse, CancellationToken, ExecutionMode, FunctionCategory,
        FunctionDescriptor, FunctionRegistry, Layer, Observer, Orchestrator, OrchestratorConfig,
        Priority, Provider, ProviderDescriptor, ResponseStatus, ResponseStream, Result, StreamItem,
    };

    #[cfg(feature = "quill-provider")]
    pub use crate::provider::{build_provider, AnthropicProvider, OpenAiProvider};

    #[cfg(feature = "quill-layer")]
    pub use crate::layer::{LoggingLayer, TracingObserver};
}
